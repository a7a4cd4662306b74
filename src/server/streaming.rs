use async_trait::async_trait;
use axum::response::sse::Event;
use futures_util::StreamExt;
use tokio::sync::mpsc::Sender;

use crate::error::GatewayError;
use crate::logging::CompletionsResult;
use crate::providers::openai::Usage;
use crate::providers::streaming::ChunkStream;

pub const DONE_SENTINEL: &str = "[DONE]";

/// 推送通道容量；客户端读得慢时转发方在 `send` 上等待
pub const SSE_BUFFER: usize = 64;

/// 向调用方推送单个 SSE 事件
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, data: String) -> Result<(), GatewayError>;
}

/// axum SSE 通道：接收端被丢弃即视为调用方已断开
pub struct SseSink {
    tx: Sender<Event>,
}

impl SseSink {
    pub fn new(tx: Sender<Event>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for SseSink {
    async fn send(&mut self, data: String) -> Result<(), GatewayError> {
        self.tx
            .send(Event::default().data(data))
            .await
            .map_err(|_| GatewayError::Relay("client disconnected".into()))
    }
}

#[derive(Default)]
struct UsageCell {
    usage: Option<Usage>,
    conn_time: i64,
    duration: i64,
    total_time: i64,
    fixed: bool,
}

/// 逐块转发上游流，并累积补全文本、用量与耗时
pub async fn relay<S>(mut chunks: ChunkStream, sink: &mut S) -> CompletionsResult
where
    S: EventSink + ?Sized,
{
    let mut completion = String::new();
    let mut cell = UsageCell::default();
    let mut error = None;

    while let Some(next) = chunks.next().await {
        let chunk = match next {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::error!(error = %e, "upstream stream failed");
                error = Some(e.to_string());
                break;
            }
        };

        completion.push_str(chunk.delta_text());
        // 一旦拿到非空用量就不再覆盖
        if !cell.fixed {
            cell.conn_time = chunk.conn_time;
            cell.duration = chunk.duration;
            cell.total_time = chunk.total_time;
            if chunk.has_usage() {
                cell.usage = chunk.usage.clone();
                cell.fixed = true;
            }
        }

        let payload = match serde_json::to_string(&chunk) {
            Ok(p) => p,
            Err(e) => {
                error = Some(e.to_string());
                break;
            }
        };
        if let Err(e) = sink.send(payload).await {
            tracing::warn!(error = %e, "relay aborted");
            error = Some(e.to_string());
            break;
        }
        if chunk.is_stop() {
            if let Err(e) = sink.send(DONE_SENTINEL.to_string()).await {
                tracing::warn!(error = %e, "relay aborted before [DONE]");
                error = Some(e.to_string());
            }
            drain_usage(&mut chunks, &mut cell).await;
            break;
        }
    }

    CompletionsResult {
        completion,
        usage: cell.usage,
        conn_time: cell.conn_time,
        duration: cell.duration,
        total_time: cell.total_time,
        error,
    }
}

/// stop 之后上游可能再发一个仅含用量的块（include_usage），只读不转发
async fn drain_usage(chunks: &mut ChunkStream, cell: &mut UsageCell) {
    while let Some(next) = chunks.next().await {
        let chunk = match next {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "upstream failed after stop");
                return;
            }
        };
        if !cell.fixed && chunk.has_usage() {
            cell.usage = chunk.usage;
            cell.conn_time = chunk.conn_time;
            cell.duration = chunk.duration;
            cell.total_time = chunk.total_time;
            cell.fixed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;
    use crate::providers::streaming::{StreamChoiceDelta, StreamChunk, StreamMessage};

    #[derive(Default)]
    struct RecordingSink {
        events: Vec<String>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn send(&mut self, data: String) -> Result<(), GatewayError> {
            if self.fail_after.is_some_and(|n| self.events.len() >= n) {
                return Err(GatewayError::Relay("client disconnected".into()));
            }
            self.events.push(data);
            Ok(())
        }
    }

    fn chunk(text: &str, finish: Option<&str>, usage: Option<u32>, total_time: i64) -> StreamChunk {
        StreamChunk {
            id: "c".into(),
            object: "chat.completion.chunk".into(),
            created: 1,
            model: "m".into(),
            choices: vec![StreamChoiceDelta {
                index: 0,
                delta: StreamMessage {
                    content: Some(text.into()),
                    ..Default::default()
                },
                finish_reason: finish.map(str::to_string),
                logprobs: None,
            }],
            usage: usage.map(|t| Usage {
                prompt_tokens: t,
                completion_tokens: 0,
                total_tokens: t,
                prompt_tokens_details: None,
                completion_tokens_details: None,
            }),
            conn_time: 10,
            duration: total_time - 10,
            total_time,
        }
    }

    fn stream_of(items: Vec<Result<StreamChunk, ProviderError>>) -> ChunkStream {
        Box::pin(futures_util::stream::iter(items))
    }

    #[tokio::test]
    async fn stop_chunk_is_followed_by_done_and_nothing_else() {
        let chunks = stream_of(vec![
            Ok(chunk("Hel", None, None, 20)),
            Ok(chunk("lo", Some("stop"), None, 30)),
            Ok(chunk("ignored", None, None, 40)),
        ]);
        let mut sink = RecordingSink::default();
        let result = relay(chunks, &mut sink).await;

        assert_eq!(sink.events.len(), 3);
        let last_chunk: serde_json::Value = serde_json::from_str(&sink.events[1]).unwrap();
        assert_eq!(last_chunk["choices"][0]["finish_reason"], "stop");
        assert_eq!(sink.events[2], DONE_SENTINEL);
        assert_eq!(result.completion, "Hello");
        assert!(result.error.is_none());
        assert_eq!(result.total_time, 30);
    }

    #[tokio::test]
    async fn usage_chunk_after_stop_is_captured_but_not_forwarded() {
        let mut usage_only = chunk("", None, Some(42), 45);
        usage_only.choices.clear();
        let chunks = stream_of(vec![Ok(chunk("hi", Some("stop"), None, 30)), Ok(usage_only)]);
        let mut sink = RecordingSink::default();
        let result = relay(chunks, &mut sink).await;

        assert_eq!(sink.events.len(), 2);
        assert_eq!(sink.events[1], DONE_SENTINEL);
        assert_eq!(result.usage.unwrap().total_tokens, 42);
        assert_eq!(result.total_time, 45);
        assert_eq!(result.completion, "hi");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn usage_seen_before_stop_is_not_overwritten_by_drain() {
        let chunks = stream_of(vec![
            Ok(chunk("a", Some("stop"), Some(7), 30)),
            Ok(chunk("", None, Some(99), 60)),
        ]);
        let mut sink = RecordingSink::default();
        let result = relay(chunks, &mut sink).await;
        assert_eq!(result.usage.unwrap().total_tokens, 7);
        assert_eq!(result.total_time, 30);
    }

    #[tokio::test]
    async fn sse_sink_waits_for_a_slow_reader() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Event>(1);
        let mut sink = SseSink::new(tx);
        sink.send("one".into()).await.unwrap();
        // 缓冲已满，第二次推送须等到读端取走一条
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            sink.send("two".into()),
        )
        .await;
        assert!(pending.is_err());

        assert!(rx.recv().await.is_some());
        sink.send("three".into()).await.unwrap();
        drop(rx);
        assert!(sink.send("four".into()).await.is_err());
    }

    #[tokio::test]
    async fn usage_and_timings_freeze_once_seen() {
        let chunks = stream_of(vec![
            Ok(chunk("a", None, Some(5), 20)),
            Ok(chunk("b", None, None, 50)),
        ]);
        let mut sink = RecordingSink::default();
        let result = relay(chunks, &mut sink).await;
        assert_eq!(result.usage.unwrap().total_tokens, 5);
        assert_eq!(result.total_time, 20);
        // 没有 stop 时自然结束，不发送 [DONE]
        assert!(sink.events.iter().all(|e| e != DONE_SENTINEL));
    }

    #[tokio::test]
    async fn push_failure_is_terminal() {
        let chunks = stream_of(vec![
            Ok(chunk("a", None, None, 20)),
            Ok(chunk("b", None, None, 30)),
            Ok(chunk("c", Some("stop"), None, 40)),
        ]);
        let mut sink = RecordingSink {
            fail_after: Some(1),
            ..Default::default()
        };
        let result = relay(chunks, &mut sink).await;
        assert_eq!(sink.events.len(), 1);
        assert_eq!(result.completion, "ab");
        assert!(result.error.unwrap().contains("client disconnected"));
    }

    #[tokio::test]
    async fn upstream_error_mid_stream_ends_relay() {
        let chunks = stream_of(vec![
            Ok(chunk("a", None, None, 20)),
            Err(ProviderError::Transport("reset".into())),
        ]);
        let mut sink = RecordingSink::default();
        let result = relay(chunks, &mut sink).await;
        assert_eq!(sink.events.len(), 1);
        assert!(result.error.unwrap().contains("reset"));
    }
}
