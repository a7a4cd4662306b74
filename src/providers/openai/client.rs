use std::time::Instant;

use async_openai::types::ChatCompletionStreamOptions;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest_eventsource::{Event, EventSource, RequestBuilderExt};

use crate::config::HttpConfig;
use crate::providers::streaming::{ChunkStream, StreamChunk};
use crate::providers::{ApiError, CompletionOutcome, DispatchTarget, ProviderClient, ProviderError};
use crate::routing::types::Corp;

use super::types::{ChatCompletionRequest, ChatCompletionResponse, fallback_response};

pub const OPENAI_CHAT_PATH: &str = "/v1/chat/completions";
pub const ZHIPU_CHAT_PATH: &str = "/api/paas/v4/chat/completions";

/// 各厂商在未配置 path 时使用的默认路径
pub fn default_chat_path(corp: Corp) -> &'static str {
    match corp {
        Corp::ZhipuAI => ZHIPU_CHAT_PATH,
        _ => OPENAI_CHAT_PATH,
    }
}

fn elapsed_ms(since: Instant) -> i64 {
    since.elapsed().as_millis() as i64
}

/// OpenAI 兼容的 HTTP 上游客户端（智谱等兼容厂商共用）
pub struct HttpProviderClient {
    client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl HttpProviderClient {
    pub fn new(cfg: &HttpConfig) -> reqwest::Result<Self> {
        Ok(Self {
            client: crate::http_client::completion_client(cfg)?,
            stream_client: crate::http_client::stream_client(cfg)?,
        })
    }
}

// 部分上游以 200 返回错误体
fn error_in_body(status: u16, value: &serde_json::Value, bytes: &[u8]) -> Option<ApiError> {
    value
        .get("error")
        .filter(|e| e.is_object())
        .map(|_| ApiError::from_body(status, bytes))
}

struct StreamState {
    es: EventSource,
    started: Instant,
    conn_time: i64,
    finished: bool,
}

impl StreamState {
    fn stamp(&self, mut chunk: StreamChunk) -> StreamChunk {
        let total = elapsed_ms(self.started);
        chunk.conn_time = self.conn_time;
        chunk.duration = total - self.conn_time;
        chunk.total_time = total;
        chunk
    }

    fn fail(mut self, err: ProviderError) -> Option<(Result<StreamChunk, ProviderError>, Self)> {
        self.finished = true;
        self.es.close();
        Some((Err(err), self))
    }
}

async fn next_chunk(mut st: StreamState) -> Option<(Result<StreamChunk, ProviderError>, StreamState)> {
    if st.finished {
        return None;
    }
    loop {
        match st.es.next().await {
            None => return None,
            Some(Ok(Event::Open)) => continue,
            Some(Ok(Event::Message(m))) => {
                let data = m.data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    st.es.close();
                    return None;
                }
                match serde_json::from_str::<StreamChunk>(data) {
                    Ok(chunk) => {
                        let chunk = st.stamp(chunk);
                        return Some((Ok(chunk), st));
                    }
                    Err(e) => {
                        if let Ok(v) = serde_json::from_str::<serde_json::Value>(data)
                            && let Some(api) = error_in_body(200, &v, data.as_bytes())
                        {
                            return st.fail(api.into());
                        }
                        tracing::warn!(error = %e, "skipping malformed stream chunk");
                    }
                }
            }
            Some(Err(reqwest_eventsource::Error::StreamEnded)) => {
                st.es.close();
                return None;
            }
            Some(Err(e)) => {
                let err = ProviderError::Transport(e.to_string());
                return st.fail(err);
            }
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn chat_completion(
        &self,
        target: &DispatchTarget,
        request: &ChatCompletionRequest,
    ) -> Result<CompletionOutcome, ProviderError> {
        let started = Instant::now();
        let mut body = request.clone();
        body.stream = Some(false);
        body.stream_options = None;

        let resp = self
            .client
            .post(target.url())
            .bearer_auth(&target.credential)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;
        let conn_time = elapsed_ms(started);
        let status = resp.status();
        let bytes = resp.bytes().await?;
        let total_time = elapsed_ms(started);

        if !status.is_success() {
            return Err(ApiError::from_body(status.as_u16(), &bytes).into());
        }
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderError::Transport(format!("invalid response body: {e}")))?;
        if let Some(api) = error_in_body(status.as_u16(), &value, &bytes) {
            return Err(api.into());
        }
        let response = match serde_json::from_value::<ChatCompletionResponse>(value.clone()) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::debug!(error = %e, "strict response decode failed, using lenient parser");
                fallback_response(&value)
            }
        };

        Ok(CompletionOutcome {
            response,
            conn_time,
            duration: total_time - conn_time,
            total_time,
        })
    }

    async fn chat_completion_stream(
        &self,
        target: &DispatchTarget,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let started = Instant::now();
        let mut body = request.clone();
        body.stream = Some(true);
        body.stream_options = match target.corp {
            Corp::ZhipuAI => None,
            _ => Some(ChatCompletionStreamOptions {
                include_usage: true,
            }),
        };

        let mut es = self
            .stream_client
            .post(target.url())
            .bearer_auth(&target.credential)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .eventsource()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        es.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

        // 等待连接建立，握手阶段的错误交给重试控制器分类
        loop {
            match es.next().await {
                Some(Ok(Event::Open)) => break,
                Some(Ok(Event::Message(_))) => continue,
                Some(Err(reqwest_eventsource::Error::InvalidStatusCode(status, resp))) => {
                    let bytes = resp.bytes().await.unwrap_or_default();
                    es.close();
                    return Err(ApiError::from_body(status.as_u16(), &bytes).into());
                }
                Some(Err(reqwest_eventsource::Error::InvalidContentType(_, resp))) => {
                    let status = resp.status().as_u16();
                    let bytes = resp.bytes().await.unwrap_or_default();
                    es.close();
                    return Err(ApiError::from_body(status, &bytes).into());
                }
                Some(Err(e)) => {
                    es.close();
                    return Err(ProviderError::Transport(e.to_string()));
                }
                None => {
                    return Err(ProviderError::Transport(
                        "stream closed before connection was established".into(),
                    ));
                }
            }
        }

        let state = StreamState {
            es,
            started,
            conn_time: elapsed_ms(started),
            finished: false,
        };
        Ok(Box::pin(futures_util::stream::unfold(state, next_chunk)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_follow_corp() {
        assert_eq!(default_chat_path(Corp::ZhipuAI), "/api/paas/v4/chat/completions");
        assert_eq!(default_chat_path(Corp::DeepSeek), "/v1/chat/completions");
    }

    #[test]
    fn error_envelope_in_success_body_is_detected() {
        let raw = br#"{"error":{"message":"Incorrect API key provided"}}"#;
        let v: serde_json::Value = serde_json::from_slice(raw).unwrap();
        let err = error_in_body(200, &v, raw).unwrap();
        assert_eq!(err.message, "Incorrect API key provided");

        let ok: serde_json::Value = serde_json::json!({"id": "x", "error": null});
        assert!(error_in_body(200, &ok, b"{}").is_none());
    }
}
