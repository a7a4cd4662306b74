use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::HeaderMap,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::error::GatewayError;
use crate::providers::openai::ChatCompletionRequest;
use crate::server::AppState;
use crate::server::streaming::{SSE_BUFFER, SseSink};
use crate::server::util::bearer_token;

pub async fn chat_completions(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, GatewayError> {
    // 缺失密钥交给解析器拒绝，这样仍会留下一条账本记录
    let secret = bearer_token(&headers).unwrap_or_default();
    let trace_id = uuid::Uuid::new_v4().to_string();
    let stream = request.stream.unwrap_or(false);
    let span = tracing::info_span!("chat", trace_id = %trace_id, model = %request.model, stream);

    // 链路在独立任务里执行，客户端断开不会丢掉结算
    if !stream {
        let response = Arc::clone(&app_state.chat)
            .complete_detached(trace_id, secret, request)
            .instrument(span)
            .await?;
        return Ok(Json(response).into_response());
    }

    // 首个分块之前的失败按普通 JSON 错误返回
    let (tx, rx) = tokio::sync::mpsc::channel::<Event>(SSE_BUFFER);
    Arc::clone(&app_state.chat)
        .stream_detached(trace_id, secret, request, SseSink::new(tx))
        .instrument(span)
        .await?;

    let events = ReceiverStream::new(rx).map(Ok::<Event, Infallible>);
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}
