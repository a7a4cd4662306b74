use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use crate::server::AppState;

mod chat;
mod models;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/models", get(models::list_models))
}

#[cfg(test)]
mod tests {
    use crate::config::Settings;
    use crate::logging::DatabaseLogger;
    use crate::providers::streaming::{ChunkStream, StreamChoiceDelta, StreamChunk, StreamMessage};
    use crate::providers::{CompletionOutcome, DispatchTarget, ProviderClient, ProviderError};
    use crate::providers::openai::ChatCompletionRequest;
    use crate::routing::CallerGrant;
    use crate::routing::types::{Corp, Key, KeyOwner, Model, ModelType, MultimodalQuota, Status, TextQuota};
    use crate::server::{AppState, router};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header::AUTHORIZATION, header::CONTENT_TYPE};
    use std::sync::Arc;
    use tempfile::tempdir;
    use tower::ServiceExt;

    /// 固定回复的上游替身
    struct EchoClient;

    fn chunk(text: &str, finish: Option<&str>) -> StreamChunk {
        StreamChunk {
            id: "c".into(),
            object: "chat.completion.chunk".into(),
            created: 1,
            model: "gpt-4o-mini".into(),
            choices: vec![StreamChoiceDelta {
                index: 0,
                delta: StreamMessage {
                    content: Some(text.into()),
                    ..Default::default()
                },
                finish_reason: finish.map(str::to_string),
                logprobs: None,
            }],
            usage: None,
            conn_time: 1,
            duration: 1,
            total_time: 2,
        }
    }

    #[async_trait]
    impl ProviderClient for EchoClient {
        async fn chat_completion(
            &self,
            _target: &DispatchTarget,
            request: &ChatCompletionRequest,
        ) -> Result<CompletionOutcome, ProviderError> {
            let response = serde_json::from_value(serde_json::json!({
                "id": "chatcmpl-echo",
                "object": "chat.completion",
                "created": 1,
                "model": request.model,
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "pong"},
                    "finish_reason": "stop"
                }]
            }))
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
            Ok(CompletionOutcome {
                response,
                conn_time: 1,
                duration: 1,
                total_time: 2,
            })
        }

        async fn chat_completion_stream(
            &self,
            _target: &DispatchTarget,
            _request: &ChatCompletionRequest,
        ) -> Result<ChunkStream, ProviderError> {
            let chunks = vec![Ok(chunk("po", None)), Ok(chunk("ng", Some("stop")))];
            Ok(Box::pin(futures_util::stream::iter(chunks)))
        }
    }

    async fn app() -> (tempfile::TempDir, axum::Router) {
        let dir = tempdir().unwrap();
        let db = Arc::new(
            DatabaseLogger::new(dir.path().join("gw.db").to_str().unwrap())
                .await
                .unwrap(),
        );
        let model = Model {
            id: "m1".into(),
            corp: Corp::OpenAI,
            name: "chat".into(),
            model: "gpt-4o-mini".into(),
            model_type: ModelType::Text,
            text_quota: TextQuota::default(),
            image_quotas: Vec::new(),
            audio_quota: TextQuota::default(),
            multimodal_quota: MultimodalQuota::default(),
            prompt: None,
            is_enable_model_agent: false,
            status: Status::Active,
        };
        db.upsert_model(&model).await.unwrap();
        db.upsert_model(&Model {
            id: "m2".into(),
            name: "retired".into(),
            status: Status::Disabled,
            ..model.clone()
        })
        .await
        .unwrap();
        db.upsert_caller(
            "sk-app",
            &CallerGrant {
                user_id: 1,
                app_id: 1,
                models: Vec::new(),
                status: Status::Active,
            },
        )
        .await
        .unwrap();
        db.insert_key(&Key {
            id: "k1".into(),
            owner: KeyOwner::Model("m1".into()),
            key: "sk-upstream-000001".into(),
            weight: 1,
            status: Status::Active,
        })
        .await
        .unwrap();

        let settings = Settings::from_toml(
            r#"
            [corps.OpenAI]
            base_url = "https://api.openai.test"
            "#,
        )
        .unwrap();
        let state = AppState::new(settings, db, Arc::new(EchoClient));
        (dir, router(state))
    }

    fn chat_request(secret: &str, stream: bool) -> Request<Body> {
        let body = serde_json::json!({
            "model": "chat",
            "stream": stream,
            "messages": [{"role": "user", "content": "ping"}]
        });
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header(AUTHORIZATION, format!("Bearer {secret}"))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(resp: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn non_stream_completion_returns_usage() {
        let (_dir, app) = app().await;
        let resp = app.oneshot(chat_request("sk-app", false)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(v["choices"][0]["message"]["content"], "pong");
        assert!(v["usage"]["total_tokens"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn stream_completion_ends_with_done() {
        let (_dir, app) = app().await;
        let resp = app.oneshot(chat_request("sk-app", true)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers()[CONTENT_TYPE].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/event-stream"));

        let body = body_string(resp).await;
        let data: Vec<&str> = body
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect();
        assert_eq!(data.len(), 3);
        assert_eq!(data[2], "[DONE]");
        let last: serde_json::Value = serde_json::from_str(data[1]).unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn unknown_secret_is_rejected_as_json_error() {
        let (_dir, app) = app().await;
        let resp = app.oneshot(chat_request("sk-nope", true)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let v: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(v["error"]["type"], "authentication_error");
    }

    #[tokio::test]
    async fn models_lists_only_active_entitled_models() {
        let (_dir, app) = app().await;
        let req = Request::builder()
            .uri("/v1/models")
            .header(AUTHORIZATION, "Bearer sk-app")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(v["object"], "list");
        let data = v["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["id"], "chat");
        assert_eq!(data[0]["owned_by"], "OpenAI");
    }
}
