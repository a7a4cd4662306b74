pub mod openai;
pub mod streaming;
pub mod zhipu;

use async_trait::async_trait;
use serde::Deserialize;

use crate::routing::types::Corp;
use openai::{ChatCompletionRequest, ChatCompletionResponse};
use streaming::ChunkStream;

pub use openai::HttpProviderClient;

/// 上游返回的结构化错误（有 HTTP 状态码与消息）
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("status {status}: {message}")]
pub struct ApiError {
    pub status: u16,
    pub message: String,
    pub r#type: Option<String>,
    pub code: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            r#type: None,
            code: None,
        }
    }

    /// 解析 `{"error":{...}}` 错误体，无法解析时以原文作为消息
    pub fn from_body(status: u16, body: &[u8]) -> Self {
        match serde_json::from_slice::<ErrorEnvelope>(body) {
            Ok(env) => Self {
                status,
                message: env.error.message,
                r#type: env.error.r#type,
                code: env.error.code.map(|c| match c {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                }),
            },
            Err(_) => Self::new(status, String::from_utf8_lossy(body).trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("{0}")]
    Api(#[from] ApiError),
    /// 网络 / 协议层错误，不归因于具体凭证
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Transport(e.to_string())
    }
}

/// 一次下发的目标：厂商、地址与（已签名的）凭证
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchTarget {
    pub corp: Corp,
    pub base_url: String,
    pub path: String,
    pub credential: String,
}

impl DispatchTarget {
    pub fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// 非流式结果 + 耗时（毫秒）
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub response: ChatCompletionResponse,
    pub conn_time: i64,
    pub duration: i64,
    pub total_time: i64,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn chat_completion(
        &self,
        target: &DispatchTarget,
        request: &ChatCompletionRequest,
    ) -> Result<CompletionOutcome, ProviderError>;

    async fn chat_completion_stream(
        &self,
        target: &DispatchTarget,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openai_error_envelope() {
        let body = br#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","code":"insufficient_quota"}}"#;
        let err = ApiError::from_body(429, body);
        assert_eq!(err.status, 429);
        assert_eq!(err.message, "You exceeded your current quota");
        assert_eq!(err.code.as_deref(), Some("insufficient_quota"));
    }

    #[test]
    fn numeric_codes_and_plain_bodies_are_tolerated() {
        let err = ApiError::from_body(400, br#"{"error":{"message":"bad","code":1261}}"#);
        assert_eq!(err.code.as_deref(), Some("1261"));
        let err = ApiError::from_body(502, b"upstream timeout\n");
        assert_eq!(err.message, "upstream timeout");
    }

    #[test]
    fn target_url_joins_base_and_path() {
        let target = DispatchTarget {
            corp: Corp::OpenAI,
            base_url: "https://api.example.com/".into(),
            path: "v1/chat/completions".into(),
            credential: "sk".into(),
        };
        assert_eq!(target.url(), "https://api.example.com/v1/chat/completions");
    }
}
