use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_stream::Stream;

use super::ProviderError;
use super::openai::Usage;

/// 流式传输的 Delta 消息结构
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    // tool_calls 等厂商字段原样透传
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 流式传输的 Choice Delta
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChoiceDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: StreamMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<Value>,
}

/// 流式传输的响应块
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_object")]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<StreamChoiceDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// 客户端侧测得的耗时（毫秒），不下发给调用方
    #[serde(skip)]
    pub conn_time: i64,
    #[serde(skip)]
    pub duration: i64,
    #[serde(skip)]
    pub total_time: i64,
}

fn default_object() -> String {
    "chat.completion.chunk".to_string()
}

impl StreamChunk {
    pub fn delta_text(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| c.delta.content.as_deref())
            .unwrap_or("")
    }

    pub fn is_stop(&self) -> bool {
        self.choices
            .first()
            .and_then(|c| c.finish_reason.as_deref())
            == Some("stop")
    }

    /// 是否携带非空用量
    pub fn has_usage(&self) -> bool {
        self.usage
            .as_ref()
            .is_some_and(|u| u.total_tokens > 0 || u.prompt_tokens > 0 || u.completion_tokens > 0)
    }
}

/// 上游块序列：`None` 即正常结束
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;
