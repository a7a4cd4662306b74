use serde::{Deserialize, Serialize};

use async_openai::types as oai;

// Chat Completions 相关类型全面对齐 async-openai
pub use async_openai::types::CompletionUsage as Usage;
pub use async_openai::types::{
    ChatCompletionRequestMessage as RequestMessage,
    CreateChatCompletionRequest as ChatCompletionRequest,
    CreateChatCompletionResponse as ChatCompletionResponse,
};

/// 多模态内容片段，在边界处一次性解析
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageRef },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    /// low / high / auto，缺省为 None
    #[serde(default)]
    pub detail: Option<String>,
}

/// 模型列表（OpenAI list 形状）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelListResponse {
    pub object: String,
    pub data: Vec<ModelCard>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub owned_by: String,
    pub model_type: String,
    pub text_quota: serde_json::Value,
    pub image_quotas: serde_json::Value,
    pub multimodal_quota: serde_json::Value,
}

fn message_json(msg: &RequestMessage) -> serde_json::Value {
    serde_json::to_value(msg).unwrap_or(serde_json::Value::Null)
}

pub fn message_role(msg: &RequestMessage) -> &'static str {
    match msg {
        RequestMessage::System(_) => "system",
        RequestMessage::Developer(_) => "developer",
        RequestMessage::User(_) => "user",
        RequestMessage::Assistant(_) => "assistant",
        RequestMessage::Tool(_) => "tool",
        RequestMessage::Function(_) => "function",
    }
}

/// 消息内容的片段视图：字符串内容视为单个文本片段
pub fn content_parts(msg: &RequestMessage) -> Vec<ContentPart> {
    match message_json(msg).get("content") {
        Some(serde_json::Value::String(s)) => vec![ContentPart::Text { text: s.clone() }],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| serde_json::from_value(item.clone()).unwrap_or(ContentPart::Other))
            .collect(),
        _ => Vec::new(),
    }
}

/// 拼接消息中的全部文本片段
pub fn message_text(msg: &RequestMessage) -> String {
    content_parts(msg)
        .into_iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

pub fn message_name(msg: &RequestMessage) -> Option<String> {
    message_json(msg)
        .get("name")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn has_tool_calls(msg: &RequestMessage) -> bool {
    match msg {
        RequestMessage::Assistant(m) => m.tool_calls.as_ref().is_some_and(|c| !c.is_empty()),
        _ => false,
    }
}

pub fn system_message(content: &str) -> RequestMessage {
    RequestMessage::System(oai::ChatCompletionRequestSystemMessage {
        content: oai::ChatCompletionRequestSystemMessageContent::Text(content.to_string()),
        name: None,
    })
}

pub fn response_text(resp: &ChatCompletionResponse) -> String {
    resp.choices
        .first()
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default()
}

fn u32_field(v: &serde_json::Value, key: &str) -> Option<u32> {
    v.get(key).and_then(|x| x.as_u64()).map(|x| x as u32)
}

/// 从 JSON 中宽松提取 usage（兼容各厂商扩展）
pub fn usage_from_value(v: &serde_json::Value) -> Option<Usage> {
    let u = v.get("usage")?;
    if !u.is_object() {
        return None;
    }
    Some(Usage {
        prompt_tokens: u32_field(u, "prompt_tokens").unwrap_or(0),
        completion_tokens: u32_field(u, "completion_tokens").unwrap_or(0),
        total_tokens: u32_field(u, "total_tokens").unwrap_or(0),
        prompt_tokens_details: u.get("prompt_tokens_details").map(|d| oai::PromptTokensDetails {
            cached_tokens: u32_field(d, "cached_tokens"),
            audio_tokens: None,
        }),
        completion_tokens_details: u.get("completion_tokens_details").map(|d| {
            oai::CompletionTokensDetails {
                reasoning_tokens: u32_field(d, "reasoning_tokens"),
                audio_tokens: None,
                accepted_prediction_tokens: None,
                rejected_prediction_tokens: None,
            }
        }),
    })
}

/// 严格反序列化失败时，尽力从原始 JSON 组装响应
#[allow(deprecated)]
pub fn fallback_response(v: &serde_json::Value) -> ChatCompletionResponse {
    let str_field = |key: &str, default: &str| {
        v.get(key)
            .and_then(|x| x.as_str())
            .unwrap_or(default)
            .to_string()
    };
    let created = u32_field(v, "created").unwrap_or_else(|| chrono::Utc::now().timestamp() as u32);

    let mut choices: Vec<oai::ChatChoice> = Vec::new();
    if let Some(arr) = v.get("choices").and_then(|x| x.as_array()) {
        for (i, c) in arr.iter().enumerate() {
            let finish_reason = c
                .get("finish_reason")
                .and_then(|x| x.as_str())
                .and_then(|s| match s {
                    "stop" => Some(oai::FinishReason::Stop),
                    "length" => Some(oai::FinishReason::Length),
                    "tool_calls" => Some(oai::FinishReason::ToolCalls),
                    "content_filter" => Some(oai::FinishReason::ContentFilter),
                    _ => None,
                });
            let content = c
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|x| x.as_str())
                .map(|s| s.to_string());
            choices.push(oai::ChatChoice {
                index: u32_field(c, "index").unwrap_or(i as u32),
                message: oai::ChatCompletionResponseMessage {
                    role: oai::Role::Assistant,
                    content,
                    refusal: None,
                    tool_calls: None,
                    function_call: None,
                    audio: None,
                },
                finish_reason,
                logprobs: None,
            });
        }
    }

    ChatCompletionResponse {
        id: str_field("id", ""),
        object: str_field("object", "chat.completion"),
        created,
        model: str_field("model", ""),
        choices,
        usage: usage_from_value(v),
        service_tier: None,
        system_fingerprint: None,
    }
}
