use crate::error::Result;
use crate::providers::openai::types::{RequestMessage, has_tool_calls, message_text, system_message};
use crate::providers::openai::ChatCompletionRequest;
use crate::providers::zhipu::{sign_glm_key, strip_image_data_prefix};
use crate::routing::types::{Key, Model};

// GLM 拒绝 top_p / temperature 恰好为 0 或 1
const LOWER_BOUNDARY_NUDGED: f32 = 0.01;
const UPPER_BOUNDARY_NUDGED: f32 = 0.99;

/// 单次下发用的请求副本与凭证
#[derive(Debug, Clone)]
pub struct AdaptedRequest {
    pub request: ChatCompletionRequest,
    pub credential: String,
}

fn nudge_boundary(value: Option<f32>) -> Option<f32> {
    match value {
        Some(v) if v == 0.0 => Some(LOWER_BOUNDARY_NUDGED),
        Some(v) if v == 1.0 => Some(UPPER_BOUNDARY_NUDGED),
        other => other,
    }
}

fn inject_preset_prompt(messages: &mut Vec<RequestMessage>, prompt: &str) {
    let preset = system_message(prompt);
    match messages.first_mut() {
        Some(first @ RequestMessage::System(_)) => *first = preset,
        _ => messages.insert(0, preset),
    }
}

fn elide_empty_leading_system(messages: &mut Vec<RequestMessage>) {
    if let Some(first @ RequestMessage::System(_)) = messages.first()
        && message_text(first).is_empty()
        && !has_tool_calls(first)
    {
        messages.remove(0);
    }
}

/// 每次尝试都从调用方原始请求出发重新适配，不会在重试间累积修改
pub fn adapt(
    original: &ChatCompletionRequest,
    model: &Model,
    key: &Key,
    now_ms: i64,
) -> Result<AdaptedRequest> {
    let mut request = original.clone();
    request.model = model.model.clone();
    let glm = model.is_glm_family();

    let credential = if glm {
        sign_glm_key(&key.key, now_ms)?
    } else {
        key.key.clone()
    };

    if glm {
        request.top_p = nudge_boundary(original.top_p);
        request.temperature = nudge_boundary(original.temperature);
        strip_image_data_prefix(&mut request);
    }

    if let Some(prompt) = model.preset_prompt() {
        inject_preset_prompt(&mut request.messages, prompt);
    }

    if glm {
        elide_empty_leading_system(&mut request.messages);
    }

    Ok(AdaptedRequest {
        request,
        credential,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::openai::types::message_role;
    use crate::routing::types::{Corp, KeyOwner, ModelType, MultimodalQuota, Status, TextQuota};

    fn model(corp: Corp, native: &str, prompt: Option<&str>) -> Model {
        Model {
            id: "m1".into(),
            corp,
            name: "chat".into(),
            model: native.into(),
            model_type: ModelType::Text,
            text_quota: TextQuota::default(),
            image_quotas: Vec::new(),
            audio_quota: TextQuota::default(),
            multimodal_quota: MultimodalQuota::default(),
            prompt: prompt.map(str::to_string),
            is_enable_model_agent: false,
            status: Status::Active,
        }
    }

    fn key(raw: &str) -> Key {
        Key {
            id: "k1".into(),
            owner: KeyOwner::Model("m1".into()),
            key: raw.into(),
            weight: 1,
            status: Status::Active,
        }
    }

    fn request(raw: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn glm_request_is_nudged_elided_and_signed() {
        let original = request(serde_json::json!({
            "model": "glm-4",
            "top_p": 1.0,
            "temperature": 0.0,
            "messages": [
                {"role": "system", "content": ""},
                {"role": "user", "content": "hello"}
            ]
        }));
        let out = adapt(&original, &model(Corp::Other, "glm-4", None), &key("id42.secret"), 1_000).unwrap();

        assert_eq!(out.request.top_p, Some(0.99));
        assert_eq!(out.request.temperature, Some(0.01));
        assert_eq!(out.request.messages.len(), 1);
        assert_eq!(message_role(&out.request.messages[0]), "user");
        assert_eq!(out.credential.split('.').count(), 3);
        assert_ne!(out.credential, "id42.secret");
        // 原请求保持不变
        assert_eq!(original.top_p, Some(1.0));
        assert_eq!(original.messages.len(), 2);
    }

    #[test]
    fn nudging_is_idempotent_across_attempts() {
        let original = request(serde_json::json!({
            "model": "glm-4",
            "temperature": 1.0,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let m = model(Corp::ZhipuAI, "glm-4", None);
        for attempt in 0..3 {
            let out = adapt(&original, &m, &key("a.b"), attempt).unwrap();
            assert_eq!(out.request.temperature, Some(0.99));
            assert_eq!(out.request.top_p, None);
        }
    }

    #[test]
    fn near_boundary_values_are_kept() {
        let original = request(serde_json::json!({
            "model": "glm-4",
            "temperature": 0.999,
            "top_p": 0.5,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let out = adapt(&original, &model(Corp::ZhipuAI, "glm-4", None), &key("a.b"), 0).unwrap();
        assert_eq!(out.request.temperature, Some(0.999));
        assert_eq!(out.request.top_p, Some(0.5));
    }

    #[test]
    fn non_glm_models_keep_parameters_and_raw_key() {
        let original = request(serde_json::json!({
            "model": "chat",
            "temperature": 0.0,
            "messages": [
                {"role": "system", "content": ""},
                {"role": "user", "content": "hi"}
            ]
        }));
        let out = adapt(&original, &model(Corp::OpenAI, "gpt-4o-mini", None), &key("sk-raw"), 0).unwrap();
        assert_eq!(out.request.model, "gpt-4o-mini");
        assert_eq!(out.request.temperature, Some(0.0));
        assert_eq!(out.request.messages.len(), 2);
        assert_eq!(out.credential, "sk-raw");
    }

    #[test]
    fn preset_prompt_replaces_or_prepends_system() {
        let m = model(Corp::OpenAI, "gpt-4o-mini", Some("You are terse."));
        let with_system = request(serde_json::json!({
            "model": "chat",
            "messages": [
                {"role": "system", "content": "caller system"},
                {"role": "user", "content": "hi"}
            ]
        }));
        let out = adapt(&with_system, &m, &key("sk"), 0).unwrap();
        assert_eq!(out.request.messages.len(), 2);
        assert_eq!(message_text(&out.request.messages[0]), "You are terse.");

        let without_system = request(serde_json::json!({
            "model": "chat",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let out = adapt(&without_system, &m, &key("sk"), 0).unwrap();
        assert_eq!(out.request.messages.len(), 2);
        assert_eq!(message_role(&out.request.messages[0]), "system");
        assert_eq!(message_role(&out.request.messages[1]), "user");
    }
}
