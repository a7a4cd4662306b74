use std::sync::Arc;

use dashmap::DashMap;
use tiktoken_rs::CoreBPE;

use crate::routing::types::Corp;

/// 未知模型或非 OpenAI 厂商时使用的参考模型
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

// 与 OpenAI cookbook 一致的消息开销
const TOKENS_PER_MESSAGE: u32 = 3;
const TOKENS_PER_NAME: u32 = 1;
const REPLY_PRIMING_TOKENS: u32 = 3;

/// 参与计数的消息视图
pub struct CountedMessage<'a> {
    pub role: &'a str,
    pub name: Option<&'a str>,
    pub text: &'a str,
}

/// 按模型缓存编码器
#[derive(Default)]
pub struct Tokenizer {
    encoders: DashMap<String, Arc<CoreBPE>>,
}

impl Tokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn load(&self, model: &str) -> Option<Arc<CoreBPE>> {
        if let Some(bpe) = self.encoders.get(model) {
            return Some(Arc::clone(&bpe));
        }
        match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => {
                let bpe = Arc::new(bpe);
                self.encoders.insert(model.to_string(), Arc::clone(&bpe));
                Some(bpe)
            }
            Err(e) => {
                tracing::debug!(model = %model, error = %e, "no tokenizer for model");
                None
            }
        }
    }

    /// 非 OpenAI 厂商直接使用参考模型；OpenAI 未知模型回退参考模型
    pub fn encoder_for(&self, corp: Corp, model: &str) -> Option<Arc<CoreBPE>> {
        if corp == Corp::OpenAI
            && let Some(bpe) = self.load(model)
        {
            return Some(bpe);
        }
        let bpe = self.load(DEFAULT_MODEL);
        if bpe.is_none() {
            tracing::error!("default tokenizer {} unavailable", DEFAULT_MODEL);
        }
        bpe
    }

    pub fn count_text(&self, corp: Corp, model: &str, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        self.encoder_for(corp, model)
            .map(|bpe| bpe.encode_with_special_tokens(text).len() as u32)
            .unwrap_or(0)
    }

    pub fn count_messages(&self, corp: Corp, model: &str, messages: &[CountedMessage<'_>]) -> u32 {
        let Some(bpe) = self.encoder_for(corp, model) else {
            return 0;
        };
        let mut total = 0u32;
        for msg in messages {
            total += TOKENS_PER_MESSAGE;
            total += bpe.encode_with_special_tokens(msg.role).len() as u32;
            total += bpe.encode_with_special_tokens(msg.text).len() as u32;
            if let Some(name) = msg.name {
                total += bpe.encode_with_special_tokens(name).len() as u32 + TOKENS_PER_NAME;
            }
        }
        total + REPLY_PRIMING_TOKENS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_openai_corp_counts_with_default_model() {
        let t = Tokenizer::new();
        let direct = t.count_text(Corp::OpenAI, DEFAULT_MODEL, "hello world");
        assert!(direct > 0);
        assert_eq!(t.count_text(Corp::ZhipuAI, "glm-4", "hello world"), direct);
    }

    #[test]
    fn unknown_openai_model_falls_back() {
        let t = Tokenizer::new();
        assert_eq!(
            t.count_text(Corp::OpenAI, "not-a-real-model", "hello world"),
            t.count_text(Corp::OpenAI, DEFAULT_MODEL, "hello world")
        );
    }

    #[test]
    fn message_overhead_is_counted() {
        let t = Tokenizer::new();
        let msgs = [CountedMessage {
            role: "user",
            name: None,
            text: "",
        }];
        // 3 (message) + role + 3 (priming)
        let role = t.count_text(Corp::OpenAI, DEFAULT_MODEL, "user");
        assert_eq!(t.count_messages(Corp::OpenAI, DEFAULT_MODEL, &msgs), 6 + role);
        assert_eq!(t.count_text(Corp::OpenAI, DEFAULT_MODEL, ""), 0);
    }
}
