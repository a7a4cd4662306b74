pub mod billing;
pub mod tokenizer;

use crate::providers::openai::types::{ContentPart, message_name, message_role};
use crate::providers::openai::{RequestMessage, Usage};
use crate::routing::types::{ImageQuota, Model};

pub use billing::{QuotaBreakdown, bill};
pub use tokenizer::{CountedMessage, DEFAULT_MODEL, Tokenizer};

/// 按 detail 模式查找图片额度：精确匹配优先，否则取标记为默认的条目
pub fn image_quota_for<'a>(quotas: &'a [ImageQuota], detail: Option<&str>) -> Option<&'a ImageQuota> {
    let detail = detail.unwrap_or("");
    let mut fallback = None;
    for quota in quotas {
        if quota.mode == detail {
            return Some(quota);
        }
        if quota.is_default {
            fallback = Some(quota);
        }
    }
    fallback
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptCount {
    pub text: u32,
    /// 图片固定额度，不参与倍率换算
    pub image_quota: i64,
}

/// 一次请求的计量结果
#[derive(Debug, Clone, PartialEq)]
pub struct Metered {
    pub usage: Usage,
    pub image_quota: i64,
}

/// Token 计数与计费
#[derive(Default)]
pub struct TokenAccountant {
    tokenizer: Tokenizer,
}

impl TokenAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    fn image_quotas<'a>(&self, model: &'a Model) -> &'a [ImageQuota] {
        if model.multimodal_quota.image_quotas.is_empty() {
            &model.image_quotas
        } else {
            &model.multimodal_quota.image_quotas
        }
    }

    /// 消息列表的文本 prompt tokens 与图片固定额度，二者分开返回
    pub fn prompt_tokens(&self, model: &Model, messages: &[RequestMessage]) -> PromptCount {
        let mut image_quota: i64 = 0;
        let mut owned: Vec<(&'static str, Option<String>, String)> = Vec::with_capacity(messages.len());
        for msg in messages {
            let mut text = String::new();
            for part in crate::providers::openai::types::content_parts(msg) {
                match part {
                    ContentPart::Text { text: t } => text.push_str(&t),
                    ContentPart::ImageUrl { image_url } => {
                        image_quota += image_quota_for(self.image_quotas(model), image_url.detail.as_deref())
                            .map(|q| q.fixed_quota)
                            .unwrap_or(0);
                    }
                    ContentPart::Other => {}
                }
            }
            owned.push((message_role(msg), message_name(msg), text));
        }
        let counted: Vec<CountedMessage<'_>> = owned
            .iter()
            .map(|(role, name, text)| CountedMessage {
                role,
                name: name.as_deref(),
                text,
            })
            .collect();
        PromptCount {
            text: self
                .tokenizer
                .count_messages(model.corp, &model.model, &counted),
            image_quota: image_quota.max(0),
        }
    }

    pub fn completion_tokens(&self, model: &Model, completion: &str) -> u32 {
        self.tokenizer.count_text(model.corp, &model.model, completion)
    }

    /// 上游未给出用量（或总量为 0）时本地计算；上游用量已含图片，不再叠加额度
    pub fn fill_usage(
        &self,
        model: &Model,
        messages: &[RequestMessage],
        completion: &str,
        provided: Option<Usage>,
    ) -> Metered {
        if let Some(usage) = provided
            && usage.total_tokens > 0
        {
            return Metered {
                usage,
                image_quota: 0,
            };
        }
        let prompt = self.prompt_tokens(model, messages);
        let completion = self.completion_tokens(model, completion);
        Metered {
            usage: Usage {
                prompt_tokens: prompt.text,
                completion_tokens: completion,
                total_tokens: prompt.text + completion,
                prompt_tokens_details: None,
                completion_tokens_details: None,
            },
            image_quota: prompt.image_quota,
        }
    }

    pub fn bill(&self, model: &Model, metered: &Metered) -> QuotaBreakdown {
        bill(
            model.billing_quota(),
            metered.usage.prompt_tokens,
            metered.usage.completion_tokens,
            metered.image_quota,
        )
    }
}
