use crate::routing::types::{BillingMethod, TextQuota};

/// 计费结果：倍率计费时 total = prompt + completion；固定计费时 total = fixed_quota
///
/// 图片额度在倍率换算之后计入 prompt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaBreakdown {
    pub billing_method: BillingMethod,
    pub prompt_ratio: f64,
    pub completion_ratio: f64,
    pub fixed_quota: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

fn scale(ratio: f64, raw: u32) -> i64 {
    (ratio * f64::from(raw)).round() as i64
}

pub fn bill(
    quota: &TextQuota,
    prompt_tokens: u32,
    completion_tokens: u32,
    image_quota: i64,
) -> QuotaBreakdown {
    let prompt = scale(quota.prompt_ratio, prompt_tokens) + image_quota;
    let completion = scale(quota.completion_ratio, completion_tokens);
    let total = match quota.billing_method {
        BillingMethod::Ratio => prompt + completion,
        BillingMethod::Fixed => quota.fixed_quota,
    };
    QuotaBreakdown {
        billing_method: quota.billing_method,
        prompt_ratio: quota.prompt_ratio,
        completion_ratio: quota.completion_ratio,
        fixed_quota: quota.fixed_quota,
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    }
}
