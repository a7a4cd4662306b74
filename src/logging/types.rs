use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::providers::openai::Usage;
use crate::routing::types::{BillingMethod, ModelAgent};

pub const LEDGER_STATUS_SUCCESS: i64 = 1;
pub const LEDGER_STATUS_FAILED: i64 = -1;

/// 单次尝试（或最终结果）的内部记录，仅用于拼装账本条目
#[derive(Debug, Clone, Default)]
pub struct CompletionsResult {
    pub completion: String,
    pub usage: Option<Usage>,
    pub conn_time: i64,
    pub duration: i64,
    pub total_time: i64,
    pub error: Option<String>,
}

/// 消息快照（角色 + 文本）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerMessage {
    pub role: String,
    pub content: String,
}

/// 代理快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub path: Option<String>,
    pub weight: u32,
    pub remark: Option<String>,
    pub status: i64,
}

impl From<&ModelAgent> for AgentSnapshot {
    fn from(agent: &ModelAgent) -> Self {
        Self {
            id: agent.id.clone(),
            name: agent.name.clone(),
            base_url: agent.base_url.clone(),
            path: agent.path.clone(),
            weight: agent.weight,
            remark: agent.remark.clone(),
            status: agent.status.as_db_value(),
        }
    }
}

/// 账本条目：每个逻辑请求恰好一条，追加写入
#[derive(Debug, Clone, PartialEq)]
pub struct UsageLedgerEntry {
    pub id: Option<i64>,
    pub trace_id: String,
    pub user_id: Option<i64>,
    pub app_id: Option<i64>,
    pub corp: Option<String>,
    pub model_id: Option<String>,
    pub name: String,
    pub model: Option<String>,
    pub model_type: Option<String>,
    pub stream: bool,
    pub prompt: String,
    pub completion: String,
    pub messages: Vec<LedgerMessage>,
    pub billing_method: Option<BillingMethod>,
    pub prompt_ratio: f64,
    pub completion_ratio: f64,
    pub fixed_quota: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub is_enable_model_agent: bool,
    pub model_agent: Option<AgentSnapshot>,
    pub key: Option<String>,
    pub conn_time: i64,
    pub duration: i64,
    pub total_time: i64,
    pub internal_time: i64,
    pub req_time: DateTime<Utc>,
    pub req_date: String,
    pub retry_count: u32,
    pub status: i64,
    pub err_msg: Option<String>,
}

/// 用量累计（按 用户/应用/模型）
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub user_id: i64,
    pub app_id: i64,
    pub model_id: String,
    pub key_id: Option<String>,
    pub quota: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageTotals {
    pub user_id: i64,
    pub app_id: i64,
    pub model_id: String,
    pub total_quota: i64,
    pub requests: i64,
}
