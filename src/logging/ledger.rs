use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::time::to_beijing_date;
use super::types::{
    AgentSnapshot, CompletionsResult, LEDGER_STATUS_FAILED, LEDGER_STATUS_SUCCESS, LedgerMessage,
    UsageLedgerEntry, UsageRecord,
};
use crate::config::KeyLogStrategy;
use crate::providers::openai::ChatCompletionRequest;
use crate::providers::openai::types::{message_role, message_text};
use crate::routing::model_resolver::Caller;
use crate::routing::types::{Key, Model, ModelAgent};
use crate::server::background::spawn_detached;
use crate::server::storage_traits::LedgerStore;
use crate::server::util::key_display_hint;
use crate::usage::QuotaBreakdown;

/// 一次逻辑请求的最终结果，用于生成唯一的账本条目
#[derive(Debug, Clone)]
pub struct Settlement {
    pub trace_id: String,
    pub caller: Option<Caller>,
    pub model: Option<Model>,
    pub key: Option<Key>,
    pub agent: Option<ModelAgent>,
    /// 调用方原始请求（未经适配）
    pub request: ChatCompletionRequest,
    pub enter_time: DateTime<Utc>,
    pub retry_count: u32,
    pub result: CompletionsResult,
}

impl Settlement {
    pub fn build_entry(
        &self,
        breakdown: Option<&QuotaBreakdown>,
        key_log_strategy: &Option<KeyLogStrategy>,
        now: DateTime<Utc>,
    ) -> UsageLedgerEntry {
        let messages: Vec<LedgerMessage> = self
            .request
            .messages
            .iter()
            .map(|m| LedgerMessage {
                role: message_role(m).to_string(),
                content: message_text(m),
            })
            .collect();
        let prompt = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        let internal_time =
            ((now - self.enter_time).num_milliseconds() - self.result.total_time).max(0);
        let model = self.model.as_ref();

        UsageLedgerEntry {
            id: None,
            trace_id: self.trace_id.clone(),
            user_id: self.caller.as_ref().map(|c| c.user_id),
            app_id: self.caller.as_ref().map(|c| c.app_id),
            corp: model.map(|m| m.corp.as_db_value().to_string()),
            model_id: model.map(|m| m.id.clone()),
            name: model
                .map(|m| m.name.clone())
                .unwrap_or_else(|| self.request.model.clone()),
            model: model.map(|m| m.model.clone()),
            model_type: model.map(|m| m.model_type.as_db_value().to_string()),
            stream: self.request.stream.unwrap_or(false),
            prompt,
            completion: self.result.completion.clone(),
            messages,
            billing_method: breakdown.map(|b| b.billing_method),
            prompt_ratio: breakdown.map(|b| b.prompt_ratio).unwrap_or_default(),
            completion_ratio: breakdown.map(|b| b.completion_ratio).unwrap_or_default(),
            fixed_quota: breakdown.map(|b| b.fixed_quota).unwrap_or_default(),
            prompt_tokens: breakdown.map(|b| b.prompt_tokens).unwrap_or_default(),
            completion_tokens: breakdown.map(|b| b.completion_tokens).unwrap_or_default(),
            total_tokens: breakdown.map(|b| b.total_tokens).unwrap_or_default(),
            is_enable_model_agent: model.is_some_and(|m| m.is_enable_model_agent),
            model_agent: self.agent.as_ref().map(AgentSnapshot::from),
            key: self
                .key
                .as_ref()
                .and_then(|k| key_display_hint(key_log_strategy, &k.key)),
            conn_time: self.result.conn_time,
            duration: self.result.duration,
            total_time: self.result.total_time,
            internal_time,
            req_time: self.enter_time,
            req_date: to_beijing_date(&self.enter_time),
            retry_count: self.retry_count,
            status: if self.result.error.is_some() {
                LEDGER_STATUS_FAILED
            } else {
                LEDGER_STATUS_SUCCESS
            },
            err_msg: self.result.error.clone(),
        }
    }

    pub fn usage_record(&self, breakdown: &QuotaBreakdown) -> Option<UsageRecord> {
        let caller = self.caller.as_ref()?;
        let model = self.model.as_ref()?;
        Some(UsageRecord {
            user_id: caller.user_id,
            app_id: caller.app_id,
            model_id: model.id.clone(),
            key_id: self.key.as_ref().map(|k| k.id.clone()),
            quota: breakdown.total_tokens,
        })
    }
}

/// 账本写入：全部放到与调用方解耦的后台任务
#[derive(Clone)]
pub struct LedgerWriter {
    store: Arc<dyn LedgerStore>,
    key_log_strategy: Option<KeyLogStrategy>,
}

impl LedgerWriter {
    pub fn new(store: Arc<dyn LedgerStore>, key_log_strategy: Option<KeyLogStrategy>) -> Self {
        Self {
            store,
            key_log_strategy,
        }
    }

    pub fn key_log_strategy(&self) -> &Option<KeyLogStrategy> {
        &self.key_log_strategy
    }

    pub fn record_usage(&self, record: UsageRecord) {
        let store = Arc::clone(&self.store);
        spawn_detached("record_usage", async move {
            if let Err(e) = store.record_usage(record).await {
                tracing::error!("Failed to record usage: {}", e);
            }
        });
    }

    pub fn write(&self, entry: UsageLedgerEntry) {
        let store = Arc::clone(&self.store);
        spawn_detached("ledger_insert", async move {
            let trace_id = entry.trace_id.clone();
            if let Err(e) = store.insert_entry(entry).await {
                tracing::error!(trace_id = %trace_id, "Failed to write ledger entry: {}", e);
            }
        });
    }
}
