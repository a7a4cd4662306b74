use std::future::Future;
use std::pin::Pin;

use crate::logging::types::{UsageLedgerEntry, UsageRecord, UsageTotals};
use crate::logging::DatabaseLogger;
use crate::routing::model_resolver::CallerGrant;
use crate::routing::types::{Key, Model, ModelAgent, Status};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// 模型与调用方授权的只读存储
pub trait ModelStore: Send + Sync {
    fn get_caller<'a>(&'a self, secret: &'a str) -> BoxFuture<'a, rusqlite::Result<Option<CallerGrant>>>;
    fn get_model_by_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, rusqlite::Result<Option<Model>>>;
    fn list_models<'a>(&'a self) -> BoxFuture<'a, rusqlite::Result<Vec<Model>>>;
}

// 凭证存储：读取密钥/代理，写入状态翻转
pub trait CredentialStore: Send + Sync {
    fn list_model_keys<'a>(&'a self, model_id: &'a str) -> BoxFuture<'a, rusqlite::Result<Vec<Key>>>;
    fn list_model_agents<'a>(&'a self, model_id: &'a str) -> BoxFuture<'a, rusqlite::Result<Vec<ModelAgent>>>;
    fn list_agent_keys<'a>(&'a self, agent_id: &'a str) -> BoxFuture<'a, rusqlite::Result<Vec<Key>>>;
    fn set_key_status<'a>(&'a self, key_id: &'a str, status: Status) -> BoxFuture<'a, rusqlite::Result<()>>;
}

// 账本存储（追加写）与用量累计
pub trait LedgerStore: Send + Sync {
    fn insert_entry<'a>(&'a self, entry: UsageLedgerEntry) -> BoxFuture<'a, rusqlite::Result<i64>>;
    fn record_usage<'a>(&'a self, record: UsageRecord) -> BoxFuture<'a, rusqlite::Result<()>>;
    fn recent_entries<'a>(&'a self, limit: i64) -> BoxFuture<'a, rusqlite::Result<Vec<UsageLedgerEntry>>>;
    fn usage_totals<'a>(&'a self, user_id: i64, app_id: i64) -> BoxFuture<'a, rusqlite::Result<Vec<UsageTotals>>>;
}

// DatabaseLogger 作为三种接口的默认实现
impl ModelStore for DatabaseLogger {
    fn get_caller<'a>(&'a self, secret: &'a str) -> BoxFuture<'a, rusqlite::Result<Option<CallerGrant>>> {
        Box::pin(async move { self.get_caller(secret).await })
    }

    fn get_model_by_name<'a>(&'a self, name: &'a str) -> BoxFuture<'a, rusqlite::Result<Option<Model>>> {
        Box::pin(async move { self.get_model_by_name(name).await })
    }

    fn list_models<'a>(&'a self) -> BoxFuture<'a, rusqlite::Result<Vec<Model>>> {
        Box::pin(async move { self.list_models().await })
    }
}

impl CredentialStore for DatabaseLogger {
    fn list_model_keys<'a>(&'a self, model_id: &'a str) -> BoxFuture<'a, rusqlite::Result<Vec<Key>>> {
        Box::pin(async move { self.list_model_keys(model_id).await })
    }

    fn list_model_agents<'a>(&'a self, model_id: &'a str) -> BoxFuture<'a, rusqlite::Result<Vec<ModelAgent>>> {
        Box::pin(async move { self.list_model_agents(model_id).await })
    }

    fn list_agent_keys<'a>(&'a self, agent_id: &'a str) -> BoxFuture<'a, rusqlite::Result<Vec<Key>>> {
        Box::pin(async move { self.list_agent_keys(agent_id).await })
    }

    fn set_key_status<'a>(&'a self, key_id: &'a str, status: Status) -> BoxFuture<'a, rusqlite::Result<()>> {
        Box::pin(async move { self.set_key_status(key_id, status).await })
    }
}

impl LedgerStore for DatabaseLogger {
    fn insert_entry<'a>(&'a self, entry: UsageLedgerEntry) -> BoxFuture<'a, rusqlite::Result<i64>> {
        Box::pin(async move { self.insert_entry(entry).await })
    }

    fn record_usage<'a>(&'a self, record: UsageRecord) -> BoxFuture<'a, rusqlite::Result<()>> {
        Box::pin(async move { self.record_usage(record).await })
    }

    fn recent_entries<'a>(&'a self, limit: i64) -> BoxFuture<'a, rusqlite::Result<Vec<UsageLedgerEntry>>> {
        Box::pin(async move { self.recent_entries(limit).await })
    }

    fn usage_totals<'a>(&'a self, user_id: i64, app_id: i64) -> BoxFuture<'a, rusqlite::Result<Vec<UsageTotals>>> {
        Box::pin(async move { self.usage_totals(user_id, app_id).await })
    }
}
