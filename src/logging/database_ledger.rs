use chrono::Utc;
use rusqlite::{Result, Row};

use super::database::DatabaseLogger;
use super::database_models::{json_column, to_json};
use super::types::{UsageLedgerEntry, UsageRecord, UsageTotals};
use crate::routing::types::BillingMethod;

fn entry_from_row(row: &Row<'_>) -> Result<UsageLedgerEntry> {
    let stream: i64 = row.get(9)?;
    let billing_method: Option<i64> = row.get(13)?;
    let enable_agent: i64 = row.get(20)?;
    let model_agent: Option<String> = row.get(21)?;
    let req_time: String = row.get(27)?;
    let retry_count: i64 = row.get(29)?;
    Ok(UsageLedgerEntry {
        id: row.get(0)?,
        trace_id: row.get(1)?,
        user_id: row.get(2)?,
        app_id: row.get(3)?,
        corp: row.get(4)?,
        model_id: row.get(5)?,
        name: row.get(6)?,
        model: row.get(7)?,
        model_type: row.get(8)?,
        stream: stream != 0,
        prompt: row.get(10)?,
        completion: row.get(11)?,
        messages: json_column(row, 12)?,
        billing_method: billing_method.map(BillingMethod::from_db_value),
        prompt_ratio: row.get(14)?,
        completion_ratio: row.get(15)?,
        fixed_quota: row.get(16)?,
        prompt_tokens: row.get(17)?,
        completion_tokens: row.get(18)?,
        total_tokens: row.get(19)?,
        is_enable_model_agent: enable_agent != 0,
        model_agent: match model_agent {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(21, rusqlite::types::Type::Text, Box::new(e))
            })?),
            None => None,
        },
        key: row.get(22)?,
        conn_time: row.get(23)?,
        duration: row.get(24)?,
        total_time: row.get(25)?,
        internal_time: row.get(26)?,
        req_time: crate::logging::time::parse_datetime_string(&req_time).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(27, rusqlite::types::Type::Text, Box::new(e))
        })?,
        req_date: row.get(28)?,
        retry_count: retry_count.max(0) as u32,
        status: row.get(30)?,
        err_msg: row.get(31)?,
    })
}

impl DatabaseLogger {
    /// 追加一条账本记录，返回自增 id
    pub async fn insert_entry(&self, entry: UsageLedgerEntry) -> Result<i64> {
        let conn = self.connection.lock().await;
        let model_agent = match &entry.model_agent {
            Some(agent) => Some(to_json(agent)?),
            None => None,
        };
        conn.execute(
            "INSERT INTO chats (
                trace_id, user_id, app_id, corp, model_id, name, model, type, stream,
                prompt, completion, messages, billing_method, prompt_ratio, completion_ratio,
                fixed_quota, prompt_tokens, completion_tokens, total_tokens,
                is_enable_model_agent, model_agent, key_value,
                conn_time, duration, total_time, internal_time,
                req_time, req_date, retry_count, status, err_msg
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                ?10, ?11, ?12, ?13, ?14, ?15,
                ?16, ?17, ?18, ?19,
                ?20, ?21, ?22,
                ?23, ?24, ?25, ?26,
                ?27, ?28, ?29, ?30, ?31
            )",
            rusqlite::params![
                &entry.trace_id,
                entry.user_id,
                entry.app_id,
                &entry.corp,
                &entry.model_id,
                &entry.name,
                &entry.model,
                &entry.model_type,
                if entry.stream { 1 } else { 0 },
                &entry.prompt,
                &entry.completion,
                to_json(&entry.messages)?,
                entry.billing_method.map(|b| b.as_db_value()),
                entry.prompt_ratio,
                entry.completion_ratio,
                entry.fixed_quota,
                entry.prompt_tokens,
                entry.completion_tokens,
                entry.total_tokens,
                if entry.is_enable_model_agent { 1 } else { 0 },
                model_agent,
                &entry.key,
                entry.conn_time,
                entry.duration,
                entry.total_time,
                entry.internal_time,
                crate::logging::time::to_iso8601_utc_string(&entry.req_time),
                &entry.req_date,
                i64::from(entry.retry_count),
                entry.status,
                &entry.err_msg,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn recent_entries(&self, limit: i64) -> Result<Vec<UsageLedgerEntry>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, trace_id, user_id, app_id, corp, model_id, name, model, type, stream,
                    prompt, completion, messages, billing_method, prompt_ratio, completion_ratio,
                    fixed_quota, prompt_tokens, completion_tokens, total_tokens,
                    is_enable_model_agent, model_agent, key_value,
                    conn_time, duration, total_time, internal_time,
                    req_time, req_date, retry_count, status, err_msg
             FROM chats ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], entry_from_row)?;
        rows.collect()
    }

    /// 用量累计：按 (user, app, model) 聚合
    pub async fn record_usage(&self, record: UsageRecord) -> Result<()> {
        let conn = self.connection.lock().await;
        let now = crate::logging::time::to_beijing_string(&Utc::now());
        conn.execute(
            "INSERT INTO usage_totals (user_id, app_id, model_id, total_quota, requests, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)
             ON CONFLICT(user_id, app_id, model_id) DO UPDATE SET
                 total_quota = total_quota + excluded.total_quota,
                 requests = requests + 1,
                 updated_at = excluded.updated_at",
            (record.user_id, record.app_id, &record.model_id, record.quota, &now),
        )?;
        if let Some(key_id) = &record.key_id {
            tracing::debug!(key_id = %key_id, quota = record.quota, "usage recorded");
        }
        Ok(())
    }

    pub async fn usage_totals(&self, user_id: i64, app_id: i64) -> Result<Vec<UsageTotals>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT user_id, app_id, model_id, total_quota, requests FROM usage_totals
             WHERE user_id = ?1 AND app_id = ?2 ORDER BY model_id",
        )?;
        let rows = stmt.query_map([user_id, app_id], |row| {
            Ok(UsageTotals {
                user_id: row.get(0)?,
                app_id: row.get(1)?,
                model_id: row.get(2)?,
                total_quota: row.get(3)?,
                requests: row.get(4)?,
            })
        })?;
        rows.collect()
    }
}
