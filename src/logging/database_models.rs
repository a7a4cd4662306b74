use chrono::Utc;
use rusqlite::{OptionalExtension, Result, Row};
use serde::de::DeserializeOwned;

use super::database::DatabaseLogger;
use crate::routing::model_resolver::CallerGrant;
use crate::routing::types::{Corp, Model, ModelType, Status};

const MODEL_COLUMNS: &str = "id, corp, name, model, type, text_quota, image_quotas, audio_quota, \
     multimodal_quota, prompt, is_enable_model_agent, status";

// JSON 列解码失败时转为 rusqlite 转换错误
pub(super) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(super) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn model_from_row(row: &Row<'_>) -> Result<Model> {
    let corp: String = row.get(1)?;
    let model_type: String = row.get(4)?;
    let enable_agent: i64 = row.get(10)?;
    let status: i64 = row.get(11)?;
    Ok(Model {
        id: row.get(0)?,
        corp: Corp::from_db_value(&corp),
        name: row.get(2)?,
        model: row.get(3)?,
        model_type: ModelType::from_db_value(&model_type),
        text_quota: json_column(row, 5)?,
        image_quotas: json_column(row, 6)?,
        audio_quota: json_column(row, 7)?,
        multimodal_quota: json_column(row, 8)?,
        prompt: row.get(9)?,
        is_enable_model_agent: enable_agent != 0,
        status: Status::from_db_value(status),
    })
}

impl DatabaseLogger {
    pub async fn upsert_model(&self, model: &Model) -> Result<()> {
        let conn = self.connection.lock().await;
        let now = crate::logging::time::to_beijing_string(&Utc::now());
        conn.execute(
            "INSERT INTO models (id, corp, name, model, type, text_quota, image_quotas, audio_quota,
                                 multimodal_quota, prompt, is_enable_model_agent, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET corp = excluded.corp,
                                           name = excluded.name,
                                           model = excluded.model,
                                           type = excluded.type,
                                           text_quota = excluded.text_quota,
                                           image_quotas = excluded.image_quotas,
                                           audio_quota = excluded.audio_quota,
                                           multimodal_quota = excluded.multimodal_quota,
                                           prompt = excluded.prompt,
                                           is_enable_model_agent = excluded.is_enable_model_agent,
                                           status = excluded.status",
            rusqlite::params![
                &model.id,
                model.corp.as_db_value(),
                &model.name,
                &model.model,
                model.model_type.as_db_value(),
                to_json(&model.text_quota)?,
                to_json(&model.image_quotas)?,
                to_json(&model.audio_quota)?,
                to_json(&model.multimodal_quota)?,
                &model.prompt,
                if model.is_enable_model_agent { 1 } else { 0 },
                model.status.as_db_value(),
                &now,
            ],
        )?;
        Ok(())
    }

    pub async fn get_model_by_name(&self, name: &str) -> Result<Option<Model>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE name = ?1 LIMIT 1"
        ))?;
        stmt.query_row([name], model_from_row).optional()
    }

    pub async fn list_models(&self) -> Result<Vec<Model>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(&format!("SELECT {MODEL_COLUMNS} FROM models ORDER BY name"))?;
        let rows = stmt.query_map([], model_from_row)?;
        rows.collect()
    }

    pub async fn upsert_caller(&self, secret: &str, grant: &CallerGrant) -> Result<()> {
        let conn = self.connection.lock().await;
        conn.execute(
            "INSERT INTO secrets (secret, user_id, app_id, models, status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(secret) DO UPDATE SET user_id = excluded.user_id,
                                               app_id = excluded.app_id,
                                               models = excluded.models,
                                               status = excluded.status",
            (
                secret,
                grant.user_id,
                grant.app_id,
                to_json(&grant.models)?,
                grant.status.as_db_value(),
            ),
        )?;
        Ok(())
    }

    pub async fn get_caller(&self, secret: &str) -> Result<Option<CallerGrant>> {
        let conn = self.connection.lock().await;
        let mut stmt = conn.prepare(
            "SELECT user_id, app_id, models, status FROM secrets WHERE secret = ?1 LIMIT 1",
        )?;
        stmt.query_row([secret], |row| {
            let status: i64 = row.get(3)?;
            Ok(CallerGrant {
                user_id: row.get(0)?,
                app_id: row.get(1)?,
                models: json_column(row, 2)?,
                status: Status::from_db_value(status),
            })
        })
        .optional()
    }
}
