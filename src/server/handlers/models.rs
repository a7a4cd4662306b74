use axum::{extract::State, http::HeaderMap, response::Json};
use std::sync::Arc;

use crate::error::GatewayError;
use crate::providers::openai::{ModelCard, ModelListResponse};
use crate::routing::types::Model;
use crate::server::AppState;
use crate::server::util::bearer_token;

fn quota_json<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

fn model_card(model: &Model) -> ModelCard {
    ModelCard {
        id: model.name.clone(),
        object: "model".into(),
        owned_by: model.corp.as_db_value().to_string(),
        model_type: model.model_type.as_db_value().to_string(),
        text_quota: quota_json(&model.text_quota),
        image_quotas: quota_json(&model.image_quotas),
        multimodal_quota: quota_json(&model.multimodal_quota),
    }
}

// 调用方密钥可见的启用模型
pub async fn list_models(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ModelListResponse>, GatewayError> {
    let secret = bearer_token(&headers)
        .ok_or_else(|| GatewayError::Unauthorized("missing bearer secret".into()))?;
    let models = app_state.chat.resolver().list_models(&secret).await?;
    tracing::debug!(count = models.len(), "listing models");

    Ok(Json(ModelListResponse {
        object: "list".into(),
        data: models.iter().map(model_card).collect(),
    }))
}
