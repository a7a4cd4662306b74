use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::routing::types::{Model, Status};
use crate::server::storage_traits::ModelStore;

/// 调用方密钥对应的授权信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerGrant {
    pub user_id: i64,
    pub app_id: i64,
    /// 允许的模型 id 或名称，空表示不限
    #[serde(default)]
    pub models: Vec<String>,
    pub status: Status,
}

impl CallerGrant {
    pub fn allows(&self, model: &Model) -> bool {
        self.models.is_empty()
            || self
                .models
                .iter()
                .any(|m| m == &model.id || m == &model.name)
    }
}

/// 已认证的调用方
#[derive(Debug, Clone, PartialEq)]
pub struct Caller {
    pub user_id: i64,
    pub app_id: i64,
    pub secret: String,
}

type Resolved = (Caller, Model);

pub struct ModelResolver {
    store: Arc<dyn ModelStore>,
    ttl: Duration,
    cache: DashMap<(String, String), (Instant, Resolved)>,
}

impl ModelResolver {
    pub fn new(store: Arc<dyn ModelStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: DashMap::new(),
        }
    }

    /// 按调用方密钥与模型名解析出 (调用方, 模型)
    pub async fn resolve(&self, model_name: &str, secret: &str) -> Result<Resolved> {
        if model_name.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("model is required".into()));
        }
        let cache_key = (secret.to_string(), model_name.to_string());
        if let Some(hit) = self.cache.get(&cache_key)
            && hit.0.elapsed() < self.ttl
        {
            return Ok(hit.1.clone());
        }

        let grant = self
            .store
            .get_caller(secret)
            .await?
            .filter(|g| g.status.is_active())
            .ok_or_else(|| GatewayError::Unauthorized("invalid or disabled secret key".into()))?;

        let model = self
            .store
            .get_model_by_name(model_name)
            .await?
            .filter(|m| m.status.is_active())
            .ok_or_else(|| GatewayError::ModelNotFound(model_name.to_string()))?;

        if !grant.allows(&model) {
            tracing::warn!(
                user_id = grant.user_id,
                app_id = grant.app_id,
                model = %model_name,
                "caller not entitled to model"
            );
            return Err(GatewayError::Unauthorized(format!(
                "secret key has no access to model {model_name}"
            )));
        }

        let resolved = (
            Caller {
                user_id: grant.user_id,
                app_id: grant.app_id,
                secret: secret.to_string(),
            },
            model,
        );
        self.cache
            .insert(cache_key, (Instant::now(), resolved.clone()));
        Ok(resolved)
    }

    /// 对调用方可见的启用模型
    pub async fn list_models(&self, secret: &str) -> Result<Vec<Model>> {
        let grant = self
            .store
            .get_caller(secret)
            .await?
            .filter(|g| g.status.is_active())
            .ok_or_else(|| GatewayError::Unauthorized("invalid or disabled secret key".into()))?;
        let models = self.store.list_models().await?;
        Ok(models
            .into_iter()
            .filter(|m| m.status.is_active() && grant.allows(m))
            .collect())
    }

    pub fn invalidate(&self) {
        self.cache.clear();
    }
}
