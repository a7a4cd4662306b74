use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result as AppResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
    pub http: HttpConfig,
    /// 各厂商默认上游地址，键为 Corp 的存储值（如 "OpenAI"、"ZhipuAI"）
    pub corps: HashMap<String, CorpEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyLogStrategy {
    None,
    Masked,
    Plain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub database_path: String,
    pub key_log_strategy: Option<KeyLogStrategy>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            database_path: "data/gateway.db".to_string(),
            key_log_strategy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// 重试次数：>0 固定次数；<0 直到密钥池耗尽；0 不重试
    pub retry: i32,
    pub model_cache_ttl_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            retry: -1,
            model_cache_ttl_secs: 60,
        }
    }
}

impl ApiConfig {
    pub fn model_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.model_cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub proxy_url: Option<String>,
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            connect_timeout_secs: 10,
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpEndpoint {
    pub base_url: String,
    pub path: Option<String>,
}

impl Settings {
    pub fn load() -> AppResult<Self> {
        let config_path = Self::find_config_file()?;
        let config_content = std::fs::read_to_string(&config_path)?;
        Self::from_toml(&config_content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        toml::from_str(content).map_err(|e| GatewayError::Config(e.to_string()))
    }

    fn find_config_file() -> AppResult<String> {
        if let Ok(path) = std::env::var("GATEWAY_CONFIG") {
            return Ok(path);
        }

        let possible_names = ["custom-config.toml", "config.toml"];

        for name in &possible_names {
            if Path::new(name).exists() {
                return Ok(name.to_string());
            }
        }

        Err(GatewayError::Config(
            "Configuration file not found. Please create custom-config.toml or config.toml".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let s = Settings::from_toml("").unwrap();
        assert_eq!(s.server.port, 8000);
        assert_eq!(s.api.retry, -1);
        assert_eq!(s.api.model_cache_ttl(), Duration::from_secs(60));
        assert!(s.corps.is_empty());
    }

    #[test]
    fn parses_corp_endpoints_and_retry() {
        let s = Settings::from_toml(
            r#"
            [api]
            retry = 2

            [logging]
            key_log_strategy = "plain"

            [corps.ZhipuAI]
            base_url = "https://open.bigmodel.cn"
            path = "/api/paas/v4/chat/completions"
            "#,
        )
        .unwrap();
        assert_eq!(s.api.retry, 2);
        assert_eq!(s.logging.key_log_strategy, Some(KeyLogStrategy::Plain));
        let zhipu = s.corps.get("ZhipuAI").unwrap();
        assert_eq!(zhipu.path.as_deref(), Some("/api/paas/v4/chat/completions"));
    }
}
