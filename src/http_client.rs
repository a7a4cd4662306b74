use std::time::Duration;

use reqwest::ClientBuilder;

use crate::config::HttpConfig;

fn has_proxy_env() -> bool {
    [
        "HTTPS_PROXY",
        "https_proxy",
        "HTTP_PROXY",
        "http_proxy",
        "ALL_PROXY",
        "all_proxy",
    ]
    .iter()
    .any(|k| std::env::var(k).is_ok_and(|v| !v.trim().is_empty()))
}

// 显式配置的代理优先于环境变量
fn apply_proxy(builder: ClientBuilder, proxy_url: Option<&str>) -> reqwest::Result<ClientBuilder> {
    match proxy_url.map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => {
            tracing::info!("Using outbound proxy: {}", url);
            Ok(builder.proxy(reqwest::Proxy::all(url)?))
        }
        None => {
            if has_proxy_env() {
                tracing::debug!("Outbound proxy taken from environment");
            }
            Ok(builder)
        }
    }
}

/// 非流式请求使用的客户端：带整体超时
pub fn completion_client(cfg: &HttpConfig) -> reqwest::Result<reqwest::Client> {
    let builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
        .timeout(Duration::from_secs(cfg.timeout_secs));
    apply_proxy(builder, cfg.proxy_url.as_deref())?.build()
}

/// 流式请求使用的客户端：只限制建连时间，避免长回答被整体超时截断
pub fn stream_client(cfg: &HttpConfig) -> reqwest::Result<reqwest::Client> {
    let builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs));
    apply_proxy(builder, cfg.proxy_url.as_deref())?.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_clients_with_and_without_proxy() {
        let mut cfg = HttpConfig::default();
        assert!(completion_client(&cfg).is_ok());
        cfg.proxy_url = Some("http://127.0.0.1:7890".into());
        assert!(stream_client(&cfg).is_ok());
    }

    #[test]
    fn blank_proxy_is_ignored() {
        let cfg = HttpConfig {
            proxy_url: Some("   ".into()),
            ..HttpConfig::default()
        };
        assert!(completion_client(&cfg).is_ok());
    }
}
