use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use async_openai::types as oai;

use crate::error::{GatewayError, Result};

/// 签名令牌有效期（毫秒）
pub const TOKEN_TTL_MS: i64 = 10 * 60 * 1000;

#[derive(Serialize)]
struct JwtHeader<'a> {
    alg: &'a str,
    sign_type: &'a str,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    api_key: &'a str,
    exp: i64,
    timestamp: i64,
}

/// 将 `id.secret` 形式的智谱密钥签成短期 HS256 令牌；其它形式原样返回
pub fn sign_glm_key(key: &str, now_ms: i64) -> Result<String> {
    let Some((id, secret)) = key.split_once('.') else {
        return Ok(key.to_string());
    };
    if id.is_empty() || secret.is_empty() {
        return Ok(key.to_string());
    }

    let header = serde_json::to_vec(&JwtHeader {
        alg: "HS256",
        sign_type: "SIGN",
    })?;
    let claims = serde_json::to_vec(&JwtClaims {
        api_key: id,
        exp: now_ms + TOKEN_TTL_MS,
        timestamp: now_ms,
    })?;
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(claims)
    );

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::InvalidRequest(format!("invalid signing key: {e}")))?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{signing_input}.{signature}"))
}

/// 去除 data:image/...;base64, 前缀，只保留逗号后的纯 base64 数据
pub fn strip_image_data_prefix(req: &mut oai::CreateChatCompletionRequest) {
    for msg in &mut req.messages {
        let oai::ChatCompletionRequestMessage::User(m) = msg else {
            continue;
        };
        let oai::ChatCompletionRequestUserMessageContent::Array(parts) = &mut m.content else {
            continue;
        };
        for part in parts.iter_mut() {
            if let oai::ChatCompletionRequestUserMessageContentPart::ImageUrl(img) = part {
                let url = &mut img.image_url.url;
                if url.starts_with("data:image/")
                    && let Some(idx) = url.find(',')
                {
                    *url = url[idx + 1..].to_string();
                }
            }
        }
    }
}
