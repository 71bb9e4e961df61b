//! Signed REST client for Binance USDⓈ-M futures

use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

use super::types::ApiErrorBody;
use crate::infrastructure::exchange::error::{ExchangeError, Result};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;

/// Map an error response onto the adapter error taxonomy
pub fn map_api_error(status: u16, body: &str) -> ExchangeError {
    let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();

    if status == 429 || status == 418 {
        let msg = parsed.map(|b| b.msg).unwrap_or_else(|| body.to_string());
        return ExchangeError::RateLimited(msg);
    }

    match parsed {
        Some(ApiErrorBody { code, msg }) => match code {
            -1003 | -1015 => ExchangeError::RateLimited(msg),
            -2011 | -2013 => ExchangeError::OrderNotFound(msg),
            -2018 | -2019 | -2027 | -2028 => ExchangeError::InsufficientMargin(msg),
            -1021 | -1022 | -2014 | -2015 => ExchangeError::Authentication(msg),
            _ => ExchangeError::Api { code, message: msg },
        },
        None => ExchangeError::Api {
            code: status as i64,
            message: body.to_string(),
        },
    }
}

/// Item-level error inside a batch response (`{"code": -2019, "msg": "..."}`)
pub fn batch_item_error(value: &serde_json::Value) -> Option<ExchangeError> {
    let code = value.get("code")?.as_i64()?;
    let msg = value
        .get("msg")
        .and_then(|m| m.as_str())
        .unwrap_or_default();
    let body = serde_json::json!({ "code": code, "msg": msg }).to_string();
    Some(map_api_error(400, &body))
}

pub struct BinanceRest {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BinanceRest {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(5)
            .tcp_keepalive(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Hex HMAC-SHA256 of the query string
    pub fn sign(&self, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Authentication(e.to_string()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn encode(params: &[(&str, String)]) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in params {
            serializer.append_pair(k, v);
        }
        serializer.finish()
    }

    /// Unauthenticated GET
    pub async fn public_get<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T> {
        self.public_get_from(&self.base_url, path, params).await
    }

    /// Unauthenticated GET against another host (spot API)
    pub async fn public_get_from<T: DeserializeOwned>(
        &self,
        base_url: &str,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let query = Self::encode(params);
        let url = if query.is_empty() {
            format!("{}{}", base_url, path)
        } else {
            format!("{}{}?{}", base_url, path, query)
        };

        debug!("[Exchange] GET {}", url);
        let response = self.http.get(&url).send().await?;
        Self::handle_response(response).await
    }

    /// Request carrying only the API key header (listen key endpoints)
    pub async fn keyed<T: DeserializeOwned>(&self, method: Method, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Signed request: timestamp and recvWindow appended, then signature
    pub async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<T> {
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", chrono::Utc::now().timestamp_millis().to_string()));

        let query = Self::encode(&params);
        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        debug!("[Exchange] {} {}", method, path);
        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExchangeError::Timeout(format!("{} {}", path, e))
                } else {
                    ExchangeError::RequestFailed(e)
                }
            })?;

        Self::handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(map_api_error(status.as_u16(), &text));
        }

        // Binance occasionally returns 200 with an error body
        if status == StatusCode::OK && text.starts_with("{\"code\"") {
            if let Ok(body) = serde_json::from_str::<ApiErrorBody>(&text) {
                if body.code < 0 {
                    return Err(map_api_error(400, &text));
                }
            }
        }

        serde_json::from_str(&text).map_err(|e| {
            ExchangeError::DeserializeFailed(format!("{} (body: {})", e, truncate(&text, 200)))
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
