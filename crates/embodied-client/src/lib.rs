//! HTTP client for the upstream embodied AI endpoint
//!
//! One operation: POST a JSON payload and decode the JSON reply. Transport,
//! status and decode failures all surface as [`ClientError::Communication`].

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Default request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Error communicating with AI endpoint: {message}")]
    Communication { message: String },
}

impl ClientError {
    pub fn communication(message: impl Into<String>) -> Self {
        Self::Communication {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::communication(err.to_string())
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Connection settings for the upstream endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub endpoint: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(DEFAULT_TIMEOUT_SECS)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(serde::de::Error::custom("timeout must be a positive number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth_token: None,
            headers: HashMap::new(),
            timeout: default_timeout(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Headers sent with every request.
    ///
    /// `Content-Type: application/json` first, configured headers on top,
    /// then `Authorization` from the auth token unless already set.
    pub fn request_headers(&self) -> ClientResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::communication(format!("invalid header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::communication(format!("invalid value for {name}: {e}")))?;
            headers.insert(name, value);
        }

        if let Some(token) = self.auth_token.as_deref().filter(|t| !t.is_empty()) {
            if !headers.contains_key(AUTHORIZATION) {
                let value = HeaderValue::from_str(token).map_err(|e| {
                    ClientError::communication(format!("invalid auth token: {e}"))
                })?;
                headers.insert(AUTHORIZATION, value);
            }
        }

        Ok(headers)
    }
}

/// Anything that can deliver a JSON payload upstream
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn post_json(&self, payload: &serde_json::Value) -> ClientResult<serde_json::Value>;
}

/// reqwest-backed client for the upstream endpoint
#[derive(Debug, Clone)]
pub struct EmbodiedClient {
    http: reqwest::Client,
    config: ClientConfig,
    headers: HeaderMap,
}

impl EmbodiedClient {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Self::with_http_client(http, config)
    }

    /// Build on a shared reqwest client. The per-request timeout still applies.
    pub fn with_http_client(http: reqwest::Client, config: ClientConfig) -> ClientResult<Self> {
        let headers = config.request_headers()?;
        Ok(Self {
            http,
            config,
            headers,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[async_trait]
impl UpstreamClient for EmbodiedClient {
    #[instrument(skip(self, payload), fields(endpoint = %self.config.endpoint))]
    async fn post_json(&self, payload: &serde_json::Value) -> ClientResult<serde_json::Value> {
        let response = self
            .http
            .post(&self.config.endpoint)
            .headers(self.headers.clone())
            .timeout(self.config.timeout)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;

        debug!(status = %response.status(), "Upstream accepted payload");
        Ok(response.json::<serde_json::Value>().await?)
    }
}
