use crate::config::ConfigError;
use crate::error::Error;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// What the remote reports about the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayInfo {
    pub url: String,
    pub recommended_shard_count: u32,
    pub max_concurrency: u32,
}

#[derive(Deserialize)]
struct SessionStartLimit {
    #[serde(default)]
    max_concurrency: Option<u32>,
}

// Accepts both the flat shape and `/gateway/bot` responses
#[derive(Deserialize)]
struct RawGatewayInfo {
    url: String,
    #[serde(default, alias = "shards")]
    recommended_shard_count: Option<u32>,
    #[serde(default)]
    max_concurrency: Option<u32>,
    #[serde(default)]
    session_start_limit: Option<SessionStartLimit>,
}

impl<'de> Deserialize<'de> for GatewayInfo {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawGatewayInfo::deserialize(deserializer)?;
        let max_concurrency = raw
            .max_concurrency
            .or_else(|| raw.session_start_limit.and_then(|l| l.max_concurrency))
            .unwrap_or(1);

        Ok(GatewayInfo {
            url: raw.url,
            recommended_shard_count: raw.recommended_shard_count.unwrap_or(1),
            max_concurrency,
        })
    }
}

/// Source of gateway URL, recommended shard count and max concurrency
#[async_trait]
pub trait GatewayDiscovery: Send + Sync {
    async fn gateway_info(&self) -> Result<GatewayInfo, Error>;
}

/// Queries `GET {api_base}/gateway/bot`
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HttpDiscovery {
    pub fn new(api_base: &str, token: impl Into<String>) -> Result<Self, ConfigError> {
        Self::with_path(api_base, "/gateway/bot", token)
    }

    pub fn with_path(
        api_base: &str,
        path: &str,
        token: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let endpoint = format!("{}{}", api_base.trim_end_matches('/'), path);
        url::Url::parse(&endpoint).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", endpoint, e)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConfigError::InvalidConnection(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            token: token.into(),
        })
    }
}

#[async_trait]
impl GatewayDiscovery for HttpDiscovery {
    async fn gateway_info(&self) -> Result<GatewayInfo, Error> {
        debug!("Requesting gateway info from {}", self.endpoint);

        let response = self
            .client
            .get(&self.endpoint)
            .header(AUTHORIZATION, format!("Bot {}", self.token))
            .send()
            .await
            .map_err(|e| Error::Discovery(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Discovery(format!("unexpected status {}", status)));
        }

        response
            .json::<GatewayInfo>()
            .await
            .map_err(|e| Error::Discovery(format!("invalid response body: {}", e)))
    }
}

/// Discovery with a pre-resolved answer
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    info: GatewayInfo,
}

impl StaticDiscovery {
    pub fn new(info: GatewayInfo) -> Self {
        Self { info }
    }
}

#[async_trait]
impl GatewayDiscovery for StaticDiscovery {
    async fn gateway_info(&self) -> Result<GatewayInfo, Error> {
        Ok(self.info.clone())
    }
}
