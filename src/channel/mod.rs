//! 渠道配置：由外部协作方提供的厂商端点、凭证与特性开关（本模块只消费，不持久化）。
//!
//! # Channel Configuration
//!
//! A channel is the opaque bundle the core receives per call: which vendor
//! family to speak, where it lives, how to authenticate, and which optional
//! features (prompt caching, thinking) the endpoint supports. The core never
//! resolves or persists channels; it only deserializes and reads them.
//!
//! Channels can be loaded from YAML or JSON:
//!
//! ```rust
//! use llm_gateway_core::channel::{ChannelConfig, Vendor};
//!
//! let yaml = r#"
//! vendor: bedrock
//! base_url: https://bedrock-runtime.us-east-1.amazonaws.com
//! credential: { type: bearer, token: "abc" }
//! deploy_name: anthropic.claude-3-5-sonnet-20241022-v2:0
//! features: { supports_cache: true, supports_thinking: true }
//! "#;
//! let channel = ChannelConfig::from_yaml_str(yaml).unwrap();
//! assert_eq!(channel.vendor, Vendor::Bedrock);
//! assert_eq!(channel.retry_budget().max_retries, 0);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::{Error, ErrorContext, Result};

/// Vendor identifier. Selects the driver and the dialect it speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    #[serde(alias = "open_ai")]
    OpenAi,
    AzureOpenAi,
    DeepSeek,
    Qwen,
    Zhipu,
    Doubao,
    Moonshot,
    Bedrock,
    Gemini,
    Vertex,
    Responses,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::OpenAi => "openai",
            Vendor::AzureOpenAi => "azure_openai",
            Vendor::DeepSeek => "deepseek",
            Vendor::Qwen => "qwen",
            Vendor::Zhipu => "zhipu",
            Vendor::Doubao => "doubao",
            Vendor::Moonshot => "moonshot",
            Vendor::Bedrock => "bedrock",
            Vendor::Gemini => "gemini",
            Vendor::Vertex => "vertex",
            Vendor::Responses => "responses",
        }
    }

    pub fn is_openai_compatible(&self) -> bool {
        matches!(
            self,
            Vendor::OpenAi
                | Vendor::AzureOpenAi
                | Vendor::DeepSeek
                | Vendor::Qwen
                | Vendor::Zhipu
                | Vendor::Doubao
                | Vendor::Moonshot
        )
    }

    /// Default automatic retries on transport errors.
    ///
    /// Bedrock and Responses calls routinely run for hundreds of seconds, so a
    /// transport error there is not retried unless the channel says otherwise.
    pub fn default_max_retries(&self) -> u32 {
        match self {
            Vendor::Bedrock | Vendor::Responses => 0,
            Vendor::Gemini | Vendor::Vertex => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential material, opaque to the core beyond how it is presented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// `Authorization: Bearer <token>`
    Bearer { token: String },
    /// Key sent in a vendor-specific header (`api-key`, `x-goog-api-key`, ...)
    ApiKey { key: String },
    None,
}

impl Default for Credential {
    fn default() -> Self {
        Credential::None
    }
}

impl Credential {
    /// Stable identity for cache keys; never the raw secret.
    pub fn fingerprint(&self) -> String {
        let raw = match self {
            Credential::Bearer { token } => format!("bearer:{}", token),
            Credential::ApiKey { key } => format!("key:{}", key),
            Credential::None => return "anonymous".to_string(),
        };
        let digest = Sha256::digest(raw.as_bytes());
        digest.iter().take(16).map(|b| format!("{:02x}", b)).collect()
    }

    pub fn secret(&self) -> Option<&str> {
        match self {
            Credential::Bearer { token } => Some(token),
            Credential::ApiKey { key } => Some(key),
            Credential::None => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFeatures {
    /// Endpoint honours explicit prompt-cache boundary markers.
    #[serde(default)]
    pub supports_cache: bool,
    /// Endpoint accepts a thinking/reasoning budget.
    #[serde(default)]
    pub supports_thinking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_ms: u64,
    /// Whole-call budget for synchronous calls and the idle gap between
    /// stream chunks.
    #[serde(default = "default_read_timeout_ms")]
    pub read_ms: u64,
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

fn default_connect_timeout_ms() -> u64 {
    env_u64("GATEWAY_HTTP_CONNECT_TIMEOUT_MS").unwrap_or(10_000)
}

fn default_read_timeout_ms() -> u64 {
    env_u64("GATEWAY_HTTP_READ_TIMEOUT_MS").unwrap_or(600_000)
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout_ms(),
            read_ms: default_read_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }
}

/// Automatic retry policy for the direct dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    pub max_retries: u32,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_min_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl RetryBudget {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }

    /// Exponential backoff: min_delay * 2^attempt, capped at max_delay.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.min_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Per-call channel bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub vendor: Vendor,
    pub base_url: String,
    #[serde(default)]
    pub credential: Credential,
    /// Vendor-side model/deployment name; overrides the canonical model id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_name: Option<String>,
    /// Cloud region / location (Vertex `locations/{region}`, Bedrock runtime region).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    /// Merged into the vendor request body last.
    #[serde(default)]
    pub extra_params: Map<String, Value>,
    #[serde(default)]
    pub features: ChannelFeatures,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryBudget>,
}

impl ChannelConfig {
    pub fn new(vendor: Vendor, base_url: impl Into<String>, credential: Credential) -> Self {
        Self {
            vendor,
            base_url: base_url.into(),
            credential,
            deploy_name: None,
            region: None,
            api_version: None,
            extra_headers: HashMap::new(),
            extra_params: Map::new(),
            features: ChannelFeatures::default(),
            timeouts: TimeoutConfig::default(),
            retry: None,
        }
    }

    pub fn with_deploy_name(mut self, name: impl Into<String>) -> Self {
        self.deploy_name = Some(name.into());
        self
    }

    pub fn with_features(mut self, features: ChannelFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn with_retry(mut self, retry: RetryBudget) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let channel: ChannelConfig = serde_yaml::from_str(s).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid channel YAML: {}", e),
                ErrorContext::new().with_source("channel_loader"),
            )
        })?;
        channel.validate()?;
        Ok(channel)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let channel: ChannelConfig = serde_json::from_str(s)?;
        channel.validate()?;
        Ok(channel)
    }

    pub fn validate(&self) -> Result<()> {
        if url::Url::parse(&self.base_url).is_err() {
            return Err(Error::configuration_with_context(
                format!("base_url is not an absolute URL: {}", self.base_url),
                ErrorContext::new()
                    .with_field_path("base_url")
                    .with_source("channel_loader"),
            ));
        }
        if self.vendor == Vendor::AzureOpenAi && self.deploy_name.is_none() {
            return Err(Error::configuration_with_context(
                "azure_openai channels need a deploy_name",
                ErrorContext::new()
                    .with_field_path("deploy_name")
                    .with_source("channel_loader"),
            ));
        }
        Ok(())
    }

    /// Model id sent on the wire.
    pub fn wire_model<'a>(&'a self, canonical: &'a str) -> &'a str {
        self.deploy_name.as_deref().unwrap_or(canonical)
    }

    pub fn retry_budget(&self) -> RetryBudget {
        self.retry.clone().unwrap_or_else(|| RetryBudget {
            max_retries: self.vendor.default_max_retries(),
            ..RetryBudget::none()
        })
    }

    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// Identity of the vendor endpoint + credential, used as the client cache key.
    pub fn client_key(&self) -> crate::transport::ClientKey {
        crate::transport::ClientKey {
            endpoint: self.base().to_string(),
            credential: self.credential.fingerprint(),
            connect_ms: self.timeouts.connect_ms,
            read_ms: self.timeouts.read_ms,
        }
    }
}
