//! IP Protection Configuration
//!
//! Tuning knobs for the token cache and proxy-list manager. Loadable from
//! TOML or JSON so the owning network context can ship it alongside other
//! browser settings.

use crate::token::ProxyLayer;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

fn default_layers() -> Vec<ProxyLayer> {
    ProxyLayer::all().to_vec()
}

fn default_batch_size() -> u32 {
    64
}

fn default_low_water_mark() -> usize {
    16
}

fn default_freshness_margin_secs() -> u64 {
    5
}

fn default_failure_backoff_secs() -> u64 {
    5
}

fn default_max_failure_backoff_secs() -> u64 {
    10 * 60
}

fn default_true() -> bool {
    true
}

/// Complete IP Protection cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpProtectionConfig {
    /// Proxy layers to keep tokens for, in chain order
    #[serde(default = "default_layers")]
    pub layers: Vec<ProxyLayer>,
    /// Tokens requested per fetch
    #[serde(default = "default_batch_size")]
    pub token_batch_size: u32,
    /// Refill once a layer holds fewer tokens than this
    #[serde(default = "default_low_water_mark")]
    pub token_low_water_mark: usize,
    /// Tokens this close to expiration are treated as expired (seconds)
    #[serde(default = "default_freshness_margin_secs")]
    pub token_freshness_margin_secs: u64,
    /// Local cooldown after a failed fetch without a server hint (seconds)
    #[serde(default = "default_failure_backoff_secs")]
    pub failure_backoff_secs: u64,
    /// Upper bound for the doubled local cooldown (seconds)
    #[serde(default = "default_max_failure_backoff_secs")]
    pub max_failure_backoff_secs: u64,
    /// Allow proxy chains reached over QUIC
    #[serde(default = "default_true")]
    pub enable_quic_proxies: bool,
}

impl IpProtectionConfig {
    /// Configuration for a single-hop proxy
    pub fn single_hop() -> Self {
        Self {
            layers: vec![ProxyLayer::ProxyA],
            ..Self::default()
        }
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let content = std::fs::read_to_string(path)?;

        match ext {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
        }
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Tokens this close to expiration are never served
    pub fn token_freshness_margin(&self) -> Duration {
        Duration::from_secs(self.token_freshness_margin_secs)
    }

    /// Base local cooldown after a failed token fetch
    pub fn failure_backoff(&self) -> Duration {
        Duration::from_secs(self.failure_backoff_secs)
    }

    /// Cap for the local cooldown
    pub fn max_failure_backoff(&self) -> Duration {
        Duration::from_secs(self.max_failure_backoff_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.layers.is_empty() {
            return Err(ConfigError::NoLayers);
        }
        let mut seen = HashSet::new();
        for layer in &self.layers {
            if !seen.insert(*layer) {
                return Err(ConfigError::DuplicateLayer(*layer));
            }
        }
        if self.token_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if self.token_low_water_mark > self.token_batch_size as usize {
            return Err(ConfigError::LowWaterMarkTooHigh {
                low_water_mark: self.token_low_water_mark,
                batch_size: self.token_batch_size,
            });
        }
        if self.failure_backoff_secs == 0 {
            return Err(ConfigError::ZeroBackoff);
        }
        if self.failure_backoff_secs > self.max_failure_backoff_secs {
            return Err(ConfigError::InvalidBackoff);
        }
        Ok(())
    }
}

impl Default for IpProtectionConfig {
    fn default() -> Self {
        Self {
            layers: default_layers(),
            token_batch_size: default_batch_size(),
            token_low_water_mark: default_low_water_mark(),
            token_freshness_margin_secs: default_freshness_margin_secs(),
            failure_backoff_secs: default_failure_backoff_secs(),
            max_failure_backoff_secs: default_max_failure_backoff_secs(),
            enable_quic_proxies: true,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),

    #[error("Unsupported config format: {0:?}")]
    UnsupportedFormat(String),

    #[error("At least one proxy layer is required")]
    NoLayers,

    #[error("Proxy layer {0} configured more than once")]
    DuplicateLayer(ProxyLayer),

    #[error("Token batch size must be positive")]
    InvalidBatchSize,

    #[error("Low-water mark {low_water_mark} exceeds batch size {batch_size}")]
    LowWaterMarkTooHigh { low_water_mark: usize, batch_size: u32 },

    #[error("Failure backoff must be at least one second")]
    ZeroBackoff,

    #[error("Failure backoff exceeds its maximum")]
    InvalidBackoff,
}
