//! Configuration management for the payment reconciler
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::Chain;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub reconciler: ReconcilerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    pub instance_id: String,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub callback_sweep_interval_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub expiry_sweep_interval_secs: u64,
    #[serde(default = "default_expiration_minutes")]
    pub order_expiration_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackConfig {
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub queue_capacity: usize,
    #[serde(default)]
    pub signing_token: String,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            timeout_secs: 10,
            backoff_base_ms: 2_000,
            queue_capacity: 1024,
            signing_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    #[serde(default)]
    pub telegram_api_url: Option<String>,
}

/// Per-chain explorer configuration. Unset fields fall back to the
/// defaults of the chain kind.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub kind: Chain,
    pub enabled: bool,
    pub explorer_urls: Vec<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub explorer_chain_id: Option<u64>,
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub decimals: Option<u32>,
    #[serde(default)]
    pub confirmation_threshold: Option<u64>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ChainConfig {
    pub fn contract_address(&self) -> String {
        self.contract_address
            .clone()
            .unwrap_or_else(|| self.kind.default_contract().to_string())
    }

    pub fn decimals(&self) -> u32 {
        self.decimals.unwrap_or_else(|| self.kind.default_decimals())
    }

    pub fn confirmation_threshold(&self) -> u64 {
        self.confirmation_threshold
            .unwrap_or_else(|| self.kind.default_confirmations())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.unwrap_or_else(|| self.kind.default_page_size())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

const MAX_EXPIRATION_MINUTES: i64 = 7 * 24 * 60;
const MAX_LOOKBACK_HOURS: i64 = 30 * 24;

fn default_scan_interval() -> u64 {
    15
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_expiration_minutes() -> i64 {
    10
}

fn default_lookback_hours() -> i64 {
    24
}

fn default_request_timeout() -> u64 {
    10
}

impl Settings {
    /// Load settings from the file named by `RECONCILER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("RECONCILER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        let reconciler = &self.reconciler;
        for (key, secs) in [
            ("scan_interval_secs", reconciler.scan_interval_secs),
            ("callback_sweep_interval_secs", reconciler.callback_sweep_interval_secs),
            ("expiry_sweep_interval_secs", reconciler.expiry_sweep_interval_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("reconciler.{} must be at least 1", key);
            }
        }
        if !(1..=MAX_EXPIRATION_MINUTES).contains(&reconciler.order_expiration_minutes) {
            anyhow::bail!(
                "reconciler.order_expiration_minutes must be between 1 and {}",
                MAX_EXPIRATION_MINUTES
            );
        }

        for (name, chain) in &self.chains {
            if !chain.enabled {
                continue;
            }
            if chain.explorer_urls.is_empty() {
                anyhow::bail!("Chain {} has no explorer URLs configured", name);
            }
            if !(1..=MAX_LOOKBACK_HOURS).contains(&chain.lookback_hours) {
                anyhow::bail!(
                    "Chain {} lookback_hours must be between 1 and {}",
                    name,
                    MAX_LOOKBACK_HOURS
                );
            }
            if chain.request_timeout_secs == 0 {
                anyhow::bail!("Chain {} request_timeout_secs must be at least 1", name);
            }
            if chain.decimals() > 28 {
                anyhow::bail!("Chain {} decimals must be at most 28", name);
            }
            if chain.kind.is_evm() && chain.api_key.as_deref().unwrap_or("").is_empty() {
                tracing::warn!("Chain {} has no explorer API key - requests may be throttled", name);
            }
        }

        if self.cache.backend == CacheBackend::Redis && self.cache.redis_url.is_none() {
            anyhow::bail!("cache.redis_url is required for the redis backend");
        }

        if self.callback.max_attempts == 0 {
            anyhow::bail!("callback.max_attempts must be at least 1");
        }
        if self.callback.timeout_secs == 0 {
            anyhow::bail!("callback.timeout_secs must be at least 1");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.reconciler.scan_interval_secs)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
