//! Chain module - explorer-backed transfer scanning for every supported network
//!
//! This module provides:
//! - The closed set of supported chains and their per-kind defaults
//! - Explorer HTTP transport with URL failover
//! - One adapter per feed schema, each turning a raw transfer feed into
//!   validated candidate transfers for a single wallet address

pub mod etherscan;
pub mod explorer;
pub mod tronscan;

pub use etherscan::EtherscanAdapter;
pub use explorer::ExplorerClient;
pub use tronscan::TronscanAdapter;

use crate::config::Settings;
use crate::error::{ReconcilerError, ReconcilerResult};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Supported networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Tron,
    Ethereum,
    Polygon,
    Bsc,
    Arbitrum,
    Avalanche,
}

/// Scan job grouping: one job type per family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainFamily {
    Tron,
    Evm,
}

impl Chain {
    pub const ALL: [Chain; 6] = [
        Chain::Tron,
        Chain::Ethereum,
        Chain::Polygon,
        Chain::Bsc,
        Chain::Arbitrum,
        Chain::Avalanche,
    ];

    /// Prefix used in chain-qualified addresses and wallet lock keys
    pub fn prefix(&self) -> &'static str {
        match self {
            Chain::Tron => "trc20",
            Chain::Ethereum => "eth",
            Chain::Polygon => "polygon",
            Chain::Bsc => "bsc",
            Chain::Arbitrum => "arb",
            Chain::Avalanche => "avax-c",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Chain> {
        Chain::ALL.into_iter().find(|c| c.prefix() == prefix)
    }

    pub fn family(&self) -> ChainFamily {
        match self {
            Chain::Tron => ChainFamily::Tron,
            _ => ChainFamily::Evm,
        }
    }

    pub fn is_evm(&self) -> bool {
        self.family() == ChainFamily::Evm
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Chain::Tron => "TRON - TRC20",
            Chain::Ethereum => "Ethereum - ERC20",
            Chain::Polygon => "Polygon PoS Chain (POL)",
            Chain::Bsc => "BNB Smart Chain - BEP20",
            Chain::Arbitrum => "Arbitrum One",
            Chain::Avalanche => "Avalanche (C-Chain)",
        }
    }

    /// Chain id understood by the multi-chain explorer API (EVM only)
    pub fn explorer_chain_id(&self) -> Option<u64> {
        match self {
            Chain::Tron => None,
            Chain::Ethereum => Some(1),
            Chain::Polygon => Some(137),
            Chain::Bsc => Some(56),
            Chain::Arbitrum => Some(42161),
            Chain::Avalanche => Some(43114),
        }
    }

    /// USDT contract on this chain
    pub fn default_contract(&self) -> &'static str {
        match self {
            Chain::Tron => "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t",
            Chain::Ethereum => "0xdAC17F958D2ee523a2206206994597C13D831ec7",
            Chain::Polygon => "0xc2132d05d31c914a87c6611c10748aeb04b58e8f",
            Chain::Bsc => "0x55d398326f99059fF775485246999027B3197955",
            Chain::Arbitrum => "0xFd086bC7CD5C481DCC9C85ebE478A1C0b69FCbb9",
            Chain::Avalanche => "0x9702230A8Ea53601f5cD2dc00fDBc13d4dF4A8c7",
        }
    }

    pub fn default_decimals(&self) -> u32 {
        match self {
            Chain::Bsc => 18,
            _ => 6,
        }
    }

    /// Minimum confirmations before a transfer is acted on.
    /// The TRC20 feed only reports finalized results, so Tron needs none.
    pub fn default_confirmations(&self) -> u64 {
        match self {
            Chain::Tron => 0,
            _ => 5,
        }
    }

    pub fn default_page_size(&self) -> u32 {
        match self {
            Chain::Tron => 50,
            _ => 10,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A wallet address qualified by its network, rendered `<prefix>:<address>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainAddress {
    pub chain: Chain,
    pub address: String,
}

impl ChainAddress {
    pub fn new(chain: Chain, address: impl Into<String>) -> Self {
        Self {
            chain,
            address: address.into(),
        }
    }

    /// Parse the `<prefix>:<address>` form stored on orders
    pub fn parse(qualified: &str) -> Option<Self> {
        let (prefix, address) = qualified.split_once(':')?;
        let chain = Chain::from_prefix(prefix)?;
        if address.is_empty() {
            return None;
        }
        Some(Self::new(chain, address))
    }
}

impl fmt::Display for ChainAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain.prefix(), self.address)
    }
}

/// Resolution of the timestamps a feed reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampPrecision {
    Millis,
    Seconds,
}

impl TimestampPrecision {
    /// Truncate `at` to this precision so it compares fairly with feed timestamps
    pub fn truncate(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimestampPrecision::Millis => at.trunc_subsecs(3),
            TimestampPrecision::Seconds => at.trunc_subsecs(0),
        }
    }
}

/// A transfer that passed the chain's validity filter
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateTransfer {
    pub chain: Chain,
    pub to: String,
    pub from: String,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
    pub precision: TimestampPrecision,
    pub tx_hash: String,
}

/// Capability shared by every per-network scanner
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> Chain;

    /// Asset contract matched against each record, if the feed reports one
    fn contract_address(&self) -> Option<String>;

    fn decimals(&self) -> u32;

    fn confirmation_threshold(&self) -> u64;

    /// Read recent transfers for `address`, newest first, keeping only the
    /// ones that are valid payments into it
    async fn scan(&self, address: &str) -> ReconcilerResult<Vec<CandidateTransfer>>;
}

/// Convert a raw integer token amount into a normalized decimal
pub fn normalize_amount(raw: &str, decimals: u32) -> ReconcilerResult<Decimal> {
    let amount_err = |message: String| ReconcilerError::Amount {
        raw: raw.to_string(),
        message,
    };

    let units: i128 = raw
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| amount_err(e.to_string()))?;
    if units < 0 {
        return Err(amount_err("negative amount".to_string()));
    }

    Decimal::try_from_i128_with_scale(units, decimals)
        .map(|d| d.normalize())
        .map_err(|e| amount_err(e.to_string()))
}

/// Adapters for every enabled chain, built once at startup
pub struct ChainRegistry {
    adapters: HashMap<Chain, Arc<dyn ChainAdapter>>,
}

impl ChainRegistry {
    pub fn new(adapters: Vec<Arc<dyn ChainAdapter>>) -> Self {
        Self {
            adapters: adapters.into_iter().map(|a| (a.chain(), a)).collect(),
        }
    }

    /// Build adapters for all enabled chains in the configuration
    pub fn from_settings(settings: &Settings) -> ReconcilerResult<Self> {
        let mut adapters: Vec<Arc<dyn ChainAdapter>> = Vec::new();

        for (name, chain_config) in settings.enabled_chains() {
            let chain = chain_config.kind;
            if adapters.iter().any(|a| a.chain() == chain) {
                warn!("Skipping chain {} - {} is already configured", name, chain);
                continue;
            }

            let client = ExplorerClient::new(
                chain,
                chain_config.explorer_urls.clone(),
                chain_config.request_timeout(),
            )?;

            let adapter: Arc<dyn ChainAdapter> = match chain.family() {
                ChainFamily::Tron => Arc::new(TronscanAdapter::new(client, chain_config)),
                ChainFamily::Evm => Arc::new(EtherscanAdapter::new(client, chain_config)?),
            };

            info!(
                "Initialized {} adapter (contract {:?}, {} decimals, {} confirmations)",
                chain,
                adapter.contract_address(),
                adapter.decimals(),
                adapter.confirmation_threshold()
            );
            adapters.push(adapter);
        }

        Ok(Self::new(adapters))
    }

    pub fn get(&self, chain: Chain) -> Option<Arc<dyn ChainAdapter>> {
        self.adapters.get(&chain).cloned()
    }

    /// Adapters belonging to one scan family, in a stable order
    pub fn family(&self, family: ChainFamily) -> Vec<Arc<dyn ChainAdapter>> {
        Chain::ALL
            .iter()
            .filter(|c| c.family() == family)
            .filter_map(|c| self.get(*c))
            .collect()
    }

    pub fn chains(&self) -> Vec<Chain> {
        Chain::ALL
            .iter()
            .copied()
            .filter(|c| self.adapters.contains_key(c))
            .collect()
    }
}
