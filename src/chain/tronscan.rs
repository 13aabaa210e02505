//! TRC20 transfer feed (Tronscan)

use super::{normalize_amount, CandidateTransfer, Chain, ChainAdapter, ExplorerClient, TimestampPrecision};
use crate::config::ChainConfig;
use crate::error::ReconcilerResult;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

const TRANSFER_PATH: &str = "/api/transfer/trc20";
const SUCCESS: &str = "SUCCESS";

/// One page of the TRC20 transfer feed
#[derive(Debug, Clone, Deserialize)]
pub struct TronTransferPage {
    #[serde(default)]
    pub page_size: i64,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub data: Vec<TronTransfer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TronTransfer {
    pub amount: String,
    pub block_timestamp: i64,
    #[serde(default)]
    pub from: String,
    pub to: String,
    pub hash: String,
    #[serde(default)]
    pub confirmed: u64,
    #[serde(default)]
    pub contract_ret: String,
    #[serde(default)]
    pub contract_address: Option<String>,
}

/// Scanner for USDT-TRC20 payments
pub struct TronscanAdapter {
    client: ExplorerClient,
    contract: String,
    decimals: u32,
    confirmation_threshold: u64,
    page_size: u32,
    lookback: chrono::Duration,
}

impl TronscanAdapter {
    pub fn new(client: ExplorerClient, config: &ChainConfig) -> Self {
        Self {
            client,
            contract: config.contract_address(),
            decimals: config.decimals(),
            confirmation_threshold: config.confirmation_threshold(),
            page_size: config.page_size(),
            lookback: chrono::Duration::hours(config.lookback_hours),
        }
    }

    /// Keep the transfers in `page` that are settled payments into `address`
    pub fn filter_page(&self, page: TronTransferPage, address: &str) -> Vec<CandidateTransfer> {
        if page.page_size <= 0 {
            return Vec::new();
        }

        page.data
            .into_iter()
            .filter(|t| self.is_valid(t, address))
            .filter_map(|t| {
                let amount = match normalize_amount(&t.amount, self.decimals) {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("Skipping TRC20 transfer {}: {}", t.hash, e);
                        return None;
                    }
                };
                let Some(timestamp) = Utc.timestamp_millis_opt(t.block_timestamp).single() else {
                    warn!("Skipping TRC20 transfer {}: bad timestamp {}", t.hash, t.block_timestamp);
                    return None;
                };
                Some(CandidateTransfer {
                    chain: Chain::Tron,
                    to: t.to,
                    from: t.from,
                    amount,
                    timestamp,
                    precision: TimestampPrecision::Millis,
                    tx_hash: t.hash,
                })
            })
            .collect()
    }

    fn is_valid(&self, transfer: &TronTransfer, address: &str) -> bool {
        // base58 addresses are case-sensitive
        if transfer.to != address || transfer.contract_ret != SUCCESS {
            return false;
        }
        if let Some(contract) = &transfer.contract_address {
            if contract != &self.contract {
                return false;
            }
        }
        transfer.confirmed >= self.confirmation_threshold
    }
}

#[async_trait]
impl ChainAdapter for TronscanAdapter {
    fn chain(&self) -> Chain {
        Chain::Tron
    }

    fn contract_address(&self) -> Option<String> {
        Some(self.contract.clone())
    }

    fn decimals(&self) -> u32 {
        self.decimals
    }

    fn confirmation_threshold(&self) -> u64 {
        self.confirmation_threshold
    }

    async fn scan(&self, address: &str) -> ReconcilerResult<Vec<CandidateTransfer>> {
        let end = Utc::now();
        let start = end - self.lookback;

        let query = [
            ("sort", "-timestamp".to_string()),
            ("limit", self.page_size.to_string()),
            ("start", "0".to_string()),
            ("direction", "2".to_string()),
            ("db_version", "1".to_string()),
            ("trc20Id", self.contract.clone()),
            ("address", address.to_string()),
            ("start_timestamp", start.timestamp_millis().to_string()),
            ("end_timestamp", end.timestamp_millis().to_string()),
        ];

        let page: TronTransferPage = self.client.get_json(TRANSFER_PATH, &query).await?;
        let fetched = page.data.len();
        let candidates = self.filter_page(page, address);

        debug!(
            "trc20:{} fetched {} transfers, {} candidates",
            address,
            fetched,
            candidates.len()
        );
        Ok(candidates)
    }
}
