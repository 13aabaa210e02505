//! Account token-transfer feed (Etherscan v2 multi-chain API) for EVM networks

use super::{normalize_amount, CandidateTransfer, Chain, ChainAdapter, ExplorerClient, TimestampPrecision};
use crate::config::ChainConfig;
use crate::error::{ReconcilerError, ReconcilerResult};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

const API_PATH: &str = "/v2/api";
const NO_TRANSACTIONS: &str = "No transactions found";

/// Envelope of an account `tokentx` response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenTxResponse {
    pub status: String,
    pub message: String,
    /// A list on success, an error string otherwise
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransfer {
    pub block_number: String,
    pub time_stamp: String,
    pub hash: String,
    #[serde(default)]
    pub from: String,
    pub contract_address: String,
    pub to: String,
    pub value: String,
    #[serde(default)]
    pub confirmations: String,
}

/// Scanner for stablecoin payments on one EVM network
pub struct EtherscanAdapter {
    chain: Chain,
    client: ExplorerClient,
    explorer_chain_id: u64,
    api_key: String,
    contract: String,
    decimals: u32,
    confirmation_threshold: u64,
    page_size: u32,
}

impl EtherscanAdapter {
    pub fn new(client: ExplorerClient, config: &ChainConfig) -> ReconcilerResult<Self> {
        let chain = config.kind;
        let explorer_chain_id = config
            .explorer_chain_id
            .or_else(|| chain.explorer_chain_id())
            .ok_or_else(|| ReconcilerError::Config(format!("{} has no explorer chain id", chain)))?;

        Ok(Self {
            chain,
            client,
            explorer_chain_id,
            api_key: config.api_key.clone().unwrap_or_default(),
            contract: config.contract_address(),
            decimals: config.decimals(),
            confirmation_threshold: config.confirmation_threshold(),
            page_size: config.page_size(),
        })
    }

    /// Unwrap the response envelope into its transfer list
    pub fn transfers(&self, response: TokenTxResponse) -> ReconcilerResult<Vec<TokenTransfer>> {
        if response.status != "1" {
            if response.message == NO_TRANSACTIONS {
                return Ok(Vec::new());
            }
            return Err(ReconcilerError::Explorer {
                chain: self.chain.to_string(),
                message: format!("{}: {}", response.message, response.result),
            });
        }

        serde_json::from_value(response.result).map_err(|e| ReconcilerError::Decode {
            chain: self.chain.to_string(),
            message: e.to_string(),
        })
    }

    /// Keep the transfers that are confirmed payments of the configured token into `address`
    pub fn filter_transfers(&self, transfers: Vec<TokenTransfer>, address: &str) -> Vec<CandidateTransfer> {
        transfers
            .into_iter()
            .filter(|t| self.is_valid(t, address))
            .filter_map(|t| {
                let amount = match normalize_amount(&t.value, self.decimals) {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("Skipping {} transfer {}: {}", self.chain, t.hash, e);
                        return None;
                    }
                };
                let timestamp = t
                    .time_stamp
                    .parse::<i64>()
                    .ok()
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
                let Some(timestamp) = timestamp else {
                    warn!("Skipping {} transfer {}: bad timestamp {:?}", self.chain, t.hash, t.time_stamp);
                    return None;
                };
                Some(CandidateTransfer {
                    chain: self.chain,
                    to: t.to,
                    from: t.from,
                    amount,
                    timestamp,
                    precision: TimestampPrecision::Seconds,
                    tx_hash: t.hash,
                })
            })
            .collect()
    }

    fn is_valid(&self, transfer: &TokenTransfer, address: &str) -> bool {
        // hex addresses compare case-insensitively
        let is_token = transfer.contract_address.eq_ignore_ascii_case(&self.contract);
        let is_inbound = transfer.to.eq_ignore_ascii_case(address);
        let confirmations: u64 = transfer.confirmations.parse().unwrap_or(0);
        is_token && is_inbound && confirmations >= self.confirmation_threshold
    }
}

#[async_trait]
impl ChainAdapter for EtherscanAdapter {
    fn chain(&self) -> Chain {
        self.chain
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
        let query = [
            ("chainid", self.explorer_chain_id.to_string()),
            ("module", "account".to_string()),
            ("action", "tokentx".to_string()),
            ("address", address.to_string()),
            ("page", "1".to_string()),
            ("offset", self.page_size.to_string()),
            ("sort", "desc".to_string()),
            ("apikey", self.api_key.clone()),
        ];

        let response: TokenTxResponse = self.client.get_json(API_PATH, &query).await?;
        let transfers = self.transfers(response)?;
        let fetched = transfers.len();
        let candidates = self.filter_transfers(transfers, address);

        debug!(
            "{}:{} fetched {} transfers, {} candidates",
            self.chain,
            address,
            fetched,
            candidates.len()
        );
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::explorer::test_server::serve;
    use axum::extract::Query;
    use axum::routing::get;
    use axum::Router;
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const WALLET: &str = "0x8A3bF5e8c4D1a2B7C9e0F1a2b3C4d5E6f7A8b9C0";
    const POLYGON_USDT: &str = "0xc2132d05d31c914a87c6611c10748aeb04b58e8f";

    fn adapter(kind: &str) -> EtherscanAdapter {
        adapter_at(kind, "https://api.etherscan.io")
    }

    fn adapter_at(kind: &str, url: &str) -> EtherscanAdapter {
        let config: ChainConfig = toml::from_str(&format!(
            r#"
            kind = "{kind}"
            enabled = true
            explorer_urls = ["{url}"]
            api_key = "key"
            "#
        ))
        .unwrap();
        let client = ExplorerClient::new(config.kind, config.explorer_urls.clone(), Duration::from_secs(5)).unwrap();
        EtherscanAdapter::new(client, &config).unwrap()
    }

    fn transfer(contract: &str, to: &str, value: &str, confirmations: &str) -> TokenTransfer {
        TokenTransfer {
            block_number: "50000000".to_string(),
            time_stamp: "1700000000".to_string(),
            hash: format!("0x{}-{}", value, confirmations),
            from: "0xpayer".to_string(),
            contract_address: contract.to_string(),
            to: to.to_string(),
            value: value.to_string(),
            confirmations: confirmations.to_string(),
        }
    }

    #[test]
    fn test_matches_case_insensitively() {
        let polygon = adapter("polygon");
        let candidates = polygon.filter_transfers(
            vec![transfer(&POLYGON_USDT.to_uppercase().replace("0X", "0x"), &WALLET.to_lowercase(), "12500000", "40")],
            WALLET,
        );

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].chain, Chain::Polygon);
        assert_eq!(candidates[0].amount, Decimal::from_str("12.5").unwrap());
        assert_eq!(candidates[0].timestamp.timestamp(), 1_700_000_000);
        assert_eq!(candidates[0].precision, TimestampPrecision::Seconds);
    }

    #[test]
    fn test_rejects_below_threshold_wrong_token_and_outbound() {
        let polygon = adapter("polygon");
        let candidates = polygon.filter_transfers(
            vec![
                transfer(POLYGON_USDT, WALLET, "12500000", "4"),
                transfer(POLYGON_USDT, WALLET, "12500000", ""),
                transfer("0xdeadbeef", WALLET, "12500000", "40"),
                transfer(POLYGON_USDT, "0xsomeoneelse", "12500000", "40"),
            ],
            WALLET,
        );
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_bsc_uses_eighteen_decimals() {
        let bsc = adapter("bsc");
        let candidates = bsc.filter_transfers(
            vec![transfer(Chain::Bsc.default_contract(), WALLET, "7010000000000000000", "6")],
            WALLET,
        );
        assert_eq!(candidates[0].amount.to_string(), "7.01");
    }

    #[test]
    fn test_envelope_handling() {
        let polygon = adapter("polygon");

        let empty: TokenTxResponse = serde_json::from_str(
            r#"{"status": "0", "message": "No transactions found", "result": []}"#,
        )
        .unwrap();
        assert!(polygon.transfers(empty).unwrap().is_empty());

        let failed: TokenTxResponse = serde_json::from_str(
            r#"{"status": "0", "message": "NOTOK", "result": "Max rate limit reached"}"#,
        )
        .unwrap();
        assert!(matches!(polygon.transfers(failed), Err(ReconcilerError::Explorer { .. })));

        let ok: TokenTxResponse = serde_json::from_str(&format!(
            r#"{{"status": "1", "message": "OK", "result": [
                {{"blockNumber": "1", "timeStamp": "1700000000", "hash": "0xh", "from": "0xa",
                  "contractAddress": "{POLYGON_USDT}", "to": "{WALLET}", "value": "1000000",
                  "tokenDecimal": "6", "confirmations": "100"}}
            ]}}"#
        ))
        .unwrap();
        let transfers = polygon.transfers(ok).unwrap();
        assert_eq!(transfers.len(), 1);
        assert_eq!(polygon.filter_transfers(transfers, WALLET).len(), 1);
    }

    #[tokio::test]
    async fn test_scan_queries_account_feed() {
        let queries: Arc<Mutex<Vec<HashMap<String, String>>>> = Arc::default();
        let recorder = queries.clone();
        let body = format!(
            r#"{{"status": "1", "message": "OK", "result": [
                {{"blockNumber": "1", "timeStamp": "1700000000", "hash": "0xh", "from": "0xa",
                  "contractAddress": "{POLYGON_USDT}", "to": "{WALLET}", "value": "12500000",
                  "confirmations": "64"}}
            ]}}"#
        );
        let app = Router::new().route(
            API_PATH,
            get(move |Query(params): Query<HashMap<String, String>>| {
                let recorder = recorder.clone();
                let body = body.clone();
                async move {
                    recorder.lock().unwrap().push(params);
                    body
                }
            }),
        );
        let url = serve(app).await;

        let candidates = adapter_at("polygon", &url).scan(WALLET).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].amount, Decimal::from_str("12.5").unwrap());
        assert_eq!(candidates[0].tx_hash, "0xh");

        let params = queries.lock().unwrap().pop().unwrap();
        assert_eq!(params["chainid"], "137");
        assert_eq!(params["module"], "account");
        assert_eq!(params["action"], "tokentx");
        assert_eq!(params["address"], WALLET);
        assert_eq!(params["sort"], "desc");
        assert_eq!(params["page"], "1");
        assert_eq!(params["offset"], "10");
        assert_eq!(params["apikey"], "key");
    }

    #[tokio::test]
    async fn test_scan_surfaces_explorer_rejection() {
        let app = Router::new().route(
            API_PATH,
            get(|| async { r#"{"status": "0", "message": "NOTOK", "result": "Invalid API Key"}"# }),
        );
        let url = serve(app).await;

        let result = adapter_at("ethereum", &url).scan(WALLET).await;
        assert!(matches!(result, Err(ReconcilerError::Explorer { .. })));
    }
}
