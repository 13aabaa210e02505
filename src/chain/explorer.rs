//! Explorer HTTP client with multi-endpoint failover

use super::Chain;
use crate::error::{ReconcilerError, ReconcilerResult};

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Indexing API client for one chain, rotating through its base URLs
pub struct ExplorerClient {
    chain: Chain,
    http: reqwest::Client,
    /// Base URLs, tried in order starting from the current one
    base_urls: Vec<String>,
    /// Current active endpoint index
    current: AtomicUsize,
}

impl ExplorerClient {
    pub fn new(chain: Chain, base_urls: Vec<String>, timeout: Duration) -> ReconcilerResult<Self> {
        let base_urls: Vec<String> = base_urls
            .into_iter()
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .collect();

        if base_urls.is_empty() {
            return Err(ReconcilerError::Config(format!(
                "No explorer URLs configured for {}",
                chain
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReconcilerError::Config(format!("HTTP client for {}: {}", chain, e)))?;

        Ok(Self {
            chain,
            http,
            base_urls,
            current: AtomicUsize::new(0),
        })
    }

    fn base(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed);
        &self.base_urls[idx % self.base_urls.len()]
    }

    /// Switch to next available endpoint
    pub fn failover(&self) {
        if self.base_urls.len() < 2 {
            return;
        }
        let current = self.current.load(Ordering::Relaxed);
        let next = (current + 1) % self.base_urls.len();
        self.current.store(next, Ordering::Relaxed);
        warn!("{} explorer failover to endpoint {}", self.chain, next);
    }

    /// GET `path` with `query` and decode the JSON body.
    ///
    /// Transport faults and non-success statuses fail over to the next
    /// endpoint; a body that does not decode is returned as an error at once.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ReconcilerResult<T> {
        let mut last_error = None;

        for _ in 0..self.base_urls.len() {
            let url = format!("{}{}", self.base(), path);
            debug!("{} explorer GET {}", self.chain, url);

            let response = match self.http.get(&url).query(query).send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!("{} explorer request failed: {}", self.chain, e);
                    last_error = Some(ReconcilerError::Explorer {
                        chain: self.chain.to_string(),
                        message: e.to_string(),
                    });
                    self.failover();
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                last_error = Some(ReconcilerError::RateLimited {
                    chain: self.chain.to_string(),
                });
                self.failover();
                continue;
            }
            if !status.is_success() {
                warn!("{} explorer returned HTTP {}", self.chain, status);
                last_error = Some(ReconcilerError::ExplorerStatus {
                    chain: self.chain.to_string(),
                    status: status.as_u16(),
                });
                self.failover();
                continue;
            }

            let body = response.bytes().await.map_err(|e| ReconcilerError::Explorer {
                chain: self.chain.to_string(),
                message: e.to_string(),
            })?;

            return serde_json::from_slice(&body).map_err(|e| ReconcilerError::Decode {
                chain: self.chain.to_string(),
                message: e.to_string(),
            });
        }

        Err(last_error.unwrap_or_else(|| ReconcilerError::Explorer {
            chain: self.chain.to_string(),
            message: "All explorer endpoints failed".to_string(),
        }))
    }
}
