//! Scan, callback sweep and expiry sweep jobs

use super::{fan_out, Job, JobKind, JobReport, TaskOutcome};
use crate::callback::CallbackDispatcher;
use crate::chain::{ChainAdapter, ChainAddress, ChainFamily};
use crate::error::ReconcilerResult;
use crate::lock::LockStore;
use crate::matcher::{MatchReport, OrderMatcher};
use crate::metrics;
use crate::state::{OrderStore, WalletDirectory};

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What happened to one wallet in a scan run
#[derive(Debug, Clone, PartialEq)]
pub enum AddressScan {
    /// No live lock, explorer not called
    Skipped,
    Scanned(MatchReport),
}

/// Scans every enabled wallet of every chain in one family
pub struct ScanJob {
    family: ChainFamily,
    adapters: Vec<Arc<dyn ChainAdapter>>,
    wallets: Arc<dyn WalletDirectory>,
    locks: LockStore,
    matcher: Arc<OrderMatcher>,
    interval: Duration,
}

impl ScanJob {
    pub fn new(
        family: ChainFamily,
        adapters: Vec<Arc<dyn ChainAdapter>>,
        wallets: Arc<dyn WalletDirectory>,
        locks: LockStore,
        matcher: Arc<OrderMatcher>,
        interval: Duration,
    ) -> Self {
        Self {
            family,
            adapters,
            wallets,
            locks,
            matcher,
            interval,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Lock gate, explorer read and matching for a single wallet
async fn scan_address(
    adapter: Arc<dyn ChainAdapter>,
    wallet: ChainAddress,
    locks: LockStore,
    matcher: Arc<OrderMatcher>,
) -> ReconcilerResult<AddressScan> {
    if !locks.is_locked(&wallet).await {
        metrics::record_scan_skipped(wallet.chain);
        return Ok(AddressScan::Skipped);
    }

    let candidates = match adapter.scan(&wallet.address).await {
        Ok(candidates) => {
            metrics::record_scan(wallet.chain, true);
            candidates
        }
        Err(e) => {
            metrics::record_scan(wallet.chain, false);
            return Err(e);
        }
    };
    metrics::record_candidates(wallet.chain, candidates.len());

    let report = matcher.process(&wallet, &candidates).await?;
    if report.paid > 0 {
        info!("{}: {} orders paid", wallet, report.paid);
    }
    Ok(AddressScan::Scanned(report))
}

#[async_trait]
impl Job for ScanJob {
    fn kind(&self) -> JobKind {
        JobKind::for_family(self.family)
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> JobReport {
        let mut report = JobReport::default();
        let mut tasks = Vec::new();

        for adapter in &self.adapters {
            let chain = adapter.chain();
            let wallets = match self.wallets.enabled_addresses(chain).await {
                Ok(wallets) => wallets,
                Err(e) => {
                    warn!("Could not list {} wallets: {}", chain, e);
                    report.failed += 1;
                    continue;
                }
            };

            for wallet in wallets {
                let address = wallet.qualified();
                tasks.push((
                    address.to_string(),
                    scan_address(
                        adapter.clone(),
                        address,
                        self.locks.clone(),
                        self.matcher.clone(),
                    ),
                ));
            }
        }

        report.tasks = tasks.len();
        let outcomes = fan_out(self.kind(), tasks).await;
        report.failed += outcomes.iter().filter(|(_, o)| o.is_failure()).count();

        let skipped = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, TaskOutcome::Completed(AddressScan::Skipped)))
            .count();
        debug!(
            "{}: {} wallets, {} without locks",
            self.kind(),
            report.tasks,
            skipped
        );

        report
    }
}

/// Re-enqueues paid orders whose callback is still unconfirmed
pub struct CallbackSweepJob {
    dispatcher: Arc<CallbackDispatcher>,
    interval: Duration,
}

impl CallbackSweepJob {
    pub fn new(dispatcher: Arc<CallbackDispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
        }
    }
}

#[async_trait]
impl Job for CallbackSweepJob {
    fn kind(&self) -> JobKind {
        JobKind::CallbackSweep
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> JobReport {
        let pending = match self.dispatcher.pending_callbacks().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Pending callback query failed: {}", e);
                return JobReport { tasks: 0, failed: 1 };
            }
        };

        let mut report = JobReport {
            tasks: pending.len(),
            failed: 0,
        };
        for order in &pending {
            if let Err(e) = self.dispatcher.enqueue(order) {
                warn!("{}", e);
                report.failed += 1;
            }
        }
        report
    }
}

/// Moves overdue WaitPay orders to Expired and releases their locks
pub struct ExpirySweepJob {
    orders: Arc<dyn OrderStore>,
    locks: LockStore,
    expiration: chrono::Duration,
    interval: Duration,
}

impl ExpirySweepJob {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        locks: LockStore,
        expiration: chrono::Duration,
        interval: Duration,
    ) -> Self {
        Self {
            orders,
            locks,
            expiration,
            interval,
        }
    }
}

#[async_trait]
impl Job for ExpirySweepJob {
    fn kind(&self) -> JobKind {
        JobKind::ExpirySweep
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> JobReport {
        let cutoff = Utc::now() - self.expiration;
        let overdue = match self.orders.expirable(cutoff).await {
            Ok(overdue) => overdue,
            Err(e) => {
                warn!("Expirable order query failed: {}", e);
                return JobReport { tasks: 0, failed: 1 };
            }
        };

        let mut report = JobReport {
            tasks: overdue.len(),
            failed: 0,
        };
        for order in overdue {
            match self.orders.expire(&order.order_id).await {
                Ok(true) => {
                    metrics::record_order_expired();
                    debug!("Order {} expired", order.trade_id);
                }
                // Paid between the query and the update
                Ok(false) => continue,
                Err(e) => {
                    warn!("Failed to expire {}: {}", order.trade_id, e);
                    report.failed += 1;
                    continue;
                }
            }

            let Some(wallet) = order.wallet() else {
                error!("Order {} has malformed token {:?}", order.trade_id, order.token);
                continue;
            };
            // The key may since have been taken over by a newer order
            match self.locks.lookup_trade_id(&wallet, order.actual_amount).await {
                Ok(Some(holder)) if holder == order.trade_id => {
                    if let Err(e) = self.locks.unlock(&wallet, order.actual_amount).await {
                        warn!("Failed to release lock for expired {}: {}", order.trade_id, e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Lock lookup for expired {} failed: {}", order.trade_id, e),
            }
        }
        report
    }
}
