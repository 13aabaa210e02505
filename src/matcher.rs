//! Order matching
//!
//! Turns candidate transfers for one wallet into paid orders: resolve the
//! trade id through the lock store, check the transfer does not predate
//! the order, then commit the WaitPay -> PaySuccess transition and hand
//! the order to the callback queue and the operator notifier.

use crate::callback::CallbackDispatcher;
use crate::chain::{CandidateTransfer, ChainAddress};
use crate::error::{ReconcilerError, ReconcilerResult};
use crate::lock::LockStore;
use crate::metrics;
use crate::notify::{Notifier, PaymentNotice};
use crate::state::{MarkPaid, MarkPaidOutcome, Order, OrderStore};

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-scan tally of what happened to each candidate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchReport {
    pub candidates: usize,
    /// No lock for the amount
    pub unmatched: usize,
    /// Lock pointed at a trade id with no order
    pub orphaned: usize,
    pub violations: usize,
    pub paid: usize,
    /// Conditional transition declined (already paid, expired, reused hash)
    pub declined: usize,
}

pub struct OrderMatcher {
    locks: LockStore,
    orders: Arc<dyn OrderStore>,
    callbacks: Arc<CallbackDispatcher>,
    notifier: Arc<dyn Notifier>,
}

impl OrderMatcher {
    pub fn new(
        locks: LockStore,
        orders: Arc<dyn OrderStore>,
        callbacks: Arc<CallbackDispatcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            locks,
            orders,
            callbacks,
            notifier,
        }
    }

    /// Process candidates for `wallet` in feed order.
    ///
    /// Storage faults abort the remaining candidates and propagate; a
    /// causality violation drops only its own candidate.
    pub async fn process(
        &self,
        wallet: &ChainAddress,
        candidates: &[CandidateTransfer],
    ) -> ReconcilerResult<MatchReport> {
        let mut report = MatchReport {
            candidates: candidates.len(),
            ..MatchReport::default()
        };

        for transfer in candidates {
            let Some(trade_id) = self.locks.lookup_trade_id(wallet, transfer.amount).await? else {
                report.unmatched += 1;
                continue;
            };

            let Some(order) = self.orders.find_by_trade_id(&trade_id).await? else {
                warn!(
                    "Lock {} {} points at unknown trade {}",
                    wallet, transfer.amount, trade_id
                );
                report.orphaned += 1;
                continue;
            };

            if let Err(e) = check_causality(&order, transfer) {
                error!(
                    target: "payment_integrity",
                    trade_id = %order.trade_id,
                    tx_hash = %transfer.tx_hash,
                    wallet = %wallet,
                    amount = %transfer.amount,
                    transfer_at = %transfer.timestamp,
                    order_created_at = %order.created_at,
                    "{}", e
                );
                metrics::record_causality_violation(wallet.chain);
                report.violations += 1;
                continue;
            }

            if self.settle(wallet, transfer, order).await? {
                report.paid += 1;
            } else {
                report.declined += 1;
            }
        }

        Ok(report)
    }

    /// Commit the payment; true when this call moved the order to PaySuccess
    async fn settle(
        &self,
        wallet: &ChainAddress,
        transfer: &CandidateTransfer,
        order: Order,
    ) -> ReconcilerResult<bool> {
        let outcome = self
            .orders
            .mark_paid(&MarkPaid {
                trade_id: order.trade_id.clone(),
                block_transaction_id: transfer.tx_hash.clone(),
            })
            .await?;

        match &outcome {
            MarkPaidOutcome::Applied => {}
            MarkPaidOutcome::AlreadyPaid => {
                debug!("{} already credited to {}", transfer.tx_hash, order.trade_id);
                metrics::record_match(wallet.chain, "already_paid");
                return Ok(false);
            }
            MarkPaidOutcome::NotPending(status) => {
                warn!(
                    "Order {} is {:?}, ignoring transfer {}",
                    order.trade_id, status, transfer.tx_hash
                );
                metrics::record_match(wallet.chain, "not_pending");
                return Ok(false);
            }
            MarkPaidOutcome::DuplicateTransaction { trade_id } => {
                warn!(
                    "Transfer {} already settled order {}, not crediting {}",
                    transfer.tx_hash, trade_id, order.trade_id
                );
                metrics::record_match(wallet.chain, "duplicate_tx");
                return Ok(false);
            }
            MarkPaidOutcome::NotFound => {
                warn!("Order {} vanished before it could be marked paid", order.trade_id);
                metrics::record_match(wallet.chain, "not_found");
                return Ok(false);
            }
        }

        metrics::record_match(wallet.chain, "paid");
        info!(
            "Order {} paid by {} ({} on {})",
            order.trade_id, transfer.tx_hash, transfer.amount, wallet
        );

        if let Err(e) = self.locks.unlock(wallet, transfer.amount).await {
            warn!("Failed to release lock for {} {}: {}", wallet, transfer.amount, e);
        }

        match self.callbacks.enqueue(&order) {
            Ok(Some(task_id)) => debug!("Callback {} queued for {}", task_id, order.trade_id),
            Ok(None) => {}
            Err(e) => warn!("{} - the callback sweep will retry", e),
        }

        let notice = PaymentNotice {
            trade_id: order.trade_id.clone(),
            order_id: order.order_id.clone(),
            amount: order.amount,
            actual_amount: order.actual_amount,
            wallet: wallet.to_string(),
            created_at: order.created_at,
            matched_at: Utc::now(),
        };
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&notice).await {
                warn!("Payment notice for {} not delivered: {}", notice.trade_id, e);
            }
        });

        Ok(true)
    }
}

/// A transfer must not be older than the order it pays, compared at the
/// resolution the feed reports.
fn check_causality(order: &Order, transfer: &CandidateTransfer) -> ReconcilerResult<()> {
    if transfer.timestamp < transfer.precision.truncate(order.created_at) {
        return Err(ReconcilerError::CausalityViolation {
            trade_id: order.trade_id.clone(),
            tx_hash: transfer.tx_hash.clone(),
        });
    }
    Ok(())
}
