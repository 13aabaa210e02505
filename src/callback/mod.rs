//! Merchant callback delivery
//!
//! A paid order gets one [`CallbackTask`] on a bounded queue. The worker
//! delivers it, records each attempt on the order and stops at
//! confirmation or after `max_retry` attempts in total. Orders whose
//! callback is still unconfirmed are re-enqueued by the callback sweep.

mod sender;
mod worker;

pub use sender::{CallbackSender, HttpCallbackSender};
pub use worker::CallbackWorker;

#[cfg(test)]
pub use sender::MockCallbackSender;

use crate::config::CallbackConfig;
use crate::error::{ReconcilerError, ReconcilerResult};
use crate::state::{CallbackAttempt, Order, OrderStore};

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// One queued delivery; carries only what is needed to reload the order
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackTask {
    pub task_id: Uuid,
    pub trade_id: String,
    pub max_retry: u32,
}

/// JSON body posted to the merchant's notify URL
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallbackPayload {
    pub trade_id: String,
    pub order_id: String,
    pub amount: Decimal,
    pub actual_amount: Decimal,
    pub token: String,
    pub block_transaction_id: String,
    pub status: i16,
    pub signature: String,
}

impl CallbackPayload {
    pub fn for_order(order: &Order, signing_token: &str) -> Self {
        let block_transaction_id = order.block_transaction_id.clone().unwrap_or_default();
        let status = order.status.code();

        let mut fields = BTreeMap::new();
        fields.insert("trade_id", order.trade_id.clone());
        fields.insert("order_id", order.order_id.clone());
        fields.insert("amount", order.amount.normalize().to_string());
        fields.insert("actual_amount", order.actual_amount.normalize().to_string());
        fields.insert("token", order.token.clone());
        fields.insert("block_transaction_id", block_transaction_id.clone());
        fields.insert("status", status.to_string());

        Self {
            trade_id: order.trade_id.clone(),
            order_id: order.order_id.clone(),
            amount: order.amount.normalize(),
            actual_amount: order.actual_amount.normalize(),
            token: order.token.clone(),
            block_transaction_id,
            status,
            signature: sign(&fields, signing_token),
        }
    }
}

/// Hex SHA3-256 of `k1=v1&k2=v2...` in key order, followed by `token`.
/// Empty values are left out.
pub fn sign(fields: &BTreeMap<&str, String>, token: &str) -> String {
    let joined = fields
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha3_256::new();
    hasher.update(joined.as_bytes());
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Front door of the callback queue
pub struct CallbackDispatcher {
    tx: mpsc::Sender<CallbackTask>,
    orders: Arc<dyn OrderStore>,
    /// trade id -> task currently being delivered
    in_flight: DashMap<String, Uuid>,
    max_attempts: u32,
}

impl CallbackDispatcher {
    /// Build the dispatcher and the receiving end for the worker
    pub fn new(
        orders: Arc<dyn OrderStore>,
        config: &CallbackConfig,
    ) -> (Self, mpsc::Receiver<CallbackTask>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let dispatcher = Self {
            tx,
            orders,
            in_flight: DashMap::new(),
            max_attempts: config.max_attempts,
        };
        (dispatcher, rx)
    }

    /// Queue a delivery for a paid order.
    ///
    /// Returns `None` when a delivery for the same trade is already queued
    /// or running.
    pub fn enqueue(&self, order: &Order) -> ReconcilerResult<Option<Uuid>> {
        let task = CallbackTask {
            task_id: Uuid::new_v4(),
            trade_id: order.trade_id.clone(),
            max_retry: self.max_attempts,
        };

        match self.in_flight.entry(order.trade_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                debug!(
                    "Callback for {} already in flight as {}",
                    order.trade_id,
                    existing.get()
                );
                return Ok(None);
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(task.task_id);
            }
        }

        if let Err(e) = self.tx.try_send(task.clone()) {
            self.in_flight.remove(&order.trade_id);
            return Err(ReconcilerError::Callback {
                trade_id: order.trade_id.clone(),
                message: format!("queue rejected task: {}", e),
            });
        }

        debug!("Enqueued callback {} for {}", task.task_id, task.trade_id);
        Ok(Some(task.task_id))
    }

    /// Paid orders whose callback is unconfirmed with attempts left
    pub async fn pending_callbacks(&self) -> ReconcilerResult<Vec<Order>> {
        self.orders.pending_callbacks(self.max_attempts as i32).await
    }

    /// Count one delivery attempt against the order
    pub async fn record_attempt(&self, order: &Order, confirmed: bool) -> ReconcilerResult<()> {
        self.orders
            .record_callback_attempt(&CallbackAttempt {
                id: order.id,
                confirmed,
            })
            .await
    }

    #[cfg(test)]
    pub fn is_in_flight(&self, trade_id: &str) -> bool {
        self.in_flight.contains_key(trade_id)
    }

    fn complete(&self, task: &CallbackTask) {
        self.in_flight
            .remove_if(&task.trade_id, |_, id| *id == task.task_id);
    }
}
