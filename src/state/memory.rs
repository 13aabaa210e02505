//! In-memory order store and wallet directory for tests

use super::{
    CallbackAttempt, CallbackConfirm, MarkPaid, MarkPaidOutcome, Order, OrderStats, OrderStatus,
    OrderStore, WalletAddress, WalletDirectory,
};
use crate::chain::Chain;
use crate::error::ReconcilerResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// A WaitPay order paying `actual_amount` into `token`
pub fn wait_pay_order(trade_id: &str, token: &str, actual_amount: &str, created_at: DateTime<Utc>) -> Order {
    Order {
        id: 0,
        trade_id: trade_id.to_string(),
        order_id: format!("merchant-{}", trade_id),
        token: token.to_string(),
        amount: Decimal::from(90),
        actual_amount: Decimal::from_str(actual_amount).unwrap(),
        status: OrderStatus::WaitPay,
        block_transaction_id: None,
        callback_num: 0,
        callback_confirm: CallbackConfirm::No,
        notify_url: "https://merchant.example/notify".to_string(),
        redirect_url: None,
        created_at,
        updated_at: created_at,
    }
}

#[derive(Default)]
pub struct MemoryOrderStore {
    orders: RwLock<Vec<Order>>,
    mark_paid_calls: AtomicUsize,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, mut order: Order) -> Order {
        let mut orders = self.orders.write().await;
        order.id = orders.len() as i64 + 1;
        orders.push(order.clone());
        order
    }

    pub async fn get(&self, trade_id: &str) -> Order {
        self.orders
            .read()
            .await
            .iter()
            .find(|o| o.trade_id == trade_id)
            .cloned()
            .expect("order exists")
    }

    pub fn mark_paid_calls(&self) -> usize {
        self.mark_paid_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn find_by_trade_id(&self, trade_id: &str) -> ReconcilerResult<Option<Order>> {
        Ok(self
            .orders
            .read()
            .await
            .iter()
            .find(|o| o.trade_id == trade_id)
            .cloned())
    }

    async fn mark_paid(&self, update: &MarkPaid) -> ReconcilerResult<MarkPaidOutcome> {
        self.mark_paid_calls.fetch_add(1, Ordering::SeqCst);
        let mut orders = self.orders.write().await;

        if let Some(credited) = orders
            .iter()
            .find(|o| o.block_transaction_id.as_deref() == Some(update.block_transaction_id.as_str()))
        {
            return Ok(if credited.trade_id == update.trade_id {
                MarkPaidOutcome::AlreadyPaid
            } else {
                MarkPaidOutcome::DuplicateTransaction {
                    trade_id: credited.trade_id.clone(),
                }
            });
        }

        let Some(order) = orders.iter_mut().find(|o| o.trade_id == update.trade_id) else {
            return Ok(MarkPaidOutcome::NotFound);
        };
        if order.status != OrderStatus::WaitPay {
            return Ok(MarkPaidOutcome::NotPending(order.status));
        }

        order.status = OrderStatus::PaySuccess;
        order.block_transaction_id = Some(update.block_transaction_id.clone());
        order.callback_confirm = CallbackConfirm::No;
        order.updated_at = Utc::now();
        Ok(MarkPaidOutcome::Applied)
    }

    async fn expire(&self, order_id: &str) -> ReconcilerResult<bool> {
        let mut orders = self.orders.write().await;
        match orders
            .iter_mut()
            .find(|o| o.order_id == order_id && o.status == OrderStatus::WaitPay)
        {
            Some(order) => {
                order.status = OrderStatus::Expired;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expirable(&self, cutoff: DateTime<Utc>) -> ReconcilerResult<Vec<Order>> {
        Ok(self
            .orders
            .read()
            .await
            .iter()
            .filter(|o| o.status == OrderStatus::WaitPay && o.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn pending_callbacks(&self, max_attempts: i32) -> ReconcilerResult<Vec<Order>> {
        Ok(self
            .orders
            .read()
            .await
            .iter()
            .filter(|o| {
                o.status == OrderStatus::PaySuccess
                    && o.callback_confirm == CallbackConfirm::No
                    && o.callback_num < max_attempts
            })
            .cloned()
            .collect())
    }

    async fn record_callback_attempt(&self, attempt: &CallbackAttempt) -> ReconcilerResult<()> {
        let mut orders = self.orders.write().await;
        if let Some(order) = orders.iter_mut().find(|o| o.id == attempt.id) {
            order.callback_num += 1;
            order.callback_confirm = if attempt.confirmed {
                CallbackConfirm::Yes
            } else {
                CallbackConfirm::No
            };
        }
        Ok(())
    }

    async fn stats(&self, max_attempts: i32) -> ReconcilerResult<OrderStats> {
        let orders = self.orders.read().await;
        let count = |s: OrderStatus| orders.iter().filter(|o| o.status == s).count() as u64;
        Ok(OrderStats {
            wait_pay: count(OrderStatus::WaitPay),
            pay_success: count(OrderStatus::PaySuccess),
            expired: count(OrderStatus::Expired),
            callbacks_pending: orders
                .iter()
                .filter(|o| {
                    o.status == OrderStatus::PaySuccess
                        && o.callback_confirm == CallbackConfirm::No
                        && o.callback_num < max_attempts
                })
                .count() as u64,
        })
    }

    async fn health_check(&self) -> ReconcilerResult<()> {
        Ok(())
    }
}

/// Fixed wallet inventory
#[derive(Default)]
pub struct StaticWallets {
    wallets: Vec<WalletAddress>,
}

impl StaticWallets {
    pub fn new(entries: &[(Chain, &str)]) -> Self {
        Self {
            wallets: entries
                .iter()
                .enumerate()
                .map(|(i, (chain, address))| WalletAddress {
                    id: i as i64 + 1,
                    chain: *chain,
                    address: address.to_string(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl WalletDirectory for StaticWallets {
    async fn enabled_addresses(&self, chain: Chain) -> ReconcilerResult<Vec<WalletAddress>> {
        Ok(self
            .wallets
            .iter()
            .filter(|w| w.chain == chain)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_callbacks_until_exhausted() {
        let store = MemoryOrderStore::new();
        let order = store
            .insert(wait_pay_order("T1", "trc20:TWallet", "10", Utc::now()))
            .await;

        assert!(store.pending_callbacks(5).await.unwrap().is_empty());

        let outcome = store
            .mark_paid(&MarkPaid {
                trade_id: "T1".to_string(),
                block_transaction_id: "h1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, MarkPaidOutcome::Applied);
        assert_eq!(store.pending_callbacks(5).await.unwrap().len(), 1);

        for attempt in 1..=5 {
            store
                .record_callback_attempt(&CallbackAttempt {
                    id: order.id,
                    confirmed: false,
                })
                .await
                .unwrap();
            let pending = store.pending_callbacks(5).await.unwrap();
            assert_eq!(pending.is_empty(), attempt == 5, "after attempt {}", attempt);
        }

        assert_eq!(store.get("T1").await.callback_num, 5);
        assert_eq!(store.get("T1").await.status, OrderStatus::PaySuccess);
    }

    #[tokio::test]
    async fn test_confirmed_callback_leaves_pending_set() {
        let store = MemoryOrderStore::new();
        let order = store
            .insert(wait_pay_order("T1", "trc20:TWallet", "10", Utc::now()))
            .await;
        store
            .mark_paid(&MarkPaid {
                trade_id: "T1".to_string(),
                block_transaction_id: "h1".to_string(),
            })
            .await
            .unwrap();

        store
            .record_callback_attempt(&CallbackAttempt {
                id: order.id,
                confirmed: true,
            })
            .await
            .unwrap();

        assert!(store.pending_callbacks(5).await.unwrap().is_empty());
        assert_eq!(store.get("T1").await.callback_confirm, CallbackConfirm::Yes);
    }

    #[tokio::test]
    async fn test_mark_paid_is_conditional() {
        let store = MemoryOrderStore::new();
        store
            .insert(wait_pay_order("T1", "trc20:TWallet", "10", Utc::now()))
            .await;
        store
            .insert(wait_pay_order("T2", "trc20:TWallet", "11", Utc::now()))
            .await;
        let paid = |trade: &str, hash: &str| MarkPaid {
            trade_id: trade.to_string(),
            block_transaction_id: hash.to_string(),
        };

        assert_eq!(store.mark_paid(&paid("T1", "h1")).await.unwrap(), MarkPaidOutcome::Applied);
        assert_eq!(store.mark_paid(&paid("T1", "h1")).await.unwrap(), MarkPaidOutcome::AlreadyPaid);
        assert_eq!(
            store.mark_paid(&paid("T1", "h9")).await.unwrap(),
            MarkPaidOutcome::NotPending(OrderStatus::PaySuccess)
        );
        assert_eq!(
            store.mark_paid(&paid("T2", "h1")).await.unwrap(),
            MarkPaidOutcome::DuplicateTransaction {
                trade_id: "T1".to_string()
            }
        );
        assert_eq!(store.mark_paid(&paid("T3", "h3")).await.unwrap(), MarkPaidOutcome::NotFound);

        assert!(store.expire("merchant-T2").await.unwrap());
        assert!(!store.expire("merchant-T1").await.unwrap());
        assert_eq!(
            store.mark_paid(&paid("T2", "h2")).await.unwrap(),
            MarkPaidOutcome::NotPending(OrderStatus::Expired)
        );
    }
}
