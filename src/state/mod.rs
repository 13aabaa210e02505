//! Order and wallet state with PostgreSQL persistence
//!
//! Handles:
//! - The order state machine (WaitPay -> PaySuccess | Expired)
//! - Callback bookkeeping on paid orders
//! - Lookup of enabled receiving wallets per chain

#[cfg(test)]
pub mod memory;
mod postgres;

pub use postgres::PgStore;

use crate::chain::{Chain, ChainAddress};
use crate::error::ReconcilerResult;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Payment status of an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderStatus {
    WaitPay,
    PaySuccess,
    Expired,
}

impl OrderStatus {
    pub fn code(&self) -> i16 {
        match self {
            OrderStatus::WaitPay => 1,
            OrderStatus::PaySuccess => 2,
            OrderStatus::Expired => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(OrderStatus::WaitPay),
            2 => Some(OrderStatus::PaySuccess),
            3 => Some(OrderStatus::Expired),
            _ => None,
        }
    }
}

/// Whether the merchant acknowledged the payment callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallbackConfirm {
    Yes,
    No,
}

impl CallbackConfirm {
    pub fn code(&self) -> i16 {
        match self {
            CallbackConfirm::Yes => 1,
            CallbackConfirm::No => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(CallbackConfirm::Yes),
            2 => Some(CallbackConfirm::No),
            _ => None,
        }
    }
}

/// A payment order as persisted by the order-creation flow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub id: i64,
    /// System-facing id, also the lock entry value
    pub trade_id: String,
    /// Merchant-facing id
    pub order_id: String,
    /// Receiving wallet as `<prefix>:<address>`
    pub token: String,
    /// Requested (fiat) amount
    pub amount: Decimal,
    /// Asset amount the payer must transfer; the lock key amount
    pub actual_amount: Decimal,
    pub status: OrderStatus,
    pub block_transaction_id: Option<String>,
    pub callback_num: i32,
    pub callback_confirm: CallbackConfirm,
    pub notify_url: String,
    pub redirect_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Receiving wallet, if the token string is well formed
    pub fn wallet(&self) -> Option<ChainAddress> {
        ChainAddress::parse(&self.token)
    }
}

/// Fields written when a transfer settles an order
#[derive(Debug, Clone, PartialEq)]
pub struct MarkPaid {
    pub trade_id: String,
    pub block_transaction_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkPaidOutcome {
    /// WaitPay -> PaySuccess committed
    Applied,
    /// Order already settled by this same transaction
    AlreadyPaid,
    /// Order is no longer awaiting payment
    NotPending(OrderStatus),
    /// The transaction already settled a different order
    DuplicateTransaction { trade_id: String },
    NotFound,
}

/// Fields written after one callback delivery
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackAttempt {
    pub id: i64,
    pub confirmed: bool,
}

/// Order counts by status
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrderStats {
    pub wait_pay: u64,
    pub pay_success: u64,
    pub expired: u64,
    pub callbacks_pending: u64,
}

/// Transactional access to order records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn find_by_trade_id(&self, trade_id: &str) -> ReconcilerResult<Option<Order>>;

    /// WaitPay -> PaySuccess in one transaction, resetting callback_confirm
    async fn mark_paid(&self, update: &MarkPaid) -> ReconcilerResult<MarkPaidOutcome>;

    /// WaitPay -> Expired; false when the order was not awaiting payment
    async fn expire(&self, order_id: &str) -> ReconcilerResult<bool>;

    /// WaitPay orders created before `cutoff`
    async fn expirable(&self, cutoff: DateTime<Utc>) -> ReconcilerResult<Vec<Order>>;

    /// Paid orders whose callback is unconfirmed with attempts left
    async fn pending_callbacks(&self, max_attempts: i32) -> ReconcilerResult<Vec<Order>>;

    /// Increment callback_num and set callback_confirm
    async fn record_callback_attempt(&self, attempt: &CallbackAttempt) -> ReconcilerResult<()>;

    async fn stats(&self, max_attempts: i32) -> ReconcilerResult<OrderStats>;

    async fn health_check(&self) -> ReconcilerResult<()>;
}

/// An externally managed receiving wallet
#[derive(Debug, Clone, PartialEq)]
pub struct WalletAddress {
    pub id: i64,
    pub chain: Chain,
    pub address: String,
}

impl WalletAddress {
    pub fn qualified(&self) -> ChainAddress {
        ChainAddress::new(self.chain, self.address.clone())
    }
}

/// Read-only view of the wallet inventory
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WalletDirectory: Send + Sync {
    async fn enabled_addresses(&self, chain: Chain) -> ReconcilerResult<Vec<WalletAddress>>;
}
