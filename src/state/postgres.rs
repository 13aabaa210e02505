//! PostgreSQL order and wallet store

use super::{
    CallbackAttempt, CallbackConfirm, MarkPaid, MarkPaidOutcome, Order, OrderStats, OrderStatus,
    OrderStore, WalletAddress, WalletDirectory,
};
use crate::chain::Chain;
use crate::config::DatabaseConfig;
use crate::error::{ReconcilerError, ReconcilerResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, warn};

const ORDER_COLUMNS: &str = r#"
    id, trade_id, order_id, token, amount, actual_amount, status,
    block_transaction_id, callback_num, callback_confirm, notify_url,
    redirect_url, created_at, updated_at
"#;

const WALLET_ENABLED: i16 = 1;

/// Advisory lock key serializing schema setup across instances
const MIGRATION_LOCK: i64 = 0x6368_6169_6e70_6179;

/// State store backed by a PostgreSQL pool
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn new(config: &DatabaseConfig) -> ReconcilerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables owned by the order and wallet flows if absent
    pub async fn run_migrations(&self) -> ReconcilerResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(MIGRATION_LOCK)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id BIGSERIAL PRIMARY KEY,
                trade_id VARCHAR(64) NOT NULL UNIQUE,
                order_id VARCHAR(64) NOT NULL UNIQUE,
                token VARCHAR(128) NOT NULL,
                amount NUMERIC(20, 4) NOT NULL,
                actual_amount NUMERIC(38, 18) NOT NULL,
                status SMALLINT NOT NULL DEFAULT 1,
                block_transaction_id VARCHAR(128),
                callback_num INTEGER NOT NULL DEFAULT 0,
                callback_confirm SMALLINT NOT NULL DEFAULT 2,
                notify_url TEXT NOT NULL,
                redirect_url TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_orders_block_tx
            ON orders (block_transaction_id)
            WHERE block_transaction_id IS NOT NULL
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_orders_status_created
            ON orders (status, created_at)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_address (
                id BIGSERIAL PRIMARY KEY,
                chain VARCHAR(16) NOT NULL,
                token VARCHAR(128) NOT NULL,
                status SMALLINT NOT NULL DEFAULT 1,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (chain, token)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("Database migrations complete");
        Ok(())
    }
}

fn order_from_row(row: &PgRow) -> ReconcilerResult<Order> {
    let status_code: i16 = row.try_get("status")?;
    let status = OrderStatus::from_code(status_code)
        .ok_or_else(|| ReconcilerError::Internal(format!("Unknown order status {}", status_code)))?;

    let confirm_code: i16 = row.try_get("callback_confirm")?;
    let callback_confirm = CallbackConfirm::from_code(confirm_code).ok_or_else(|| {
        ReconcilerError::Internal(format!("Unknown callback_confirm {}", confirm_code))
    })?;

    Ok(Order {
        id: row.try_get("id")?,
        trade_id: row.try_get("trade_id")?,
        order_id: row.try_get("order_id")?,
        token: row.try_get("token")?,
        amount: row.try_get("amount")?,
        actual_amount: row.try_get("actual_amount")?,
        status,
        block_transaction_id: row.try_get("block_transaction_id")?,
        callback_num: row.try_get("callback_num")?,
        callback_confirm,
        notify_url: row.try_get("notify_url")?,
        redirect_url: row.try_get("redirect_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl OrderStore for PgStore {
    async fn find_by_trade_id(&self, trade_id: &str) -> ReconcilerResult<Option<Order>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE trade_id = $1 LIMIT 1",
            ORDER_COLUMNS
        ))
        .bind(trade_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(order_from_row).transpose()
    }

    async fn mark_paid(&self, update: &MarkPaid) -> ReconcilerResult<MarkPaidOutcome> {
        let mut tx = self.pool.begin().await?;

        let credited = sqlx::query("SELECT trade_id FROM orders WHERE block_transaction_id = $1 LIMIT 1")
            .bind(&update.block_transaction_id)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = credited {
            let trade_id: String = row.try_get("trade_id")?;
            tx.rollback().await?;
            return Ok(if trade_id == update.trade_id {
                MarkPaidOutcome::AlreadyPaid
            } else {
                MarkPaidOutcome::DuplicateTransaction { trade_id }
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $1, block_transaction_id = $2, callback_confirm = $3, updated_at = NOW()
            WHERE trade_id = $4 AND status = $5
            "#,
        )
        .bind(OrderStatus::PaySuccess.code())
        .bind(&update.block_transaction_id)
        .bind(CallbackConfirm::No.code())
        .bind(&update.trade_id)
        .bind(OrderStatus::WaitPay.code())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let current = sqlx::query("SELECT status FROM orders WHERE trade_id = $1")
                .bind(&update.trade_id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;

            return Ok(match current {
                None => MarkPaidOutcome::NotFound,
                Some(row) => {
                    let code: i16 = row.try_get("status")?;
                    match OrderStatus::from_code(code) {
                        Some(status) => MarkPaidOutcome::NotPending(status),
                        None => {
                            return Err(ReconcilerError::Internal(format!(
                                "Unknown order status {}",
                                code
                            )))
                        }
                    }
                }
            });
        }

        tx.commit().await?;
        debug!(
            "Order {} marked paid by {}",
            update.trade_id, update.block_transaction_id
        );
        Ok(MarkPaidOutcome::Applied)
    }

    async fn expire(&self, order_id: &str) -> ReconcilerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE orders SET status = $1, updated_at = NOW()
            WHERE order_id = $2 AND status = $3
            "#,
        )
        .bind(OrderStatus::Expired.code())
        .bind(order_id)
        .bind(OrderStatus::WaitPay.code())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn expirable(&self, cutoff: DateTime<Utc>) -> ReconcilerResult<Vec<Order>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM orders WHERE status = $1 AND created_at < $2 ORDER BY created_at",
            ORDER_COLUMNS
        ))
        .bind(OrderStatus::WaitPay.code())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn pending_callbacks(&self, max_attempts: i32) -> ReconcilerResult<Vec<Order>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM orders
            WHERE callback_num < $1 AND callback_confirm = $2 AND status = $3
            ORDER BY id
            "#,
            ORDER_COLUMNS
        ))
        .bind(max_attempts)
        .bind(CallbackConfirm::No.code())
        .bind(OrderStatus::PaySuccess.code())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn record_callback_attempt(&self, attempt: &CallbackAttempt) -> ReconcilerResult<()> {
        let confirm = if attempt.confirmed {
            CallbackConfirm::Yes
        } else {
            CallbackConfirm::No
        };

        sqlx::query(
            r#"
            UPDATE orders
            SET callback_num = callback_num + 1, callback_confirm = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(confirm.code())
        .bind(attempt.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn stats(&self, max_attempts: i32) -> ReconcilerResult<OrderStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 1) as wait_pay,
                COUNT(*) FILTER (WHERE status = 2) as pay_success,
                COUNT(*) FILTER (WHERE status = 3) as expired,
                COUNT(*) FILTER (WHERE status = 2 AND callback_confirm = 2 AND callback_num < $1)
                    as callbacks_pending
            FROM orders
            "#,
        )
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;

        Ok(OrderStats {
            wait_pay: row.try_get::<i64, _>("wait_pay")? as u64,
            pay_success: row.try_get::<i64, _>("pay_success")? as u64,
            expired: row.try_get::<i64, _>("expired")? as u64,
            callbacks_pending: row.try_get::<i64, _>("callbacks_pending")? as u64,
        })
    }

    async fn health_check(&self) -> ReconcilerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl WalletDirectory for PgStore {
    async fn enabled_addresses(&self, chain: Chain) -> ReconcilerResult<Vec<WalletAddress>> {
        let rows = sqlx::query("SELECT id, token FROM wallet_address WHERE chain = $1 AND status = $2")
            .bind(chain.prefix())
            .bind(WALLET_ENABLED)
            .fetch_all(&self.pool)
            .await?;

        let mut wallets = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let address: String = row.try_get("token")?;
            if address.trim().is_empty() {
                warn!("Ignoring empty wallet address {} on {}", id, chain);
                continue;
            }
            wallets.push(WalletAddress {
                id,
                chain,
                address: address.trim().to_string(),
            });
        }

        Ok(wallets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    /// Store on the database named by `TEST_DATABASE_URL`; `None` skips the test.
    ///
    /// Every test uses fresh trade ids and hashes, so runs can share one database.
    async fn store() -> Option<PgStore> {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL is not set, skipping PostgreSQL test");
            return None;
        };
        let store = PgStore::new(&DatabaseConfig {
            url,
            max_connections: 2,
            min_connections: 0,
        })
        .await
        .unwrap();
        store.run_migrations().await.unwrap();
        Some(store)
    }

    fn unique(prefix: &str) -> String {
        format!("{}-{}", prefix, Uuid::new_v4().simple())
    }

    async fn insert_order(store: &PgStore, trade_id: &str, created_at: DateTime<Utc>) -> Order {
        sqlx::query(
            r#"
            INSERT INTO orders
                (trade_id, order_id, token, amount, actual_amount, status, notify_url, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            "#,
        )
        .bind(trade_id)
        .bind(format!("m-{}", trade_id))
        .bind("trc20:TWallet")
        .bind(Decimal::from(90))
        .bind(Decimal::new(125, 1))
        .bind(OrderStatus::WaitPay.code())
        .bind("https://merchant.example/notify")
        .bind(created_at)
        .execute(&store.pool)
        .await
        .unwrap();

        store.find_by_trade_id(trade_id).await.unwrap().unwrap()
    }

    fn paid_by(trade_id: &str, hash: &str) -> MarkPaid {
        MarkPaid {
            trade_id: trade_id.to_string(),
            block_transaction_id: hash.to_string(),
        }
    }

    #[tokio::test]
    async fn test_mark_paid_applies_once() {
        let Some(store) = store().await else { return };
        let trade_id = unique("T");
        let hash = unique("h");
        let order = insert_order(&store, &trade_id, Utc::now()).await;
        assert_eq!(order.status, OrderStatus::WaitPay);
        assert_eq!(order.actual_amount, Decimal::new(125, 1));

        let outcome = store.mark_paid(&paid_by(&trade_id, &hash)).await.unwrap();
        assert_eq!(outcome, MarkPaidOutcome::Applied);

        let paid = store.find_by_trade_id(&trade_id).await.unwrap().unwrap();
        assert_eq!(paid.status, OrderStatus::PaySuccess);
        assert_eq!(paid.block_transaction_id.as_deref(), Some(hash.as_str()));
        assert_eq!(paid.callback_confirm, CallbackConfirm::No);

        // Same transfer seen again on a later scan
        let again = store.mark_paid(&paid_by(&trade_id, &hash)).await.unwrap();
        assert_eq!(again, MarkPaidOutcome::AlreadyPaid);

        let other = store.mark_paid(&paid_by(&trade_id, &unique("h"))).await.unwrap();
        assert_eq!(other, MarkPaidOutcome::NotPending(OrderStatus::PaySuccess));
    }

    #[tokio::test]
    async fn test_expired_order_never_becomes_paid() {
        let Some(store) = store().await else { return };
        let trade_id = unique("T");
        let order = insert_order(&store, &trade_id, Utc::now()).await;

        assert!(store.expire(&order.order_id).await.unwrap());
        assert!(!store.expire(&order.order_id).await.unwrap());

        let outcome = store.mark_paid(&paid_by(&trade_id, &unique("h"))).await.unwrap();
        assert_eq!(outcome, MarkPaidOutcome::NotPending(OrderStatus::Expired));

        let expired = store.find_by_trade_id(&trade_id).await.unwrap().unwrap();
        assert_eq!(expired.status, OrderStatus::Expired);
        assert_eq!(expired.block_transaction_id, None);
    }

    #[tokio::test]
    async fn test_transaction_settles_only_one_order() {
        let Some(store) = store().await else { return };
        let first = unique("T");
        let second = unique("T");
        let hash = unique("h");
        insert_order(&store, &first, Utc::now()).await;
        insert_order(&store, &second, Utc::now()).await;

        assert_eq!(
            store.mark_paid(&paid_by(&first, &hash)).await.unwrap(),
            MarkPaidOutcome::Applied
        );
        assert_eq!(
            store.mark_paid(&paid_by(&second, &hash)).await.unwrap(),
            MarkPaidOutcome::DuplicateTransaction { trade_id: first }
        );

        let untouched = store.find_by_trade_id(&second).await.unwrap().unwrap();
        assert_eq!(untouched.status, OrderStatus::WaitPay);
    }

    #[tokio::test]
    async fn test_mark_paid_unknown_order() {
        let Some(store) = store().await else { return };
        let outcome = store
            .mark_paid(&paid_by(&unique("missing"), &unique("h")))
            .await
            .unwrap();
        assert_eq!(outcome, MarkPaidOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_callback_bookkeeping() {
        let Some(store) = store().await else { return };
        let retried = unique("T");
        let confirmed = unique("T");
        for trade_id in [&retried, &confirmed] {
            insert_order(&store, trade_id, Utc::now()).await;
            store.mark_paid(&paid_by(trade_id, &unique("h"))).await.unwrap();
        }
        let pending_ids = |orders: Vec<Order>| -> Vec<String> {
            orders.into_iter().map(|o| o.trade_id).collect()
        };

        let pending = pending_ids(store.pending_callbacks(5).await.unwrap());
        assert!(pending.contains(&retried));
        assert!(pending.contains(&confirmed));

        let order = store.find_by_trade_id(&confirmed).await.unwrap().unwrap();
        store
            .record_callback_attempt(&CallbackAttempt {
                id: order.id,
                confirmed: true,
            })
            .await
            .unwrap();

        let order = store.find_by_trade_id(&retried).await.unwrap().unwrap();
        for _ in 0..4 {
            store
                .record_callback_attempt(&CallbackAttempt {
                    id: order.id,
                    confirmed: false,
                })
                .await
                .unwrap();
        }

        let pending = pending_ids(store.pending_callbacks(5).await.unwrap());
        assert!(pending.contains(&retried));
        assert!(!pending.contains(&confirmed));

        store
            .record_callback_attempt(&CallbackAttempt {
                id: order.id,
                confirmed: false,
            })
            .await
            .unwrap();
        let pending = pending_ids(store.pending_callbacks(5).await.unwrap());
        assert!(!pending.contains(&retried));

        let exhausted = store.find_by_trade_id(&retried).await.unwrap().unwrap();
        assert_eq!(exhausted.callback_num, 5);
        assert_eq!(exhausted.callback_confirm, CallbackConfirm::No);
    }

    #[tokio::test]
    async fn test_expirable_respects_cutoff() {
        let Some(store) = store().await else { return };
        let old = unique("T");
        let fresh = unique("T");
        insert_order(&store, &old, Utc::now() - chrono::Duration::minutes(30)).await;
        insert_order(&store, &fresh, Utc::now()).await;

        let overdue: Vec<String> = store
            .expirable(Utc::now() - chrono::Duration::minutes(10))
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.trade_id)
            .collect();

        assert!(overdue.contains(&old));
        assert!(!overdue.contains(&fresh));
    }

    #[tokio::test]
    async fn test_enabled_addresses() {
        let Some(store) = store().await else { return };
        let enabled = unique("T");
        let disabled = unique("T");
        for (address, status) in [(&enabled, WALLET_ENABLED), (&disabled, 2)] {
            sqlx::query("INSERT INTO wallet_address (chain, token, status) VALUES ($1, $2, $3)")
                .bind(Chain::Tron.prefix())
                .bind(format!(" {} ", address))
                .bind(status)
                .execute(&store.pool)
                .await
                .unwrap();
        }
        sqlx::query(
            "INSERT INTO wallet_address (chain, token, status) VALUES ($1, '  ', $2) ON CONFLICT DO NOTHING",
        )
        .bind(Chain::Tron.prefix())
        .bind(WALLET_ENABLED)
        .execute(&store.pool)
        .await
        .unwrap();

        let wallets = store.enabled_addresses(Chain::Tron).await.unwrap();
        assert!(wallets.iter().any(|w| w.address == enabled && w.chain == Chain::Tron));
        assert!(!wallets.iter().any(|w| w.address == disabled));
        assert!(wallets.iter().all(|w| !w.address.is_empty()));
    }
}
