//! Error types for the payment reconciler

use thiserror::Error;

/// Main error type for the reconciler
#[derive(Error, Debug)]
pub enum ReconcilerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Explorer request failed for {chain}: {message}")]
    Explorer { chain: String, message: String },

    #[error("Explorer for {chain} returned HTTP {status}")]
    ExplorerStatus { chain: String, status: u16 },

    #[error("Failed to decode {chain} explorer response: {message}")]
    Decode { chain: String, message: String },

    #[error("Invalid amount {raw:?}: {message}")]
    Amount { raw: String, message: String },

    #[error("Transfer {tx_hash} predates order {trade_id}")]
    CausalityViolation { trade_id: String, tx_hash: String },

    #[error("Callback delivery for {trade_id} failed: {message}")]
    Callback { trade_id: String, message: String },

    #[error("Rate limited by {chain} explorer")]
    RateLimited { chain: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReconcilerError {
    /// Check if error is retryable on the next tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcilerError::Explorer { .. }
                | ReconcilerError::ExplorerStatus { .. }
                | ReconcilerError::RateLimited { .. }
                | ReconcilerError::Cache(_)
                | ReconcilerError::Database(_)
                | ReconcilerError::Callback { .. }
        )
    }
}

/// Result type for reconciler operations
pub type ReconcilerResult<T> = Result<T, ReconcilerError>;
