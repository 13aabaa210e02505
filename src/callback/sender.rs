//! HTTP transport for merchant callbacks

use super::CallbackPayload;
use crate::error::{ReconcilerError, ReconcilerResult};

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Body a merchant answers with to acknowledge a callback
const CONFIRM_BODY: &str = "ok";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallbackSender: Send + Sync {
    /// Deliver once; `Ok(true)` when the merchant confirmed receipt
    async fn deliver(&self, url: &str, payload: &CallbackPayload) -> ReconcilerResult<bool>;
}

pub struct HttpCallbackSender {
    http: reqwest::Client,
}

impl HttpCallbackSender {
    pub fn new(timeout: Duration) -> ReconcilerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReconcilerError::Config(format!("Callback client: {}", e)))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl CallbackSender for HttpCallbackSender {
    async fn deliver(&self, url: &str, payload: &CallbackPayload) -> ReconcilerResult<bool> {
        let callback_err = |message: String| ReconcilerError::Callback {
            trade_id: payload.trade_id.clone(),
            message,
        };

        let response = self
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| callback_err(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| callback_err(e.to_string()))?;

        debug!(
            "Callback {} -> HTTP {} ({} bytes)",
            payload.trade_id,
            status,
            body.len()
        );
        Ok(status.is_success() && body.trim() == CONFIRM_BODY)
    }
}
