//! Operator notifications for settled payments

use crate::config::NotifyConfig;
use crate::error::{ReconcilerError, ReconcilerResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const TELEGRAM_API: &str = "https://api.telegram.org";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Details of a payment that was just matched
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentNotice {
    pub trade_id: String,
    pub order_id: String,
    pub amount: Decimal,
    pub actual_amount: Decimal,
    pub wallet: String,
    pub created_at: DateTime<Utc>,
    pub matched_at: DateTime<Utc>,
}

impl PaymentNotice {
    /// HTML message body
    pub fn render(&self) -> String {
        format!(
            "<b>📢 New payment received</b>\n\
             <pre>Trade ID: {}</pre>\n\
             <pre>Order ID: {}</pre>\n\
             <pre>Requested amount: {}</pre>\n\
             <pre>Paid amount: {}</pre>\n\
             <pre>Wallet: {}</pre>\n\
             <pre>Order created: {}</pre>\n\
             <pre>Paid at: {}</pre>",
            escape_html(&self.trade_id),
            escape_html(&self.order_id),
            self.amount,
            self.actual_amount,
            escape_html(&self.wallet),
            self.created_at.format(TIME_FORMAT),
            self.matched_at.format(TIME_FORMAT),
        )
    }
}

/// Escape text for Telegram's HTML parse mode
fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Sink for operator alerts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &PaymentNotice) -> ReconcilerResult<()>;
}

/// Build the configured notifier, falling back to the log
pub fn from_config(config: &NotifyConfig) -> ReconcilerResult<Arc<dyn Notifier>> {
    match (&config.telegram_bot_token, &config.telegram_chat_id) {
        (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
            let api = config
                .telegram_api_url
                .clone()
                .unwrap_or_else(|| TELEGRAM_API.to_string());
            Ok(Arc::new(TelegramNotifier::new(api, token.clone(), chat_id.clone())?))
        }
        _ => {
            info!("No Telegram bot configured - payment notices go to the log");
            Ok(Arc::new(LogNotifier))
        }
    }
}

/// Posts notices to a Telegram chat through the Bot API
pub struct TelegramNotifier {
    http: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'static str,
}

impl TelegramNotifier {
    pub fn new(api: String, token: String, chat_id: String) -> ReconcilerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ReconcilerError::Config(format!("Telegram client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: format!("{}/bot{}/sendMessage", api.trim_end_matches('/'), token),
            chat_id,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, notice: &PaymentNotice) -> ReconcilerResult<()> {
        let body = SendMessage {
            chat_id: &self.chat_id,
            text: notice.render(),
            parse_mode: "HTML",
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ReconcilerError::Internal(format!("Telegram send failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ReconcilerError::Internal(format!(
                "Telegram returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Writes notices to the log only
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &PaymentNotice) -> ReconcilerResult<()> {
        info!(
            trade_id = %notice.trade_id,
            order_id = %notice.order_id,
            amount = %notice.amount,
            actual_amount = %notice.actual_amount,
            wallet = %notice.wallet,
            "Payment received"
        );
        Ok(())
    }
}
