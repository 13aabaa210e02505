//! Callback delivery worker

use super::{CallbackDispatcher, CallbackPayload, CallbackSender, CallbackTask};
use crate::metrics;
use crate::state::{CallbackConfirm, OrderStatus, OrderStore};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Drains the callback queue, one delivery loop per task
pub struct CallbackWorker {
    dispatcher: Arc<CallbackDispatcher>,
    orders: Arc<dyn OrderStore>,
    sender: Arc<dyn CallbackSender>,
    signing_token: String,
    backoff_base: Duration,
}

impl CallbackWorker {
    pub fn new(
        dispatcher: Arc<CallbackDispatcher>,
        orders: Arc<dyn OrderStore>,
        sender: Arc<dyn CallbackSender>,
        signing_token: String,
        backoff_base: Duration,
    ) -> Self {
        Self {
            dispatcher,
            orders,
            sender,
            signing_token,
            backoff_base,
        }
    }

    /// Run until every dispatcher handle is dropped
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<CallbackTask>) {
        info!("Callback worker started");

        while let Some(task) = rx.recv().await {
            let worker = self.clone();
            tokio::spawn(async move {
                worker.deliver(task).await;
            });
        }

        info!("Callback worker stopped");
    }

    /// Deliver one task until confirmed or out of attempts.
    /// Returns the number of attempts made.
    pub async fn deliver(&self, task: CallbackTask) -> u32 {
        let _in_flight = InFlight {
            dispatcher: &self.dispatcher,
            task: &task,
        };
        let mut attempts = 0;

        loop {
            let order = match self.orders.find_by_trade_id(&task.trade_id).await {
                Ok(Some(order)) => order,
                Ok(None) => {
                    warn!("Callback {}: order {} not found", task.task_id, task.trade_id);
                    break;
                }
                Err(e) => {
                    warn!("Callback {}: reload of {} failed: {}", task.task_id, task.trade_id, e);
                    break;
                }
            };

            if order.status != OrderStatus::PaySuccess
                || order.callback_confirm == CallbackConfirm::Yes
                || order.callback_num >= task.max_retry as i32
            {
                debug!(
                    "Callback {} for {} has nothing to do ({:?}, {} attempts)",
                    task.task_id, order.trade_id, order.callback_confirm, order.callback_num
                );
                break;
            }

            let payload = CallbackPayload::for_order(&order, &self.signing_token);
            let confirmed = match self.sender.deliver(&order.notify_url, &payload).await {
                Ok(confirmed) => confirmed,
                Err(e) => {
                    warn!("{}", e);
                    false
                }
            };
            metrics::record_callback_attempt(if confirmed { "confirmed" } else { "unconfirmed" });

            if let Err(e) = self.dispatcher.record_attempt(&order, confirmed).await {
                error!("Failed to record callback attempt for {}: {}", order.trade_id, e);
                break;
            }
            attempts += 1;

            let used = order.callback_num + 1;
            if confirmed {
                info!("Callback for {} confirmed after {} attempts", order.trade_id, used);
                break;
            }
            if used >= task.max_retry as i32 {
                warn!(
                    "Giving up callback for {} after {} unconfirmed attempts",
                    order.trade_id, used
                );
                break;
            }

            tokio::time::sleep(self.backoff(used as u32)).await;
        }

        attempts
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.pow(attempt.saturating_sub(1).min(10))
    }
}

/// Clears the dispatcher's in-flight entry when delivery ends, including on unwind
struct InFlight<'a> {
    dispatcher: &'a CallbackDispatcher,
    task: &'a CallbackTask,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.dispatcher.complete(self.task);
    }
}
