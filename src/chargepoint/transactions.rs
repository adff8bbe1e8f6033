//! Transaction-related message delivery.
//!
//! StartTransaction, StopTransaction and MeterValues are the messages the
//! central system must not lose: a timeout is retried up to
//! `TransactionMessageAttempts` times with a growing interval, and
//! messages that cannot be delivered while offline are queued and drained
//! in order once the connection returns.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::OcppConfig;
use crate::rpc::{RpcClient, RpcError};

/// A transaction message awaiting delivery.
#[derive(Debug, Clone)]
struct QueuedMessage {
    action: &'static str,
    payload: Value,
}

pub struct TransactionMessenger {
    ocpp_config: Arc<OcppConfig>,
    client: Arc<RpcClient>,
    offline_queue: Mutex<VecDeque<QueuedMessage>>,
}

impl TransactionMessenger {
    pub fn new(ocpp_config: Arc<OcppConfig>, client: Arc<RpcClient>) -> Self {
        Self {
            ocpp_config,
            client,
            offline_queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Send a transaction message, retrying timeouts.
    ///
    /// Returns the response payload, or the final error once the attempts
    /// are exhausted. A CALLERROR aborts immediately: the central system
    /// received the message and refused it.
    pub async fn send_with_retry(
        &self,
        action: &'static str,
        payload: Value,
    ) -> Result<Value, RpcError> {
        let attempts = self.ocpp_config.transaction_message_attempts().max(1);
        let interval = Duration::from_secs(
            self.ocpp_config.transaction_message_retry_interval_secs() as u64,
        );

        let mut attempt = 1u32;
        loop {
            match self.client.call_raw(action, payload.clone()).await {
                Ok(response) => return Ok(response),
                Err(RpcError::Timeout) if attempt < attempts => {
                    warn!(action, attempt, "Transaction message timed out, retrying");
                    // The retry interval grows with the attempt number.
                    tokio::time::sleep(interval * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send now when connected, queue for later otherwise. Used for the
    /// fire-and-forget transaction messages (StopTransaction replays,
    /// MeterValues).
    pub async fn send_or_queue(&self, action: &'static str, payload: Value) {
        if self.client.is_connected() {
            match self.send_with_retry(action, payload.clone()).await {
                Ok(_) => return,
                Err(RpcError::CallError { code, description, .. }) => {
                    warn!(action, code = code.as_str(), description = description.as_str(),
                        "Transaction message refused, dropping");
                    return;
                }
                Err(e) => {
                    warn!(action, error = %e, "Transaction message undeliverable, queueing");
                }
            }
        }
        self.offline_queue
            .lock()
            .await
            .push_back(QueuedMessage { action, payload });
    }

    /// Drain the offline queue in order. Called after reconnection.
    pub async fn drain(&self) {
        loop {
            let message = {
                let mut queue = self.offline_queue.lock().await;
                match queue.pop_front() {
                    Some(message) => message,
                    None => break,
                }
            };
            info!(action = message.action, "Replaying queued transaction message");
            match self.send_with_retry(message.action, message.payload.clone()).await {
                Ok(_) => {}
                Err(RpcError::CallError { .. }) => {
                    // Refused by the central system; drop and continue.
                }
                Err(_) => {
                    // Still undeliverable; put it back and stop draining.
                    self.offline_queue.lock().await.push_front(message);
                    break;
                }
            }
        }
    }

    pub async fn queued_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
