//! Coupled charge-point / central-system session pair.
//!
//! The two legs are independent session objects tied together by the
//! pair: default handlers re-issue each CALL on the other leg and relay
//! the response or error verbatim. Lifetime coupling runs through
//! disconnect notifications, never through destructors, so the two legs
//! hold no strong references to each other.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::LocalControllerEvents;
use crate::messages::dispatcher::{DispatchOutcome, HandlerError, MessageHandler};
use crate::messages::{
    MessageDispatcher, MessagesValidator, Request, CP_INITIATED_ACTIONS, CS_INITIATED_ACTIONS,
};
use crate::rpc::frame::RpcErrorCode;
use crate::rpc::{ClientConfig, ClientListener, RpcClient, RpcError, RpcSession};

pub struct ProxyPair {
    identifier: String,
    /// Charge-point facing (server) leg; attached once the handshake is
    /// complete.
    charge_point_session: Mutex<Option<Arc<RpcSession>>>,
    /// Central-system facing (client) leg.
    central_system: Arc<RpcClient>,
    charge_point_dispatcher: Arc<MessageDispatcher>,
    central_system_dispatcher: Arc<MessageDispatcher>,
    client_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProxyPair {
    pub(super) fn new(
        identifier: String,
        validator: Arc<MessagesValidator>,
        client_config: ClientConfig,
        disconnect_cp_when_cs_disconnected: bool,
        events: Arc<dyn LocalControllerEvents>,
    ) -> Arc<Self> {
        let charge_point_dispatcher =
            Arc::new(MessageDispatcher::new(Arc::clone(&validator)));
        let central_system_dispatcher = Arc::new(MessageDispatcher::new(validator));

        let central_system = RpcClient::new(
            client_config,
            Arc::clone(&central_system_dispatcher),
            None,
        );

        let pair = Arc::new(Self {
            identifier,
            charge_point_session: Mutex::new(None),
            central_system,
            charge_point_dispatcher,
            central_system_dispatcher,
            client_task: Mutex::new(None),
        });

        // Charge point → central system: forward through the client leg.
        let forward_up = Arc::new(ForwardToCentralSystem {
            client: Arc::clone(&pair.central_system),
        });
        for action in CP_INITIATED_ACTIONS {
            pair.charge_point_dispatcher
                .register(*action, Arc::clone(&forward_up) as Arc<dyn MessageHandler>, false);
        }

        // Central system → charge point: forward through the server leg.
        let forward_down = Arc::new(ForwardToChargePoint {
            pair: Arc::downgrade(&pair),
        });
        for action in CS_INITIATED_ACTIONS {
            pair.central_system_dispatcher.register(
                *action,
                Arc::clone(&forward_down) as Arc<dyn MessageHandler>,
                false,
            );
        }

        let task = pair.central_system.start(Arc::new(CentralSystemLegListener {
            pair: Arc::downgrade(&pair),
            disconnect_cp_when_cs_disconnected,
            events,
        }));
        *pair.client_task.lock().unwrap() = Some(task);

        pair
    }

    pub(super) fn attach_charge_point(&self, session: Arc<RpcSession>) {
        *self.charge_point_session.lock().unwrap() = Some(session);
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Dispatcher of the charge-point leg (charge-point-initiated
    /// actions). Register with `allow_replace` to intercept.
    pub fn charge_point_dispatcher(&self) -> Arc<MessageDispatcher> {
        Arc::clone(&self.charge_point_dispatcher)
    }

    /// Dispatcher of the central-system leg (central-system-initiated
    /// actions). Register with `allow_replace` to intercept.
    pub fn central_system_dispatcher(&self) -> Arc<MessageDispatcher> {
        Arc::clone(&self.central_system_dispatcher)
    }

    fn charge_point_session(&self) -> Option<Arc<RpcSession>> {
        self.charge_point_session.lock().unwrap().clone()
    }

    /// Issue a typed call towards the charge point.
    pub async fn call_charge_point<R: Request>(&self, request: &R) -> Result<R::Response, RpcError> {
        match self.charge_point_session() {
            Some(session) => session.call(request).await,
            None => Err(RpcError::TransportClosed),
        }
    }

    /// Issue a typed call towards the central system.
    pub async fn call_central_system<R: Request>(
        &self,
        request: &R,
    ) -> Result<R::Response, RpcError> {
        self.central_system.call(request).await
    }

    /// Tear both legs down.
    pub fn close(&self) {
        self.central_system.stop();
        if let Some(task) = self.client_task.lock().unwrap().take() {
            task.abort();
        }
        self.close_charge_point_leg();
    }

    fn close_charge_point_leg(&self) {
        if let Some(session) = self.charge_point_session.lock().unwrap().take() {
            session.request_close();
        }
    }
}

/// Map a relayed call failure onto the CALLERROR sent back to the caller.
/// A CALLERROR from the other leg is propagated verbatim.
fn relay_error(identifier: &str, action: &str, error: RpcError) -> HandlerError {
    match error {
        RpcError::CallError { code, description, .. } => HandlerError::new(
            RpcErrorCode::parse(&code).unwrap_or(RpcErrorCode::GenericError),
            description,
        ),
        RpcError::Timeout => {
            warn!(identifier, action, "Relay timed out");
            HandlerError::new(RpcErrorCode::GenericError, "No response from the peer")
        }
        RpcError::TransportClosed => {
            warn!(identifier, action, "Relay target disconnected");
            HandlerError::new(RpcErrorCode::GenericError, "Peer disconnected")
        }
        RpcError::Codec(e) => HandlerError::internal(e.to_string()),
    }
}

/// Default handler of the charge-point leg: re-issue on the client leg.
struct ForwardToCentralSystem {
    client: Arc<RpcClient>,
}

#[async_trait]
impl MessageHandler for ForwardToCentralSystem {
    async fn handle(&self, action: &str, payload: Value) -> DispatchOutcome {
        debug!(action, "Relaying to the central system");
        self.client
            .call_raw(action, payload)
            .await
            .map_err(|e| relay_error("cs-leg", action, e))
    }
}

/// Default handler of the central-system leg: re-issue on the server leg.
struct ForwardToChargePoint {
    pair: Weak<ProxyPair>,
}

#[async_trait]
impl MessageHandler for ForwardToChargePoint {
    async fn handle(&self, action: &str, payload: Value) -> DispatchOutcome {
        let Some(pair) = self.pair.upgrade() else {
            return Err(HandlerError::internal("Proxy pair is gone"));
        };
        let Some(session) = pair.charge_point_session() else {
            return Err(HandlerError::new(
                RpcErrorCode::GenericError,
                "Charge point not attached",
            ));
        };
        debug!(action, identifier = pair.identifier.as_str(), "Relaying to the charge point");
        session
            .call_raw(action, payload)
            .await
            .map_err(|e| relay_error(&pair.identifier, action, e))
    }
}

/// Couples the central-system leg's lifetime to the charge-point leg.
struct CentralSystemLegListener {
    pair: Weak<ProxyPair>,
    disconnect_cp_when_cs_disconnected: bool,
    events: Arc<dyn LocalControllerEvents>,
}

#[async_trait]
impl ClientListener for CentralSystemLegListener {
    async fn on_connected(&self) {
        if let Some(pair) = self.pair.upgrade() {
            info!(identifier = pair.identifier.as_str(), "Central system leg connected");
        }
    }

    async fn on_disconnected(&self) {
        let Some(pair) = self.pair.upgrade() else {
            return;
        };
        self.events
            .central_system_disconnected(&pair.identifier)
            .await;
        if self.disconnect_cp_when_cs_disconnected {
            info!(
                identifier = pair.identifier.as_str(),
                "Central system leg lost, dropping the charge point leg"
            );
            pair.close_charge_point_leg();
        }
    }

    async fn on_connection_failed(&self) {
        let Some(pair) = self.pair.upgrade() else {
            return;
        };
        if self.disconnect_cp_when_cs_disconnected {
            warn!(
                identifier = pair.identifier.as_str(),
                "Central system unreachable, dropping the charge point leg"
            );
            pair.close_charge_point_leg();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::localcontroller::DefaultLocalControllerEvents;
    use crate::messages::dispatcher::typed_handler;
    use std::time::Duration;

    fn test_pair() -> Arc<ProxyPair> {
        ProxyPair::new(
            "CP-1".to_string(),
            Arc::new(MessagesValidator::permissive()),
            ClientConfig {
                url: "ws://127.0.0.1:9/unreachable".to_string(),
                call_timeout: Duration::from_millis(100),
                retry_interval: Duration::from_secs(3600),
                ..ClientConfig::default()
            },
            false,
            Arc::new(DefaultLocalControllerEvents),
        )
    }

    #[tokio::test]
    async fn default_forwarders_cover_both_action_sets() {
        let pair = test_pair();
        for action in CP_INITIATED_ACTIONS {
            assert!(pair.charge_point_dispatcher.has_handler(action));
        }
        for action in CS_INITIATED_ACTIONS {
            assert!(pair.central_system_dispatcher.has_handler(action));
        }
        pair.close();
    }

    #[tokio::test]
    async fn user_override_replaces_forwarder() {
        use crate::messages::core::{HeartbeatRequest, HeartbeatResponse};

        let pair = test_pair();
        // Short-circuit Heartbeat at the controller.
        let replaced = pair.charge_point_dispatcher().register(
            "Heartbeat",
            typed_handler(|_req: HeartbeatRequest| async {
                Ok(HeartbeatResponse {
                    current_time: "2025-06-01T12:00:00Z".parse().unwrap(),
                })
            }),
            true,
        );
        assert!(replaced);

        let response = pair
            .charge_point_dispatcher()
            .dispatch("Heartbeat", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(response["currentTime"], "2025-06-01T12:00:00Z");
        pair.close();
    }

    #[tokio::test]
    async fn forwarding_without_peer_reports_generic_error() {
        let pair = test_pair();
        // No central system is reachable: the relay must surface a
        // CALLERROR, not hang or panic.
        let err = pair
            .charge_point_dispatcher()
            .dispatch("Heartbeat", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::GenericError);
        pair.close();
    }

    #[tokio::test]
    async fn call_error_code_is_propagated_verbatim() {
        let err = relay_error(
            "CP-1",
            "Reset",
            RpcError::CallError {
                code: "NotSupported".to_string(),
                description: "nope".to_string(),
                details: serde_json::Value::Null,
            },
        );
        assert_eq!(err.code, RpcErrorCode::NotSupported);
        assert_eq!(err.message, "nope");
    }
}
