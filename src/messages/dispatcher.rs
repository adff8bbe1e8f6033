//! Inbound CALL dispatch.
//!
//! Routes an action to its registered handler, gating both the request and
//! the handler's response through the schema validator.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use super::validator::{MessagesValidator, PayloadDirection};
use super::Request;
use crate::rpc::frame::RpcErrorCode;

/// Handler rejection: an OCPP-J error code plus a human readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub code: RpcErrorCode,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InternalError, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::NotSupported, message)
    }

    pub fn property_constraint(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::PropertyConstraintViolation, message)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for HandlerError {}

pub type DispatchOutcome = Result<Value, HandlerError>;

/// An action handler working on raw JSON payloads.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, action: &str, payload: Value) -> DispatchOutcome;
}

/// Action → handler table with schema gating.
pub struct MessageDispatcher {
    validator: Arc<MessagesValidator>,
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
}

impl MessageDispatcher {
    pub fn new(validator: Arc<MessagesValidator>) -> Self {
        Self {
            validator,
            handlers: DashMap::new(),
        }
    }

    /// Register `handler` for `action`.
    ///
    /// Returns `false` (and leaves the table unchanged) when a handler is
    /// already registered and `allow_replace` is not set.
    pub fn register(
        &self,
        action: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        allow_replace: bool,
    ) -> bool {
        let action = action.into();
        if !allow_replace && self.handlers.contains_key(&action) {
            warn!(action, "Handler already registered");
            return false;
        }
        self.handlers.insert(action, handler);
        true
    }

    pub fn has_handler(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    /// Dispatch an inbound CALL payload.
    pub async fn dispatch(&self, action: &str, payload: Value) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(action).map(|h| h.clone()) else {
            return Err(HandlerError::new(
                RpcErrorCode::NotImplemented,
                format!("No handler for action {action}"),
            ));
        };

        if let Err(errors) =
            self.validator
                .validate(action, PayloadDirection::Request, &payload)
        {
            warn!(action, ?errors, "Request payload failed schema validation");
            return Err(HandlerError::new(
                RpcErrorCode::FormationViolation,
                errors.join("; "),
            ));
        }

        let response = handler.handle(action, payload).await?;

        if let Err(errors) =
            self.validator
                .validate(action, PayloadDirection::Response, &response)
        {
            warn!(action, ?errors, "Response payload failed schema validation");
            return Err(HandlerError::internal("Response failed schema validation"));
        }

        debug!(action, "Dispatched");
        Ok(response)
    }
}

// ── Typed handler adapter ──────────────────────────────────────

struct TypedHandler<R, F> {
    f: F,
    _marker: PhantomData<fn(R)>,
}

#[async_trait]
impl<R, F, Fut> MessageHandler for TypedHandler<R, F>
where
    R: Request,
    F: Fn(R) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R::Response, HandlerError>> + Send,
{
    async fn handle(&self, _action: &str, payload: Value) -> DispatchOutcome {
        let request: R = serde_json::from_value(payload).map_err(|e| {
            HandlerError::new(RpcErrorCode::TypeConstraintViolation, e.to_string())
        })?;
        let response = (self.f)(request).await?;
        serde_json::to_value(response)
            .map_err(|e| HandlerError::internal(format!("Response serialization failed: {e}")))
    }
}

/// Wrap an async closure over typed payloads into a [`MessageHandler`].
pub fn typed_handler<R, F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    R: Request,
    F: Fn(R) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R::Response, HandlerError>> + Send + 'static,
{
    Arc::new(TypedHandler {
        f,
        _marker: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::core::{HeartbeatRequest, HeartbeatResponse};

    fn dispatcher() -> MessageDispatcher {
        MessageDispatcher::new(Arc::new(MessagesValidator::permissive()))
    }

    #[tokio::test]
    async fn unknown_action_is_not_implemented() {
        let d = dispatcher();
        let err = d
            .dispatch("Heartbeat", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::NotImplemented);
    }

    #[tokio::test]
    async fn typed_handler_roundtrip() {
        let d = dispatcher();
        let registered = d.register(
            HeartbeatRequest::ACTION,
            typed_handler(|_req: HeartbeatRequest| async {
                Ok(HeartbeatResponse {
                    current_time: "2025-01-01T00:00:00Z".parse().unwrap(),
                })
            }),
            false,
        );
        assert!(registered);

        let response = d
            .dispatch("Heartbeat", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(response["currentTime"], "2025-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn register_twice_requires_allow_replace() {
        let d = dispatcher();
        let handler = || {
            typed_handler(|_req: HeartbeatRequest| async {
                Ok(HeartbeatResponse {
                    current_time: chrono::Utc::now(),
                })
            })
        };
        assert!(d.register("Heartbeat", handler(), false));
        assert!(!d.register("Heartbeat", handler(), false));
        assert!(d.register("Heartbeat", handler(), true));
    }

    #[tokio::test]
    async fn schema_rejection_bypasses_handler() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Authorize.json"),
            r#"{"type":"object","required":["idTag"],"properties":{"idTag":{"type":"string"}}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("AuthorizeResponse.json"), "{}").unwrap();
        let validator = Arc::new(MessagesValidator::load(dir.path(), ["Authorize"]).unwrap());

        let d = MessageDispatcher::new(validator);
        d.register(
            "Authorize",
            typed_handler(|_req: crate::messages::core::AuthorizeRequest| async {
                unreachable!("handler must not run when the schema rejects")
            }),
            false,
        );

        let err = d
            .dispatch("Authorize", serde_json::json!({"wrong": true}))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::FormationViolation);
    }

    #[tokio::test]
    async fn malformed_typed_payload_is_type_constraint() {
        let d = dispatcher();
        d.register(
            "StartTransaction",
            typed_handler(|_req: crate::messages::core::StartTransactionRequest| async {
                unreachable!("handler must not run on malformed payload")
            }),
            false,
        );
        let err = d
            .dispatch("StartTransaction", serde_json::json!({"connectorId": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::TypeConstraintViolation);
    }
}
