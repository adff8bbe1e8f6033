//! Symmetric RPC session over a WebSocket connection.
//!
//! Both peers of an OCPP-J connection may initiate calls, so the same
//! session type serves every role: it correlates outbound calls with their
//! responses through a pending-call table, dispatches inbound calls to the
//! registered handlers, and serializes all writes through a single writer
//! task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::frame::{Frame, RpcErrorCode};
use crate::messages::{MessageDispatcher, Request};

/// Observer of raw frames, both directions. Used for wire logging.
pub trait RpcSpy: Send + Sync {
    fn on_rx(&self, frame: &str);
    fn on_tx(&self, frame: &str);
}

/// Notified when the session's transport goes down.
#[async_trait::async_trait]
pub trait SessionObserver: Send + Sync {
    async fn on_disconnected(&self);
}

/// Failure of an outbound call.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("no response within the call timeout")]
    Timeout,
    #[error("call error {code}: {description}")]
    CallError {
        code: String,
        description: String,
        details: Value,
    },
    #[error("transport closed")]
    TransportClosed,
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl RpcError {
    /// Parsed error code of a `CallError`, when it is a standard one.
    pub fn error_code(&self) -> Option<RpcErrorCode> {
        match self {
            Self::CallError { code, .. } => RpcErrorCode::parse(code),
            _ => None,
        }
    }
}

type CallOutcome = Result<Value, RpcError>;

pub struct RpcSession {
    /// Short prefix making unique ids recognizable per session in logs.
    prefix: String,
    sink: mpsc::UnboundedSender<Message>,
    pending: DashMap<String, oneshot::Sender<CallOutcome>>,
    dispatcher: Arc<MessageDispatcher>,
    spy: Option<Arc<dyn RpcSpy>>,
    observer: Option<Arc<dyn SessionObserver>>,
    connected: AtomicBool,
    call_timeout: Duration,
    message_counter: AtomicU64,
}

impl RpcSession {
    /// Create a session around the writer channel of a transport.
    ///
    /// The transport glue ([`run_transport`]) owns the WebSocket and feeds
    /// [`Self::handle_incoming`] / [`Self::handle_disconnected`].
    pub fn new(
        sink: mpsc::UnboundedSender<Message>,
        dispatcher: Arc<MessageDispatcher>,
        call_timeout: Duration,
        spy: Option<Arc<dyn RpcSpy>>,
        observer: Option<Arc<dyn SessionObserver>>,
    ) -> Arc<Self> {
        let mut prefix = Uuid::new_v4().simple().to_string();
        prefix.truncate(8);
        Arc::new(Self {
            prefix,
            sink,
            pending: DashMap::new(),
            dispatcher,
            spy,
            observer,
            connected: AtomicBool::new(true),
            call_timeout,
            message_counter: AtomicU64::new(1),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn next_unique_id(&self) -> String {
        let n = self.message_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.prefix, n)
    }

    /// Issue a typed call and await its typed response.
    pub async fn call<R: Request>(&self, request: &R) -> Result<R::Response, RpcError> {
        let payload = serde_json::to_value(request)?;
        let response = self.call_raw(R::ACTION, payload).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Issue a call with the session's default timeout.
    pub async fn call_raw(&self, action: &str, payload: Value) -> CallOutcome {
        self.call_raw_with_timeout(action, payload, self.call_timeout)
            .await
    }

    /// Issue a call and wait up to `call_timeout` for the correlated
    /// CALLRESULT or CALLERROR.
    pub async fn call_raw_with_timeout(
        &self,
        action: &str,
        payload: Value,
        call_timeout: Duration,
    ) -> CallOutcome {
        if !self.is_connected() {
            return Err(RpcError::TransportClosed);
        }

        let unique_id = self.next_unique_id();
        let frame = Frame::Call {
            unique_id: unique_id.clone(),
            action: action.to_string(),
            payload,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(unique_id.clone(), tx);

        debug!(action, unique_id = unique_id.as_str(), "Sending call");
        let start = std::time::Instant::now();

        if !self.send_frame(&frame) {
            self.pending.remove(&unique_id);
            return Err(RpcError::TransportClosed);
        }

        let outcome = match timeout(call_timeout, rx).await {
            Ok(Ok(result)) => result,
            // The sender is dropped only when the pending table is drained
            // on disconnect.
            Ok(Err(_)) => Err(RpcError::TransportClosed),
            Err(_) => {
                self.pending.remove(&unique_id);
                warn!(action, unique_id = unique_id.as_str(), "Call timed out");
                Err(RpcError::Timeout)
            }
        };

        metrics::histogram!("ocpp_rpc_call_duration_seconds", "action" => action.to_string())
            .record(start.elapsed().as_secs_f64());
        metrics::counter!("ocpp_rpc_calls_total", "action" => action.to_string()).increment(1);

        outcome
    }

    /// Process one inbound text frame. Called from the read task; CALL
    /// dispatch is spawned so a slow handler never stalls frame ingestion.
    pub async fn handle_incoming(self: &Arc<Self>, text: &str) {
        if let Some(spy) = &self.spy {
            spy.on_rx(text);
        }

        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, raw = text, "Dropping malformed frame");
                if let Some(unique_id) = e.unique_id() {
                    self.send_frame(&Frame::error(
                        unique_id,
                        RpcErrorCode::FormationViolation,
                        e.to_string(),
                    ));
                }
                return;
            }
        };

        match frame {
            Frame::Call {
                unique_id,
                action,
                payload,
            } => {
                let session = Arc::clone(self);
                tokio::spawn(async move {
                    session.dispatch_call(unique_id, action, payload).await;
                });
            }
            Frame::CallResult { unique_id, payload } => {
                self.resolve_pending(&unique_id, Ok(payload));
            }
            Frame::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => {
                self.resolve_pending(
                    &unique_id,
                    Err(RpcError::CallError {
                        code: error_code,
                        description: error_description,
                        details: error_details,
                    }),
                );
            }
        }
    }

    async fn dispatch_call(self: Arc<Self>, unique_id: String, action: String, payload: Value) {
        metrics::counter!("ocpp_rpc_dispatched_total", "action" => action.clone()).increment(1);
        let response = match self.dispatcher.dispatch(&action, payload).await {
            Ok(payload) => Frame::CallResult { unique_id, payload },
            Err(e) => {
                warn!(action, code = %e.code, message = %e.message, "Call rejected");
                Frame::error(unique_id, e.code, e.message)
            }
        };
        self.send_frame(&response);
    }

    fn resolve_pending(&self, unique_id: &str, outcome: CallOutcome) {
        match self.pending.remove(unique_id) {
            Some((_, tx)) => {
                // The waiter may have timed out concurrently; a failed send
                // is the late-response case and is dropped silently.
                let _ = tx.send(outcome);
            }
            None => {
                warn!(unique_id, "Response for unknown or timed-out call");
            }
        }
    }

    fn send_frame(&self, frame: &Frame) -> bool {
        let text = frame.serialize();
        if let Some(spy) = &self.spy {
            spy.on_tx(&text);
        }
        self.sink.send(Message::Text(text)).is_ok()
    }

    /// Ask the transport to close. The writer sends a Close frame; the
    /// read loop then winds the session down through
    /// [`Self::handle_disconnected`].
    pub fn request_close(&self) {
        let _ = self.sink.send(Message::Close(None));
    }

    /// Mark the transport gone and fail every pending call.
    pub async fn handle_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(prefix = self.prefix.as_str(), "Session disconnected");
            let waiters: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
            for unique_id in waiters {
                if let Some((_, tx)) = self.pending.remove(&unique_id) {
                    let _ = tx.send(Err(RpcError::TransportClosed));
                }
            }
            if let Some(observer) = &self.observer {
                observer.on_disconnected().await;
            }
        }
    }
}

/// Drive a WebSocket stream: writer task consuming the session's outbound
/// channel (plus keep-alive pings), read loop feeding the session.
///
/// Returns when the connection is closed from either side; the session is
/// marked disconnected before returning.
pub async fn run_transport<S>(
    ws: WebSocketStream<S>,
    session: Arc<RpcSession>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    ping_interval: Option<Duration>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sink, mut ws_stream) = ws.split();

    let writer = tokio::spawn(async move {
        let mut ping = ping_interval.map(tokio::time::interval);
        if let Some(ping) = ping.as_mut() {
            // First tick fires immediately; skip it.
            ping.tick().await;
        }
        loop {
            let message = match ping.as_mut() {
                Some(ping) => {
                    tokio::select! {
                        msg = outgoing.recv() => msg,
                        _ = ping.tick() => Some(Message::Ping(Vec::new())),
                    }
                }
                None => outgoing.recv().await,
            };
            match message {
                Some(msg) => {
                    if ws_sink.send(msg).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_sink.close().await;
                    break;
                }
            }
        }
    });

    while let Some(msg) = ws_stream.next().await {
        match msg {
            Ok(Message::Text(text)) => session.handle_incoming(&text).await,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Pongs are produced by tungstenite itself; nothing to do.
            }
            Ok(Message::Close(frame)) => {
                debug!(?frame, "Close frame received");
                break;
            }
            Ok(Message::Binary(data)) => {
                warn!(len = data.len(), "Ignoring binary message");
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                error!(error = %e, "WebSocket error");
                break;
            }
        }
    }

    session.handle_disconnected().await;
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessagesValidator;

    fn session_pair() -> (Arc<RpcSession>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(MessageDispatcher::new(Arc::new(
            MessagesValidator::permissive(),
        )));
        let session = RpcSession::new(tx, dispatcher, Duration::from_millis(200), None, None);
        (session, rx)
    }

    fn sent_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> String {
        match rx.try_recv().expect("a frame should have been written") {
            Message::Text(text) => text,
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn call_resolves_on_call_result() {
        let (session, mut rx) = session_pair();

        let s = Arc::clone(&session);
        let call = tokio::spawn(async move {
            s.call_raw("Heartbeat", serde_json::json!({})).await
        });

        // Wait for the outbound frame and answer it.
        tokio::task::yield_now().await;
        let sent = loop {
            if let Ok(Message::Text(text)) = rx.try_recv() {
                break text;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let frame = Frame::parse(&sent).unwrap();
        let reply = Frame::CallResult {
            unique_id: frame.unique_id().to_string(),
            payload: serde_json::json!({"currentTime": "2025-01-01T00:00:00Z"}),
        };
        session.handle_incoming(&reply.serialize()).await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["currentTime"], "2025-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn call_times_out() {
        let (session, _rx) = session_pair();
        let outcome = session.call_raw("Heartbeat", serde_json::json!({})).await;
        assert!(matches!(outcome, Err(RpcError::Timeout)));
        // The pending slot is gone; a late response is dropped silently.
        assert!(session.pending.is_empty());
    }

    #[tokio::test]
    async fn call_error_is_delivered() {
        let (session, mut rx) = session_pair();

        let s = Arc::clone(&session);
        let call = tokio::spawn(async move {
            s.call_raw("Reset", serde_json::json!({"type": "Soft"})).await
        });

        tokio::task::yield_now().await;
        let sent = loop {
            if let Ok(Message::Text(text)) = rx.try_recv() {
                break text;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let frame = Frame::parse(&sent).unwrap();
        let reply = Frame::error(
            frame.unique_id(),
            RpcErrorCode::NotSupported,
            "no can do",
        );
        session.handle_incoming(&reply.serialize()).await;

        let err = call.await.unwrap().unwrap_err();
        match err {
            RpcError::CallError { code, description, .. } => {
                assert_eq!(code, "NotSupported");
                assert_eq!(description, "no can do");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_fails_pending_calls() {
        let (session, _rx) = session_pair();

        let s = Arc::clone(&session);
        let call = tokio::spawn(async move {
            s.call_raw("Heartbeat", serde_json::json!({})).await
        });
        tokio::task::yield_now().await;

        session.handle_disconnected().await;
        let outcome = call.await.unwrap();
        assert!(matches!(outcome, Err(RpcError::TransportClosed)));

        // Further calls are refused outright.
        let outcome = session.call_raw("Heartbeat", serde_json::json!({})).await;
        assert!(matches!(outcome, Err(RpcError::TransportClosed)));
    }

    #[tokio::test]
    async fn inbound_call_without_handler_answers_not_implemented() {
        let (session, mut rx) = session_pair();
        let call = Frame::Call {
            unique_id: "u1".into(),
            action: "Heartbeat".into(),
            payload: serde_json::json!({}),
        };
        session.handle_incoming(&call.serialize()).await;

        // Dispatch runs on a spawned task.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let text = sent_text(&mut rx);
        match Frame::parse(&text).unwrap() {
            Frame::CallError {
                unique_id,
                error_code,
                ..
            } => {
                assert_eq!(unique_id, "u1");
                assert_eq!(error_code, "NotImplemented");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frame_with_id_answers_formation_violation() {
        let (session, mut rx) = session_pair();
        session.handle_incoming(r#"[2,"u9","Heartbeat"]"#).await;
        let text = sent_text(&mut rx);
        match Frame::parse(&text).unwrap() {
            Frame::CallError {
                unique_id,
                error_code,
                ..
            } => {
                assert_eq!(unique_id, "u9");
                assert_eq!(error_code, "FormationViolation");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn spy_sees_both_directions() {
        struct Recorder(std::sync::Mutex<Vec<String>>);
        impl RpcSpy for Recorder {
            fn on_rx(&self, frame: &str) {
                self.0.lock().unwrap().push(format!("rx:{frame}"));
            }
            fn on_tx(&self, frame: &str) {
                self.0.lock().unwrap().push(format!("tx:{frame}"));
            }
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(MessageDispatcher::new(Arc::new(
            MessagesValidator::permissive(),
        )));
        let recorder = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        let session = RpcSession::new(
            tx,
            dispatcher,
            Duration::from_millis(50),
            Some(recorder.clone()),
            None,
        );

        let _ = session.call_raw("Heartbeat", serde_json::json!({})).await;
        session
            .handle_incoming(r#"[3,"nobody",{}]"#)
            .await;

        let seen = recorder.0.lock().unwrap();
        assert!(seen.iter().any(|s| s.starts_with("tx:")));
        assert!(seen.iter().any(|s| s.starts_with("rx:")));
    }
}
