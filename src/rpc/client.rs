//! WebSocket RPC client.
//!
//! Maintains one outbound OCPP-J connection: connects with subprotocol
//! negotiation and optional HTTP Basic credentials, then reconnects with
//! exponential backoff until stopped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use super::session::{run_transport, RpcError, RpcSession, RpcSpy};
use crate::messages::{MessageDispatcher, Request};

/// Connection settings for one client leg.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full endpoint URL, identifier segment included
    /// (e.g. `ws://cs.example.com/ocpp/CP%2D01`).
    pub url: String,
    /// WebSocket subprotocol, normally `ocpp1.6`.
    pub protocol: String,
    /// HTTP Basic credentials (security profiles 1 and 2).
    pub credentials: Option<(String, String)>,
    pub call_timeout: Duration,
    pub ping_interval: Option<Duration>,
    /// Initial reconnect delay; doubles up to `max_retry_interval`.
    pub retry_interval: Duration,
    pub max_retry_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            protocol: super::OCPP16_SUBPROTOCOL.to_string(),
            credentials: None,
            call_timeout: Duration::from_secs(30),
            ping_interval: Some(Duration::from_secs(60)),
            retry_interval: Duration::from_secs(5),
            max_retry_interval: Duration::from_secs(120),
        }
    }
}

/// Connection state notifications for the owning role.
#[async_trait::async_trait]
pub trait ClientListener: Send + Sync {
    async fn on_connected(&self);
    async fn on_disconnected(&self);
    /// A connection attempt failed before the session was established.
    async fn on_connection_failed(&self) {}
}

pub struct RpcClient {
    config: ClientConfig,
    dispatcher: Arc<MessageDispatcher>,
    spy: Option<Arc<dyn RpcSpy>>,
    session: Mutex<Option<Arc<RpcSession>>>,
    shutdown: watch::Sender<bool>,
}

impl RpcClient {
    pub fn new(
        config: ClientConfig,
        dispatcher: Arc<MessageDispatcher>,
        spy: Option<Arc<dyn RpcSpy>>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            config,
            dispatcher,
            spy,
            session: Mutex::new(None),
            shutdown,
        })
    }

    /// Spawn the connection loop. The returned handle completes when the
    /// client is stopped.
    pub fn start(self: &Arc<Self>, listener: Arc<dyn ClientListener>) -> tokio::task::JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.run(listener).await })
    }

    async fn run(self: Arc<Self>, listener: Arc<dyn ClientListener>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = self.config.retry_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.connect_once().await {
                Ok(ws) => {
                    backoff = self.config.retry_interval;

                    let (tx, rx) = mpsc::unbounded_channel();
                    let session = RpcSession::new(
                        tx,
                        Arc::clone(&self.dispatcher),
                        self.config.call_timeout,
                        self.spy.clone(),
                        None,
                    );
                    *self.session.lock().unwrap() = Some(Arc::clone(&session));
                    listener.on_connected().await;

                    tokio::select! {
                        _ = run_transport(ws, Arc::clone(&session), rx, self.config.ping_interval) => {}
                        _ = shutdown.changed() => {
                            session.handle_disconnected().await;
                        }
                    }

                    *self.session.lock().unwrap() = None;
                    listener.on_disconnected().await;
                }
                Err(e) => {
                    warn!(url = self.config.url.as_str(), error = %e, "Connection attempt failed");
                    listener.on_connection_failed().await;
                }
            }

            if *shutdown.borrow() {
                break;
            }

            // Jittered exponential backoff between attempts.
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
            let delay = backoff + Duration::from_millis(jitter);
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(self.config.max_retry_interval);
        }
    }

    async fn connect_once(
        &self,
    ) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, tokio_tungstenite::tungstenite::Error>
    {
        let mut request = self.config.url.as_str().into_client_request()?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&self.config.protocol)
                .map_err(|e| tokio_tungstenite::tungstenite::Error::Http(
                    tokio_tungstenite::tungstenite::http::Response::builder()
                        .status(400)
                        .body(Some(e.to_string().into_bytes()))
                        .unwrap(),
                ))?,
        );
        if let Some((user, password)) = &self.config.credentials {
            let token =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
            request.headers_mut().insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Basic {token}")).expect("base64 is ASCII"),
            );
        }

        let (ws, response) =
            match tokio::time::timeout(self.config.call_timeout, connect_async(request)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(tokio_tungstenite::tungstenite::Error::Io(
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                    ))
                }
            };

        let negotiated = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if negotiated != Some(self.config.protocol.as_str()) {
            warn!(
                requested = self.config.protocol.as_str(),
                ?negotiated,
                "Server did not confirm the requested subprotocol"
            );
        }

        info!(url = self.config.url.as_str(), "Connected");
        Ok(ws)
    }

    /// Currently established session, when connected.
    pub fn session(&self) -> Option<Arc<RpcSession>> {
        self.session.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session().map(|s| s.is_connected()).unwrap_or(false)
    }

    /// Issue a typed call on the current session.
    pub async fn call<R: Request>(&self, request: &R) -> Result<R::Response, RpcError> {
        match self.session() {
            Some(session) => session.call(request).await,
            None => Err(RpcError::TransportClosed),
        }
    }

    pub async fn call_raw(
        &self,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        match self.session() {
            Some(session) => session.call_raw(action, payload).await,
            None => Err(RpcError::TransportClosed),
        }
    }

    /// Stop the connection loop and close any active session.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}
