//! WebSocket RPC server.
//!
//! Accepts OCPP-J connections, negotiates the subprotocol, checks HTTP
//! Basic credentials and extracts the charge-point identifier from the
//! terminal URL path segment (percent-decoded).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use percent_encoding::percent_decode_str;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{error, info, warn};

use super::session::{run_transport, RpcSession, RpcSpy};
use crate::messages::MessageDispatcher;

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address, e.g. `0.0.0.0:8180`.
    pub listen_address: String,
    /// Accepted WebSocket subprotocol, normally `ocpp1.6`.
    pub protocol: String,
    pub call_timeout: Duration,
    pub ping_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8180".to_string(),
            protocol: super::OCPP16_SUBPROTOCOL.to_string(),
            call_timeout: Duration::from_secs(30),
            ping_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Per-session wiring supplied by the owning role.
pub struct SessionSetup {
    pub dispatcher: Arc<MessageDispatcher>,
    pub spy: Option<Arc<dyn RpcSpy>>,
}

/// Role-side hooks driving accepted connections.
#[async_trait::async_trait]
pub trait RpcServerHandler: Send + Sync {
    /// Verify HTTP Basic credentials. Sessions without an Authorization
    /// header are checked with empty user and password.
    fn check_credentials(&self, charge_point_id: &str, user: &str, password: &str) -> bool {
        let _ = (charge_point_id, user, password);
        true
    }

    /// A connection for `charge_point_id` passed the handshake. Return the
    /// session wiring, or `None` to drop the connection.
    async fn session_opened(&self, charge_point_id: &str) -> Option<SessionSetup>;

    /// The session is established and can carry calls.
    async fn session_ready(&self, charge_point_id: &str, session: Arc<RpcSession>);

    /// The session's transport is gone.
    async fn session_closed(&self, charge_point_id: &str);
}

pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl RpcServer {
    /// Bind the listener and spawn the accept loop.
    pub async fn bind(
        config: ServerConfig,
        handler: Arc<dyn RpcServerHandler>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.listen_address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "RPC server listening");

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let config = config.clone();
                                let handler = Arc::clone(&handler);
                                tokio::spawn(async move {
                                    handle_connection(stream, peer, config, handler).await;
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "Accept failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("RPC server stopping");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    /// Actual bound address (useful when listening on port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

struct HandshakeOutcome {
    charge_point_id: String,
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: ServerConfig,
    handler: Arc<dyn RpcServerHandler>,
) {
    let mut outcome: Option<HandshakeOutcome> = None;

    let callback = |req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let path = req.uri().path();
        let charge_point_id = extract_identifier(path).ok_or_else(|| {
            warn!(%peer, path, "Rejecting connection without an identifier");
            error_response(400)
        })?;

        let (user, password) = basic_credentials(req);
        if !handler.check_credentials(&charge_point_id, &user, &password) {
            warn!(%peer, charge_point_id = charge_point_id.as_str(), "Invalid credentials");
            return Err(error_response(401));
        }

        let offered = req
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if offered
            .split(',')
            .map(str::trim)
            .any(|p| p == config.protocol)
        {
            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                config.protocol.parse().expect("static protocol name"),
            );
        } else {
            warn!(
                %peer,
                offered,
                expected = config.protocol.as_str(),
                "Client did not offer the expected subprotocol"
            );
        }

        outcome = Some(HandshakeOutcome { charge_point_id });
        Ok(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "Handshake failed");
            return;
        }
    };
    let Some(HandshakeOutcome { charge_point_id }) = outcome else {
        return;
    };

    info!(%peer, charge_point_id = charge_point_id.as_str(), "Charge point connected");

    let Some(setup) = handler.session_opened(&charge_point_id).await else {
        warn!(charge_point_id = charge_point_id.as_str(), "Session refused by role");
        return;
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let session = RpcSession::new(tx, setup.dispatcher, config.call_timeout, setup.spy, None);
    handler
        .session_ready(&charge_point_id, Arc::clone(&session))
        .await;

    run_transport(ws, Arc::clone(&session), rx, config.ping_interval).await;

    handler.session_closed(&charge_point_id).await;
    info!(charge_point_id = charge_point_id.as_str(), "Charge point disconnected");
}

fn error_response(status: u16) -> ErrorResponse {
    tokio_tungstenite::tungstenite::http::Response::builder()
        .status(status)
        .body(None)
        .expect("static response")
}

/// The charge-point identifier is the percent-decoded terminal path segment.
fn extract_identifier(path: &str) -> Option<String> {
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    if segment.is_empty() {
        return None;
    }
    percent_decode_str(segment)
        .decode_utf8()
        .ok()
        .map(|s| s.to_string())
}

fn basic_credentials(req: &Request) -> (String, String) {
    let header = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let Some(token) = header.strip_prefix("Basic ") else {
        return (String::new(), String::new());
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(token.trim()) else {
        return (String::new(), String::new());
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return (String::new(), String::new());
    };
    match text.split_once(':') {
        Some((user, password)) => (user.to_string(), password.to_string()),
        None => (text, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_is_last_segment_percent_decoded() {
        assert_eq!(extract_identifier("/ocpp/CP-01").as_deref(), Some("CP-01"));
        assert_eq!(
            extract_identifier("/ocpp/CP%2001").as_deref(),
            Some("CP 01")
        );
        assert_eq!(extract_identifier("/CP-01/").as_deref(), Some("CP-01"));
        assert_eq!(extract_identifier("/"), None);
    }
}
