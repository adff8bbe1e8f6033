//! Central System role runtime.
//!
//! Listens for charge-point connections, keeps one [`ChargePointProxy`]
//! per session and routes every charge-point-initiated action into the
//! embedder's [`CentralSystemEvents`] implementation. A failure on one
//! session never affects the others.

pub mod events;
pub mod proxy;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::config::CentralSystemSettings;
use crate::messages::core::*;
use crate::messages::dispatcher::typed_handler;
use crate::messages::firmware::{
    DiagnosticsStatusNotificationRequest, DiagnosticsStatusNotificationResponse,
    FirmwareStatusNotificationRequest, FirmwareStatusNotificationResponse,
};
use crate::messages::security::{
    LogStatusNotificationRequest, LogStatusNotificationResponse,
    SecurityEventNotificationRequest, SecurityEventNotificationResponse, SignCertificateRequest,
    SignCertificateResponse, SignedFirmwareStatusNotificationRequest,
    SignedFirmwareStatusNotificationResponse,
};
use crate::messages::{
    MessageDispatcher, MessagesValidator, Request, ValidatorError, CP_INITIATED_ACTIONS,
};
use crate::rpc::{
    RpcServer, RpcServerHandler, RpcSession, ServerConfig, SessionSetup,
};

pub use events::{CentralSystemEvents, DefaultCentralSystemEvents};
pub use proxy::ChargePointProxy;

#[derive(Debug, thiserror::Error)]
pub enum CentralSystemError {
    #[error(transparent)]
    Schemas(#[from] ValidatorError),
    #[error("could not bind listener: {0}")]
    Bind(#[from] std::io::Error),
}

pub struct CentralSystem {
    server: RpcServer,
    proxies: Arc<DashMap<String, Arc<ChargePointProxy>>>,
}

impl CentralSystem {
    /// Load the schemas, bind the listener and start accepting charge
    /// points.
    pub async fn start(
        settings: CentralSystemSettings,
        events: Arc<dyn CentralSystemEvents>,
    ) -> Result<Self, CentralSystemError> {
        let validator = Arc::new(MessagesValidator::load(
            &settings.schemas_dir,
            CP_INITIATED_ACTIONS,
        )?);
        let proxies = Arc::new(DashMap::new());

        let handler = Arc::new(SessionHandler {
            validator,
            events,
            proxies: Arc::clone(&proxies),
        });

        let server = RpcServer::bind(
            ServerConfig {
                listen_address: settings.listen_address.clone(),
                call_timeout: settings.call_timeout(),
                ping_interval: Some(settings.ping_interval()),
                ..ServerConfig::default()
            },
            handler,
        )
        .await?;

        info!(address = %server.local_addr(), "Central system started");
        Ok(Self { server, proxies })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.server.local_addr()
    }

    /// Proxy of a connected charge point.
    pub fn charge_point(&self, identifier: &str) -> Option<Arc<ChargePointProxy>> {
        self.proxies.get(identifier).map(|p| p.clone())
    }

    pub fn connected_identifiers(&self) -> Vec<String> {
        self.proxies.iter().map(|p| p.key().clone()).collect()
    }

    pub fn stop(&self) {
        self.server.stop();
        self.proxies.clear();
    }
}

struct SessionHandler {
    validator: Arc<MessagesValidator>,
    events: Arc<dyn CentralSystemEvents>,
    proxies: Arc<DashMap<String, Arc<ChargePointProxy>>>,
}

#[async_trait]
impl RpcServerHandler for SessionHandler {
    fn check_credentials(&self, charge_point_id: &str, user: &str, password: &str) -> bool {
        self.events.check_credentials(charge_point_id, user, password)
    }

    async fn session_opened(&self, charge_point_id: &str) -> Option<SessionSetup> {
        let dispatcher = build_dispatcher(
            Arc::clone(&self.validator),
            Arc::clone(&self.events),
            charge_point_id.to_string(),
        );
        Some(SessionSetup {
            dispatcher,
            spy: None,
        })
    }

    async fn session_ready(&self, charge_point_id: &str, session: Arc<RpcSession>) {
        let proxy = ChargePointProxy::new(charge_point_id, session);
        self.proxies
            .insert(charge_point_id.to_string(), Arc::clone(&proxy));
        self.events.charge_point_connected(proxy).await;
    }

    async fn session_closed(&self, charge_point_id: &str) {
        self.proxies.remove(charge_point_id);
        self.events.charge_point_disconnected(charge_point_id).await;
    }
}

/// One dispatcher per session so every handler closure knows which charge
/// point it serves.
fn build_dispatcher(
    validator: Arc<MessagesValidator>,
    events: Arc<dyn CentralSystemEvents>,
    charge_point_id: String,
) -> Arc<MessageDispatcher> {
    let dispatcher = Arc::new(MessageDispatcher::new(validator));

    macro_rules! handle {
        ($request:ty, |$events:ident, $cp:ident, $req:ident| $body:expr) => {{
            let $events = Arc::clone(&events);
            let $cp = charge_point_id.clone();
            dispatcher.register(
                <$request>::ACTION,
                typed_handler(move |$req: $request| {
                    let $events = Arc::clone(&$events);
                    let $cp = $cp.clone();
                    async move { Ok($body) }
                }),
                false,
            );
        }};
    }

    handle!(BootNotificationRequest, |events, cp, request| {
        events.boot_notification(&cp, request).await
    });
    handle!(HeartbeatRequest, |events, cp, _request| {
        HeartbeatResponse {
            current_time: events.heartbeat(&cp).await,
        }
    });
    handle!(AuthorizeRequest, |events, cp, request| {
        AuthorizeResponse {
            id_tag_info: events.authorize(&cp, &request.id_tag).await,
        }
    });
    handle!(StartTransactionRequest, |events, cp, request| {
        events.start_transaction(&cp, request).await
    });
    handle!(StopTransactionRequest, |events, cp, request| {
        events.stop_transaction(&cp, request).await
    });
    handle!(MeterValuesRequest, |events, cp, request| {
        events.meter_values(&cp, request).await;
        MeterValuesResponse {}
    });
    handle!(StatusNotificationRequest, |events, cp, request| {
        events.status_notification(&cp, request).await;
        StatusNotificationResponse {}
    });
    handle!(DataTransferRequest, |events, cp, request| {
        events.data_transfer(&cp, request).await
    });
    handle!(DiagnosticsStatusNotificationRequest, |events, cp, request| {
        events
            .diagnostics_status_notification(&cp, request.status)
            .await;
        DiagnosticsStatusNotificationResponse {}
    });
    handle!(FirmwareStatusNotificationRequest, |events, cp, request| {
        events.firmware_status_notification(&cp, request.status).await;
        FirmwareStatusNotificationResponse {}
    });
    handle!(LogStatusNotificationRequest, |events, cp, request| {
        events.log_status_notification(&cp, request).await;
        LogStatusNotificationResponse {}
    });
    handle!(SecurityEventNotificationRequest, |events, cp, request| {
        events.security_event_notification(&cp, request).await;
        SecurityEventNotificationResponse {}
    });
    handle!(SignedFirmwareStatusNotificationRequest, |events, cp, request| {
        events
            .signed_firmware_status_notification(&cp, request)
            .await;
        SignedFirmwareStatusNotificationResponse {}
    });
    handle!(SignCertificateRequest, |events, cp, request| {
        SignCertificateResponse {
            status: events.sign_certificate(&cp, &request.csr).await,
        }
    });

    dispatcher
}
