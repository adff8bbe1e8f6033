//! Local Controller role runtime.
//!
//! A store-and-forward bridge: each connecting charge point gets a paired
//! outbound connection to the central system, and every CALL received on
//! one leg is re-issued verbatim on the other. User code may replace the
//! forwarding handler of any action to observe, modify or short-circuit
//! traffic.

pub mod pair;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tracing::{info, warn};

use crate::config::LocalControllerSettings;
use crate::messages::{
    MessagesValidator, ValidatorError, CP_INITIATED_ACTIONS, CS_INITIATED_ACTIONS,
};
use crate::rpc::{
    ClientConfig, RpcServer, RpcServerHandler, RpcSession, ServerConfig, SessionSetup,
};

pub use pair::ProxyPair;

#[derive(Debug, thiserror::Error)]
pub enum LocalControllerError {
    #[error(transparent)]
    Schemas(#[from] ValidatorError),
    #[error("could not bind listener: {0}")]
    Bind(#[from] std::io::Error),
}

/// User-side notifications of the Local Controller role.
#[async_trait]
pub trait LocalControllerEvents: Send + Sync {
    /// HTTP Basic credential check for the charge-point leg.
    fn check_credentials(&self, charge_point_id: &str, user: &str, password: &str) -> bool {
        let _ = (charge_point_id, user, password);
        true
    }

    /// A proxy pair is up: both legs connected, forwarding active.
    /// Register replacement handlers on the pair here to intercept
    /// traffic.
    async fn charge_point_connected(&self, pair: Arc<ProxyPair>) {
        let _ = pair;
    }

    async fn charge_point_disconnected(&self, charge_point_id: &str) {
        let _ = charge_point_id;
    }

    async fn central_system_disconnected(&self, charge_point_id: &str) {
        let _ = charge_point_id;
    }
}

/// Forward-everything events implementation.
pub struct DefaultLocalControllerEvents;

#[async_trait]
impl LocalControllerEvents for DefaultLocalControllerEvents {}

pub struct LocalController {
    server: RpcServer,
    pairs: Arc<DashMap<String, Arc<ProxyPair>>>,
}

impl LocalController {
    pub async fn start(
        settings: LocalControllerSettings,
        events: Arc<dyn LocalControllerEvents>,
    ) -> Result<Self, LocalControllerError> {
        // Both directions flow through the controller, so the schema set
        // is the union of both action sets.
        let actions: BTreeSet<&str> = CP_INITIATED_ACTIONS
            .iter()
            .chain(CS_INITIATED_ACTIONS.iter())
            .copied()
            .collect();
        let validator = Arc::new(MessagesValidator::load(&settings.schemas_dir, actions)?);

        let pairs = Arc::new(DashMap::new());
        let handler = Arc::new(PairMaker {
            settings: settings.clone(),
            validator,
            events,
            pairs: Arc::clone(&pairs),
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

        info!(address = %server.local_addr(), "Local controller started");
        Ok(Self { server, pairs })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.server.local_addr()
    }

    pub fn pair(&self, charge_point_id: &str) -> Option<Arc<ProxyPair>> {
        self.pairs.get(charge_point_id).map(|p| p.clone())
    }

    pub fn connected_identifiers(&self) -> Vec<String> {
        self.pairs.iter().map(|p| p.key().clone()).collect()
    }

    pub fn stop(&self) {
        self.server.stop();
        for pair in self.pairs.iter() {
            pair.close();
        }
        self.pairs.clear();
    }
}

/// Builds a [`ProxyPair`] for every accepted charge-point connection.
struct PairMaker {
    settings: LocalControllerSettings,
    validator: Arc<MessagesValidator>,
    events: Arc<dyn LocalControllerEvents>,
    pairs: Arc<DashMap<String, Arc<ProxyPair>>>,
}

impl PairMaker {
    fn central_system_url(&self, charge_point_id: &str) -> String {
        let encoded = utf8_percent_encode(charge_point_id, NON_ALPHANUMERIC);
        format!(
            "{}/{}",
            self.settings.central_system_url.trim_end_matches('/'),
            encoded
        )
    }
}

#[async_trait]
impl RpcServerHandler for PairMaker {
    fn check_credentials(&self, charge_point_id: &str, user: &str, password: &str) -> bool {
        self.events.check_credentials(charge_point_id, user, password)
    }

    async fn session_opened(&self, charge_point_id: &str) -> Option<SessionSetup> {
        if self.pairs.contains_key(charge_point_id) {
            warn!(charge_point_id, "Charge point already proxied, refusing");
            return None;
        }

        let pair = ProxyPair::new(
            charge_point_id.to_string(),
            Arc::clone(&self.validator),
            ClientConfig {
                url: self.central_system_url(charge_point_id),
                call_timeout: self.settings.call_timeout(),
                ping_interval: Some(self.settings.ping_interval()),
                ..ClientConfig::default()
            },
            self.settings.disconnect_from_cp_when_cs_disconnected,
            Arc::clone(&self.events),
        );
        let dispatcher = pair.charge_point_dispatcher();
        self.pairs.insert(charge_point_id.to_string(), pair);
        Some(SessionSetup {
            dispatcher,
            spy: None,
        })
    }

    async fn session_ready(&self, charge_point_id: &str, session: Arc<RpcSession>) {
        let Some(pair) = self.pair_of(charge_point_id) else {
            return;
        };
        pair.attach_charge_point(session);
        info!(charge_point_id, "Proxy pair established");
        self.events.charge_point_connected(pair).await;
    }

    async fn session_closed(&self, charge_point_id: &str) {
        if let Some((_, pair)) = self.pairs.remove(charge_point_id) {
            // The charge-point leg is gone; the central-system leg always
            // follows it down.
            pair.close();
        }
        self.events.charge_point_disconnected(charge_point_id).await;
    }
}

impl PairMaker {
    fn pair_of(&self, charge_point_id: &str) -> Option<Arc<ProxyPair>> {
        self.pairs.get(charge_point_id).map(|p| p.clone())
    }
}
