//! Charge Point role runtime.
//!
//! Owns the connection to the central system, the connectors, the boot and
//! heartbeat lifecycle, transactions, reservations, authorization and
//! smart charging, and exposes the embedder-facing operations.

pub mod authent;
pub mod authent_cache;
pub mod authent_locallist;
pub mod connectors;
pub mod events;
pub mod iso15118;
pub mod profile_db;
pub mod reservations;
pub mod smartcharging;
pub mod transactions;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::config::{ChargePointSettings, OcppConfig};
use crate::messages::core::*;
use crate::messages::dispatcher::{typed_handler, HandlerError};
use crate::messages::firmware::*;
use crate::messages::localauth::{
    GetLocalListVersionRequest, SendLocalListRequest,
};
use crate::messages::remotetrigger::{TriggerMessageRequest, TriggerMessageResponse};
use crate::messages::reservation::{CancelReservationRequest, ReserveNowRequest};
use crate::messages::security::*;
use crate::messages::smartcharging::{
    ClearChargingProfileRequest, GetCompositeScheduleRequest, SetChargingProfileRequest,
};
use crate::messages::types::*;
use crate::messages::{
    MessageDispatcher, MessagesValidator, Request, ValidatorError, CS_INITIATED_ACTIONS,
};
use crate::rpc::{ClientConfig, ClientListener, RpcClient, RpcError};
use crate::storage::PersistentStore;

pub use authent::AuthentManager;
pub use authent_cache::AuthentCache;
pub use authent_locallist::AuthentLocalList;
pub use connectors::{Connector, Connectors};
pub use events::{ChargePointEventsHandler, DefaultEventsHandler};
pub use iso15118::Iso15118Manager;
pub use reservations::{ReservationManager, ReservationObserver};
pub use smartcharging::{SmartChargingManager, SmartChargingSetpoint};
pub use transactions::TransactionMessenger;

/// Internal-config keys for the boot and uptime counters.
const START_COUNT_KEY: &str = "StartNbr";
const UPTIME_KEY: &str = "UptimeNbr";
const TOTAL_UPTIME_KEY: &str = "TotalUptimeNbr";

#[derive(Debug, thiserror::Error)]
pub enum ChargePointError {
    #[error(transparent)]
    Schemas(#[from] ValidatorError),
    #[error("unknown connector {0}")]
    UnknownConnector(u32),
    #[error("a transaction is already in progress on connector {0}")]
    TransactionInProgress(u32),
    #[error("no transaction in progress on connector {0}")]
    NoTransaction(u32),
    #[error("authorization refused: {0:?}")]
    NotAuthorized(AuthorizationStatus),
    #[error("connector reserved for another idTag")]
    Reserved,
    #[error("start refused by the central system: {0:?}")]
    RefusedByCentralSystem(AuthorizationStatus),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Result of a successful StartTransaction.
#[derive(Debug, Clone)]
pub struct StartedTransaction {
    pub transaction_id: i32,
    /// The transaction was started while offline; its id is a local
    /// placeholder until the queued StartTransaction is replayed.
    pub offline: bool,
}

pub struct ChargePoint {
    settings: ChargePointSettings,
    ocpp_config: Arc<OcppConfig>,
    connectors: Arc<Connectors>,
    client: Arc<RpcClient>,
    events: Arc<dyn ChargePointEventsHandler>,
    store: Arc<dyn PersistentStore>,
    authent: Arc<AuthentManager>,
    cache: Arc<AuthentCache>,
    local_list: Arc<AuthentLocalList>,
    smart_charging: Arc<SmartChargingManager>,
    reservations: Arc<ReservationManager>,
    messenger: Arc<TransactionMessenger>,
    iso15118: Iso15118Manager,
    registration: RwLock<Option<RegistrationStatus>>,
    /// Local ids handed out for transactions started offline.
    offline_tx_counter: AtomicI32,
    heartbeat_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    background_tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ChargePoint {
    /// Build and start the role: loads the schemas, registers the
    /// handlers and opens the (auto-reconnecting) connection.
    pub async fn start(
        settings: ChargePointSettings,
        events: Arc<dyn ChargePointEventsHandler>,
        store: Arc<dyn PersistentStore>,
    ) -> Result<Arc<Self>, ChargePointError> {
        let validator = Arc::new(MessagesValidator::load(
            &settings.schemas_dir,
            CS_INITIATED_ACTIONS,
        )?);
        let dispatcher = Arc::new(MessageDispatcher::new(validator));

        let ocpp_config = Arc::new(OcppConfig::new());
        ocpp_config.set_internal("NumberOfConnectors", &settings.connector_count.to_string());
        let connectors = Arc::new(Connectors::new(settings.connector_count));

        let client = RpcClient::new(
            ClientConfig {
                url: settings.endpoint_url(),
                credentials: settings
                    .basic_auth_password
                    .clone()
                    .map(|password| (settings.identifier.clone(), password)),
                call_timeout: settings.call_timeout(),
                ping_interval: Some(settings.ping_interval()),
                retry_interval: settings.retry_interval(),
                ..ClientConfig::default()
            },
            Arc::clone(&dispatcher),
            None,
        );

        let cache = Arc::new(AuthentCache::new(
            Arc::clone(&ocpp_config),
            Arc::clone(&store),
            settings.authent_cache_max_entries,
        ));
        let local_list = Arc::new(
            AuthentLocalList::new(Arc::clone(&ocpp_config), Arc::clone(&store)).await,
        );
        let authent = Arc::new(AuthentManager::new(
            Arc::clone(&ocpp_config),
            Arc::clone(&cache),
            Arc::clone(&local_list),
            client.clone(),
        ));
        let smart_charging = SmartChargingManager::new(
            settings.operating_voltage,
            Arc::clone(&ocpp_config),
            Arc::clone(&connectors),
            Arc::clone(&events),
            Arc::clone(&store),
        )
        .await;
        let reservations =
            ReservationManager::new(Arc::clone(&ocpp_config), Arc::clone(&connectors));
        let messenger = Arc::new(TransactionMessenger::new(
            Arc::clone(&ocpp_config),
            Arc::clone(&client),
        ));
        let iso15118 = Iso15118Manager::new(Arc::clone(&client), Arc::clone(&authent));

        let charge_point = Arc::new(Self {
            settings,
            ocpp_config,
            connectors,
            client,
            events,
            store,
            authent,
            cache,
            local_list,
            smart_charging,
            reservations,
            messenger,
            iso15118,
            registration: RwLock::new(None),
            offline_tx_counter: AtomicI32::new(-1),
            heartbeat_task: StdMutex::new(None),
            background_tasks: StdMutex::new(Vec::new()),
        });

        charge_point.register_handlers(&dispatcher);
        charge_point.bump_start_counter().await;

        {
            let mut tasks = charge_point.background_tasks.lock().unwrap();
            tasks.push(charge_point.smart_charging.spawn_cleanup_task());
            tasks.push(
                charge_point
                    .reservations
                    .spawn_expiry_task(charge_point.clone()),
            );
            tasks.push(charge_point.spawn_uptime_task());
            tasks.push(charge_point.client.start(Arc::new(ConnectionListener {
                charge_point: Arc::downgrade(&charge_point),
            })));
        }

        Ok(charge_point)
    }

    /// Stop the role: closes the connection and cancels the timers.
    pub fn stop(&self) {
        self.client.stop();
        if let Some(task) = self.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }
        for task in self.background_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    // ── Embedder-facing state ──────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn registration_status(&self) -> Option<RegistrationStatus> {
        *self.registration.read().unwrap()
    }

    pub fn connectors(&self) -> &Arc<Connectors> {
        &self.connectors
    }

    pub fn ocpp_config(&self) -> &Arc<OcppConfig> {
        &self.ocpp_config
    }

    pub fn smart_charging(&self) -> &Arc<SmartChargingManager> {
        &self.smart_charging
    }

    pub fn iso15118(&self) -> &Iso15118Manager {
        &self.iso15118
    }

    // ── Authorization & transactions ───────────────────────────

    pub async fn authorize(&self, id_tag: &str) -> (AuthorizationStatus, String) {
        self.authent.authorize(id_tag).await
    }

    /// Run the StartTransaction procedure on a connector.
    pub async fn start_transaction(
        self: &Arc<Self>,
        connector_id: u32,
        id_tag: &str,
    ) -> Result<StartedTransaction, ChargePointError> {
        let connector = self
            .connectors
            .get(connector_id)
            .ok_or(ChargePointError::UnknownConnector(connector_id))?;
        if connector_id == 0 {
            return Err(ChargePointError::UnknownConnector(0));
        }
        if connector.has_transaction() {
            return Err(ChargePointError::TransactionInProgress(connector_id));
        }

        let (status, parent_id) = self.authent.authorize(id_tag).await;
        if status != AuthorizationStatus::Accepted {
            return Err(ChargePointError::NotAuthorized(status));
        }
        if self
            .reservations
            .blocking_reservation(connector_id, id_tag, &parent_id)
        {
            return Err(ChargePointError::Reserved);
        }
        let reservation_id = self
            .reservations
            .matching_reservation(connector_id, id_tag, &parent_id);

        let request = StartTransactionRequest {
            connector_id,
            id_tag: id_tag.to_string(),
            meter_start: self.events.transaction_meter_value(connector_id).await,
            reservation_id,
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_value(&request).map_err(RpcError::Codec)?;

        let started = match self
            .messenger
            .send_with_retry(StartTransactionRequest::ACTION, payload.clone())
            .await
        {
            Ok(response) => {
                let response: StartTransactionResponse =
                    serde_json::from_value(response).map_err(RpcError::Codec)?;
                self.authent.update(id_tag, &response.id_tag_info).await;
                if response.id_tag_info.status != AuthorizationStatus::Accepted {
                    return Err(ChargePointError::RefusedByCentralSystem(
                        response.id_tag_info.status,
                    ));
                }
                StartedTransaction {
                    transaction_id: response.transaction_id,
                    offline: false,
                }
            }
            Err(RpcError::CallError { code, description, .. }) => {
                return Err(ChargePointError::Rpc(RpcError::CallError {
                    code,
                    description,
                    details: serde_json::Value::Null,
                }));
            }
            Err(_) => {
                // Offline: a local placeholder id keeps the transaction
                // going; the queued StartTransaction is replayed later.
                let local_id = self.offline_tx_counter.fetch_sub(1, Ordering::SeqCst);
                self.messenger
                    .send_or_queue(StartTransactionRequest::ACTION, payload)
                    .await;
                StartedTransaction {
                    transaction_id: local_id,
                    offline: true,
                }
            }
        };

        if let Some(reservation_id) = reservation_id {
            self.reservations.release(reservation_id, self.as_ref());
        }
        self.connectors.with_mut(connector_id, |c| {
            c.transaction_id = started.transaction_id;
            c.transaction_start = Some(request.timestamp);
            c.transaction_id_tag = Some(id_tag.to_string());
        });
        self.smart_charging
            .assign_pending_tx_profiles(connector_id, started.transaction_id)
            .await;
        self.update_status(connector_id, ChargePointStatus::Charging, ChargePointErrorCode::NoError, None)
            .await;

        info!(
            connector_id,
            transaction_id = started.transaction_id,
            offline = started.offline,
            "Transaction started"
        );
        Ok(started)
    }

    /// Run the StopTransaction procedure on a connector.
    pub async fn stop_transaction(
        self: &Arc<Self>,
        connector_id: u32,
        id_tag: Option<&str>,
        reason: Reason,
    ) -> Result<(), ChargePointError> {
        let connector = self
            .connectors
            .get(connector_id)
            .ok_or(ChargePointError::UnknownConnector(connector_id))?;
        if !connector.has_transaction() {
            return Err(ChargePointError::NoTransaction(connector_id));
        }

        let request = StopTransactionRequest {
            id_tag: id_tag.map(str::to_string),
            meter_stop: self.events.transaction_meter_value(connector_id).await,
            timestamp: Utc::now(),
            transaction_id: connector.transaction_id,
            reason: Some(reason),
            transaction_data: None,
        };
        let payload = serde_json::to_value(&request).map_err(RpcError::Codec)?;

        self.connectors.with_mut(connector_id, |c| {
            c.transaction_id = 0;
            c.transaction_start = None;
            c.transaction_id_tag = None;
        });
        self.smart_charging.clear_tx_profiles(connector_id).await;
        self.update_status(connector_id, ChargePointStatus::Available, ChargePointErrorCode::NoError, None)
            .await;

        self.messenger
            .send_or_queue(StopTransactionRequest::ACTION, payload)
            .await;

        info!(
            connector_id,
            transaction_id = request.transaction_id,
            ?reason,
            "Transaction stopped"
        );
        Ok(())
    }

    /// Send meter samples for a connector.
    pub async fn send_meter_values(
        &self,
        connector_id: u32,
        meter_values: Vec<MeterValue>,
    ) -> Result<(), ChargePointError> {
        let connector = self
            .connectors
            .get(connector_id)
            .ok_or(ChargePointError::UnknownConnector(connector_id))?;
        let request = MeterValuesRequest {
            connector_id,
            transaction_id: connector.has_transaction().then_some(connector.transaction_id),
            meter_value: meter_values,
        };
        let payload = serde_json::to_value(&request).map_err(RpcError::Codec)?;
        self.messenger
            .send_or_queue(MeterValuesRequest::ACTION, payload)
            .await;
        Ok(())
    }

    // ── Status notifications ───────────────────────────────────

    /// Report a connector status change, deduplicating repeats.
    pub async fn update_status(
        &self,
        connector_id: u32,
        status: ChargePointStatus,
        error_code: ChargePointErrorCode,
        info_text: Option<String>,
    ) -> bool {
        let changed = self
            .connectors
            .with_mut(connector_id, |c| {
                let changed = c.status != status;
                c.status = status;
                changed
            })
            .unwrap_or(false);
        if !changed && error_code == ChargePointErrorCode::NoError {
            return false;
        }
        self.send_status_notification(connector_id, status, error_code, info_text)
            .await;
        true
    }

    async fn send_status_notification(
        &self,
        connector_id: u32,
        status: ChargePointStatus,
        error_code: ChargePointErrorCode,
        info_text: Option<String>,
    ) {
        let request = StatusNotificationRequest {
            connector_id,
            error_code,
            info: info_text,
            status,
            timestamp: Some(Utc::now()),
            vendor_id: None,
            vendor_error_code: None,
        };
        if let Ok(payload) = serde_json::to_value(&request) {
            self.messenger
                .send_or_queue(StatusNotificationRequest::ACTION, payload)
                .await;
        }
    }

    async fn send_all_status_notifications(&self) {
        for connector in self.connectors.all() {
            self.send_status_notification(
                connector.id,
                connector.status,
                ChargePointErrorCode::NoError,
                None,
            )
            .await;
        }
    }

    // ── Notifications to the central system ────────────────────

    pub async fn firmware_status_notification(
        &self,
        status: FirmwareStatus,
    ) -> Result<(), RpcError> {
        self.client
            .call(&FirmwareStatusNotificationRequest { status })
            .await
            .map(drop)
    }

    pub async fn diagnostics_status_notification(
        &self,
        status: DiagnosticsStatus,
    ) -> Result<(), RpcError> {
        self.client
            .call(&DiagnosticsStatusNotificationRequest { status })
            .await
            .map(drop)
    }

    pub async fn security_event_notification(
        &self,
        event_type: &str,
        tech_info: Option<String>,
    ) -> Result<(), RpcError> {
        self.client
            .call(&SecurityEventNotificationRequest {
                event_type: event_type.to_string(),
                timestamp: Utc::now(),
                tech_info,
            })
            .await
            .map(drop)
    }

    pub async fn log_status_notification(
        &self,
        status: UploadLogStatus,
        request_id: Option<i32>,
    ) -> Result<(), RpcError> {
        self.client
            .call(&LogStatusNotificationRequest { status, request_id })
            .await
            .map(drop)
    }

    pub async fn signed_firmware_status_notification(
        &self,
        status: SignedFirmwareStatus,
        request_id: Option<i32>,
    ) -> Result<(), RpcError> {
        self.client
            .call(&SignedFirmwareStatusNotificationRequest { status, request_id })
            .await
            .map(drop)
    }

    pub async fn sign_certificate(&self, csr: &str) -> Result<GenericStatus, RpcError> {
        let response = self
            .client
            .call(&SignCertificateRequest {
                csr: csr.to_string(),
            })
            .await?;
        Ok(response.status)
    }

    pub async fn data_transfer(
        &self,
        vendor_id: &str,
        message_id: Option<String>,
        data: Option<String>,
    ) -> Result<DataTransferResponse, RpcError> {
        self.client
            .call(&DataTransferRequest {
                vendor_id: vendor_id.to_string(),
                message_id,
                data,
            })
            .await
    }

    // ── Boot & heartbeat lifecycle ─────────────────────────────

    async fn bump_start_counter(&self) {
        let count = match self.store.kv_get(START_COUNT_KEY).await {
            Ok(Some(value)) => value.parse::<u64>().unwrap_or(0) + 1,
            _ => 1,
        };
        let _ = self.store.kv_set(START_COUNT_KEY, &count.to_string()).await;
        // A new run starts counting its own uptime from zero.
        let _ = self.store.kv_set(UPTIME_KEY, "0").await;
    }

    fn spawn_uptime_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let charge_point = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(15));
            tick.tick().await;
            loop {
                tick.tick().await;
                for key in [UPTIME_KEY, TOTAL_UPTIME_KEY] {
                    let current = match charge_point.store.kv_get(key).await {
                        Ok(Some(value)) => value.parse::<u64>().unwrap_or(0),
                        _ => 0,
                    };
                    let _ = charge_point
                        .store
                        .kv_set(key, &(current + 15).to_string())
                        .await;
                }
            }
        })
    }

    fn boot_notification_request(&self) -> BootNotificationRequest {
        let identity = &self.settings.identity;
        BootNotificationRequest {
            charge_point_vendor: identity.vendor.clone(),
            charge_point_model: identity.model.clone(),
            charge_point_serial_number: identity.serial_number.clone(),
            charge_box_serial_number: None,
            firmware_version: identity.firmware_version.clone(),
            iccid: identity.iccid.clone(),
            imsi: identity.imsi.clone(),
            meter_type: identity.meter_type.clone(),
            meter_serial_number: identity.meter_serial_number.clone(),
        }
    }

    async fn boot_procedure(self: Arc<Self>) {
        loop {
            match self.client.call(&self.boot_notification_request()).await {
                Ok(response) => {
                    info!(status = ?response.status, interval = response.interval, "Boot notification answered");
                    *self.registration.write().unwrap() = Some(response.status);
                    self.events
                        .boot_notification_result(response.status)
                        .await;
                    match response.status {
                        RegistrationStatus::Accepted => {
                            if response.interval > 0 {
                                self.ocpp_config.set_internal(
                                    "HeartbeatInterval",
                                    &response.interval.to_string(),
                                );
                            }
                            self.start_heartbeat();
                            self.send_all_status_notifications().await;
                            self.messenger.drain().await;
                            return;
                        }
                        RegistrationStatus::Pending | RegistrationStatus::Rejected => {
                            // The interval is the retry delay until accepted.
                            let delay = response.interval.max(1) as u64;
                            tokio::time::sleep(Duration::from_secs(delay)).await;
                        }
                    }
                }
                Err(RpcError::TransportClosed) => return,
                Err(e) => {
                    warn!(error = %e, "Boot notification failed");
                    tokio::time::sleep(self.settings.retry_interval()).await;
                }
            }
            if !self.client.is_connected() {
                return;
            }
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let charge_point = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                let interval = charge_point.ocpp_config.heartbeat_interval_secs().max(1);
                tokio::time::sleep(Duration::from_secs(interval as u64)).await;
                charge_point.send_heartbeat().await;
            }
        });
        if let Some(previous) = self.heartbeat_task.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    async fn send_heartbeat(&self) {
        match self.client.call(&HeartbeatRequest {}).await {
            Ok(response) => {
                tracing::debug!(current_time = %response.current_time, "Heartbeat answered");
            }
            Err(e) => warn!(error = %e, "Heartbeat failed"),
        }
    }

    // ── Inbound request handlers ───────────────────────────────

    fn register_handlers(self: &Arc<Self>, dispatcher: &MessageDispatcher) {
        // Handlers hold weak references: the dispatcher lives inside the
        // RPC client owned by this charge point.
        let weak = Arc::downgrade(self);

        macro_rules! with_cp {
            ($weak:expr, $cp:ident, $body:expr) => {{
                match $weak.upgrade() {
                    Some($cp) => $body,
                    None => Err(HandlerError::internal("Charge point is shutting down")),
                }
            }};
        }

        let w = weak.clone();
        dispatcher.register(
            ChangeAvailabilityRequest::ACTION,
            typed_handler(move |request: ChangeAvailabilityRequest| {
                let w = w.clone();
                async move { with_cp!(w, cp, cp.on_change_availability(request).await) }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            ChangeConfigurationRequest::ACTION,
            typed_handler(move |request: ChangeConfigurationRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, {
                        let status = cp.ocpp_config.set_configuration(&request.key, &request.value);
                        info!(key = request.key.as_str(), ?status, "Configuration change");
                        Ok(ChangeConfigurationResponse { status })
                    })
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            GetConfigurationRequest::ACTION,
            typed_handler(move |request: GetConfigurationRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, {
                        let keys = request.key.unwrap_or_default();
                        let (known, unknown) = cp.ocpp_config.get_configuration(&keys);
                        Ok(GetConfigurationResponse {
                            configuration_key: (!known.is_empty()).then_some(known),
                            unknown_key: (!unknown.is_empty()).then_some(unknown),
                        })
                    })
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            ClearCacheRequest::ACTION,
            typed_handler(move |_request: ClearCacheRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, {
                        let status = cp.cache.handle_clear_cache().await;
                        Ok(ClearCacheResponse { status })
                    })
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            GetLocalListVersionRequest::ACTION,
            typed_handler(move |_request: GetLocalListVersionRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, Ok(cp.local_list.handle_get_local_list_version().await))
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            SendLocalListRequest::ACTION,
            typed_handler(move |request: SendLocalListRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, Ok(cp.local_list.handle_send_local_list(request).await))
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            SetChargingProfileRequest::ACTION,
            typed_handler(move |request: SetChargingProfileRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, cp.smart_charging.handle_set_charging_profile(request).await)
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            ClearChargingProfileRequest::ACTION,
            typed_handler(move |request: ClearChargingProfileRequest| {
                let w = w.clone();
                async move {
                    with_cp!(
                        w,
                        cp,
                        Ok(cp.smart_charging.handle_clear_charging_profile(request).await)
                    )
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            GetCompositeScheduleRequest::ACTION,
            typed_handler(move |request: GetCompositeScheduleRequest| {
                let w = w.clone();
                async move {
                    with_cp!(
                        w,
                        cp,
                        Ok(cp.smart_charging.handle_get_composite_schedule(request).await)
                    )
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            RemoteStartTransactionRequest::ACTION,
            typed_handler(move |request: RemoteStartTransactionRequest| {
                let w = w.clone();
                async move { with_cp!(w, cp, cp.on_remote_start(request).await) }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            RemoteStopTransactionRequest::ACTION,
            typed_handler(move |request: RemoteStopTransactionRequest| {
                let w = w.clone();
                async move { with_cp!(w, cp, cp.on_remote_stop(request).await) }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            ResetRequest::ACTION,
            typed_handler(move |request: ResetRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, {
                        let accepted = cp.events.reset_requested(request.reset_type).await;
                        info!(reset_type = ?request.reset_type, accepted, "Reset requested");
                        Ok(ResetResponse {
                            status: if accepted {
                                ResetStatus::Accepted
                            } else {
                                ResetStatus::Rejected
                            },
                        })
                    })
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            UnlockConnectorRequest::ACTION,
            typed_handler(move |request: UnlockConnectorRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, {
                        if !cp.connectors.is_valid(request.connector_id) || request.connector_id == 0 {
                            return Ok(UnlockConnectorResponse {
                                status: UnlockStatus::NotSupported,
                            });
                        }
                        let status = cp
                            .events
                            .unlock_connector_requested(request.connector_id)
                            .await;
                        Ok(UnlockConnectorResponse { status })
                    })
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            DataTransferRequest::ACTION,
            typed_handler(move |request: DataTransferRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, {
                        if let Some((status, data)) = cp.iso15118.handle_inbound(
                            &request.vendor_id,
                            request.message_id.as_deref(),
                            request.data.as_deref(),
                        ) {
                            return Ok(DataTransferResponse { status, data });
                        }
                        Ok(cp
                            .events
                            .data_transfer(
                                &request.vendor_id,
                                request.message_id.as_deref(),
                                request.data.as_deref(),
                            )
                            .await)
                    })
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            TriggerMessageRequest::ACTION,
            typed_handler(move |request: TriggerMessageRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, {
                        let status = cp.on_trigger(request.requested_message, request.connector_id);
                        Ok(TriggerMessageResponse { status })
                    })
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            ExtendedTriggerMessageRequest::ACTION,
            typed_handler(move |request: ExtendedTriggerMessageRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, {
                        let status = cp.on_trigger(request.requested_message, request.connector_id);
                        Ok(ExtendedTriggerMessageResponse { status })
                    })
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            ReserveNowRequest::ACTION,
            typed_handler(move |request: ReserveNowRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, Ok(cp.reservations.handle_reserve_now(request, cp.as_ref())))
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            CancelReservationRequest::ACTION,
            typed_handler(move |request: CancelReservationRequest| {
                let w = w.clone();
                async move {
                    with_cp!(
                        w,
                        cp,
                        Ok(cp.reservations.handle_cancel_reservation(request, cp.as_ref()))
                    )
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            GetDiagnosticsRequest::ACTION,
            typed_handler(move |request: GetDiagnosticsRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, {
                        let file_name = cp
                            .events
                            .diagnostics_requested(
                                &request.location,
                                request.start_time,
                                request.stop_time,
                            )
                            .await;
                        Ok(GetDiagnosticsResponse { file_name })
                    })
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            UpdateFirmwareRequest::ACTION,
            typed_handler(move |request: UpdateFirmwareRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, {
                        cp.events
                            .firmware_update_requested(&request.location, request.retrieve_date)
                            .await;
                        Ok(UpdateFirmwareResponse {})
                    })
                }
            }),
            false,
        );

        let w = weak.clone();
        dispatcher.register(
            SignedUpdateFirmwareRequest::ACTION,
            typed_handler(move |request: SignedUpdateFirmwareRequest| {
                let w = w.clone();
                async move {
                    with_cp!(w, cp, {
                        cp.events
                            .firmware_update_requested(
                                &request.firmware.location,
                                request.firmware.retrieve_date_time,
                            )
                            .await;
                        Ok(SignedUpdateFirmwareResponse {
                            status: UpdateFirmwareStatus::Accepted,
                        })
                    })
                }
            }),
            false,
        );

        // Certificate management needs an X.509 store, which is an
        // external collaborator; without one the requests are refused
        // with their action-level status.
        dispatcher.register(
            CertificateSignedRequest::ACTION,
            typed_handler(move |_request: CertificateSignedRequest| async move {
                Ok(CertificateSignedResponse {
                    status: CertificateSignedStatus::Rejected,
                })
            }),
            false,
        );
        dispatcher.register(
            DeleteCertificateRequest::ACTION,
            typed_handler(move |_request: DeleteCertificateRequest| async move {
                Ok(DeleteCertificateResponse {
                    status: DeleteCertificateStatus::NotFound,
                })
            }),
            false,
        );
        dispatcher.register(
            GetInstalledCertificateIdsRequest::ACTION,
            typed_handler(move |_request: GetInstalledCertificateIdsRequest| async move {
                Ok(GetInstalledCertificateIdsResponse {
                    status: GetInstalledCertificateStatus::NotFound,
                    certificate_hash_data: None,
                })
            }),
            false,
        );
        dispatcher.register(
            InstallCertificateRequest::ACTION,
            typed_handler(move |_request: InstallCertificateRequest| async move {
                Ok(InstallCertificateResponse {
                    status: CertificateStatus::Rejected,
                })
            }),
            false,
        );
        dispatcher.register(
            GetLogRequest::ACTION,
            typed_handler(move |_request: GetLogRequest| async move {
                Ok(GetLogResponse {
                    status: LogStatus::Rejected,
                    filename: None,
                })
            }),
            false,
        );
    }

    async fn on_change_availability(
        self: &Arc<Self>,
        request: ChangeAvailabilityRequest,
    ) -> Result<ChangeAvailabilityResponse, HandlerError> {
        if !self.connectors.is_valid(request.connector_id) {
            return Ok(ChangeAvailabilityResponse {
                status: AvailabilityStatus::Rejected,
            });
        }

        let target_ids: Vec<u32> = if request.connector_id == 0 {
            (1..=self.connectors.count()).collect()
        } else {
            vec![request.connector_id]
        };

        // A change on a connector with a running transaction is only
        // applicable once the transaction ends.
        let busy = target_ids.iter().any(|id| {
            self.connectors
                .get(*id)
                .map(|c| c.has_transaction())
                .unwrap_or(false)
        });
        if busy {
            return Ok(ChangeAvailabilityResponse {
                status: AvailabilityStatus::Scheduled,
            });
        }

        let status = self
            .events
            .availability_change_requested(request.connector_id, request.availability_type)
            .await;
        if status == AvailabilityStatus::Accepted {
            let new_status = match request.availability_type {
                AvailabilityType::Operative => ChargePointStatus::Available,
                AvailabilityType::Inoperative => ChargePointStatus::Unavailable,
            };
            for id in target_ids {
                self.update_status(id, new_status, ChargePointErrorCode::NoError, None)
                    .await;
            }
        }
        Ok(ChangeAvailabilityResponse { status })
    }

    async fn on_remote_start(
        self: &Arc<Self>,
        request: RemoteStartTransactionRequest,
    ) -> Result<RemoteStartTransactionResponse, HandlerError> {
        let rejected = || {
            Ok(RemoteStartTransactionResponse {
                status: RemoteStartStopStatus::Rejected,
            })
        };

        // Pick the requested connector, or the first idle one.
        let connector_id = match request.connector_id {
            Some(id) if id != 0 && self.connectors.is_valid(id) => id,
            Some(_) => return rejected(),
            None => {
                let candidate = self.connectors.all().into_iter().find(|c| {
                    c.id != 0
                        && !c.has_transaction()
                        && matches!(
                            c.status,
                            ChargePointStatus::Available | ChargePointStatus::Preparing
                        )
                });
                match candidate {
                    Some(connector) => connector.id,
                    None => return rejected(),
                }
            }
        };
        if self
            .connectors
            .get(connector_id)
            .map(|c| c.has_transaction())
            .unwrap_or(true)
        {
            return rejected();
        }

        if self.ocpp_config.authorize_remote_tx_requests() {
            let (status, _) = self.authent.authorize(&request.id_tag).await;
            if status != AuthorizationStatus::Accepted {
                return rejected();
            }
        }

        if let Some(profile) = request.charging_profile {
            if profile.charging_profile_purpose != ChargingProfilePurposeType::TxProfile
                || !self.smart_charging.install_tx_profile(connector_id, profile).await
            {
                return rejected();
            }
        }

        if !self
            .events
            .remote_start_requested(connector_id, &request.id_tag)
            .await
        {
            return rejected();
        }

        let charge_point = Arc::clone(self);
        let id_tag = request.id_tag.clone();
        tokio::spawn(async move {
            if let Err(e) = charge_point.start_transaction(connector_id, &id_tag).await {
                warn!(connector_id, error = %e, "Remote start failed");
            }
        });
        Ok(RemoteStartTransactionResponse {
            status: RemoteStartStopStatus::Accepted,
        })
    }

    async fn on_remote_stop(
        self: &Arc<Self>,
        request: RemoteStopTransactionRequest,
    ) -> Result<RemoteStopTransactionResponse, HandlerError> {
        let Some(connector) = self.connectors.find_by_transaction(request.transaction_id) else {
            return Ok(RemoteStopTransactionResponse {
                status: RemoteStartStopStatus::Rejected,
            });
        };

        if !self.events.remote_stop_requested(connector.id).await {
            return Ok(RemoteStopTransactionResponse {
                status: RemoteStartStopStatus::Rejected,
            });
        }

        let charge_point = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = charge_point
                .stop_transaction(connector.id, None, Reason::Remote)
                .await
            {
                warn!(connector_id = connector.id, error = %e, "Remote stop failed");
            }
        });
        Ok(RemoteStopTransactionResponse {
            status: RemoteStartStopStatus::Accepted,
        })
    }

    fn on_trigger(
        self: &Arc<Self>,
        trigger: MessageTrigger,
        connector_id: Option<u32>,
    ) -> TriggerMessageStatus {
        let charge_point = Arc::clone(self);
        match trigger {
            MessageTrigger::Heartbeat => {
                tokio::spawn(async move { charge_point.send_heartbeat().await });
                TriggerMessageStatus::Accepted
            }
            MessageTrigger::BootNotification => {
                tokio::spawn(async move {
                    let request = charge_point.boot_notification_request();
                    if let Err(e) = charge_point.client.call(&request).await {
                        warn!(error = %e, "Triggered boot notification failed");
                    }
                });
                TriggerMessageStatus::Accepted
            }
            MessageTrigger::StatusNotification => {
                tokio::spawn(async move {
                    match connector_id {
                        Some(id) => {
                            if let Some(connector) = charge_point.connectors.get(id) {
                                charge_point
                                    .send_status_notification(
                                        id,
                                        connector.status,
                                        ChargePointErrorCode::NoError,
                                        None,
                                    )
                                    .await;
                            }
                        }
                        None => charge_point.send_all_status_notifications().await,
                    }
                });
                TriggerMessageStatus::Accepted
            }
            MessageTrigger::DiagnosticsStatusNotification => {
                tokio::spawn(async move {
                    let _ = charge_point
                        .diagnostics_status_notification(DiagnosticsStatus::Idle)
                        .await;
                });
                TriggerMessageStatus::Accepted
            }
            MessageTrigger::FirmwareStatusNotification => {
                tokio::spawn(async move {
                    let _ = charge_point
                        .firmware_status_notification(FirmwareStatus::Idle)
                        .await;
                });
                TriggerMessageStatus::Accepted
            }
            MessageTrigger::MeterValues => TriggerMessageStatus::NotImplemented,
        }
    }
}

impl ReservationObserver for ChargePoint {
    fn connector_status_changed(&self, connector_id: u32, status: ChargePointStatus) {
        // Reservation transitions are reported like any other status
        // change; the send must not block the (sync) observer.
        let messenger = Arc::clone(&self.messenger);
        let request = StatusNotificationRequest {
            connector_id,
            error_code: ChargePointErrorCode::NoError,
            info: None,
            status,
            timestamp: Some(Utc::now()),
            vendor_id: None,
            vendor_error_code: None,
        };
        tokio::spawn(async move {
            if let Ok(payload) = serde_json::to_value(&request) {
                messenger
                    .send_or_queue(StatusNotificationRequest::ACTION, payload)
                    .await;
            }
        });
    }
}

/// Connection listener holding a weak backreference so the client (owned
/// by the charge point) never keeps its owner alive.
struct ConnectionListener {
    charge_point: Weak<ChargePoint>,
}

#[async_trait]
impl ClientListener for ConnectionListener {
    async fn on_connected(&self) {
        let Some(charge_point) = self.charge_point.upgrade() else {
            return;
        };
        info!("Connected to the central system");
        charge_point.events.connection_state_changed(true).await;
        tokio::spawn(charge_point.clone().boot_procedure());
    }

    async fn on_disconnected(&self) {
        let Some(charge_point) = self.charge_point.upgrade() else {
            return;
        };
        warn!("Disconnected from the central system");
        if let Some(task) = charge_point.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }
        charge_point.events.connection_state_changed(false).await;
    }
}
