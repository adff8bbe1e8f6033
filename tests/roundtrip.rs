//! End-to-end exercises over real WebSocket connections.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ocpp_runtime::centralsystem::{CentralSystem, CentralSystemEvents};
use ocpp_runtime::chargepoint::{ChargePoint, DefaultEventsHandler};
use ocpp_runtime::config::{
    CentralSystemSettings, ChargePointIdentity, ChargePointSettings, LocalControllerSettings,
};
use ocpp_runtime::localcontroller::{DefaultLocalControllerEvents, LocalController};
use ocpp_runtime::messages::core::{HeartbeatRequest, ResetRequest, ResetResponse};
use ocpp_runtime::messages::dispatcher::typed_handler;
use ocpp_runtime::messages::types::{RegistrationStatus, ResetStatus, ResetType};
use ocpp_runtime::messages::{MessageDispatcher, MessagesValidator};
use ocpp_runtime::rpc::{ClientConfig, ClientListener, RpcClient};
use ocpp_runtime::storage::InMemoryStore;

struct QuietListener;

#[async_trait]
impl ClientListener for QuietListener {
    async fn on_connected(&self) {}
    async fn on_disconnected(&self) {}
}

fn cp_settings(url: String, schemas_dir: std::path::PathBuf) -> ChargePointSettings {
    ChargePointSettings {
        identifier: "CP-1".to_string(),
        central_system_url: url,
        schemas_dir,
        identity: ChargePointIdentity {
            vendor: "Acme".to_string(),
            model: "X".to_string(),
            serial_number: None,
            firmware_version: Some("1.0.0".to_string()),
            iccid: None,
            imsi: None,
            meter_type: None,
            meter_serial_number: None,
        },
        connector_count: 2,
        operating_voltage: 230.0,
        authent_cache_max_entries: 100,
        call_timeout_secs: 5,
        ping_interval_secs: 60,
        retry_interval_secs: 1,
        basic_auth_password: None,
    }
}

#[tokio::test]
async fn charge_point_boots_against_central_system() {
    common::init_tracing();
    let (_guard, schemas) = common::schemas_dir();

    struct BootWatcher {
        booted: AtomicBool,
    }
    #[async_trait]
    impl CentralSystemEvents for BootWatcher {
        async fn boot_notification(
            &self,
            charge_point_id: &str,
            request: ocpp_runtime::messages::core::BootNotificationRequest,
        ) -> ocpp_runtime::messages::core::BootNotificationResponse {
            assert_eq!(charge_point_id, "CP-1");
            assert_eq!(request.charge_point_vendor, "Acme");
            self.booted.store(true, Ordering::SeqCst);
            ocpp_runtime::messages::core::BootNotificationResponse {
                status: RegistrationStatus::Accepted,
                current_time: Utc::now(),
                interval: 300,
            }
        }
    }

    let events = Arc::new(BootWatcher {
        booted: AtomicBool::new(false),
    });
    let central_system = CentralSystem::start(
        CentralSystemSettings {
            listen_address: "127.0.0.1:0".to_string(),
            schemas_dir: schemas.clone(),
            call_timeout_secs: 5,
            ping_interval_secs: 60,
            heartbeat_interval_secs: 300,
        },
        events.clone(),
    )
    .await
    .expect("central system starts");

    let url = format!("ws://{}/ocpp", central_system.local_addr());
    let charge_point = ChargePoint::start(
        cp_settings(url, schemas),
        Arc::new(DefaultEventsHandler),
        Arc::new(InMemoryStore::new()),
    )
    .await
    .expect("charge point starts");

    assert!(
        common::wait_until(5000, || events.booted.load(Ordering::SeqCst)
            && charge_point.registration_status() == Some(RegistrationStatus::Accepted))
        .await,
        "charge point did not reach Accepted"
    );

    // Central-system-initiated traffic: configuration round trip.
    let proxy = central_system.charge_point("CP-1").expect("proxy exists");
    let status = proxy
        .change_configuration("HeartbeatInterval", "120")
        .await
        .expect("change configuration");
    assert_eq!(
        status,
        ocpp_runtime::messages::types::ConfigurationStatus::Accepted
    );
    let response = proxy
        .get_configuration(Some(vec!["HeartbeatInterval".to_string()]))
        .await
        .expect("get configuration");
    let keys = response.configuration_key.unwrap_or_default();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].value.as_deref(), Some("120"));

    charge_point.stop();
    central_system.stop();
}

#[tokio::test]
async fn local_controller_relays_both_directions() {
    common::init_tracing();
    let (_guard, schemas) = common::schemas_dir();

    // The central system answers heartbeats with a fixed instant so the
    // relayed payload is recognizable.
    struct FixedClock;
    #[async_trait]
    impl CentralSystemEvents for FixedClock {
        async fn heartbeat(&self, _charge_point_id: &str) -> DateTime<Utc> {
            "2025-03-01T10:00:00Z".parse().unwrap()
        }
    }

    let central_system = CentralSystem::start(
        CentralSystemSettings {
            listen_address: "127.0.0.1:0".to_string(),
            schemas_dir: schemas.clone(),
            call_timeout_secs: 5,
            ping_interval_secs: 60,
            heartbeat_interval_secs: 300,
        },
        Arc::new(FixedClock),
    )
    .await
    .expect("central system starts");

    let controller = LocalController::start(
        LocalControllerSettings {
            listen_address: "127.0.0.1:0".to_string(),
            central_system_url: format!("ws://{}/ocpp", central_system.local_addr()),
            schemas_dir: schemas,
            disconnect_from_cp_when_cs_disconnected: true,
            call_timeout_secs: 5,
            ping_interval_secs: 60,
        },
        Arc::new(DefaultLocalControllerEvents),
    )
    .await
    .expect("local controller starts");

    // Charge-point leg: a raw RPC client with a Reset handler, so the
    // CS→LC→CP direction can be observed too.
    let dispatcher = Arc::new(MessageDispatcher::new(Arc::new(
        MessagesValidator::permissive(),
    )));
    dispatcher.register(
        "Reset",
        typed_handler(|request: ResetRequest| async move {
            assert_eq!(request.reset_type, ResetType::Soft);
            Ok(ResetResponse {
                status: ResetStatus::Accepted,
            })
        }),
        false,
    );
    let charge_point = RpcClient::new(
        ClientConfig {
            url: format!("ws://{}/ocpp/CP-9", controller.local_addr()),
            call_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(1),
            ..ClientConfig::default()
        },
        dispatcher,
        None,
    );
    let _client_task = charge_point.start(Arc::new(QuietListener));

    // Both legs of the pair must be up before traffic flows.
    assert!(
        common::wait_until(5000, || {
            central_system.charge_point("CP-9").is_some() && charge_point.is_connected()
        })
        .await,
        "proxy pair did not come up"
    );

    // CP → LC → CS: the relayed heartbeat answer arrives unchanged.
    let response = charge_point
        .call(&HeartbeatRequest {})
        .await
        .expect("relayed heartbeat");
    assert_eq!(
        response.current_time,
        "2025-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap()
    );

    // CS → LC → CP: the relayed reset reaches the charge point handler.
    let proxy = central_system.charge_point("CP-9").unwrap();
    let status = proxy.reset(ResetType::Soft).await.expect("relayed reset");
    assert_eq!(status, ResetStatus::Accepted);

    charge_point.stop();
    controller.stop();
    central_system.stop();
}
