//! User-side callbacks of the Central System role.
//!
//! Every charge-point-initiated action lands here. Defaults implement a
//! permissive back-end so a minimal central system only overrides what it
//! cares about.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::proxy::ChargePointProxy;
use crate::messages::core::{
    BootNotificationRequest, BootNotificationResponse, DataTransferRequest, DataTransferResponse,
    MeterValuesRequest, StartTransactionRequest, StartTransactionResponse,
    StatusNotificationRequest, StopTransactionRequest, StopTransactionResponse,
};
use crate::messages::security::{
    LogStatusNotificationRequest, SecurityEventNotificationRequest,
    SignedFirmwareStatusNotificationRequest,
};
use crate::messages::types::{
    DataTransferStatus, DiagnosticsStatus, FirmwareStatus, GenericStatus, IdTagInfo,
    RegistrationStatus,
};

/// Fallback transaction-id source for the default `start_transaction`.
static DEFAULT_TRANSACTION_IDS: AtomicI32 = AtomicI32::new(1);

#[async_trait]
pub trait CentralSystemEvents: Send + Sync {
    /// HTTP Basic credential check during the WebSocket handshake.
    /// Sessions without an Authorization header present empty values.
    fn check_credentials(&self, charge_point_id: &str, user: &str, password: &str) -> bool {
        let _ = (charge_point_id, user, password);
        true
    }

    /// A charge point connected; the proxy carries every outbound
    /// operation towards it.
    async fn charge_point_connected(&self, proxy: Arc<ChargePointProxy>) {
        let _ = proxy;
    }

    async fn charge_point_disconnected(&self, charge_point_id: &str) {
        let _ = charge_point_id;
    }

    async fn boot_notification(
        &self,
        charge_point_id: &str,
        request: BootNotificationRequest,
    ) -> BootNotificationResponse {
        let _ = (charge_point_id, request);
        BootNotificationResponse {
            status: RegistrationStatus::Accepted,
            current_time: Utc::now(),
            interval: 300,
        }
    }

    async fn heartbeat(&self, charge_point_id: &str) -> DateTime<Utc> {
        let _ = charge_point_id;
        Utc::now()
    }

    async fn authorize(&self, charge_point_id: &str, id_tag: &str) -> IdTagInfo {
        let _ = (charge_point_id, id_tag);
        IdTagInfo::accepted()
    }

    async fn start_transaction(
        &self,
        charge_point_id: &str,
        request: StartTransactionRequest,
    ) -> StartTransactionResponse {
        let _ = (charge_point_id, request);
        StartTransactionResponse {
            id_tag_info: IdTagInfo::accepted(),
            transaction_id: DEFAULT_TRANSACTION_IDS.fetch_add(1, Ordering::SeqCst),
        }
    }

    async fn stop_transaction(
        &self,
        charge_point_id: &str,
        request: StopTransactionRequest,
    ) -> StopTransactionResponse {
        let _ = (charge_point_id, request);
        StopTransactionResponse { id_tag_info: None }
    }

    async fn meter_values(&self, charge_point_id: &str, request: MeterValuesRequest) {
        let _ = (charge_point_id, request);
    }

    async fn status_notification(&self, charge_point_id: &str, request: StatusNotificationRequest) {
        let _ = (charge_point_id, request);
    }

    async fn data_transfer(
        &self,
        charge_point_id: &str,
        request: DataTransferRequest,
    ) -> DataTransferResponse {
        let _ = (charge_point_id, request);
        DataTransferResponse {
            status: DataTransferStatus::UnknownVendorId,
            data: None,
        }
    }

    async fn diagnostics_status_notification(
        &self,
        charge_point_id: &str,
        status: DiagnosticsStatus,
    ) {
        let _ = (charge_point_id, status);
    }

    async fn firmware_status_notification(&self, charge_point_id: &str, status: FirmwareStatus) {
        let _ = (charge_point_id, status);
    }

    async fn log_status_notification(
        &self,
        charge_point_id: &str,
        request: LogStatusNotificationRequest,
    ) {
        let _ = (charge_point_id, request);
    }

    async fn security_event_notification(
        &self,
        charge_point_id: &str,
        request: SecurityEventNotificationRequest,
    ) {
        let _ = (charge_point_id, request);
    }

    async fn signed_firmware_status_notification(
        &self,
        charge_point_id: &str,
        request: SignedFirmwareStatusNotificationRequest,
    ) {
        let _ = (charge_point_id, request);
    }

    /// CSR received from a charge point; a real implementation forwards
    /// it to its PKI and answers with CertificateSigned later.
    async fn sign_certificate(&self, charge_point_id: &str, csr: &str) -> GenericStatus {
        let _ = (charge_point_id, csr);
        GenericStatus::Rejected
    }
}

/// Accept-everything events implementation for tests and demos.
pub struct DefaultCentralSystemEvents;

#[async_trait]
impl CentralSystemEvents for DefaultCentralSystemEvents {}
