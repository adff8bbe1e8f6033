//! User-side callbacks of the Charge Point role.
//!
//! The embedder implements this trait to connect the OCPP stack to the
//! actual hardware: start/stop the power train, unlock connectors, run
//! firmware updates. Defaults are provided where a safe no-op exists.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::messages::core::DataTransferResponse;
use crate::messages::types::{
    AvailabilityStatus, AvailabilityType, ChargingSchedule, DataTransferStatus,
    RegistrationStatus, ResetType, UnlockStatus,
};

#[async_trait]
pub trait ChargePointEventsHandler: Send + Sync {
    /// Connection to the central system established or lost.
    async fn connection_state_changed(&self, connected: bool) {
        let _ = connected;
    }

    /// Result of the boot notification procedure.
    async fn boot_notification_result(&self, status: RegistrationStatus) {
        let _ = status;
    }

    /// RemoteStartTransaction accepted by the stack; start the charge.
    async fn remote_start_requested(&self, connector_id: u32, id_tag: &str) -> bool {
        let _ = (connector_id, id_tag);
        true
    }

    /// RemoteStopTransaction accepted by the stack; stop the charge.
    async fn remote_stop_requested(&self, connector_id: u32) -> bool {
        let _ = connector_id;
        true
    }

    /// Reset requested by the central system. Returning `true` accepts;
    /// the embedder performs the actual restart afterwards.
    async fn reset_requested(&self, reset_type: ResetType) -> bool {
        let _ = reset_type;
        true
    }

    async fn unlock_connector_requested(&self, connector_id: u32) -> UnlockStatus {
        let _ = connector_id;
        UnlockStatus::NotSupported
    }

    async fn availability_change_requested(
        &self,
        connector_id: u32,
        kind: AvailabilityType,
    ) -> AvailabilityStatus {
        let _ = (connector_id, kind);
        AvailabilityStatus::Accepted
    }

    /// Vendor DataTransfer (the ISO 15118 envelope is intercepted before
    /// this is called).
    async fn data_transfer(
        &self,
        vendor_id: &str,
        message_id: Option<&str>,
        data: Option<&str>,
    ) -> DataTransferResponse {
        let _ = (message_id, data);
        tracing::debug!(vendor_id, "Unhandled data transfer");
        DataTransferResponse {
            status: DataTransferStatus::UnknownVendorId,
            data: None,
        }
    }

    /// Firmware download requested; the embedder drives the download and
    /// reports progress through the runtime's notification methods.
    async fn firmware_update_requested(&self, location: &str, retrieve_date: DateTime<Utc>) {
        let _ = (location, retrieve_date);
    }

    /// Diagnostics upload requested; returns the uploaded file name.
    async fn diagnostics_requested(
        &self,
        location: &str,
        start_time: Option<DateTime<Utc>>,
        stop_time: Option<DateTime<Utc>>,
    ) -> Option<String> {
        let _ = (location, start_time, stop_time);
        None
    }

    /// Meter register value (Wh) used for StartTransaction / StopTransaction.
    async fn transaction_meter_value(&self, connector_id: u32) -> i32 {
        let _ = connector_id;
        0
    }

    /// Physical limitations of the installation over the coming `duration`
    /// seconds, merged into composite schedules with a minimum rule.
    ///
    /// Called with the smart-charging lock held; must be CPU-only.
    fn get_local_limitations_schedule(
        &self,
        connector_id: u32,
        duration: u32,
    ) -> Option<ChargingSchedule> {
        let _ = (connector_id, duration);
        None
    }
}

/// Handler accepting every request with defaults. Useful for tests and
/// simulators.
pub struct DefaultEventsHandler;

#[async_trait]
impl ChargePointEventsHandler for DefaultEventsHandler {}
