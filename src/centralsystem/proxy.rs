//! Per-charge-point proxy.
//!
//! One proxy per connected charge point; every central-system-initiated
//! operation is a typed method delegating to the underlying session.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::messages::core::*;
use crate::messages::firmware::{GetDiagnosticsRequest, GetDiagnosticsResponse, UpdateFirmwareRequest};
use crate::messages::localauth::{
    GetLocalListVersionRequest, SendLocalListRequest, SendLocalListResponse,
};
use crate::messages::remotetrigger::{TriggerMessageRequest, TriggerMessageResponse};
use crate::messages::reservation::{
    CancelReservationRequest, CancelReservationResponse, ReserveNowRequest, ReserveNowResponse,
};
use crate::messages::security::*;
use crate::messages::types::*;
use crate::rpc::{RpcError, RpcSession};

pub struct ChargePointProxy {
    identifier: String,
    session: Arc<RpcSession>,
}

impl ChargePointProxy {
    pub fn new(identifier: impl Into<String>, session: Arc<RpcSession>) -> Arc<Self> {
        Arc::new(Self {
            identifier: identifier.into(),
            session,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn session(&self) -> &Arc<RpcSession> {
        &self.session
    }

    // ── Core ───────────────────────────────────────────────────

    pub async fn remote_start_transaction(
        &self,
        id_tag: &str,
        connector_id: Option<u32>,
        charging_profile: Option<ChargingProfile>,
    ) -> Result<RemoteStartStopStatus, RpcError> {
        let response = self
            .session
            .call(&RemoteStartTransactionRequest {
                connector_id,
                id_tag: id_tag.to_string(),
                charging_profile,
            })
            .await?;
        Ok(response.status)
    }

    pub async fn remote_stop_transaction(
        &self,
        transaction_id: i32,
    ) -> Result<RemoteStartStopStatus, RpcError> {
        let response = self
            .session
            .call(&RemoteStopTransactionRequest { transaction_id })
            .await?;
        Ok(response.status)
    }

    pub async fn reset(&self, reset_type: ResetType) -> Result<ResetStatus, RpcError> {
        let response = self.session.call(&ResetRequest { reset_type }).await?;
        Ok(response.status)
    }

    pub async fn unlock_connector(&self, connector_id: u32) -> Result<UnlockStatus, RpcError> {
        let response = self
            .session
            .call(&UnlockConnectorRequest { connector_id })
            .await?;
        Ok(response.status)
    }

    pub async fn change_availability(
        &self,
        connector_id: u32,
        availability_type: AvailabilityType,
    ) -> Result<AvailabilityStatus, RpcError> {
        let response = self
            .session
            .call(&ChangeAvailabilityRequest {
                connector_id,
                availability_type,
            })
            .await?;
        Ok(response.status)
    }

    pub async fn change_configuration(
        &self,
        key: &str,
        value: &str,
    ) -> Result<ConfigurationStatus, RpcError> {
        let response = self
            .session
            .call(&ChangeConfigurationRequest {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?;
        Ok(response.status)
    }

    pub async fn get_configuration(
        &self,
        keys: Option<Vec<String>>,
    ) -> Result<GetConfigurationResponse, RpcError> {
        self.session
            .call(&GetConfigurationRequest { key: keys })
            .await
    }

    pub async fn clear_cache(&self) -> Result<ClearCacheStatus, RpcError> {
        let response = self.session.call(&ClearCacheRequest {}).await?;
        Ok(response.status)
    }

    pub async fn data_transfer(
        &self,
        vendor_id: &str,
        message_id: Option<String>,
        data: Option<String>,
    ) -> Result<DataTransferResponse, RpcError> {
        self.session
            .call(&DataTransferRequest {
                vendor_id: vendor_id.to_string(),
                message_id,
                data,
            })
            .await
    }

    // ── Local auth list ────────────────────────────────────────

    pub async fn get_local_list_version(&self) -> Result<i32, RpcError> {
        let response = self.session.call(&GetLocalListVersionRequest {}).await?;
        Ok(response.list_version)
    }

    pub async fn send_local_list(
        &self,
        request: SendLocalListRequest,
    ) -> Result<SendLocalListResponse, RpcError> {
        self.session.call(&request).await
    }

    // ── Remote trigger ─────────────────────────────────────────

    pub async fn trigger_message(
        &self,
        requested_message: MessageTrigger,
        connector_id: Option<u32>,
    ) -> Result<TriggerMessageResponse, RpcError> {
        self.session
            .call(&TriggerMessageRequest {
                requested_message,
                connector_id,
            })
            .await
    }

    pub async fn extended_trigger_message(
        &self,
        requested_message: MessageTrigger,
        connector_id: Option<u32>,
    ) -> Result<ExtendedTriggerMessageResponse, RpcError> {
        self.session
            .call(&ExtendedTriggerMessageRequest {
                requested_message,
                connector_id,
            })
            .await
    }

    // ── Reservation ────────────────────────────────────────────

    pub async fn reserve_now(
        &self,
        request: ReserveNowRequest,
    ) -> Result<ReserveNowResponse, RpcError> {
        self.session.call(&request).await
    }

    pub async fn cancel_reservation(
        &self,
        reservation_id: i32,
    ) -> Result<CancelReservationResponse, RpcError> {
        self.session
            .call(&CancelReservationRequest { reservation_id })
            .await
    }

    // ── Smart charging ─────────────────────────────────────────

    pub async fn set_charging_profile(
        &self,
        connector_id: u32,
        profile: ChargingProfile,
    ) -> Result<ChargingProfileStatus, RpcError> {
        let response = self
            .session
            .call(&crate::messages::smartcharging::SetChargingProfileRequest {
                connector_id,
                cs_charging_profiles: profile,
            })
            .await?;
        Ok(response.status)
    }

    pub async fn clear_charging_profile(
        &self,
        request: crate::messages::smartcharging::ClearChargingProfileRequest,
    ) -> Result<ClearChargingProfileStatus, RpcError> {
        let response = self.session.call(&request).await?;
        Ok(response.status)
    }

    pub async fn get_composite_schedule(
        &self,
        connector_id: u32,
        duration: u32,
        charging_rate_unit: Option<ChargingRateUnitType>,
    ) -> Result<crate::messages::smartcharging::GetCompositeScheduleResponse, RpcError> {
        self.session
            .call(&crate::messages::smartcharging::GetCompositeScheduleRequest {
                connector_id,
                duration,
                charging_rate_unit,
            })
            .await
    }

    // ── Firmware ───────────────────────────────────────────────

    pub async fn get_diagnostics(
        &self,
        request: GetDiagnosticsRequest,
    ) -> Result<GetDiagnosticsResponse, RpcError> {
        self.session.call(&request).await
    }

    pub async fn update_firmware(
        &self,
        location: &str,
        retrieve_date: DateTime<Utc>,
        retries: Option<u32>,
        retry_interval: Option<u32>,
    ) -> Result<(), RpcError> {
        self.session
            .call(&UpdateFirmwareRequest {
                location: location.to_string(),
                retries,
                retrieve_date,
                retry_interval,
            })
            .await
            .map(drop)
    }

    pub async fn signed_update_firmware(
        &self,
        request: SignedUpdateFirmwareRequest,
    ) -> Result<UpdateFirmwareStatus, RpcError> {
        let response = self.session.call(&request).await?;
        Ok(response.status)
    }

    // ── Security ───────────────────────────────────────────────

    pub async fn certificate_signed(
        &self,
        certificate_chain: &str,
    ) -> Result<CertificateSignedStatus, RpcError> {
        let response = self
            .session
            .call(&CertificateSignedRequest {
                certificate_chain: certificate_chain.to_string(),
            })
            .await?;
        Ok(response.status)
    }

    pub async fn delete_certificate(
        &self,
        certificate_hash_data: CertificateHashData,
    ) -> Result<DeleteCertificateStatus, RpcError> {
        let response = self
            .session
            .call(&DeleteCertificateRequest {
                certificate_hash_data,
            })
            .await?;
        Ok(response.status)
    }

    pub async fn get_installed_certificate_ids(
        &self,
        certificate_type: CertificateUse,
    ) -> Result<GetInstalledCertificateIdsResponse, RpcError> {
        self.session
            .call(&GetInstalledCertificateIdsRequest { certificate_type })
            .await
    }

    pub async fn install_certificate(
        &self,
        certificate_type: CertificateUse,
        certificate: &str,
    ) -> Result<CertificateStatus, RpcError> {
        let response = self
            .session
            .call(&InstallCertificateRequest {
                certificate_type,
                certificate: certificate.to_string(),
            })
            .await?;
        Ok(response.status)
    }

    pub async fn get_log(&self, request: GetLogRequest) -> Result<GetLogResponse, RpcError> {
        self.session.call(&request).await
    }
}
