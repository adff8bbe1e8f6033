//! ISO 15118 Plug & Charge messages tunneled through DataTransfer.
//!
//! The OCPP 1.6 PnC extension wraps each inner message in a
//! `DataTransfer` call: `vendorId` is [`ISO15118_VENDOR_ID`], `messageId`
//! names the inner action and `data` carries the inner JSON payload
//! serialized as a string.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::core::{DataTransferRequest, DataTransferResponse};
use super::types::{DataTransferStatus, GenericStatus, HashAlgorithm};

/// Vendor id of the ISO 15118 PnC extension.
pub const ISO15118_VENDOR_ID: &str = "org.openchargealliance.iso15118pnc";

/// Build the DataTransfer envelope for an inner PnC message.
pub fn wrap<T: Serialize>(
    message_id: &str,
    inner: &T,
) -> Result<DataTransferRequest, serde_json::Error> {
    Ok(DataTransferRequest {
        vendor_id: ISO15118_VENDOR_ID.to_string(),
        message_id: Some(message_id.to_string()),
        data: Some(serde_json::to_string(inner)?),
    })
}

/// Extract the inner payload of an accepted envelope response.
pub fn unwrap<T: DeserializeOwned>(response: &DataTransferResponse) -> Result<T, UnwrapError> {
    if response.status != DataTransferStatus::Accepted {
        return Err(UnwrapError::Rejected(response.status));
    }
    let data = response.data.as_deref().ok_or(UnwrapError::MissingData)?;
    serde_json::from_str(data).map_err(UnwrapError::InvalidPayload)
}

#[derive(Debug, thiserror::Error)]
pub enum UnwrapError {
    #[error("data transfer rejected: {0:?}")]
    Rejected(DataTransferStatus),
    #[error("accepted response carries no data")]
    MissingData,
    #[error("invalid inner payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),
}

// ── Inner message ids ──────────────────────────────────────────

pub const AUTHORIZE_MESSAGE_ID: &str = "Authorize";
pub const GET_15118_EV_CERTIFICATE_MESSAGE_ID: &str = "Get15118EVCertificate";
pub const GET_CERTIFICATE_STATUS_MESSAGE_ID: &str = "GetCertificateStatus";
pub const SIGN_CERTIFICATE_MESSAGE_ID: &str = "SignCertificate";
pub const CERTIFICATE_SIGNED_MESSAGE_ID: &str = "CertificateSigned";
pub const TRIGGER_MESSAGE_MESSAGE_ID: &str = "TriggerMessage";

// ── Inner payloads ─────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OcspRequestData {
    pub hash_algorithm: HashAlgorithm,
    pub issuer_name_hash: String,
    pub issuer_key_hash: String,
    pub serial_number: String,
    pub responder_url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizeCertificateStatus {
    Accepted,
    SignatureError,
    CertificateExpired,
    CertificateRevoked,
    NoCertificateAvailable,
    CertChainError,
    ContractCancelled,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Iso15118IdTokenInfo {
    pub status: super::types::AuthorizationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_expiry_date_time: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Iso15118AuthorizeRequest {
    #[serde(rename = "15118CertificateHashData")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_hash_data: Option<Vec<OcspRequestData>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    pub id_token: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Iso15118AuthorizeResponse {
    pub id_token_info: Iso15118IdTokenInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_status: Option<AuthorizeCertificateStatus>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateActionEnum {
    Install,
    Update,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Get15118EVCertificateRequest {
    #[serde(rename = "iso15118SchemaVersion")]
    pub iso15118_schema_version: String,
    pub action: CertificateActionEnum,
    pub exi_request: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iso15118EVCertificateStatus {
    Accepted,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Get15118EVCertificateResponse {
    pub status: Iso15118EVCertificateStatus,
    pub exi_response: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GetCertificateStatusRequest {
    pub ocsp_request_data: OcspRequestData,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetCertificateStatusKind {
    Accepted,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GetCertificateStatusResponse {
    pub status: GetCertificateStatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocsp_result: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Iso15118SignCertificateRequest {
    pub csr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_type: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Iso15118SignCertificateResponse {
    pub status: GenericStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let inner = Iso15118SignCertificateRequest {
            csr: "----BEGIN CSR----".into(),
            certificate_type: None,
        };
        let envelope = wrap(SIGN_CERTIFICATE_MESSAGE_ID, &inner).unwrap();
        assert_eq!(envelope.vendor_id, ISO15118_VENDOR_ID);
        assert_eq!(envelope.message_id.as_deref(), Some("SignCertificate"));

        let nested: Iso15118SignCertificateRequest =
            serde_json::from_str(envelope.data.as_deref().unwrap()).unwrap();
        assert_eq!(nested, inner);
    }

    #[test]
    fn unwrap_rejected_envelope() {
        let response = DataTransferResponse {
            status: DataTransferStatus::UnknownVendorId,
            data: None,
        };
        let err = unwrap::<Iso15118SignCertificateResponse>(&response).unwrap_err();
        assert!(matches!(err, UnwrapError::Rejected(_)));
    }
}
