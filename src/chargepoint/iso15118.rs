//! ISO 15118 Plug & Charge operations (charge point side).
//!
//! Outbound messages ride in DataTransfer envelopes addressed to the
//! PnC vendor id; inbound envelopes are intercepted before the generic
//! DataTransfer callback and answered here.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use super::authent::AuthentManager;
use crate::messages::iso15118::{
    self, AuthorizeCertificateStatus, CertificateActionEnum, Get15118EVCertificateRequest,
    Get15118EVCertificateResponse, GetCertificateStatusKind, GetCertificateStatusRequest,
    GetCertificateStatusResponse, Iso15118AuthorizeRequest, Iso15118AuthorizeResponse,
    Iso15118SignCertificateRequest, Iso15118SignCertificateResponse, OcspRequestData,
    ISO15118_VENDOR_ID,
};
use crate::messages::types::{AuthorizationStatus, DataTransferStatus, GenericStatus};
use crate::rpc::{RpcClient, RpcError};

#[derive(Debug, thiserror::Error)]
pub enum Iso15118Error {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Envelope(#[from] iso15118::UnwrapError),
    #[error("invalid inner payload: {0}")]
    Codec(#[from] serde_json::Error),
}

pub struct Iso15118Manager {
    client: Arc<RpcClient>,
    authent: Arc<AuthentManager>,
}

impl Iso15118Manager {
    pub fn new(client: Arc<RpcClient>, authent: Arc<AuthentManager>) -> Self {
        Self { client, authent }
    }

    async fn send<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        message_id: &str,
        request: &Req,
    ) -> Result<Resp, Iso15118Error> {
        let envelope = iso15118::wrap(message_id, request)?;
        let response = self.client.call(&envelope).await?;
        Ok(iso15118::unwrap(&response)?)
    }

    /// Authorize an ISO 15118 transaction. Falls back to the local lists
    /// when the central system is unreachable.
    pub async fn authorize(
        &self,
        certificate: Option<String>,
        id_token: &str,
        hash_data: Option<Vec<OcspRequestData>>,
    ) -> Result<(AuthorizationStatus, Option<AuthorizeCertificateStatus>), Iso15118Error> {
        let request = Iso15118AuthorizeRequest {
            certificate_hash_data: hash_data,
            certificate,
            id_token: id_token.to_string(),
        };
        match self
            .send::<_, Iso15118AuthorizeResponse>(iso15118::AUTHORIZE_MESSAGE_ID, &request)
            .await
        {
            Ok(response) => {
                self.authent
                    .iso15118_update(id_token, &response.id_token_info)
                    .await;
                Ok((response.id_token_info.status, response.certificate_status))
            }
            Err(Iso15118Error::Rpc(e)) => {
                warn!(error = %e, "ISO 15118 authorize failed, using local data");
                Ok((self.authent.iso15118_authorize(id_token).await, None))
            }
            Err(e) => Err(e),
        }
    }

    /// Install or update an EV contract certificate (EXI payload pass-through).
    pub async fn get_ev_certificate(
        &self,
        schema_version: &str,
        action: CertificateActionEnum,
        exi_request: &str,
    ) -> Result<Get15118EVCertificateResponse, Iso15118Error> {
        self.send(
            iso15118::GET_15118_EV_CERTIFICATE_MESSAGE_ID,
            &Get15118EVCertificateRequest {
                iso15118_schema_version: schema_version.to_string(),
                action,
                exi_request: exi_request.to_string(),
            },
        )
        .await
    }

    /// OCSP status of a contract certificate.
    pub async fn get_certificate_status(
        &self,
        ocsp_request: OcspRequestData,
    ) -> Result<(GetCertificateStatusKind, Option<String>), Iso15118Error> {
        let response: GetCertificateStatusResponse = self
            .send(
                iso15118::GET_CERTIFICATE_STATUS_MESSAGE_ID,
                &GetCertificateStatusRequest {
                    ocsp_request_data: ocsp_request,
                },
            )
            .await?;
        Ok((response.status, response.ocsp_result))
    }

    /// Request a V2G certificate signature.
    pub async fn sign_certificate(&self, csr: &str) -> Result<GenericStatus, Iso15118Error> {
        let response: Iso15118SignCertificateResponse = self
            .send(
                iso15118::SIGN_CERTIFICATE_MESSAGE_ID,
                &Iso15118SignCertificateRequest {
                    csr: csr.to_string(),
                    certificate_type: None,
                },
            )
            .await?;
        Ok(response.status)
    }

    /// Answer an inbound PnC envelope. Returns `None` for foreign vendor
    /// ids so the generic DataTransfer path can take over.
    pub fn handle_inbound(
        &self,
        vendor_id: &str,
        message_id: Option<&str>,
        _data: Option<&str>,
    ) -> Option<(DataTransferStatus, Option<String>)> {
        if vendor_id != ISO15118_VENDOR_ID {
            return None;
        }
        info!(?message_id, "Inbound ISO 15118 message");
        match message_id {
            // Certificate provisioning needs an X.509 store, which is an
            // external collaborator; without one the requests are refused.
            Some(iso15118::CERTIFICATE_SIGNED_MESSAGE_ID)
            | Some(iso15118::TRIGGER_MESSAGE_MESSAGE_ID) => {
                let body = serde_json::json!({"status": "Rejected"}).to_string();
                Some((DataTransferStatus::Accepted, Some(body)))
            }
            Some(_) => Some((DataTransferStatus::UnknownMessageId, None)),
            None => Some((DataTransferStatus::UnknownMessageId, None)),
        }
    }
}
