//! Typed OCPP 1.6 messages, schema validation and action dispatch.
//!
//! Every action has a `<Action>Request` / `<Action>Response` struct pair;
//! the [`Request`] trait ties the two together with the wire action name so
//! RPC proxies can expose a single typed `call` method.

pub mod core;
pub mod dispatcher;
pub mod firmware;
pub mod iso15118;
pub mod localauth;
pub mod remotetrigger;
pub mod reservation;
pub mod security;
pub mod smartcharging;
pub mod types;
pub mod validator;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use dispatcher::{DispatchOutcome, HandlerError, MessageDispatcher, MessageHandler};
pub use validator::{MessagesValidator, PayloadDirection, ValidatorError};

/// A request payload bound to its wire action name and response type.
pub trait Request: Serialize + DeserializeOwned + Send + Sync + 'static {
    const ACTION: &'static str;
    type Response: Serialize + DeserializeOwned + Send + Sync + 'static;
}

/// Actions initiated by the Charge Point (handled by a Central System).
pub const CP_INITIATED_ACTIONS: &[&str] = &[
    "Authorize",
    "BootNotification",
    "DataTransfer",
    "DiagnosticsStatusNotification",
    "FirmwareStatusNotification",
    "Heartbeat",
    "LogStatusNotification",
    "MeterValues",
    "SecurityEventNotification",
    "SignCertificate",
    "SignedFirmwareStatusNotification",
    "StartTransaction",
    "StatusNotification",
    "StopTransaction",
];

/// Actions initiated by the Central System (handled by a Charge Point).
pub const CS_INITIATED_ACTIONS: &[&str] = &[
    "CancelReservation",
    "CertificateSigned",
    "ChangeAvailability",
    "ChangeConfiguration",
    "ClearCache",
    "ClearChargingProfile",
    "DataTransfer",
    "DeleteCertificate",
    "ExtendedTriggerMessage",
    "GetCompositeSchedule",
    "GetConfiguration",
    "GetDiagnostics",
    "GetInstalledCertificateIds",
    "GetLocalListVersion",
    "GetLog",
    "InstallCertificate",
    "RemoteStartTransaction",
    "RemoteStopTransaction",
    "ReserveNow",
    "Reset",
    "SendLocalList",
    "SetChargingProfile",
    "SignedUpdateFirmware",
    "TriggerMessage",
    "UnlockConnector",
    "UpdateFirmware",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_sets_are_sorted_and_unique() {
        for set in [CP_INITIATED_ACTIONS, CS_INITIATED_ACTIONS] {
            let mut sorted = set.to_vec();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted, set.to_vec());
        }
    }

    #[test]
    fn request_trait_binds_action_names() {
        assert_eq!(core::HeartbeatRequest::ACTION, "Heartbeat");
        assert_eq!(
            smartcharging::SetChargingProfileRequest::ACTION,
            "SetChargingProfile"
        );
        assert_eq!(security::GetLogRequest::ACTION, "GetLog");
    }
}
