//! OCPP standard configuration keys.
//!
//! The registry backs GetConfiguration / ChangeConfiguration. Keys are
//! matched case-insensitively (lowercased on lookup) while the canonical
//! spelling is preserved in responses. Writes run through an optional
//! per-key validator, then notify the key's change listeners.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::messages::types::{ConfigurationStatus, KeyValue};

/// Notified after a configuration value was accepted and stored.
pub trait ConfigChangeListener: Send + Sync {
    fn on_changed(&self, key: &str, value: &str);
}

type Validator = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct Entry {
    canonical: &'static str,
    value: String,
    readonly: bool,
    reboot_required: bool,
}

#[derive(Default)]
pub struct OcppConfig {
    entries: RwLock<HashMap<String, Entry>>,
    validators: RwLock<HashMap<String, Validator>>,
    listeners: RwLock<HashMap<String, Vec<Arc<dyn ConfigChangeListener>>>>,
}

impl OcppConfig {
    /// Registry pre-populated with the standard keys and their defaults.
    pub fn new() -> Self {
        let config = Self::default();
        for &(key, value, readonly, reboot) in DEFAULT_KEYS {
            config.declare(key, value, readonly, reboot);
        }
        config
    }

    /// Declare a key. Intended for vendor-specific additions; standard
    /// keys are declared by [`Self::new`].
    pub fn declare(&self, key: &'static str, value: &str, readonly: bool, reboot_required: bool) {
        self.entries.write().unwrap().insert(
            key.to_lowercase(),
            Entry {
                canonical: key,
                value: value.to_string(),
                readonly,
                reboot_required,
            },
        );
    }

    pub fn register_validator(
        &self,
        key: &str,
        validator: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) {
        self.validators
            .write()
            .unwrap()
            .insert(key.to_lowercase(), Box::new(validator));
    }

    pub fn register_listener(&self, key: &str, listener: Arc<dyn ConfigChangeListener>) {
        self.listeners
            .write()
            .unwrap()
            .entry(key.to_lowercase())
            .or_default()
            .push(listener);
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.entries
            .read()
            .unwrap()
            .get(&key.to_lowercase())
            .map(|e| e.value.clone())
    }

    /// GetConfiguration: resolve `keys` (all keys when empty) into
    /// key-value pairs plus the list of unknown keys.
    pub fn get_configuration(&self, keys: &[String]) -> (Vec<KeyValue>, Vec<String>) {
        let entries = self.entries.read().unwrap();
        if keys.is_empty() {
            let mut known: Vec<KeyValue> = entries
                .values()
                .map(|e| KeyValue {
                    key: e.canonical.to_string(),
                    readonly: e.readonly,
                    value: Some(e.value.clone()),
                })
                .collect();
            known.sort_by(|a, b| a.key.cmp(&b.key));
            return (known, Vec::new());
        }

        let mut known = Vec::new();
        let mut unknown = Vec::new();
        for key in keys {
            match entries.get(&key.to_lowercase()) {
                Some(e) => known.push(KeyValue {
                    key: e.canonical.to_string(),
                    readonly: e.readonly,
                    value: Some(e.value.clone()),
                }),
                None => unknown.push(key.clone()),
            }
        }
        (known, unknown)
    }

    /// ChangeConfiguration: validate and store a new value.
    pub fn set_configuration(&self, key: &str, value: &str) -> ConfigurationStatus {
        let lookup = key.to_lowercase();

        {
            let entries = self.entries.read().unwrap();
            let Some(entry) = entries.get(&lookup) else {
                return ConfigurationStatus::NotSupported;
            };
            if entry.readonly {
                return ConfigurationStatus::Rejected;
            }
        }

        if let Some(validator) = self.validators.read().unwrap().get(&lookup) {
            if !validator(value) {
                warn!(key, value, "Configuration value rejected by validator");
                return ConfigurationStatus::Rejected;
            }
        }

        let reboot_required = {
            let mut entries = self.entries.write().unwrap();
            let entry = entries.get_mut(&lookup).expect("checked above");
            entry.value = value.to_string();
            entry.reboot_required
        };

        if let Some(listeners) = self.listeners.read().unwrap().get(&lookup) {
            for listener in listeners {
                listener.on_changed(key, value);
            }
        }

        if reboot_required {
            ConfigurationStatus::RebootRequired
        } else {
            ConfigurationStatus::Accepted
        }
    }

    /// Internal write bypassing the readonly flag and validators (used by
    /// the runtime itself, e.g. to store the heartbeat interval granted by
    /// the central system).
    pub fn set_internal(&self, key: &str, value: &str) {
        if let Some(entry) = self.entries.write().unwrap().get_mut(&key.to_lowercase()) {
            entry.value = value.to_string();
        }
    }

    // ── Typed getters for the keys the core consumes ───────────

    fn bool_key(&self, key: &str, default: bool) -> bool {
        self.value(key)
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(default)
    }

    fn u32_key(&self, key: &str, default: u32) -> u32 {
        self.value(key)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(default)
    }

    pub fn authorization_cache_enabled(&self) -> bool {
        self.bool_key("AuthorizationCacheEnabled", true)
    }

    pub fn local_auth_list_enabled(&self) -> bool {
        self.bool_key("LocalAuthListEnabled", true)
    }

    pub fn local_auth_list_max_length(&self) -> u32 {
        self.u32_key("LocalAuthListMaxLength", 1000)
    }

    pub fn send_local_list_max_length(&self) -> u32 {
        self.u32_key("SendLocalListMaxLength", 100)
    }

    pub fn local_pre_authorize(&self) -> bool {
        self.bool_key("LocalPreAuthorize", false)
    }

    pub fn local_authorize_offline(&self) -> bool {
        self.bool_key("LocalAuthorizeOffline", true)
    }

    pub fn allow_offline_tx_for_unknown_id(&self) -> bool {
        self.bool_key("AllowOfflineTxForUnknownId", false)
    }

    pub fn authorize_remote_tx_requests(&self) -> bool {
        self.bool_key("AuthorizeRemoteTxRequests", false)
    }

    pub fn charge_profile_max_stack_level(&self) -> u32 {
        self.u32_key("ChargeProfileMaxStackLevel", 10)
    }

    pub fn charging_schedule_max_periods(&self) -> u32 {
        self.u32_key("ChargingScheduleMaxPeriods", 100)
    }

    /// Comma separated list of `Current` / `Power`.
    pub fn charging_schedule_allowed_charging_rate_unit(&self) -> String {
        self.value("ChargingScheduleAllowedChargingRateUnit")
            .unwrap_or_else(|| "Current,Power".to_string())
    }

    pub fn max_charging_profiles_installed(&self) -> u32 {
        self.u32_key("MaxChargingProfilesInstalled", 10)
    }

    pub fn heartbeat_interval_secs(&self) -> u32 {
        self.u32_key("HeartbeatInterval", 300)
    }

    pub fn connection_timeout_secs(&self) -> u32 {
        self.u32_key("ConnectionTimeOut", 60)
    }

    pub fn web_socket_ping_interval_secs(&self) -> u32 {
        self.u32_key("WebSocketPingInterval", 60)
    }

    pub fn transaction_message_attempts(&self) -> u32 {
        self.u32_key("TransactionMessageAttempts", 3)
    }

    pub fn transaction_message_retry_interval_secs(&self) -> u32 {
        self.u32_key("TransactionMessageRetryInterval", 10)
    }

    pub fn number_of_connectors(&self) -> u32 {
        self.u32_key("NumberOfConnectors", 1)
    }

    pub fn get_configuration_max_keys(&self) -> u32 {
        self.u32_key("GetConfigurationMaxKeys", 100)
    }

    pub fn reserve_connector_zero_supported(&self) -> bool {
        self.bool_key("ReserveConnectorZeroSupported", false)
    }

    pub fn call_request_timeout_secs(&self) -> u32 {
        self.u32_key("CallRequestTimeout", 30)
    }
}

/// (key, default, readonly, reboot_required)
const DEFAULT_KEYS: &[(&'static str, &'static str, bool, bool)] = &[
    ("AllowOfflineTxForUnknownId", "false", false, false),
    ("AuthorizationCacheEnabled", "true", false, false),
    ("AuthorizeRemoteTxRequests", "false", false, false),
    ("CallRequestTimeout", "30", false, false),
    ("ChargeProfileMaxStackLevel", "10", true, false),
    ("ChargingScheduleAllowedChargingRateUnit", "Current,Power", true, false),
    ("ChargingScheduleMaxPeriods", "100", true, false),
    ("ConnectionTimeOut", "60", false, false),
    ("GetConfigurationMaxKeys", "100", true, false),
    ("HeartbeatInterval", "300", false, false),
    ("LocalAuthListEnabled", "true", false, false),
    ("LocalAuthListMaxLength", "1000", true, false),
    ("LocalAuthorizeOffline", "true", false, false),
    ("LocalPreAuthorize", "false", false, false),
    ("MaxChargingProfilesInstalled", "10", true, false),
    ("NumberOfConnectors", "1", true, false),
    ("ReserveConnectorZeroSupported", "false", true, false),
    ("SendLocalListMaxLength", "100", true, false),
    ("SupportedFeatureProfiles", "Core,FirmwareManagement,LocalAuthListManagement,Reservation,SmartCharging,RemoteTrigger", true, false),
    ("TransactionMessageAttempts", "3", false, false),
    ("TransactionMessageRetryInterval", "10", false, false),
    ("WebSocketPingInterval", "60", false, true),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive() {
        let config = OcppConfig::new();
        assert_eq!(
            config.set_configuration("heartbeatinterval", "120"),
            ConfigurationStatus::Accepted
        );
        assert_eq!(config.heartbeat_interval_secs(), 120);
        assert_eq!(config.value("HEARTBEATINTERVAL").as_deref(), Some("120"));
    }

    #[test]
    fn canonical_spelling_preserved_in_get_configuration() {
        let config = OcppConfig::new();
        let (known, unknown) =
            config.get_configuration(&["heartbeatinterval".into(), "NoSuchKey".into()]);
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].key, "HeartbeatInterval");
        assert_eq!(unknown, vec!["NoSuchKey".to_string()]);
    }

    #[test]
    fn readonly_keys_reject_writes() {
        let config = OcppConfig::new();
        assert_eq!(
            config.set_configuration("NumberOfConnectors", "4"),
            ConfigurationStatus::Rejected
        );
    }

    #[test]
    fn unknown_key_is_not_supported() {
        let config = OcppConfig::new();
        assert_eq!(
            config.set_configuration("VendorMagic", "on"),
            ConfigurationStatus::NotSupported
        );
    }

    #[test]
    fn validator_gates_writes() {
        let config = OcppConfig::new();
        config.register_validator("HeartbeatInterval", |v| {
            v.parse::<u32>().map(|n| n >= 10).unwrap_or(false)
        });
        assert_eq!(
            config.set_configuration("HeartbeatInterval", "5"),
            ConfigurationStatus::Rejected
        );
        assert_eq!(
            config.set_configuration("HeartbeatInterval", "60"),
            ConfigurationStatus::Accepted
        );
    }

    #[test]
    fn listeners_fire_on_accepted_write() {
        struct Seen(std::sync::Mutex<Vec<(String, String)>>);
        impl ConfigChangeListener for Seen {
            fn on_changed(&self, key: &str, value: &str) {
                self.0
                    .lock()
                    .unwrap()
                    .push((key.to_string(), value.to_string()));
            }
        }

        let config = OcppConfig::new();
        let seen = Arc::new(Seen(std::sync::Mutex::new(Vec::new())));
        config.register_listener("HeartbeatInterval", seen.clone());

        config.set_configuration("HeartbeatInterval", "42");
        config.set_configuration("NumberOfConnectors", "9"); // rejected, no event

        let events = seen.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1, "42");
    }

    #[test]
    fn reboot_required_key() {
        let config = OcppConfig::new();
        assert_eq!(
            config.set_configuration("WebSocketPingInterval", "30"),
            ConfigurationStatus::RebootRequired
        );
    }
}
