//! Stack settings, loaded from TOML files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("could not read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse {path}: {source}")]
    Invalid {
        path: PathBuf,
        source: toml::de::Error,
    },
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_ping_interval_secs() -> u64 {
    60
}

/// Boot identity reported in BootNotification.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargePointIdentity {
    pub vendor: String,
    pub model: String,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub iccid: Option<String>,
    #[serde(default)]
    pub imsi: Option<String>,
    #[serde(default)]
    pub meter_type: Option<String>,
    #[serde(default)]
    pub meter_serial_number: Option<String>,
}

/// Settings of a Charge Point role instance.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargePointSettings {
    /// Charge point identifier, appended (percent-encoded) to the
    /// central system URL.
    pub identifier: String,
    /// Central system endpoint, e.g. `ws://cs.example.com/ocpp`.
    pub central_system_url: String,
    /// Directory holding the per-action JSON schema files.
    pub schemas_dir: PathBuf,
    pub identity: ChargePointIdentity,
    /// Number of physical connectors (connector 0 excluded).
    #[serde(default = "ChargePointSettings::default_connector_count")]
    pub connector_count: u32,
    /// Nominal operating voltage, used for A<->W setpoint conversion.
    #[serde(default = "ChargePointSettings::default_operating_voltage")]
    pub operating_voltage: f64,
    /// Bound of the authorization cache.
    #[serde(default = "ChargePointSettings::default_cache_max_entries")]
    pub authent_cache_max_entries: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "ChargePointSettings::default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    /// HTTP Basic password (security profiles 1 and 2); the user name is
    /// the charge point identifier.
    #[serde(default)]
    pub basic_auth_password: Option<String>,
}

impl ChargePointSettings {
    fn default_connector_count() -> u32 {
        1
    }

    fn default_operating_voltage() -> f64 {
        230.0
    }

    fn default_cache_max_entries() -> usize {
        1000
    }

    fn default_retry_interval_secs() -> u64 {
        5
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        load(path)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Endpoint URL with the percent-encoded identifier appended.
    pub fn endpoint_url(&self) -> String {
        use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
        let encoded = utf8_percent_encode(&self.identifier, NON_ALPHANUMERIC);
        format!(
            "{}/{}",
            self.central_system_url.trim_end_matches('/'),
            encoded
        )
    }
}

/// Settings of a Central System role instance.
#[derive(Debug, Clone, Deserialize)]
pub struct CentralSystemSettings {
    /// Bind address of the WebSocket listener, e.g. `0.0.0.0:8180`.
    pub listen_address: String,
    /// Directory holding the per-action JSON schema files.
    pub schemas_dir: PathBuf,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Default interval handed out in BootNotification responses.
    #[serde(default = "CentralSystemSettings::default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl CentralSystemSettings {
    fn default_heartbeat_interval_secs() -> u64 {
        300
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        load(path)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// Settings of a Local Controller role instance.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalControllerSettings {
    /// Bind address of the charge-point facing listener.
    pub listen_address: String,
    /// Central system endpoint the controller connects out to.
    pub central_system_url: String,
    /// Directory holding the per-action JSON schema files.
    pub schemas_dir: PathBuf,
    /// Tear down the charge-point leg when the central-system leg drops.
    #[serde(default = "LocalControllerSettings::default_disconnect_coupling")]
    pub disconnect_from_cp_when_cs_disconnected: bool,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl LocalControllerSettings {
    fn default_disconnect_coupling() -> bool {
        true
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        load(path)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

fn load<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, SettingsError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| SettingsError::Invalid {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_point_settings_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.toml");
        std::fs::write(
            &path,
            r#"
identifier = "CP 01"
central_system_url = "ws://localhost:8180/ocpp/"
schemas_dir = "/etc/ocpp/schemas"

[identity]
vendor = "Acme"
model = "X"
firmware_version = "1.2.3"
"#,
        )
        .unwrap();

        let settings = ChargePointSettings::load(&path).unwrap();
        assert_eq!(settings.identifier, "CP 01");
        assert_eq!(settings.connector_count, 1);
        assert_eq!(settings.operating_voltage, 230.0);
        assert_eq!(
            settings.endpoint_url(),
            "ws://localhost:8180/ocpp/CP%2001"
        );
    }
}
