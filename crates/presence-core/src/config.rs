//! Resolved daemon configuration.
//!
//! Handles loading and validating the presence daemon configuration:
//! - Per-transport sections (`bluetooth`, `ping`, `http`, `pipe`, `motion`)
//! - The known-device table mapping operator names to transport identities
//!
//! Settings are layered with the `config` crate: system file, root file, user
//! file, an optional explicit file, then `PRESENCED_*` environment variables
//! (`PRESENCED_PING__SLEEP=5`). The known-device table lives in its own TOML
//! file, one table per device key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Environment, File};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Presence;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "PRESENCED";

/// Name of the main configuration file.
pub const CONFIG_FILE_NAME: &str = "presenced.toml";

/// Default name of the known-device table.
pub const DEVICES_FILE_NAME: &str = "devices.toml";

static MAC_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("MAC pattern is valid")
});

/// Returns `true` if `address` looks like `XX:XX:XX:XX:XX:XX`.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_PATTERN.is_match(address)
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    ReadError {
        /// File that failed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Layered loading or deserialization failed.
    #[error("failed to load configuration: {0}")]
    LoadError(#[from] ::config::ConfigError),

    /// The known-device table is not valid TOML.
    #[error("failed to parse known-device table: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A single field holds an invalid value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields are invalid.
    #[error("{} configuration problems: {}", .0.len(), join_errors(.0))]
    MultipleValidationErrors(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConfigError {
    fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Known-device table
// ============================================================================

/// One operator-configured device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnownDevice {
    /// Table key, filled in from the section name.
    #[serde(skip)]
    pub key: String,
    /// Human readable name.
    pub display: Option<String>,
    /// DNS host name.
    pub dns: Option<String>,
    /// IP address.
    pub ip: Option<String>,
    /// Hardware serial number.
    pub serial: Option<String>,
    /// WLAN MAC address.
    pub wlan: Option<String>,
    /// Bluetooth MAC address.
    pub bt: Option<String>,
    /// Home zone tag.
    pub zone: Option<String>,
    /// Expected presence when the daemon starts.
    pub online: Option<bool>,
    /// Per-device ping interval override, in seconds.
    pub sleep: Option<u64>,
    /// Any other attribute.
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

impl KnownDevice {
    /// Look up a string attribute by name, including extra attributes.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        match name {
            "key" => Some(self.key.as_str()),
            "display" => self.display.as_deref(),
            "dns" => self.dns.as_deref(),
            "ip" => self.ip.as_deref(),
            "serial" => self.serial.as_deref(),
            "wlan" => self.wlan.as_deref(),
            "bt" => self.bt.as_deref(),
            "zone" => self.zone.as_deref(),
            other => self.extra.get(other).and_then(toml::Value::as_str),
        }
    }

    /// Address used to ping this device: the IP if set, else the DNS name.
    pub fn host(&self) -> Option<&str> {
        self.ip.as_deref().or(self.dns.as_deref())
    }

    /// Display name, falling back to the key.
    pub fn display_name(&self) -> &str {
        self.display.as_deref().unwrap_or(&self.key)
    }

    /// Expected initial presence, if configured.
    pub fn expected(&self) -> Option<Presence> {
        self.online.map(Presence::from_reading)
    }
}

/// Read-only table of known devices, keyed by operator name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnownDevices {
    devices: BTreeMap<String, KnownDevice>,
}

impl KnownDevices {
    /// Parse a table from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] when the text is not a table of tables.
    pub fn from_toml(text: &str) -> ConfigResult<Self> {
        let mut devices: BTreeMap<String, KnownDevice> = toml::from_str(text)?;
        for (key, device) in &mut devices {
            device.key.clone_from(key);
        }
        Ok(Self { devices })
    }

    /// Load the table from disk. A missing file yields an empty table.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no known-device table");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Build a table from already parsed devices.
    pub fn from_devices(devices: impl IntoIterator<Item = KnownDevice>) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|device| (device.key.clone(), device))
                .collect(),
        }
    }

    /// Look up a device by key.
    pub fn get(&self, key: &str) -> Option<&KnownDevice> {
        self.devices.get(key)
    }

    /// Iterate over all devices.
    pub fn iter(&self) -> impl Iterator<Item = &KnownDevice> {
        self.devices.values()
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns `true` when the table is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Fully resolved configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Controller-wide options.
    pub controller: ControllerSettings,
    /// Bluetooth inquiry probe.
    pub bluetooth: BluetoothSettings,
    /// Ping probe.
    pub ping: PingSettings,
    /// HTTP zone update listener.
    pub http: HttpSettings,
    /// Named pipe control channel.
    pub pipe: PipeSettings,
    /// PIR motion sensor.
    #[serde(alias = "pir")]
    pub motion: MotionSettings,
    /// Known-device table.
    #[serde(skip)]
    pub devices: KnownDevices,
}

/// Controller-wide options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Path of the known-device table, relative to the root directory.
    pub devices: PathBuf,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            devices: PathBuf::from(DEVICES_FILE_NAME),
        }
    }
}

/// Bluetooth probe options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothSettings {
    /// Enable the probe.
    pub enabled: bool,
    /// Seconds after which an unseen device is forgotten.
    pub expire: u64,
    /// Length of one inquiry window, in seconds.
    pub inquiry: u64,
    /// Report the first sighting of every device.
    pub announce_initial: bool,
    /// Known-device keys reconciled against discoveries.
    pub devices: Vec<String>,
}

impl Default for BluetoothSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            expire: 300,
            inquiry: 10,
            announce_initial: true,
            devices: Vec::new(),
        }
    }
}

impl BluetoothSettings {
    /// Expiry window.
    pub fn expire_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.expire).unwrap_or(i64::MAX))
    }

    /// Inquiry window.
    pub const fn inquiry_window(&self) -> Duration {
        Duration::from_secs(self.inquiry)
    }
}

/// Ping probe options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingSettings {
    /// Enable the probe.
    pub enabled: bool,
    /// Default seconds between checks.
    pub sleep: u64,
    /// Seconds to wait for one echo reply.
    pub timeout: u64,
    /// Echo payload size in bytes.
    pub psize: u16,
    /// Extra attempts after a lost reply.
    pub retry: u8,
    /// Expected initial state of targets without their own `online` entry.
    pub online: bool,
    /// Report the first reading of every target.
    pub announce_initial: bool,
    /// Known-device keys or raw host names / addresses.
    pub devices: Vec<String>,
}

impl Default for PingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sleep: 10,
            timeout: 1,
            psize: 64,
            retry: 1,
            online: true,
            announce_initial: false,
            devices: Vec::new(),
        }
    }
}

impl PingSettings {
    /// Default interval between checks.
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.sleep)
    }

    /// Per-attempt timeout.
    pub const fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// HTTP listener options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Enable the listener.
    pub enabled: bool,
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Known-device attribute used as the `device` query value.
    pub key: String,
    /// Known-device keys accepted for zone updates.
    pub devices: Vec<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
            key: "serial".to_string(),
            devices: Vec::new(),
        }
    }
}

/// Control channel options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeSettings {
    /// Enable the channel.
    pub enabled: bool,
    /// FIFO path.
    pub path: PathBuf,
}

impl Default for PipeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/tmp/presenced.fifo"),
        }
    }
}

/// Motion sensor options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    /// Enable the sensor.
    pub enabled: bool,
    /// BCM GPIO number of the sensor pin.
    pub gpio: u8,
    /// Idle timeout, in ticks (seconds).
    pub timeout: u32,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            gpio: 4,
            timeout: 60,
        }
    }
}

impl Settings {
    /// Configuration files consulted by default, lowest precedence first.
    pub fn default_files(root: &Path) -> Vec<PathBuf> {
        let mut files = vec![
            PathBuf::from("/etc/presenced").join(CONFIG_FILE_NAME),
            root.join(CONFIG_FILE_NAME),
        ];
        if let Some(dirs) = directories::ProjectDirs::from("", "", "presenced") {
            files.push(dirs.config_dir().join(CONFIG_FILE_NAME));
        }
        files
    }

    /// Load settings from the given files and the environment, then the
    /// known-device table, then validate.
    ///
    /// Missing files are skipped. Relative table paths resolve against `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if any source fails to parse or validation fails.
    pub fn load(files: &[PathBuf], root: &Path) -> ConfigResult<Self> {
        let mut builder = ::config::Config::builder();
        for file in files {
            builder = builder.add_source(File::from(file.as_path()).required(false));
        }
        let environment = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("bluetooth.devices")
            .with_list_parse_key("ping.devices")
            .with_list_parse_key("http.devices");

        let mut settings: Self = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        let table = if settings.controller.devices.is_absolute() {
            settings.controller.devices.clone()
        } else {
            root.join(&settings.controller.devices)
        };
        settings.devices = KnownDevices::load(&table)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field constraints and collect every problem.
    ///
    /// # Errors
    ///
    /// Returns the single problem, or [`ConfigError::MultipleValidationErrors`].
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        for device in self.devices.iter() {
            if let Some(address) = &device.bt {
                if !is_valid_mac_address(address) {
                    errors.push(ConfigError::invalid(
                        format!("devices.{}.bt", device.key),
                        format!("'{address}' is not a Bluetooth address (XX:XX:XX:XX:XX:XX)"),
                    ));
                }
            }
        }

        if self.bluetooth.enabled {
            if self.bluetooth.inquiry == 0 {
                errors.push(ConfigError::invalid("bluetooth.inquiry", "must be positive"));
            }
            for key in &self.bluetooth.devices {
                match self.devices.get(key) {
                    None => errors.push(unknown_device("bluetooth.devices", key)),
                    Some(device) if device.bt.is_none() => errors.push(ConfigError::invalid(
                        "bluetooth.devices",
                        format!("device '{key}' has no bt address"),
                    )),
                    Some(_) => {}
                }
            }
        }

        if self.ping.enabled {
            if self.ping.sleep == 0 {
                errors.push(ConfigError::invalid("ping.sleep", "must be positive"));
            }
            if self.ping.timeout == 0 {
                errors.push(ConfigError::invalid("ping.timeout", "must be positive"));
            }
        }

        if self.http.enabled {
            if self.http.port == 0 {
                errors.push(ConfigError::invalid("http.port", "must be positive"));
            }
            for key in &self.http.devices {
                match self.devices.get(key) {
                    None => errors.push(unknown_device("http.devices", key)),
                    Some(device) if device.attribute(&self.http.key).is_none() => {
                        errors.push(ConfigError::invalid(
                            "http.devices",
                            format!("device '{key}' has no '{}' attribute", self.http.key),
                        ));
                    }
                    Some(_) => {}
                }
            }
        }

        if self.pipe.enabled && self.pipe.path.as_os_str().is_empty() {
            errors.push(ConfigError::invalid("pipe.path", "must not be empty"));
        }

        if self.motion.enabled && self.motion.timeout == 0 {
            errors.push(ConfigError::invalid("motion.timeout", "must be positive"));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

fn unknown_device(field: &str, key: &str) -> ConfigError {
    ConfigError::invalid(field, format!("'{key}' is not in the known-device table"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"
        [nexus]
        display = "Google Nexus 10"
        dns = "nexus"
        ip = "192.168.100.60"
        serial = "R32D102JR6N"
        bt = "08:D4:2B:17:D8:E7"
        online = false

        [htc]
        display = "HTC One M7"
        serial = "SH42NW901328"
        bt = "00:EE:BD:52:83:B5"
        imei = "35-209900-176148-1"
    "#;

    #[test]
    fn test_defaults_match_daemon_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.bluetooth.expire, 300);
        assert_eq!(settings.ping.sleep, 10);
        assert_eq!(settings.ping.timeout, 1);
        assert!(settings.ping.online);
        assert_eq!(settings.ping.psize, 64);
        assert_eq!(settings.http.port, 8080);
        assert_eq!(settings.http.key, "serial");
        assert_eq!(settings.motion.timeout, 60);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_known_devices_from_toml() {
        let table = KnownDevices::from_toml(TABLE).unwrap();
        assert_eq!(table.len(), 2);

        let nexus = table.get("nexus").unwrap();
        assert_eq!(nexus.key, "nexus");
        assert_eq!(nexus.host(), Some("192.168.100.60"));
        assert_eq!(nexus.expected(), Some(Presence::Offline));
        assert_eq!(nexus.attribute("serial"), Some("R32D102JR6N"));

        let htc = table.get("htc").unwrap();
        assert_eq!(htc.attribute("imei"), Some("35-209900-176148-1"));
        assert_eq!(htc.host(), None);
        assert_eq!(htc.display_name(), "HTC One M7");
    }

    #[test]
    fn test_load_layers_file_and_table() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEVICES_FILE_NAME), TABLE).unwrap();
        let file = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &file,
            r#"
            [ping]
            sleep = 30
            devices = ["nexus", "10.0.0.1"]

            [http]
            port = 9090
            devices = ["htc"]

            [pir]
            timeout = 120
            "#,
        )
        .unwrap();

        let settings = Settings::load(&[file], dir.path()).unwrap();
        assert_eq!(settings.ping.sleep, 30);
        assert_eq!(settings.ping.devices, vec!["nexus", "10.0.0.1"]);
        assert_eq!(settings.http.port, 9090);
        assert_eq!(settings.motion.timeout, 120);
        assert_eq!(settings.devices.len(), 2);
    }

    #[test]
    fn test_missing_files_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&[dir.path().join("absent.toml")], dir.path()).unwrap();
        assert_eq!(settings.bluetooth.expire, 300);
        assert!(settings.devices.is_empty());
    }

    #[test]
    fn test_validation_collects_all_problems() {
        let mut settings = Settings {
            devices: KnownDevices::from_toml(
                r#"
                [broken]
                bt = "not-a-mac"
                "#,
            )
            .unwrap(),
            ..Settings::default()
        };
        settings.http.devices = vec!["missing".to_string()];
        settings.ping.sleep = 0;

        let err = settings.validate().unwrap_err();
        match err {
            ConfigError::MultipleValidationErrors(errors) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_http_device_without_key_attribute_is_rejected() {
        let mut settings = Settings {
            devices: KnownDevices::from_toml("[tablet]\ndisplay = \"Tablet\"\n").unwrap(),
            ..Settings::default()
        };
        settings.http.devices = vec!["tablet".to_string()];
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_is_valid_mac_address() {
        assert!(is_valid_mac_address("00:EE:BD:52:83:B5"));
        assert!(is_valid_mac_address("08:d4:2b:17:d8:e7"));
        assert!(!is_valid_mac_address("00:EE:BD:52:83"));
        assert!(!is_valid_mac_address("htc"));
    }
}
