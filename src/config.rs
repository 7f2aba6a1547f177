//! Settings file loading and device registry resolution.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::ota::Device;

/// Overrides `mqtt.password` when set.
pub const PASSWORD_ENV: &str = "DEEP_OTA_MQTT_PASSWORD";

const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub topic_prefix: String,
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Path to a CA certificate (PEM). Empty means plain TCP.
    ///
    /// The broker certificate is always checked against this CA, hostname
    /// included. There is no switch to skip verification.
    pub ca_certificate: String,
    /// Empty means `deep-ota-<device>-<pid>`.
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub retain: bool,
    pub clear_retained: bool,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            ca_certificate: String::new(),
            client_id: String::new(),
            keep_alive_secs: 60,
            connect_timeout_secs: 5,
            retain: true,
            clear_retained: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSettings {
    pub program: String,
    pub working_dir: String,
    /// Appended to the device name to form its network address.
    pub domain: String,
    /// Directory receiving `<device>.log`. Empty disables the log file.
    pub log_dir: String,
    pub precompile: bool,
    pub compile_args: Vec<String>,
    pub upload_args: Vec<String>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            program: "esphome".to_string(),
            working_dir: String::new(),
            domain: String::new(),
            log_dir: String::new(),
            precompile: false,
            compile_args: vec!["compile".to_string(), "{config}".to_string()],
            upload_args: vec![
                "upload".to_string(),
                "{config}".to_string(),
                "--device".to_string(),
                "{address}".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceEntry {
    pub config_file: Option<String>,
    pub address: Option<String>,
}

/// Default location: `<config dir>/deep-ota/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().ok_or_else(|| {
        Error::Configuration("Cannot determine configuration directory".to_string())
    })?;
    Ok(dir.join("deep-ota").join("config.toml"))
}

impl Settings {
    /// Loads, applies environment overrides and validates.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Configuration(format!(
                    "Configuration file not found at: {}",
                    path.display()
                ))
            } else {
                Error::Io(e)
            }
        })?;

        let mut settings = Self::from_toml(&content)?;
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            settings.mqtt.password = password;
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.is_empty() {
            return Err(Error::Configuration(
                "mqtt.host must be specified".to_string(),
            ));
        }
        if self.mqtt.port == 0 {
            return Err(Error::Configuration("mqtt.port cannot be 0".to_string()));
        }
        if self.mqtt.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(Error::Configuration(format!(
                "mqtt.keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}"
            )));
        }
        if self.mqtt.connect_timeout_secs == 0 {
            return Err(Error::Configuration(
                "mqtt.connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.build.program.is_empty() {
            return Err(Error::Configuration(
                "build.program must be specified".to_string(),
            ));
        }
        if let Some(name) = self.devices.keys().find(|name| !is_valid_device_name(name)) {
            return Err(Error::Configuration(format!(
                "Invalid device name {name:?}: must be non-empty without '/', '+' or '#'"
            )));
        }
        Ok(())
    }

    /// Resolves a device from the registry.
    pub fn device(&self, name: &str) -> Result<Device> {
        let entry = self
            .devices
            .get(name)
            .ok_or_else(|| Error::UnknownDevice(name.to_string()))?;

        let mut device = Device::new(name, &self.topic_prefix);
        if let Some(config_file) = &entry.config_file {
            device = device.with_config_file(config_file.clone());
        }
        device = match &entry.address {
            Some(address) => device.with_address(address.clone()),
            None if !self.build.domain.is_empty() => {
                device.with_address(format!("{}.{}", name, self.build.domain))
            }
            None => device,
        };
        Ok(device)
    }

    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn client_id(&self, device: &Device) -> String {
        if self.mqtt.client_id.is_empty() {
            format!("deep-ota-{}-{}", device.name(), std::process::id())
        } else {
            self.mqtt.client_id.clone()
        }
    }
}

fn is_valid_device_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '+', '#'])
}
