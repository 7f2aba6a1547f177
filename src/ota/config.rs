use std::time::Duration;

use crate::config::Settings;
use crate::error::{Error, Result};

/// Longest accepted wait for a device.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Per-run options for one OTA attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaOptions {
    pub timeout: Duration,
    pub retain: bool,
    pub clear_retained: bool,
    pub precompile: bool,
    pub report_states: bool,
}

impl Default for OtaOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            retain: true,
            clear_retained: false,
            precompile: false,
            report_states: false,
        }
    }
}

impl OtaOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options seeded from the signal and build sections of the settings file.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new()
            .with_retain(settings.mqtt.retain)
            .with_clear_retained(settings.mqtt.clear_retained)
            .with_precompile(settings.build.precompile)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_timeout_secs(self, secs: u64) -> Self {
        self.with_timeout(Duration::from_secs(secs))
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_clear_retained(mut self, clear: bool) -> Self {
        self.clear_retained = clear;
        self
    }

    pub fn with_precompile(mut self, precompile: bool) -> Self {
        self.precompile = precompile;
        self
    }

    pub fn report_states(mut self) -> Self {
        self.report_states = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::Configuration(
                "Wait timeout must be greater than zero".to_string(),
            ));
        }

        if self.timeout > MAX_TIMEOUT {
            return Err(Error::Configuration(format!(
                "Wait timeout cannot exceed {}s",
                MAX_TIMEOUT.as_secs()
            )));
        }

        if self.clear_retained && !self.retain {
            return Err(Error::Configuration(
                "clear_retained requires retained signals".to_string(),
            ));
        }

        Ok(())
    }
}
