use thiserror::Error;

use crate::ota::{BuildStep, ToolStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Device {0} does not exist in the device registry")]
    UnknownDevice(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Timeout reached")]
    Timeout,

    #[error("{step} step failed: {status}")]
    BuildFailed {
        step: BuildStep,
        status: ToolStatus,
        output: Vec<String>,
    },

    #[error("Unable to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures reported by the build tool rather than by the handshake.
    pub fn is_build_failure(&self) -> bool {
        matches!(self, Error::BuildFailed { .. } | Error::Spawn { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Client(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
