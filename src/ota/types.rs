use std::fmt;

/// Payload asking the device to hold off deep sleep.
pub const HOLD_SIGNAL: &[u8] = b"ON";
/// Payload letting the device resume its deep-sleep cycle.
pub const RELEASE_SIGNAL: &[u8] = b"OFF";
/// Payload the device publishes once it is awake and safe to flash.
pub const READY_SIGNAL: &str = "READY";

const REQUEST_SUFFIX: &str = "/ota-req";
const READY_SUFFIX: &str = "/ota";

/// A registered device, with its topics and build parameters resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    name: String,
    config_file: String,
    address: String,
    request_topic: String,
    ready_topic: String,
}

impl Device {
    pub fn new(name: impl Into<String>, topic_prefix: &str) -> Self {
        let name = name.into();
        Self {
            config_file: format!("{name}.yaml"),
            address: name.clone(),
            request_topic: format!("{topic_prefix}{name}{REQUEST_SUFFIX}"),
            ready_topic: format!("{topic_prefix}{name}{READY_SUFFIX}"),
            name,
        }
    }

    pub fn with_config_file(mut self, config_file: impl Into<String>) -> Self {
        self.config_file = config_file.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Topic receiving the hold and release signals.
    pub fn request_topic(&self) -> &str {
        &self.request_topic
    }

    /// Topic on which the device confirms readiness.
    pub fn ready_topic(&self) -> &str {
        &self.ready_topic
    }
}

/// How the wait for the device resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

/// Progress states of a run, as reported to a supervising process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Starting,
    End,
    Compiling,
    Syncing,
    Uploading,
    MqttError,
    SyncingError,
    CompileError,
    TransmitError,
    Error,
    Success,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Starting => "STARTING",
            DeviceState::End => "END",
            DeviceState::Compiling => "COMPILING",
            DeviceState::Syncing => "SYNCING",
            DeviceState::Uploading => "UPLOADING",
            DeviceState::MqttError => "MQTT_ERROR",
            DeviceState::SyncingError => "SYNCING_ERROR",
            DeviceState::CompileError => "COMPILE_ERROR",
            DeviceState::TransmitError => "TRANSMIT_ERROR",
            DeviceState::Error => "ERROR",
            DeviceState::Success => "SUCCESS",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildStep {
    Compile,
    Upload,
}

impl BuildStep {
    /// State entered while the step runs.
    pub fn running_state(&self) -> DeviceState {
        match self {
            BuildStep::Compile => DeviceState::Compiling,
            BuildStep::Upload => DeviceState::Uploading,
        }
    }

    /// State entered when the step fails.
    pub fn failed_state(&self) -> DeviceState {
        match self {
            BuildStep::Compile => DeviceState::CompileError,
            BuildStep::Upload => DeviceState::TransmitError,
        }
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStep::Compile => f.write_str("compile"),
            BuildStep::Upload => f.write_str("upload"),
        }
    }
}

/// Exit status of the build tool. `None` when it was terminated by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolStatus(pub Option<i32>);

impl ToolStatus {
    pub fn success(&self) -> bool {
        self.0 == Some(0)
    }
}

impl From<std::process::ExitStatus> for ToolStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self(status.code())
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// What one build tool invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolReport {
    pub status: ToolStatus,
    /// Trailing lines of combined stdout/stderr.
    pub output: Vec<String>,
}
