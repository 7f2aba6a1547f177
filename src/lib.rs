//! Deep-sleep OTA Library
//!
//! This library pushes new firmware to battery-powered devices that spend most
//! of their time in deep sleep and can only be flashed while awake.
//!
//! # Device convention
//! - `ON` on `<prefix><device>/ota-req` makes the device hold off deep sleep
//! - the device then publishes `READY` on `<prefix><device>/ota`
//! - `OFF` on `<prefix><device>/ota-req` lets it go back to sleep
//!
//! # Run
//! 1. Subscribe to the readiness topic, publish `ON`
//! 2. Wait (bounded) for `READY`
//! 3. Compile and upload with the external build tool
//! 4. Publish `OFF` on every path
//!
//! # Exit status
//! - `0`: firmware transmitted
//! - `1`: transport, configuration or build error
//! - `2`: the device did not answer in time
//!
//! # Example
//!
//! ```rust,no_run
//! use deep_ota::ota::{CommandTool, OtaOptions};
//!
//! #[tokio::main]
//! async fn main() -> deep_ota::Result<()> {
//!     let prepared = deep_ota::prepare("config.toml".as_ref(), "mailbox")?;
//!     let options = OtaOptions::from_settings(&prepared.settings).with_timeout_secs(24);
//!
//!     let tool = CommandTool::new(&prepared.settings.build);
//!     deep_ota::deploy(prepared.broker, tool, prepared.device, options).await
//! }
//! ```

pub mod config;
mod error;
pub mod logging;
pub mod ota;
pub mod transport;

pub use error::{Error, Result};
pub use ota::{Device, OtaOptions, OtaUpdate, RunResult};

use std::path::Path;

use config::Settings;
use ota::BuildTool;
use transport::{Broker, MqttBroker};

/// Everything a run needs, resolved before any network activity.
pub struct Prepared {
    pub settings: Settings,
    pub device: Device,
    pub broker: MqttBroker,
}

/// Loads the settings, looks the device up and builds an unconnected broker.
///
/// Fails on a missing or invalid file, an unknown device or an unreadable CA
/// certificate. No connection is attempted here.
pub fn prepare(config: &Path, device: &str) -> Result<Prepared> {
    let settings = Settings::load(config)?;
    let device = settings.device(device)?;
    let broker = MqttBroker::new(&settings.mqtt, &settings.client_id(&device))?;
    Ok(Prepared {
        settings,
        device,
        broker,
    })
}

/// Runs one complete OTA update for `device`.
pub async fn deploy<B, T>(broker: B, tool: T, device: Device, options: OtaOptions) -> Result<()>
where
    B: Broker,
    T: BuildTool,
{
    let mut update = OtaUpdate::new(broker, tool, device, options);
    update.run().await
}

/// Creates run options with default settings
pub fn new_options() -> OtaOptions {
    OtaOptions::new()
}
