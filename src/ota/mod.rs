use std::fmt;
use std::io::Write;

use chrono::{DateTime, Local};
use log::{error, info, warn};

use crate::error::{Error, Result};
use crate::transport::Broker;

mod config;
mod coordinator;
mod dispatcher;
mod types;

pub use config::*;
pub use coordinator::ReadinessCoordinator;
pub use dispatcher::{expand, log_path, BuildDispatcher, BuildTool, CommandTool, MockTool};
pub use types::*;

/// Final outcome of a run, as seen by the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Success,
    BuildFailed,
    DeviceTimeout,
    TransportOrConfigError,
}

impl RunResult {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunResult::Success => 0,
            RunResult::BuildFailed | RunResult::TransportOrConfigError => 1,
            RunResult::DeviceTimeout => 2,
        }
    }
}

impl From<&Result<()>> for RunResult {
    fn from(result: &Result<()>) -> Self {
        match result {
            Ok(()) => RunResult::Success,
            Err(Error::Timeout) => RunResult::DeviceTimeout,
            Err(e) if e.is_build_failure() => RunResult::BuildFailed,
            Err(_) => RunResult::TransportOrConfigError,
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunResult::Success => f.write_str("Completed"),
            RunResult::BuildFailed => f.write_str("Build or transmit error"),
            RunResult::DeviceTimeout => f.write_str("Timeout reached"),
            RunResult::TransportOrConfigError => f.write_str("Communication or configuration error"),
        }
    }
}

/// Timestamped record of the states a run went through.
#[derive(Debug, Clone)]
pub struct StateLog {
    device: String,
    report: bool,
    entries: Vec<(DateTime<Local>, DeviceState)>,
}

impl StateLog {
    pub fn new(device: &str, report: bool) -> Self {
        Self {
            device: device.to_string(),
            report,
            entries: Vec::new(),
        }
    }

    /// Records a state; when reporting, also prints `[<device>,<STATE>]` to stdout.
    pub fn record(&mut self, state: DeviceState) {
        self.entries.push((Local::now(), state));
        if self.report {
            let mut stdout = std::io::stdout().lock();
            let _ = writeln!(stdout, "[{},{}]", self.device, state);
            let _ = stdout.flush();
        }
    }

    pub fn states(&self) -> Vec<DeviceState> {
        self.entries.iter().map(|(_, state)| *state).collect()
    }

    pub fn entries(&self) -> &[(DateTime<Local>, DeviceState)] {
        &self.entries
    }

    pub fn last(&self) -> Option<DeviceState> {
        self.entries.last().map(|(_, state)| *state)
    }
}

/// One OTA run: hold the device awake, build and flash, release.
pub struct OtaUpdate<B, T> {
    broker: B,
    dispatcher: BuildDispatcher<T>,
    device: Device,
    options: OtaOptions,
    states: StateLog,
}

impl<B: Broker, T: BuildTool> OtaUpdate<B, T> {
    pub fn new(broker: B, tool: T, device: Device, options: OtaOptions) -> Self {
        let states = StateLog::new(device.name(), options.report_states);
        Self {
            broker,
            dispatcher: BuildDispatcher::new(tool),
            device,
            options,
            states,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn states(&self) -> &StateLog {
        &self.states
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Runs the update. The broker connection is closed on every path.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.execute().await;

        if let Err(e) = self.broker.close().await {
            warn!("Error while closing broker connection: {}", e);
        }

        let outcome = RunResult::from(&result);
        if let Err(e) = &result {
            error!("{}", e);
        }
        info!("End result: {}", outcome);
        self.states.record(match outcome {
            RunResult::Success => DeviceState::Success,
            RunResult::DeviceTimeout => DeviceState::SyncingError,
            RunResult::BuildFailed | RunResult::TransportOrConfigError => DeviceState::Error,
        });
        self.states.record(DeviceState::End);
        info!("End of job.");

        result
    }

    async fn execute(&mut self) -> Result<()> {
        self.options.validate()?;

        info!(
            "About to send new binary code to device with {} second(s) max wait time",
            self.options.timeout.as_secs()
        );
        self.states.record(DeviceState::Starting);

        if self.options.precompile {
            run_step(&self.dispatcher, &mut self.states, BuildStep::Compile, &self.device).await?;
        }

        if let Err(e) = self.broker.connect().await {
            self.states.record(DeviceState::MqttError);
            return Err(e);
        }

        self.states.record(DeviceState::Syncing);

        let precompiled = self.options.precompile;
        let dispatcher = &self.dispatcher;
        let states = &mut self.states;
        let device = &self.device;

        let readiness = ReadinessCoordinator::new(&mut self.broker, device, &self.options)
            .hold_for(self.options.timeout, move || async move {
                if !precompiled {
                    run_step(dispatcher, states, BuildStep::Compile, device).await?;
                }
                run_step(dispatcher, states, BuildStep::Upload, device).await
            })
            .await;

        match readiness {
            Ok(Readiness::Ready) => Ok(()),
            Ok(Readiness::TimedOut) => Err(Error::Timeout),
            Err(e) => {
                if !e.is_build_failure() {
                    self.states.record(DeviceState::MqttError);
                }
                Err(e)
            }
        }
    }
}

async fn run_step<T: BuildTool>(
    dispatcher: &BuildDispatcher<T>,
    states: &mut StateLog,
    step: BuildStep,
    device: &Device,
) -> Result<()> {
    states.record(step.running_state());
    dispatcher
        .run_step(step, device)
        .await
        .inspect_err(|_| states.record(step.failed_state()))
}
