use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::types::{BuildStep, Device, ToolReport, ToolStatus};
use crate::config::BuildSettings;
use crate::error::{Error, Result};

/// Lines of tool output kept for failure reports.
const OUTPUT_TAIL_LINES: usize = 40;

/// External build/flash tool.
#[allow(async_fn_in_trait)]
pub trait BuildTool {
    async fn run(&self, step: BuildStep, device: &Device) -> Result<ToolReport>;
}

/// Runs the build tool once per step and classifies the outcome. Never retries.
pub struct BuildDispatcher<T> {
    tool: T,
}

impl<T: BuildTool> BuildDispatcher<T> {
    pub fn new(tool: T) -> Self {
        Self { tool }
    }

    pub fn tool(&self) -> &T {
        &self.tool
    }

    /// Compiles then transmits the firmware.
    pub async fn build_and_flash(&self, device: &Device) -> Result<()> {
        self.run_step(BuildStep::Compile, device).await?;
        self.run_step(BuildStep::Upload, device).await
    }

    pub async fn run_step(&self, step: BuildStep, device: &Device) -> Result<()> {
        match step {
            BuildStep::Compile => info!("Compiling new code for device ..."),
            BuildStep::Upload => info!("Transmitting new code to device ..."),
        }

        let report = self
            .tool
            .run(step, device)
            .await
            .inspect_err(|e| error!("{}", e))?;

        info!("{} result: {}", step, report.status);
        if report.status.success() {
            return Ok(());
        }

        error!("{} step failed with {}", step, report.status);
        if !report.output.is_empty() {
            error!("Last {} line(s) of output:", report.output.len());
            for line in &report.output {
                error!(target: "build", "{}", line);
            }
        }

        Err(Error::BuildFailed {
            step,
            status: report.status,
            output: report.output,
        })
    }
}

/// Build tool driven by a command line, ESPHome by default.
///
/// Argument templates may use `{name}`, `{config}` and `{address}`.
#[derive(Debug, Clone)]
pub struct CommandTool {
    program: String,
    working_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    compile_args: Vec<String>,
    upload_args: Vec<String>,
}

impl CommandTool {
    pub fn new(settings: &BuildSettings) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| PathBuf::from(s));
        Self {
            program: settings.program.clone(),
            working_dir: non_empty(&settings.working_dir),
            log_dir: non_empty(&settings.log_dir),
            compile_args: settings.compile_args.clone(),
            upload_args: settings.upload_args.clone(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self, step: BuildStep, device: &Device) -> Vec<String> {
        let templates = match step {
            BuildStep::Compile => &self.compile_args,
            BuildStep::Upload => &self.upload_args,
        };
        templates.iter().map(|t| expand(t, device)).collect()
    }

    /// Compile starts a fresh log, upload appends to it.
    async fn open_log(&self, step: BuildStep, device: &Device) -> Option<File> {
        let dir = self.log_dir.as_deref()?;
        let path = log_path(dir, device);
        let mut options = OpenOptions::new();
        options.create(true);
        match step {
            BuildStep::Compile => options.write(true).truncate(true),
            BuildStep::Upload => options.append(true),
        };

        match options.open(&path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("Unable to open log file {}: {}", path.display(), e);
                None
            }
        }
    }
}

impl BuildTool for CommandTool {
    async fn run(&self, step: BuildStep, device: &Device) -> Result<ToolReport> {
        let args = self.args(step, device);
        info!("Running {} {}", self.program, args.join(" "));

        let mut log_file = self.open_log(step, device).await;

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        while let Some(line) = rx.recv().await {
            info!(target: "build", "{}", line);
            if let Some(file) = log_file.as_mut() {
                if let Err(e) = write_line(file, &line).await {
                    warn!("Unable to write build log: {}", e);
                    log_file = None;
                }
            }
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let status = child.wait().await?;
        if let Some(mut file) = log_file {
            if let Err(e) = file.flush().await {
                warn!("Unable to flush build log: {}", e);
            }
        }

        Ok(ToolReport {
            status: ToolStatus::from(status),
            output: tail.into(),
        })
    }
}

pub fn expand(template: &str, device: &Device) -> String {
    template
        .replace("{name}", device.name())
        .replace("{config}", device.config_file())
        .replace("{address}", device.address())
}

pub fn log_path(dir: &Path, device: &Device) -> PathBuf {
    dir.join(format!("{}.log", device.name()))
}

async fn write_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await
}

/// Reads until EOF even on invalid UTF-8 so the child never blocks on a full pipe.
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Tool output stream ended: {}", e);
                break;
            }
        }
    }
}

#[derive(Default)]
struct MockToolState {
    exit_codes: HashMap<BuildStep, i32>,
    output: Vec<String>,
    invocations: Vec<(BuildStep, String)>,
}

/// Scripted build tool. Every step succeeds unless told otherwise.
#[derive(Clone, Default)]
pub struct MockTool {
    state: Arc<Mutex<MockToolState>>,
}

impl MockTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(self, step: BuildStep, code: i32) -> Self {
        self.state().exit_codes.insert(step, code);
        self
    }

    pub fn with_output(self, lines: &[&str]) -> Self {
        self.state().output = lines.iter().map(|l| l.to_string()).collect();
        self
    }

    /// Steps run so far, with the device name each was run for.
    pub fn invocations(&self) -> Vec<(BuildStep, String)> {
        self.state().invocations.clone()
    }

    fn state(&self) -> MutexGuard<'_, MockToolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BuildTool for MockTool {
    async fn run(&self, step: BuildStep, device: &Device) -> Result<ToolReport> {
        let mut state = self.state();
        state.invocations.push((step, device.name().to_string()));
        let code = state.exit_codes.get(&step).copied().unwrap_or(0);
        Ok(ToolReport {
            status: ToolStatus(Some(code)),
            output: state.output.clone(),
        })
    }
}
