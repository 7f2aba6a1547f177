use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, LevelFilter};

use deep_ota::config::default_config_path;
use deep_ota::ota::{CommandTool, DeviceState, OtaOptions, OtaUpdate, RunResult, StateLog};
use deep_ota::Prepared;

#[derive(Parser)]
#[command(name = "deep-ota", version)]
#[command(about = "Push new firmware to a deep-sleep device once it confirms it is awake")]
struct Cli {
    /// Device name, as registered in the configuration file
    device: String,

    /// Maximum time to wait for the device, in seconds
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    timeout: u64,

    /// Configuration file [default: <config dir>/deep-ota/config.toml]
    #[arg(short, long, env = "DEEP_OTA_CONFIG")]
    config: Option<PathBuf>,

    /// Print [<device>,<STATE>] progress lines on stdout
    #[arg(short = 's', long)]
    report_states: bool,

    /// Increase log verbosity (-v debug, -vv trace including libraries)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit 1; status 2 is reserved for a device timeout.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if let Err(e) = deep_ota::logging::init(&cli.device, level) {
        eprintln!("Unable to initialize logging: {e}");
    }

    let result = run(&cli).await;
    ExitCode::from(RunResult::from(&result).exit_code())
}

async fn run(cli: &Cli) -> deep_ota::Result<()> {
    let Prepared {
        settings,
        device,
        broker,
    } = match prepare(cli) {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("{}", e);
            let mut states = StateLog::new(&cli.device, cli.report_states);
            states.record(DeviceState::Error);
            states.record(DeviceState::End);
            return Err(e);
        }
    };

    let mut options = OtaOptions::from_settings(&settings).with_timeout_secs(cli.timeout);
    if cli.report_states {
        options = options.report_states();
    }

    let tool = CommandTool::new(&settings.build);

    OtaUpdate::new(broker, tool, device, options).run().await
}

fn prepare(cli: &Cli) -> deep_ota::Result<Prepared> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    deep_ota::prepare(&path, &cli.device)
}
