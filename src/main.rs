//! Binary entry point for the Flashsoak CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use flashsoak::{
    CommandFormatter, ConfigError, Device, DeviceIo, DeviceParseError, DeviceStatus, FleetError,
    FleetSupervisor, FormatterKind, FsDeviceIo, RunState, SoakConfig, StopMode, TracingLog,
    WipeFormatter,
};

mod cli;

use cli::{Cli, RunCommand};

/// How often the binary checks whether every device has finished.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Exit status when at least one device ended in the fatal state.
const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Device(#[from] DeviceParseError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("fleet error: {0}")]
    Fleet(#[from] FleetError),
    #[error("failed to write summary: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Run(command) => run_command(command).await,
    }
}

async fn run_command(args: RunCommand) -> Result<i32, CliError> {
    let devices = parse_devices(&args.devices)?;
    let config = resolve_config(&args)?;
    config.check_devices(&devices)?;
    let io = build_io(&config)?;

    let fleet = FleetSupervisor::new(io, config.stagger_interval())?;
    for device in devices {
        let log = Arc::new(TracingLog::new(device.id.as_str()));
        let settings = config.settings_for(log)?;
        fleet.register(device, settings)?;
    }
    for status in fleet.statuses() {
        fleet.request_start(&status.device)?;
    }

    tokio::select! {
        () = fleet.wait_until_idle(IDLE_POLL) => {
            tracing::info!("every device has finished");
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                tracing::warn!(error = %err, "failed to listen for interrupt");
            }
            tracing::info!("interrupt received, stopping all devices");
        }
    }
    shutdown(&fleet).await;

    let statuses = fleet.statuses();
    write_summary(io::stdout().lock(), &statuses, args.json)?;
    Ok(exit_code(&statuses))
}

fn parse_devices(specs: &[String]) -> Result<Vec<Device>, CliError> {
    specs
        .iter()
        .map(|spec| spec.parse::<Device>().map_err(CliError::from))
        .collect()
}

fn resolve_config(args: &RunCommand) -> Result<SoakConfig, CliError> {
    let mut config = SoakConfig::load_without_cli_args()?;
    if let Some(source) = &args.source {
        config.source_dir = Some(source.clone());
    }
    if args.clean_start {
        config.clean_start = true;
    }
    config.validate()?;
    Ok(config)
}

fn build_io(config: &SoakConfig) -> Result<Arc<dyn DeviceIo>, CliError> {
    let io: Arc<dyn DeviceIo> = match config.formatter_kind()? {
        FormatterKind::Command => Arc::new(FsDeviceIo::new(
            CommandFormatter::with_process_runner(config.format_bin.clone()),
        )),
        FormatterKind::Wipe => Arc::new(FsDeviceIo::new(WipeFormatter)),
    };
    Ok(io)
}

async fn shutdown(fleet: &FleetSupervisor) {
    if let Err(err) = fleet.stop_all(StopMode::Graceful).await {
        tracing::warn!(error = %err, "graceful stop timed out, aborting workers");
        if let Err(forced) = fleet.stop_all(StopMode::Forced).await {
            tracing::error!(error = %forced, "forced stop failed");
        }
    }
}

fn exit_code(statuses: &[DeviceStatus]) -> i32 {
    if statuses
        .iter()
        .any(|status| status.state == RunState::Fatal)
    {
        EXIT_FATAL
    } else {
        0
    }
}

fn write_summary(
    mut target: impl Write,
    statuses: &[DeviceStatus],
    json: bool,
) -> Result<(), CliError> {
    let output = |err: io::Error| CliError::Output(err.to_string());
    if json {
        let rendered =
            serde_json::to_string_pretty(statuses).map_err(|err| CliError::Output(err.to_string()))?;
        writeln!(target, "{rendered}").map_err(output)?;
        return Ok(());
    }
    for status in statuses {
        writeln!(
            target,
            "{}\t{}\terrors={}\treads={}\twrites={}\trestarts={}",
            status.device,
            status.health,
            status.error_count,
            status.read_cycles,
            status.write_cycles,
            status.restarts
        )
        .map_err(output)?;
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
