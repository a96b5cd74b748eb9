// src/main.rs - Run one print workflow against a real or simulated printer
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use printlink_rs::config::{self, Config};
use printlink_rs::device::network::NetworkDevice;
use printlink_rs::device::DeviceFacade;
use printlink_rs::print_job::{JobRequest, ModelFormat, Outcome, ShapeParams};
use printlink_rs::simulator::SimulatedDevice;
use printlink_rs::workflow::{BasicMeshValidator, FileModelSource, WorkflowOrchestrator, WorkflowSettings};

/// Send a model to a printer and optionally follow the print to completion.
#[derive(Parser, Debug)]
#[command(name = "printlink", version, about)]
struct Cli {
    /// Model file to print
    model: PathBuf,

    /// Path to a TOML config file
    #[arg(short, long, default_value = "printlink.toml")]
    config: PathBuf,

    /// Upload the model to device storage
    #[arg(long)]
    upload: bool,

    /// Start printing after upload (implies --upload)
    #[arg(long)]
    start: bool,

    /// Follow the print until it finishes (implies --start)
    #[arg(long)]
    monitor: bool,

    /// Use the simulated printer regardless of config
    #[arg(long)]
    simulate: bool,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

fn load(cli: &Cli) -> Result<Config, config::ConfigError> {
    let mut config = if cli.config.exists() {
        config::load_config(&cli.config.to_string_lossy())?
    } else {
        tracing::info!("No config at {}, using defaults", cli.config.display());
        Config::default()
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());
    if cli.simulate {
        config.simulator.enabled = true;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO })
        .init();

    let config = load(&cli).map_err(|e| {
        tracing::error!("Configuration error: {}", e);
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;

    let device: Arc<dyn DeviceFacade> = if config.simulator.enabled {
        tracing::info!("Using simulated printer");
        Arc::new(SimulatedDevice::from_config(&config.simulator))
    } else {
        tracing::info!("Using printer at {} (serial {})", config.printer.host, config.printer.serial);
        Arc::new(NetworkDevice::new(&config))
    };

    let orchestrator = WorkflowOrchestrator::new(
        device,
        Arc::new(FileModelSource::new()),
        Arc::new(BasicMeshValidator),
        WorkflowSettings::from_config(&config.workflow),
    );

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let format = ModelFormat::from_path(&cli.model).unwrap_or(config.workflow.output_format);
    let monitor = cli.monitor || config.workflow.monitor;
    let start = cli.start || monitor || config.workflow.start;
    let mut request = JobRequest::new(ShapeParams::from_file(&cli.model), format);
    if cli.upload || config.workflow.upload {
        request = request.with_upload();
    }
    if start {
        request = request.with_start(monitor);
    }

    let result = orchestrator.run(request).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.outcome == Outcome::Failed {
        std::process::exit(1);
    }
    Ok(())
}
