//! CLI entry point for the simulation harness: drives a simulated print tick by tick
//! and writes the progress trace as CSV.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use printlink_rs::device::{DeviceFacade, PrintPhase};
use printlink_rs::simulator::{SimulatedDevice, SimulatorSettings};

type HarnessError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Simulation Harness CLI
#[derive(Parser, Debug)]
#[command(name = "sim-harness", about = "Drive a simulated printer and trace its state.")]
pub struct Cli {
    /// Path to a TOML config file (simulator section is used)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Progress per tick, overrides the config
    #[arg(long)]
    rate: Option<u8>,

    /// Pause the print for TICKS ticks at tick AT (e.g. --pause 10:5)
    #[arg(long, value_parser = parse_pause)]
    pause: Option<PauseWindow>,

    /// Write CSV here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a print to completion (default)
    Run,
    /// Start a print, then stop it at the given tick
    Cancel { at: u64 },
}

/// Pause at tick `at`, resume once tick `until` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseWindow {
    at: u64,
    until: u64,
}

fn parse_pause(s: &str) -> Result<PauseWindow, String> {
    let (at, ticks) = s
        .split_once(':')
        .ok_or_else(|| format!("Invalid AT:TICKS: no `:` found in '{}'.", s))?;
    let at: u64 = at.parse().map_err(|e| format!("Invalid tick '{}': {}", at, e))?;
    let ticks: u64 = ticks.parse().map_err(|e| format!("Invalid tick count '{}': {}", ticks, e))?;
    if ticks == 0 {
        return Err("Pause must last at least one tick.".to_string());
    }
    let until = at
        .checked_add(ticks)
        .ok_or_else(|| format!("Pause window {}+{} overflows.", at, ticks))?;
    Ok(PauseWindow { at, until })
}

/// Step the device one tick at a time until its print ends, one CSV row per tick.
/// Returns the last tick written.
async fn trace(
    device: &SimulatedDevice,
    pause: Option<PauseWindow>,
    cancel_at: Option<u64>,
    out: &mut dyn Write,
) -> Result<u64, HarnessError> {
    writeln!(out, "tick,phase,progress,layer,remaining_min,nozzle,bed")?;
    let mut tick = 0u64;
    loop {
        if let Some(window) = pause {
            let phase = device.get_status().await.print_phase;
            if tick == window.at && phase == PrintPhase::Printing {
                device.pause().await?;
            } else if tick >= window.until && phase == PrintPhase::Paused {
                device.resume().await?;
            }
        }
        if cancel_at == Some(tick) {
            device.stop().await?;
        }

        let state = device.get_status().await;
        writeln!(
            out,
            "{},{:?},{},{},{},{:.1},{:.1}",
            tick,
            state.print_phase,
            state.progress_percent,
            state.layer_current,
            state.remaining_minutes,
            state.nozzle_temp,
            state.bed_temp
        )?;
        if state.print_phase.is_terminal() {
            return Ok(tick);
        }
        device.advance(1);
        tick += 1;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), HarnessError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => printlink_rs::config::load_config(&path.to_string_lossy())?,
        None => printlink_rs::config::Config::default(),
    };
    let rate = cli.rate.unwrap_or(config.simulator.progress_per_tick);
    let device = SimulatedDevice::new(SimulatorSettings::manual(rate));

    let mut out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout()),
    };

    device.connect().await?;
    device
        .upload_file(&PathBuf::from("harness.3mf"), None)
        .await?;
    device.start_print("harness.3mf").await?;

    let cancel_at = match cli.command {
        Some(Commands::Cancel { at }) => Some(at),
        Some(Commands::Run) | None => None,
    };

    trace(&device, cli.pause, cancel_at, &mut out).await?;
    device.disconnect().await;
    Ok(())
}
