//! Redfire Clocksync main application

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use redfire_clocksync::{
    config::SyncConfig,
    core::params::ClockParameters,
    services::{ReplayStampSource, SimulatedStampSource, SyncEvent, SyncService},
    testing::{SimulatorConfig, StampSimulator},
    utils::setup_logging,
};

#[derive(Parser)]
#[command(name = "redfire-clocksync")]
#[command(about = "Bidirectional feed-forward clock synchronization")]
#[command(version = redfire_clocksync::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the configuration
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run recorded stamps (JSON lines) through the engine
    Replay {
        /// Stamp file
        #[arg(short, long)]
        input: PathBuf,
        /// Write per-stamp diagnostics here (JSON lines)
        #[arg(short, long)]
        diagnostics: Option<PathBuf>,
        /// Save the final engine state here
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Generate synthetic stamps and run them through the engine
    Simulate {
        /// Number of stamps
        #[arg(short = 'n', long, default_value_t = 2000)]
        count: u64,
        /// Random seed
        #[arg(short, long, default_value_t = 1)]
        seed: u64,
        /// Seconds between exchanges
        #[arg(long, default_value_t = 16.0)]
        poll_period: f64,
        /// Mean queueing delay per direction, seconds
        #[arg(long, default_value_t = 50e-6)]
        queueing: f64,
        /// Also write the generated stamps here (JSON lines)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration
    ValidateConfig,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = load_configuration(&cli)?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    // Setup logging
    let _log_guard = setup_logging(&config.logging).context("failed to set up logging")?;

    info!("Starting {} v{}", redfire_clocksync::NAME, redfire_clocksync::VERSION);

    match cli.command {
        Commands::Replay {
            input,
            diagnostics,
            snapshot,
        } => replay(config, input, diagnostics, snapshot).await,
        Commands::Simulate {
            count,
            seed,
            poll_period,
            queueing,
            output,
        } => {
            let simulator = SimulatorConfig {
                counter_hz: config.estimator.counter_frequency_hz,
                poll_period,
                queueing_mean: queueing,
                seed,
                ..SimulatorConfig::default()
            };
            simulate(config, simulator, count, output).await
        }
        Commands::ValidateConfig => validate_configuration(&config),
        Commands::GenerateConfig { output } => generate_default_config(output),
    }
}

fn load_configuration(cli: &Cli) -> anyhow::Result<SyncConfig> {
    let config = if let Some(config_path) = &cli.config {
        SyncConfig::load_from_file(config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?
    } else {
        SyncConfig::load_from_env().unwrap_or_else(|_| SyncConfig::default_config())
    };

    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn replay(
    mut config: SyncConfig,
    input: PathBuf,
    diagnostics: Option<PathBuf>,
    snapshot: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(path) = diagnostics {
        config.service.telemetry_file = Some(path.to_string_lossy().into_owned());
    }

    let mut service = SyncService::new(config)?;
    let event_task = spawn_event_logger(&mut service)?;

    let mut source = ReplayStampSource::open(&input)
        .await
        .with_context(|| format!("failed to open {}", input.display()))?;
    let processed = service.run(&mut source).await?;

    if let Some(path) = snapshot {
        std::fs::write(&path, service.snapshot().await?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("Engine state saved to {}", path.display());
    }

    report(&service, processed).await?;
    drop(service);
    let _ = event_task.await;
    Ok(())
}

async fn simulate(
    config: SyncConfig,
    simulator: SimulatorConfig,
    count: u64,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(path) = &output {
        let mut file = std::io::BufWriter::new(
            std::fs::File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        );
        for stamp in StampSimulator::new(simulator.clone()).take(count as usize) {
            serde_json::to_writer(&mut file, &stamp)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        info!("Wrote {} stamps to {}", count, path.display());
    }

    let mut service = SyncService::new(config)?;
    let event_task = spawn_event_logger(&mut service)?;

    let mut source = SimulatedStampSource::new(simulator, Some(count));
    let processed = service.run(&mut source).await?;
    let true_period = source.simulator().true_period();

    if let Some(params) = service.parameters().await {
        let error = (params.phat - true_period) / true_period;
        info!(relative_period_error = error, "Simulation finished");
    }
    report(&service, processed).await?;
    drop(service);
    let _ = event_task.await;
    Ok(())
}

/// Log events until the service (and every clone of it) is dropped.
fn spawn_event_logger(service: &mut SyncService) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let mut event_rx = service
        .take_event_receiver()
        .context("event receiver already taken")?;
    Ok(tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            handle_sync_event(event);
        }
    }))
}

fn handle_sync_event(event: SyncEvent) {
    match event {
        SyncEvent::PhaseChanged { index, phase } => {
            info!("Phase changed to {:?} at stamp {}", phase, index);
        }
        SyncEvent::ParametersUpdated { .. } | SyncEvent::Diagnostic { .. } => {}
        SyncEvent::SanityRejected { index, estimator } => {
            warn!("Sanity check rejected {} at stamp {}", estimator, index);
        }
        SyncEvent::LevelShift { shift } => {
            warn!(
                "Level shift at stamp {}: RTT baseline {} -> {} ticks",
                shift.index, shift.old_rtt_hat, shift.new_rtt_hat
            );
        }
        SyncEvent::Rollover { rollover } => {
            info!("History rollover at stamp {} ({:?})", rollover.index, rollover.kind);
        }
        SyncEvent::Reinitialized { reason } => {
            warn!("Engine reinitialized: {}", reason);
        }
    }
}

async fn report(service: &SyncService, processed: u64) -> anyhow::Result<()> {
    let stats = service.statistics().await;
    println!("Processed {} stamps ({} anomalous, {} rejected)", processed, stats.algo.anomalous, stats.stamps_rejected);
    println!(
        "Phase {:?}, {} rollovers, {} level shifts, {} sanity rejections",
        stats.phase, stats.algo.rollovers, stats.algo.level_shifts, stats.algo.sanity_rejections
    );

    match service.parameters().await {
        Some(params) => print_parameters(&params)?,
        None => {
            error!("No clock parameters were published");
            println!("No clock parameters published");
        }
    }
    Ok(())
}

fn print_parameters(params: &ClockParameters) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(params)?);
    println!("{}", serde_json::to_string_pretty(&params.to_ffclock())?);
    Ok(())
}

fn validate_configuration(config: &SyncConfig) -> anyhow::Result<()> {
    config.validate()?;

    let w = &config.windows;
    println!("✓ Configuration is valid");
    println!("  Peer: {}", config.general.peer_name);
    println!("  Counter frequency: {} Hz", config.estimator.counter_frequency_hz);
    println!(
        "  Windows: warmup {} shift {} plocal {} offset {} jsearch {} history {}",
        w.warmup_win, w.shift_win, w.plocal_win, w.offset_win, w.jsearch_win, w.history_win
    );
    println!("  Offset quality threshold: {:.1} us", config.estimator.eoffset_quality() * 1e6);

    Ok(())
}

fn generate_default_config(output_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = SyncConfig::default_config();
    let toml_content = toml::to_string_pretty(&config).context("failed to serialize config")?;

    match output_path {
        Some(path) => {
            std::fs::write(&path, toml_content)?;
            println!("✓ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", toml_content);
        }
    }

    Ok(())
}
