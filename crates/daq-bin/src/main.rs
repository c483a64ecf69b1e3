//! `scan-daq` command-line front end.
//!
//! Loads a scan set and a simulated beamline, then runs, previews or
//! limit-checks a scan against the simulated channels.
//!
//! # Usage
//!
//! Run the default scan twice and print the arrays:
//! ```bash
//! scan-daq run config/scan.toml --world config/mock_world.toml --passes 2
//! ```
//!
//! Check every planned point against the positioner limits:
//! ```bash
//! scan-daq check-limits config/scan.toml
//! ```
//!
//! Logs go to stderr. `--log-level` takes any `EnvFilter` directive and
//! overrides `RUST_LOG`; `--json-logs` switches to JSON lines.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod report;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use daq_core::ScanError;
use daq_driver_mock::{MockWorld, MockWorldConfig};
use daq_scan::{Phase, Scan, ScanArena, ScanControl, ScanSetConfig};
use report::{render_preview, PassReport};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scan-daq")]
#[command(about = "Multi-axis scan engine driven against simulated channels", long_about = None)]
struct Cli {
    /// Log filter, e.g. "info" or "daq_scan=debug" (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Setup {
    /// Scan set configuration (TOML)
    scans: PathBuf,

    /// Simulated channels (TOML)
    #[arg(long, default_value = "config/mock_world.toml")]
    world: PathBuf,

    /// Scan to use; defaults to the first outermost scan
    #[arg(long)]
    scan: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run passes and print the acquired arrays
    Run {
        #[command(flatten)]
        setup: Setup,

        /// Number of passes
        #[arg(long, default_value_t = 1)]
        passes: u32,

        /// Give up (and kill every scan) after this many seconds per pass
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Print reports as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check every planned point against the positioner limits
    CheckLimits {
        #[command(flatten)]
        setup: Setup,
    },

    /// Print planned positions without moving anything
    Preview {
        #[command(flatten)]
        setup: Setup,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref(), cli.json_logs)?;

    match cli.command {
        Commands::Run {
            setup,
            passes,
            timeout_secs,
            json,
        } => run(setup, passes, timeout_secs.map(Duration::from_secs), json).await,
        Commands::CheckLimits { setup } => check_limits(setup).await,
        Commands::Preview { setup, json } => preview(setup, json).await,
    }
}

fn init_logging(level: Option<&str>, json: bool) -> Result<()> {
    let filter = match level {
        Some(directive) => EnvFilter::try_new(directive)
            .with_context(|| format!("invalid log filter '{}'", directive))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

/// Build the simulated world and every scan of the set.
fn load(setup: &Setup) -> Result<(MockWorld, ScanArena)> {
    let scans = ScanSetConfig::load_from(&setup.scans)
        .with_context(|| format!("failed to load scans from {}", setup.scans.display()))?;
    let world_config = MockWorldConfig::load_from(&setup.world)?;
    let world = MockWorld::from_config(&world_config)?;
    let arena = ScanArena::build(&scans, &world).context("failed to build scans")?;

    for (_, scan) in arena.iter() {
        for role in scan.connections().missing() {
            tracing::warn!(scan = %scan.name(), %role, "channel not connected in the simulated world");
        }
    }
    Ok((world, arena))
}

fn select(arena: &ScanArena, name: Option<&str>) -> Result<Scan> {
    let scan = match name {
        Some(name) => arena.scan(name),
        None => arena.outermost().first().and_then(|id| arena.get(*id)),
    };
    scan.cloned().ok_or_else(|| match name {
        Some(name) => anyhow!("no scan named '{}'", name),
        None => anyhow!("the configuration defines no scans"),
    })
}

async fn run(setup: Setup, passes: u32, timeout: Option<Duration>, json: bool) -> Result<()> {
    let (_world, arena) = load(&setup)?;
    let scan = select(&arena, setup.scan.as_deref())?;
    let progress = tokio::spawn(log_progress(scan.clone()));

    let mut reports = Vec::new();
    for pass in 1..=passes {
        let mut outcomes = scan.subscribe_outcomes();
        scan.request_start()
            .with_context(|| format!("scan '{}' refused to start", scan.name()))?;

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        let outcome = tokio::select! {
            outcome = outcomes.recv() => outcome.context("scan closed its outcome channel")?,
            _ = signal::ctrl_c() => {
                tracing::warn!(scan = %scan.name(), "interrupted; aborting every scan");
                arena.abort_all();
                outcomes.recv().await.context("scan closed its outcome channel")?
            }
            _ = deadline => {
                let status = scan.status();
                arena.kill_all();
                return Err(anyhow!(
                    "pass {} of '{}' did not finish within {:?} (phase {}, {})",
                    pass,
                    scan.name(),
                    timeout.unwrap_or_default(),
                    status.phase,
                    status.message.trim()
                ));
            }
        };

        tracing::info!(
            scan = %outcome.scan,
            pass,
            points = outcome.points,
            aborted = outcome.aborted,
            "{}",
            outcome.message.trim()
        );
        let aborted = outcome.aborted;
        reports.push(PassReport::capture(&scan, pass, &outcome));
        if aborted {
            break;
        }
    }
    progress.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            print!("{}", report.render());
        }
    }
    Ok(())
}

/// Log every point and phase change of `scan`.
async fn log_progress(scan: Scan) {
    let mut status = scan.subscribe_status();
    let mut last = (Phase::Idle, 0);
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        if (current.phase, current.point) == last {
            continue;
        }
        if current.point != last.1 && current.busy {
            tracing::info!(scan = %current.scan, point = current.point, points = current.points, "progress");
        }
        tracing::debug!(scan = %current.scan, phase = %current.phase, message = %current.message.trim(), "status");
        last = (current.phase, current.point);
    }
}

async fn check_limits(setup: Setup) -> Result<()> {
    let (_world, arena) = load(&setup)?;
    let selected: Vec<Scan> = match setup.scan.as_deref() {
        Some(name) => vec![select(&arena, Some(name))?],
        None => arena.iter().map(|(_, scan)| scan.clone()).collect(),
    };

    let mut violations = 0;
    for scan in &selected {
        match scan.check_limits() {
            Ok(()) => println!("{}: {}", scan.name(), scan.status().message),
            Err(err @ ScanError::LimitViolation { .. }) => {
                violations += 1;
                println!("{}: {}", scan.name(), err);
            }
            Err(err) => return Err(err).context(format!("limit check of '{}' failed", scan.name())),
        }
    }
    if violations > 0 {
        return Err(anyhow!("{} scan(s) outside limits", violations));
    }
    Ok(())
}

async fn preview(setup: Setup, json: bool) -> Result<()> {
    let (_world, arena) = load(&setup)?;
    let scan = select(&arena, setup.scan.as_deref())?;
    let planned = scan.preview()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&planned)?);
    } else {
        print!("{}", render_preview(scan.name(), &planned));
    }
    Ok(())
}
