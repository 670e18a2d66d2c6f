//! ovn-northd-sync - OVN northd reconciliation daemon
//!
//! Loads a northbound snapshot, reconciles it into a southbound database
//! and prints the southbound state as JSON.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use ovn_db::{NbDb, SbDb};
use ovn_northd_sync::{Northd, NorthdConfig};

/// OVN northd datapath and port binding reconciliation
#[derive(Parser, Debug)]
#[command(name = "ovn-northd-sync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Northbound database snapshot (JSON)
    #[arg(short = 'n', long)]
    nb_file: PathBuf,

    /// Initial southbound database snapshot (JSON)
    #[arg(short = 's', long)]
    sb_file: Option<PathBuf>,

    /// Northd configuration (JSON)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Enable VXLAN mode (overrides the configuration file)
    #[arg(long)]
    vxlan_mode: bool,

    /// Maximum number of passes per reconciliation
    #[arg(short = 'p', long, default_value = "8")]
    passes: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Keep running, reloading the northbound snapshot when it changes
    #[arg(long)]
    interval_ms: Option<u64>,
}

/// Initializes tracing, honoring `RUST_LOG` over `log_level`.
fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

fn load_config(args: &Args) -> Result<NorthdConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => NorthdConfig::default(),
    };
    if args.vxlan_mode {
        config.vxlan_mode = true;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn load_nb(path: &Path) -> Result<NbDb> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    NbDb::from_json(&text).with_context(|| format!("parsing {}", path.display()))
}

fn load_sb(path: Option<&Path>) -> Result<SbDb> {
    let Some(path) = path else {
        return Ok(SbDb::new());
    };
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    SbDb::from_json(&text).with_context(|| format!("parsing {}", path.display()))
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn reconcile(northd: &mut Northd, nb: &mut NbDb, sb: &mut SbDb, passes: usize) -> Result<()> {
    let reports = northd
        .run_until_quiescent(nb, sb, passes)
        .context("reconciliation pass failed")?;
    if let Some(last) = reports.last() {
        if last.changed {
            warn!(passes, "southbound database still changing after pass limit");
        }
        info!(
            passes = reports.len(),
            datapaths = last.datapaths,
            pending = last.pending_datapaths,
            port_bindings = last.port_bindings,
            "reconciliation complete"
        );
    }
    Ok(())
}

async fn watch(
    args: &Args,
    northd: &mut Northd,
    nb: &mut NbDb,
    sb: &mut SbDb,
    interval_ms: u64,
) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    let mut last_modified = modified(&args.nb_file);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let current = modified(&args.nb_file);
                let mut loaded = true;
                if current != last_modified {
                    last_modified = current;
                    match load_nb(&args.nb_file) {
                        Ok(reloaded) => {
                            info!(path = %args.nb_file.display(), "northbound snapshot reloaded");
                            *nb = reloaded;
                            northd.force_recompute();
                        }
                        Err(e) => {
                            error!(error = %e, "failed to reload northbound snapshot");
                            loaded = false;
                        }
                    }
                }
                if loaded {
                    if let Err(e) = reconcile(northd, nb, sb, args.passes) {
                        error!(error = %e, "reconciliation failed, retrying on next tick");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                return Ok(());
            }
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let mut nb = load_nb(&args.nb_file)?;
    let mut sb = load_sb(args.sb_file.as_deref())?;

    info!(
        nb = %args.nb_file.display(),
        vxlan = config.vxlan_mode,
        max_dp_key = config.max_dp_tunnel_id(),
        max_port_key = config.max_pb_tunnel_id(),
        "starting ovn-northd-sync"
    );

    let mut northd = Northd::new(config);
    reconcile(&mut northd, &mut nb, &mut sb, args.passes)?;

    if let Some(interval_ms) = args.interval_ms {
        watch(&args, &mut northd, &mut nb, &mut sb, interval_ms).await?;
    }
    northd.cleanup();

    println!("{}", sb.to_json_pretty().context("rendering southbound database")?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
