//! Multi-Connectivity UE Simulator
//!
//! Runs one dual-connectivity UE scenario in virtual time and prints a
//! JSON summary of the PDCP and NAS behaviour.

mod config;
mod scenario;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use config::ScenarioConfig;
use scenario::Scenario;

/// Multi-connectivity UE PDCP/NAS simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to scenario file (YAML, or TOML with a .toml extension)
    #[arg(short, long, default_value = "ue/config/mc_ue.yml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the scenario
    #[arg(short, long)]
    log_level: Option<String>,

    /// RNG seed for leg delay and loss
    #[arg(long)]
    seed: Option<u64>,

    /// Number of downlink packets
    #[arg(long)]
    packets: Option<u32>,

    /// Write the JSON summary to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ScenarioConfig::from_file(&args.config)?;
    if let Some(level) = args.log_level {
        config.log.all_level = level;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(packets) = args.packets {
        config.traffic.packets = packets;
    }

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.directives()));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_line_number(true)
        .init();

    info!("Starting multi-connectivity UE simulator");
    info!("Scenario file: {}", args.config.display());
    info!(
        "PDCP: {}-bit SN, t-Reordering {} ms, reordering {}",
        config.pdcp.sn_size, config.pdcp.t_reordering, config.pdcp.enable_reordering
    );
    info!(
        "Cells: primary {}, secondary {} and {}",
        config.primary.cell_id, config.first_secondary.cell_id, config.second_secondary.cell_id
    );
    info!(
        "Traffic: {} packets of {} bytes every {} ms, seed {}",
        config.traffic.packets, config.traffic.packet_size, config.traffic.interval_ms, config.seed
    );

    // The scenario is single threaded and runs to completion in virtual time
    let run = tokio::task::spawn_blocking(move || Scenario::new(config)?.run());

    let summary = tokio::select! {
        result = run => result??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Received shutdown signal, abandoning scenario");
            return Ok(());
        }
    };

    info!(
        "Final NAS state {}, {} SDUs delivered, {} discarded, {} reordering timeouts",
        summary.final_state,
        summary.pdcp.delivered_sdus,
        summary.pdcp.discarded_pdus,
        summary.pdcp.reordering_timeouts
    );

    let json = serde_json::to_string_pretty(&summary)?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, json)?;
            info!("Summary written to {}", path.display());
        }
        None => println!("{}", json),
    }

    Ok(())
}
