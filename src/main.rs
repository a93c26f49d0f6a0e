//! sluice - run a DAQ pipeline from a setup file.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Shared-memory DAQ pipeline runner
#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "Start live data capturing and processing from a setup file")]
#[command(version)]
struct Cli {
    /// Log filter when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline described by a setup YAML file
    Run {
        /// Path to the setup file
        setup: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log)),
        )
        .init();

    sluice::workers::register_builtin();

    match cli.command {
        Command::Run { setup } => {
            let plan = sluice::SetupPlan::load(&setup)
                .with_context(|| format!("loading setup '{}'", setup.display()))?;
            let summary = sluice::run(plan)?;
            println!(
                "Finished: {} events processed in {:.2}s",
                summary.events_processed,
                summary.elapsed.as_secs_f64()
            );
            for (name, code) in &summary.worker_exits {
                if *code != 0 {
                    println!("  worker {name} exited with code {code}");
                }
            }
        }
    }
    Ok(())
}
