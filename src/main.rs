use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use log::error;

use zarrs_multiscale::{
    config::{PrecomputedConfig, RunConfig},
    convert,
    pool::{CommandLauncher, WorkerPool},
    precomputed,
};

/// Convert 3-D volumes into multiscale chunked stores.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write every configured source and composite into a multiscale store.
    Convert {
        /// JSON run configuration.
        config: PathBuf,
        /// Replace an existing store root.
        #[arg(long)]
        clobber: bool,
        /// Number of worker processes.
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Export one volume as a flat tiled layer.
    Precomputed {
        /// JSON export configuration.
        config: PathBuf,
        #[arg(long)]
        clobber: bool,
        /// Number of worker processes.
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Process a job file; launched by `convert`.
    #[command(hide = true)]
    Worker { job: PathBuf },
    /// Process an export job file; launched by `precomputed`.
    #[command(hide = true)]
    ExportWorker { job: PathBuf },
}

fn run(args: Args) -> zarrs_multiscale::Result<()> {
    match args.command {
        Command::Convert {
            config,
            clobber,
            workers,
        } => {
            let mut config = RunConfig::from_path(&config)?;
            config.clobber |= clobber;
            if let Some(n) = workers {
                config.workers = n;
            }
            let launcher = CommandLauncher::current_exe(["worker"])?;
            convert::run(&config, launcher)?;
        }
        Command::Precomputed {
            config,
            clobber,
            workers,
        } => {
            let mut config = PrecomputedConfig::from_path(&config)?;
            config.clobber |= clobber;
            if let Some(n) = workers {
                config.workers = n;
            }
            let launcher = CommandLauncher::current_exe(["export-worker"])?;
            let pool = WorkerPool::new(launcher, config.workers)?;
            precomputed::export_with_pool(&config, &pool)?;
        }
        Command::Worker { job } => convert::run_worker(&job)?,
        Command::ExportWorker { job } => precomputed::run_export_worker(&job)?,
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
