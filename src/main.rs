use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use burstprobe::config::{Cli, Command, ListenConfig, ProbeConfig, SocketConfig};
use burstprobe::listen::{listen, prompt_worker_count};
use burstprobe::probe::ProbeController;
use burstprobe::report::{render_bursts, render_json, render_report};
use burstprobe::trial::SocketTrialRunner;
use clap::Parser;
use dotenv::dotenv;
use tracing::warn;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let interrupt = Arc::new(AtomicBool::new(false));
    let interrupt_clone = interrupt.clone();
    ctrlc::set_handler(move || {
        if interrupt_clone.swap(true, Ordering::SeqCst) {
            warn!("Already shutting down");
        }
    })?;

    match cli.command {
        Command::Probe(args) => {
            let socket = SocketConfig::try_from(&args.socket)?;
            let probe = ProbeConfig::try_from(&args)?;
            let runner = SocketTrialRunner::new(socket, probe.clone(), interrupt.clone());
            let report = ProbeController::new(probe, runner, interrupt).run();
            if cli.json {
                println!("{}", render_json(&report)?);
            } else {
                print!("{}", render_report(&report));
            }
        }
        Command::Listen(args) => {
            let config = ListenConfig::try_from(&args)?;
            let workers = match config.workers {
                Some(workers) => workers,
                None => prompt_worker_count()?,
            };
            let records = listen(&config.socket, workers, config.join_timeout, &interrupt)?;
            if cli.json {
                let bursts: Vec<_> = records
                    .iter()
                    .map(burstprobe::models::dto::BurstRecordDTO::from)
                    .collect();
                println!("{}", serde_json::to_string_pretty(&bursts)?);
            } else {
                println!("\nSummary of burst throughputs:");
                print!("{}", render_bursts(&records));
            }
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "burstprobe=debug" } else { "burstprobe=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_thread_names(true).init();
}
