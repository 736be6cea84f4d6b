use std::io::{self, BufRead, Write};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tracing::{error, info};

use crate::config::{parse_worker_count, ConfigError, SocketConfig};
use crate::models::domain::BurstRecord;
use crate::probe::sleep_unless_interrupted;
use crate::stats::StatsAggregator;
use crate::trial::{open_channel, WorkerPool};

/// Asks the operator for a worker count on stdin.
pub fn prompt_worker_count() -> Result<usize, Box<dyn std::error::Error>> {
    print!("Enter the number of workers: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(parse_worker_count(&line)?)
}

/// Receives with `workers` workers until `interrupt` is raised and returns
/// every burst ordered by start time.
pub fn listen(
    config: &SocketConfig,
    workers: usize,
    join_timeout: Duration,
    interrupt: &AtomicBool,
) -> Result<Vec<BurstRecord>, Box<dyn std::error::Error>> {
    if workers == 0 {
        return Err(ConfigError::ZeroCount("worker count").into());
    }
    let stats = StatsAggregator::new();
    let pool = match open_channel(config) {
        Ok(channel) => WorkerPool::spawn(workers, &channel, config, &stats),
        Err(e) => {
            error!("Could not open the receive channel: {}", e);
            return Err(e.into());
        }
    };
    if pool.is_empty() {
        return Err("no worker thread could be started".into());
    }
    info!(
        "Listening for broadcasts on {} with {} workers. Press Ctrl+C to stop...",
        config.bind_addr,
        pool.len()
    );

    while sleep_unless_interrupted(interrupt, Duration::from_secs(1)) {}
    info!("Interrupted, stopping workers...");
    let summary = pool.shutdown(join_timeout);

    let mut records = summary.retain_finished(stats.snapshot());
    records.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
    Ok(records)
}
