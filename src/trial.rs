use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::arbiter::{ArbiterStats, SharedChannelArbiter};
use crate::config::{ProbeConfig, ReceiveMode, SocketConfig};
use crate::models::domain::{BurstRecord, TrialResult, WorkerId};
use crate::probe::{sleep_unless_interrupted, TrialRun, TrialRunner};
use crate::receiver::{ReceiveChannel, ReceiveError, ReceiverWorker, WorkerExit};
use crate::stats::StatsAggregator;

/// Opens the receive channel for one trial according to the configured mode.
pub fn open_channel(config: &SocketConfig) -> Result<ReceiveChannel, ReceiveError> {
    match config.mode {
        ReceiveMode::Shared => Ok(ReceiveChannel::Shared(Arc::new(SharedChannelArbiter::bind(config)?))),
        ReceiveMode::PerWorker => Ok(ReceiveChannel::Dedicated(config.clone())),
    }
}

/// Receiver threads of one trial, all feeding one aggregator.
pub struct WorkerPool {
    handles: Vec<(WorkerId, JoinHandle<()>)>,
    exits: Receiver<(WorkerId, WorkerExit)>,
    cancel: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub cancelled: usize,
    pub failed: usize,
    /// Workers still running at the join deadline.
    pub abandoned: Vec<WorkerId>,
}

impl ShutdownSummary {
    /// Drops every record of an abandoned worker. Such a worker may still be
    /// flushing into the store after shutdown returned.
    pub fn retain_finished(&self, mut records: Vec<BurstRecord>) -> Vec<BurstRecord> {
        if !self.abandoned.is_empty() {
            records.retain(|record| !self.abandoned.contains(&record.worker_id));
        }
        records
    }
}

impl WorkerPool {
    pub fn spawn(count: usize, channel: &ReceiveChannel, config: &SocketConfig, stats: &StatsAggregator) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let (exit_tx, exits) = unbounded();
        let mut handles = Vec::with_capacity(count);

        for id in 1..=count {
            let worker = ReceiverWorker::new(id, config, stats.clone(), cancel.clone());
            let channel = channel.clone();
            let exit_tx: Sender<(WorkerId, WorkerExit)> = exit_tx.clone();
            let spawned = thread::Builder::new().name(format!("T{}", id)).spawn(move || {
                let exit = worker.start(&channel);
                // The pool may already have given up on us.
                let _ = exit_tx.send((id, exit));
            });
            match spawned {
                Ok(handle) => handles.push((id, handle)),
                Err(e) => error!("Failed to spawn worker T{}: {}", id, e),
            }
        }
        debug!("Started {} of {} workers", handles.len(), count);

        WorkerPool { handles, exits, cancel }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Raises the cancellation flag and waits up to `join_timeout` for the
    /// workers. Workers still running at the deadline are detached.
    pub fn shutdown(self, join_timeout: Duration) -> ShutdownSummary {
        self.cancel.store(true, Ordering::Release);

        let deadline = Instant::now() + join_timeout;
        let mut summary = ShutdownSummary::default();
        let mut exited = HashSet::new();
        while exited.len() < self.handles.len() {
            match self.exits.recv_deadline(deadline) {
                Ok((id, exit)) => {
                    match exit {
                        WorkerExit::Cancelled => summary.cancelled += 1,
                        WorkerExit::SetupFailed | WorkerExit::TransportFailed => summary.failed += 1,
                    }
                    exited.insert(id);
                }
                Err(_) => break,
            }
        }

        for (id, handle) in self.handles {
            if exited.contains(&id) {
                if handle.join().is_err() {
                    error!("Worker T{} panicked", id);
                }
            } else {
                warn!("Worker T{} did not stop within {:?}; abandoning it", id, join_timeout);
                summary.abandoned.push(id);
            }
        }
        summary
    }
}

/// Runs trials against a real UDP port.
pub struct SocketTrialRunner {
    socket: SocketConfig,
    probe: ProbeConfig,
    interrupt: Arc<AtomicBool>,
}

impl SocketTrialRunner {
    pub fn new(socket: SocketConfig, probe: ProbeConfig, interrupt: Arc<AtomicBool>) -> Self {
        SocketTrialRunner {
            socket,
            probe,
            interrupt,
        }
    }
}

impl TrialRunner for SocketTrialRunner {
    fn run_trial(&mut self, worker_count: usize) -> TrialRun {
        info!("Testing with {} workers on {}", worker_count, self.socket.bind_addr);

        // Fresh store per trial: stragglers from an earlier trial cannot reach it.
        let stats = StatsAggregator::new();
        let running = match open_channel(&self.socket) {
            Ok(channel) => {
                let pool = WorkerPool::spawn(worker_count, &channel, &self.socket, &stats);
                Some((channel, pool))
            }
            Err(e) => {
                error!("Could not open the receive channel: {}; trial runs without workers", e);
                None
            }
        };

        let warmed_up = sleep_unless_interrupted(&self.interrupt, self.probe.warmup);
        let mut window_start = ArbiterStats::default();
        if warmed_up {
            let discarded = stats.len();
            stats.clear();
            window_start = running
                .as_ref()
                .and_then(|(channel, _)| channel.contention())
                .unwrap_or_default();
            debug!("Discarded {} warm-up bursts", discarded);
        }
        let measured = warmed_up && sleep_unless_interrupted(&self.interrupt, self.probe.window);

        let mut contention = ArbiterStats::default();
        let mut summary = ShutdownSummary::default();
        if let Some((channel, pool)) = running {
            contention = channel.contention().unwrap_or_default().since(window_start);
            summary = pool.shutdown(self.probe.join_timeout);
            debug!(
                "Workers stopped: {} cancelled, {} failed, {} abandoned",
                summary.cancelled,
                summary.failed,
                summary.abandoned.len()
            );
        }
        if !measured {
            return TrialRun::Interrupted;
        }

        let records = summary.retain_finished(stats.snapshot());
        let trial = TrialResult::from_bursts(worker_count, self.probe.window, records).with_contention(contention);
        if trial.recv_attempts > 0 {
            info!(
                "Shared channel: {} receive attempts, {} gave up on the lock ({:.1}%)",
                trial.recv_attempts,
                trial.contended_attempts,
                trial.contention_ratio() * 100.0
            );
        }
        info!(
            "Trial complete: {} packets in {} bursts, {:.2} Mbps",
            trial.total_packets,
            trial.burst_records.len(),
            trial.aggregate_throughput_mbps
        );
        TrialRun::Completed(trial)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, UdpSocket};
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::receiver::{DatagramSource, RecvOutcome};

    fn loopback_config(port: u16, mode: ReceiveMode) -> SocketConfig {
        SocketConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            recv_timeout: Duration::from_millis(10),
            idle_timeout: Duration::from_millis(50),
            broadcast: false,
            mode,
            ..SocketConfig::default()
        }
    }

    fn free_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    /// Sends `count` datagrams of `size` bytes to `port`, starting after `delay`.
    fn send_later(port: u16, delay: Duration, count: usize, size: usize) -> JoinHandle<()> {
        thread::spawn(move || {
            let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
            thread::sleep(delay);
            for _ in 0..count {
                sender.send_to(&vec![0x5A; size], ("127.0.0.1", port)).unwrap();
                thread::sleep(Duration::from_millis(2));
            }
        })
    }

    fn completed(run: TrialRun) -> TrialResult {
        match run {
            TrialRun::Completed(trial) => trial,
            TrialRun::Interrupted => panic!("trial was not interrupted"),
        }
    }

    /// Hands out one datagram, then blocks every later receive for `stall`
    /// without looking at the cancellation flag.
    struct StallingSource {
        calls: AtomicUsize,
        stall: Duration,
    }

    impl DatagramSource for StallingSource {
        fn recv(&self, _buf: &mut [u8]) -> Result<RecvOutcome, ReceiveError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(RecvOutcome::Datagram(100));
            }
            thread::sleep(self.stall);
            Ok(RecvOutcome::Timeout)
        }
    }

    #[test]
    fn shutdown_joins_idle_workers() {
        let config = loopback_config(free_port(), ReceiveMode::Shared);
        let channel = open_channel(&config).unwrap();
        let stats = StatsAggregator::new();
        let pool = WorkerPool::spawn(3, &channel, &config, &stats);
        assert_eq!(pool.len(), 3);

        let summary = pool.shutdown(Duration::from_secs(2));
        assert_eq!(
            summary,
            ShutdownSummary {
                cancelled: 3,
                failed: 0,
                abandoned: Vec::new()
            }
        );
        assert!(stats.is_empty());
    }

    #[test]
    fn per_worker_bind_failures_do_not_stop_the_pool() {
        let blocker = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut config = loopback_config(blocker.local_addr().unwrap().port(), ReceiveMode::PerWorker);
        config.reuse_address = false;
        let channel = open_channel(&config).unwrap();
        let stats = StatsAggregator::new();

        let summary = WorkerPool::spawn(2, &channel, &config, &stats).shutdown(Duration::from_secs(2));
        assert_eq!(summary.failed, 2);
        assert!(summary.abandoned.is_empty());
    }

    #[test]
    fn empty_pool_shuts_down_at_once() {
        let config = loopback_config(free_port(), ReceiveMode::PerWorker);
        let channel = open_channel(&config).unwrap();
        let pool = WorkerPool::spawn(0, &channel, &config, &StatsAggregator::new());
        assert!(pool.is_empty());
        assert_eq!(pool.shutdown(Duration::from_secs(2)), ShutdownSummary::default());
    }

    #[test]
    fn stuck_worker_is_abandoned_at_the_deadline() {
        let config = loopback_config(free_port(), ReceiveMode::Shared);
        let source = Arc::new(StallingSource {
            calls: AtomicUsize::new(0),
            stall: Duration::from_millis(500),
        });
        let stats = StatsAggregator::new();
        let pool = WorkerPool::spawn(1, &ReceiveChannel::Source(source), &config, &stats);
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        let summary = pool.shutdown(Duration::from_millis(100));
        let waited = started.elapsed();
        assert_eq!(summary.abandoned, vec![1]);
        assert_eq!(summary.cancelled, 0);
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(400), "shutdown waited {:?}", waited);

        // The stuck worker wakes up after shutdown and still writes its burst.
        let deadline = Instant::now() + Duration::from_secs(2);
        while stats.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(stats.len(), 1);
        assert!(summary.retain_finished(stats.snapshot()).is_empty());
    }

    #[test]
    fn only_abandoned_workers_lose_their_records() {
        let summary = ShutdownSummary {
            cancelled: 2,
            failed: 0,
            abandoned: vec![2],
        };
        let records = vec![
            BurstRecord::new(1, 0.0, 1.0, 4, 400),
            BurstRecord::new(2, 0.0, 1.0, 9, 900),
            BurstRecord::new(3, 0.5, 1.0, 1, 100),
        ];
        let kept = summary.retain_finished(records);
        let workers: Vec<_> = kept.iter().map(|r| r.worker_id).collect();
        assert_eq!(workers, vec![1, 3]);
    }

    #[test]
    fn interrupted_trial_is_not_reported() {
        let config = loopback_config(free_port(), ReceiveMode::Shared);
        let timing = ProbeConfig {
            warmup: Duration::from_secs(5),
            join_timeout: Duration::from_secs(1),
            ..ProbeConfig::default()
        };
        let mut runner = SocketTrialRunner::new(config, timing, Arc::new(AtomicBool::new(true)));
        assert_eq!(runner.run_trial(2), TrialRun::Interrupted);
    }

    #[test]
    fn trial_without_traffic_has_no_signal() {
        let config = loopback_config(free_port(), ReceiveMode::Shared);
        let timing = ProbeConfig {
            warmup: Duration::ZERO,
            window: Duration::from_millis(100),
            join_timeout: Duration::from_secs(1),
            ..ProbeConfig::default()
        };
        let mut runner = SocketTrialRunner::new(config, timing, Arc::new(AtomicBool::new(false)));
        let trial = completed(runner.run_trial(2));
        assert_eq!(trial.worker_count, 2);
        assert!(!trial.has_signal());
        // Two workers polling a 10 ms receive timeout for 100 ms.
        assert!(trial.recv_attempts > 0);
        assert!(trial.contended_attempts <= trial.recv_attempts);
    }

    #[test]
    fn dedicated_sockets_report_no_contention() {
        let config = loopback_config(free_port(), ReceiveMode::PerWorker);
        let timing = ProbeConfig {
            warmup: Duration::ZERO,
            window: Duration::from_millis(100),
            join_timeout: Duration::from_secs(1),
            ..ProbeConfig::default()
        };
        let mut runner = SocketTrialRunner::new(config, timing, Arc::new(AtomicBool::new(false)));
        let trial = completed(runner.run_trial(2));
        assert_eq!((trial.recv_attempts, trial.contended_attempts), (0, 0));
    }

    #[test]
    fn warmup_traffic_is_discarded() {
        let port = free_port();
        let timing = ProbeConfig {
            warmup: Duration::from_millis(600),
            window: Duration::from_millis(300),
            join_timeout: Duration::from_secs(1),
            ..ProbeConfig::default()
        };
        let mut runner = SocketTrialRunner::new(
            loopback_config(port, ReceiveMode::Shared),
            timing,
            Arc::new(AtomicBool::new(false)),
        );
        // 50 datagrams between roughly 100 ms and 200 ms into the warm-up.
        let sender = send_later(port, Duration::from_millis(100), 50, 100);
        let trial = completed(runner.run_trial(2));
        sender.join().unwrap();

        assert_eq!(trial.total_packets, 0);
        assert!(trial.burst_records.is_empty());
    }

    #[test]
    fn window_traffic_is_counted_without_warmup() {
        let port = free_port();
        let timing = ProbeConfig {
            warmup: Duration::ZERO,
            window: Duration::from_millis(600),
            join_timeout: Duration::from_secs(1),
            ..ProbeConfig::default()
        };
        let mut runner = SocketTrialRunner::new(
            loopback_config(port, ReceiveMode::Shared),
            timing,
            Arc::new(AtomicBool::new(false)),
        );
        let sender = send_later(port, Duration::from_millis(100), 50, 100);
        let trial = completed(runner.run_trial(2));
        sender.join().unwrap();

        assert_eq!(trial.total_packets, 50);
        assert_eq!(trial.total_bytes, 5000);
    }
}
