pub mod domain {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use crate::arbiter::ArbiterStats;

    /// Bytes in one mebibit, the unit every throughput figure is reported in.
    const BITS_PER_MEBIBIT: f64 = 1024.0 * 1024.0;

    /// Elapsed time used for a burst whose first and last arrival coincide.
    pub const DEGENERATE_BURST_SECS: f64 = 1.0;

    /// Identifies one receiver worker inside a trial, starting at 1.
    pub type WorkerId = usize;

    /// One datagram seen by one worker.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct ArrivalEvent {
        pub worker_id: WorkerId,
        pub timestamp: f64,
        pub byte_size: usize,
    }

    /// A closed run of arrivals at one worker.
    #[derive(Debug, Clone, PartialEq)]
    pub struct BurstRecord {
        pub worker_id: WorkerId,
        pub start_time: f64,
        pub end_time: f64,
        pub packet_count: usize,
        pub byte_total: usize,
        pub throughput_mbps: f64,
    }

    impl BurstRecord {
        /// Builds a record and derives its throughput.
        ///
        /// A burst made of arrivals sharing one timestamp has no measurable
        /// duration, so its elapsed time is floored to [`DEGENERATE_BURST_SECS`].
        pub fn new(
            worker_id: WorkerId,
            start_time: f64,
            end_time: f64,
            packet_count: usize,
            byte_total: usize,
        ) -> Self {
            let end_time = end_time.max(start_time);
            let elapsed = end_time - start_time;
            let elapsed = if elapsed > 0.0 { elapsed } else { DEGENERATE_BURST_SECS };
            BurstRecord {
                worker_id,
                start_time,
                end_time,
                packet_count,
                byte_total,
                throughput_mbps: throughput_mbps(byte_total, elapsed),
            }
        }

        pub fn elapsed(&self) -> f64 {
            self.end_time - self.start_time
        }
    }

    /// Mebibits per second for `bytes` delivered over `elapsed_secs`.
    pub fn throughput_mbps(bytes: usize, elapsed_secs: f64) -> f64 {
        if elapsed_secs <= 0.0 {
            return 0.0;
        }
        bytes as f64 * 8.0 / BITS_PER_MEBIBIT / elapsed_secs
    }

    /// Running totals of the burst a segmenter is currently accumulating.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub struct WorkerState {
        pub burst_count: usize,
        pub burst_start: Option<f64>,
        pub burst_last: Option<f64>,
        pub byte_total: usize,
    }

    /// Everything measured at one worker count.
    #[derive(Debug, Clone, PartialEq)]
    pub struct TrialResult {
        pub worker_count: usize,
        /// Sum of every burst's own throughput.
        pub aggregate_throughput_mbps: f64,
        /// Total bytes over the measurement window; reported, never used in decisions.
        pub window_throughput_mbps: f64,
        pub total_packets: usize,
        pub total_bytes: usize,
        pub burst_records: Vec<BurstRecord>,
        /// Shared-channel lock counters over the window; zero with dedicated sockets.
        pub recv_attempts: u64,
        pub contended_attempts: u64,
    }

    impl TrialResult {
        pub fn from_bursts(worker_count: usize, window: Duration, burst_records: Vec<BurstRecord>) -> Self {
            let aggregate_throughput_mbps = burst_records.iter().map(|b| b.throughput_mbps).sum();
            let total_packets = burst_records.iter().map(|b| b.packet_count).sum();
            let total_bytes = burst_records.iter().map(|b| b.byte_total).sum();
            TrialResult {
                worker_count,
                aggregate_throughput_mbps,
                window_throughput_mbps: throughput_mbps(total_bytes, window.as_secs_f64()),
                total_packets,
                total_bytes,
                burst_records,
                recv_attempts: 0,
                contended_attempts: 0,
            }
        }

        pub fn with_contention(mut self, contention: ArbiterStats) -> Self {
            self.recv_attempts = contention.attempts;
            self.contended_attempts = contention.contended;
            self
        }

        /// Share of receive attempts that gave up waiting for the shared lock.
        pub fn contention_ratio(&self) -> f64 {
            if self.recv_attempts == 0 {
                return 0.0;
            }
            self.contended_attempts as f64 / self.recv_attempts as f64
        }

        pub fn has_signal(&self) -> bool {
            self.aggregate_throughput_mbps > 0.0
        }
    }

    pub fn current_timestamp() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }

}

pub mod dto {
    use serde::Serialize;

    use super::domain::{BurstRecord, TrialResult};
    use crate::probe::{ProbeReport, ProbeStep, Termination, Verdict};

    #[derive(Debug, Serialize, Clone)]
    pub struct BurstRecordDTO {
        pub worker_id: usize,
        pub start_time: f64,
        pub end_time: f64,
        pub packet_count: usize,
        pub byte_total: usize,
        pub throughput_mbps: f64,
    }

    impl From<&BurstRecord> for BurstRecordDTO {
        fn from(record: &BurstRecord) -> Self {
            BurstRecordDTO {
                worker_id: record.worker_id,
                start_time: record.start_time,
                end_time: record.end_time,
                packet_count: record.packet_count,
                byte_total: record.byte_total,
                throughput_mbps: record.throughput_mbps,
            }
        }
    }

    #[derive(Debug, Serialize, Clone)]
    pub struct TrialResultDTO {
        pub worker_count: usize,
        pub aggregate_throughput_mbps: f64,
        pub window_throughput_mbps: f64,
        pub total_packets: usize,
        pub total_bytes: usize,
        pub recv_attempts: u64,
        pub contended_attempts: u64,
        pub verdict: String,
        pub bursts: Vec<BurstRecordDTO>,
    }

    impl TrialResultDTO {
        fn new(trial: &TrialResult, verdict: &Verdict) -> Self {
            TrialResultDTO {
                worker_count: trial.worker_count,
                aggregate_throughput_mbps: trial.aggregate_throughput_mbps,
                window_throughput_mbps: trial.window_throughput_mbps,
                total_packets: trial.total_packets,
                total_bytes: trial.total_bytes,
                recv_attempts: trial.recv_attempts,
                contended_attempts: trial.contended_attempts,
                verdict: verdict.to_string(),
                bursts: trial.burst_records.iter().map(BurstRecordDTO::from).collect(),
            }
        }
    }

    impl From<&ProbeStep> for TrialResultDTO {
        fn from(step: &ProbeStep) -> Self {
            TrialResultDTO::new(&step.trial, &step.verdict)
        }
    }

    #[derive(Debug, Serialize, Clone)]
    pub struct ProbeReportDTO {
        pub optimal_worker_count: usize,
        pub baseline_throughput_mbps: Option<f64>,
        pub termination: String,
        pub failed_at: Option<usize>,
        pub history: Vec<TrialResultDTO>,
    }

    impl From<&ProbeReport> for ProbeReportDTO {
        fn from(report: &ProbeReport) -> Self {
            let failed_at = match report.termination {
                Termination::DegradationDetected { failed_at } => Some(failed_at),
                _ => None,
            };
            ProbeReportDTO {
                optimal_worker_count: report.optimal_worker_count,
                baseline_throughput_mbps: report.baseline_throughput_mbps,
                termination: report.termination.as_str().to_string(),
                failed_at,
                history: report.history.iter().map(TrialResultDTO::from).collect(),
            }
        }
    }
}
