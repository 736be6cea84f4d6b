//! Adaptive search for the worker count with the best aggregate throughput.
//!
//! Trials run at `start, start + step, ...` workers. The first trial with any
//! signal sets the baseline; later trials either raise it, stay close enough
//! to move the optimum, or drop far enough below it to end the search.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::ProbeConfig;
use crate::models::domain::TrialResult;

/// Granularity at which long waits notice an interrupt.
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

/// Outcome of running one trial.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialRun {
    Completed(TrialResult),
    Interrupted,
}

/// Runs one measurement at a given worker count.
pub trait TrialRunner {
    fn run_trial(&mut self, worker_count: usize) -> TrialRun;
}

/// How one trial moved the search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// No baseline yet and the trial saw no traffic.
    NoSignal,
    /// First trial with traffic; it sets the baseline.
    Baseline,
    NewBest,
    /// Below the baseline but inside the tolerance band.
    NearBaseline { degradation: f64 },
    /// Below the band but not past the threshold.
    Acceptable { degradation: f64 },
    Degraded { degradation: f64 },
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::NoSignal => write!(f, "no signal"),
            Verdict::Baseline => write!(f, "baseline"),
            Verdict::NewBest => write!(f, "new best"),
            Verdict::NearBaseline { degradation } => write!(f, "near baseline (-{:.1}%)", degradation * 100.0),
            Verdict::Acceptable { degradation } => write!(f, "acceptable (-{:.1}%)", degradation * 100.0),
            Verdict::Degraded { degradation } => write!(f, "degraded (-{:.1}%)", degradation * 100.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    DegradationDetected { failed_at: usize },
    CeilingReached,
    Interrupted,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::DegradationDetected { .. } => "degradation-detected",
            Termination::CeilingReached => "ceiling-reached",
            Termination::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeStep {
    pub trial: TrialResult,
    pub verdict: Verdict,
}

/// Search state, touched only between trials.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationState {
    pub baseline_throughput: Option<f64>,
    pub optimal_worker_count: usize,
    pub history: Vec<ProbeStep>,
}

impl OptimizationState {
    pub fn new(start_workers: usize) -> Self {
        OptimizationState {
            baseline_throughput: None,
            optimal_worker_count: start_workers,
            history: Vec::new(),
        }
    }

    /// Folds a finished trial into the state and records it in the history.
    pub fn evaluate(&mut self, trial: TrialResult, config: &ProbeConfig) -> Verdict {
        let throughput = trial.aggregate_throughput_mbps;
        let workers = trial.worker_count;

        let verdict = match self.baseline_throughput {
            None if trial.has_signal() => {
                self.baseline_throughput = Some(throughput);
                self.optimal_worker_count = workers;
                Verdict::Baseline
            }
            None => Verdict::NoSignal,
            Some(baseline) => {
                let degradation = (baseline - throughput) / baseline;
                if degradation > config.degradation_threshold {
                    Verdict::Degraded { degradation }
                } else if throughput >= baseline {
                    self.baseline_throughput = Some(throughput);
                    self.optimal_worker_count = workers;
                    Verdict::NewBest
                } else if throughput >= baseline * (1.0 - config.tolerance_band()) {
                    self.optimal_worker_count = workers;
                    Verdict::NearBaseline { degradation }
                } else {
                    Verdict::Acceptable { degradation }
                }
            }
        };

        self.history.push(ProbeStep { trial, verdict });
        verdict
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub history: Vec<ProbeStep>,
    pub optimal_worker_count: usize,
    pub baseline_throughput_mbps: Option<f64>,
    pub termination: Termination,
}

pub struct ProbeController<R> {
    config: ProbeConfig,
    runner: R,
    interrupt: Arc<AtomicBool>,
}

impl<R: TrialRunner> ProbeController<R> {
    pub fn new(config: ProbeConfig, runner: R, interrupt: Arc<AtomicBool>) -> Self {
        ProbeController {
            config,
            runner,
            interrupt,
        }
    }

    pub fn run(&mut self) -> ProbeReport {
        let config = &self.config;
        info!(
            "Probing worker counts {}..={} in steps of {}, degradation threshold {:.0}%",
            config.start_workers,
            config.max_workers,
            config.worker_step,
            config.degradation_threshold * 100.0
        );

        let mut state = OptimizationState::new(self.config.start_workers);
        let mut current = self.config.start_workers;

        let termination = loop {
            if self.interrupt.load(Ordering::SeqCst) {
                break Termination::Interrupted;
            }

            let trial = match self.runner.run_trial(current) {
                TrialRun::Completed(trial) => trial,
                TrialRun::Interrupted => break Termination::Interrupted,
            };
            let throughput = trial.aggregate_throughput_mbps;
            let packets = trial.total_packets;

            match state.evaluate(trial, &self.config) {
                Verdict::NoSignal => {
                    warn!("No throughput with {} workers; is the sender running?", current)
                }
                Verdict::Baseline => {
                    info!("Baseline established: {:.2} Mbps with {} workers", throughput, current)
                }
                Verdict::NewBest => {
                    info!("New best throughput: {:.2} Mbps with {} workers", throughput, current)
                }
                Verdict::Degraded { degradation } => {
                    warn!(
                        "Degradation detected: throughput dropped {:.1}% with {} workers",
                        degradation * 100.0,
                        current
                    );
                    break Termination::DegradationDetected { failed_at: current };
                }
                verdict => info!("{:.2} Mbps, {} packets with {} workers: {}", throughput, packets, current, verdict),
            }

            match current.checked_add(self.config.worker_step) {
                Some(next) if next <= self.config.max_workers => current = next,
                _ => {
                    info!("Reached the ceiling of {} workers", self.config.max_workers);
                    break Termination::CeilingReached;
                }
            }
            if !sleep_unless_interrupted(&self.interrupt, self.config.trial_pause) {
                break Termination::Interrupted;
            }
        };

        info!("Optimal worker count: {} ({})", state.optimal_worker_count, termination);
        ProbeReport {
            history: state.history,
            optimal_worker_count: state.optimal_worker_count,
            baseline_throughput_mbps: state.baseline_throughput,
            termination,
        }
    }

    pub fn into_runner(self) -> R {
        self.runner
    }
}

/// Sleeps for `duration`; returns false if the interrupt flag was raised first.
pub fn sleep_unless_interrupted(interrupt: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if interrupt.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(INTERRUPT_POLL));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::models::domain::BurstRecord;

    /// Plays back a list of throughputs, one per trial.
    struct ScriptedRunner {
        throughputs: VecDeque<f64>,
        requested: Vec<usize>,
        interrupt_after: Option<(usize, Arc<AtomicBool>)>,
    }

    impl ScriptedRunner {
        fn new(throughputs: &[f64]) -> Self {
            ScriptedRunner {
                throughputs: throughputs.iter().copied().collect(),
                requested: Vec::new(),
                interrupt_after: None,
            }
        }
    }

    impl TrialRunner for ScriptedRunner {
        fn run_trial(&mut self, worker_count: usize) -> TrialRun {
            self.requested.push(worker_count);
            if let Some((after, flag)) = &self.interrupt_after {
                if self.requested.len() > *after {
                    flag.store(true, Ordering::SeqCst);
                    return TrialRun::Interrupted;
                }
            }
            let mbps = self.throughputs.pop_front().unwrap_or(0.0);
            TrialRun::Completed(trial(worker_count, mbps))
        }
    }

    fn trial(worker_count: usize, mbps: f64) -> TrialResult {
        let mut bursts = Vec::new();
        if mbps > 0.0 {
            // One second carrying `mbps` mebibits.
            let bytes = (mbps * 1024.0 * 1024.0 / 8.0) as usize;
            bursts.push(BurstRecord::new(1, 0.0, 1.0, 10, bytes));
        }
        TrialResult::from_bursts(worker_count, Duration::from_secs(7), bursts)
    }

    fn config(start: usize, step: usize, max: usize) -> ProbeConfig {
        ProbeConfig {
            start_workers: start,
            worker_step: step,
            max_workers: max,
            degradation_threshold: 0.15,
            trial_pause: Duration::ZERO,
            ..ProbeConfig::default()
        }
    }

    fn search(config: ProbeConfig, throughputs: &[f64]) -> (ProbeReport, Vec<usize>) {
        let mut controller = ProbeController::new(
            config,
            ScriptedRunner::new(throughputs),
            Arc::new(AtomicBool::new(false)),
        );
        let report = controller.run();
        (report, controller.into_runner().requested)
    }

    #[test]
    fn degradation_stops_at_last_good_count() {
        let (report, requested) = search(config(4, 5, 50), &[100.0, 80.0]);
        assert_eq!(requested, vec![4, 9]);
        assert_eq!(report.termination, Termination::DegradationDetected { failed_at: 9 });
        assert_eq!(report.optimal_worker_count, 4);
        assert!(matches!(report.history[1].verdict, Verdict::Degraded { degradation } if (degradation - 0.2).abs() < 1e-3));
    }

    #[test]
    fn improvement_raises_baseline_and_continues() {
        let mut state = OptimizationState::new(4);
        let config = config(4, 5, 50);
        assert_eq!(state.evaluate(trial(4, 100.0), &config), Verdict::Baseline);
        assert_eq!(state.evaluate(trial(9, 105.0), &config), Verdict::NewBest);
        assert_eq!(state.optimal_worker_count, 9);
        let baseline = state.baseline_throughput.unwrap();
        assert!((baseline - 105.0).abs() < 1e-3);

        let rising: Vec<f64> = (0..10).map(|i| 100.0 + 5.0 * i as f64).collect();
        let (report, requested) = search(config, &rising);
        assert_eq!(requested.len(), 10, "search continues up to the ceiling");
        assert_eq!(report.optimal_worker_count, 49);
        assert_eq!(report.termination, Termination::CeilingReached);
    }

    #[test]
    fn zero_first_trial_leaves_baseline_unset() {
        let config = config(5, 5, 50);
        let mut state = OptimizationState::new(5);
        assert_eq!(state.evaluate(trial(5, 0.0), &config), Verdict::NoSignal);
        assert_eq!(state.baseline_throughput, None);
        assert_eq!(state.optimal_worker_count, 5);

        let (report, requested) = search(config, &[0.0, 0.0, 50.0, 48.0, 20.0]);
        assert_eq!(requested, vec![5, 10, 15, 20, 25]);
        assert_eq!(report.history[0].verdict, Verdict::NoSignal);
        assert_eq!(report.history[2].verdict, Verdict::Baseline);
        // 48 is within 5% of 50, so it moves the optimum without raising the baseline.
        assert!(matches!(report.history[3].verdict, Verdict::NearBaseline { .. }));
        assert_eq!(report.optimal_worker_count, 20);
        assert_eq!(report.termination, Termination::DegradationDetected { failed_at: 25 });
        assert!((report.baseline_throughput_mbps.unwrap() - 50.0).abs() < 1e-3);
    }

    #[test]
    fn band_between_tolerance_and_threshold_keeps_optimum() {
        let config = config(5, 5, 50);
        let mut state = OptimizationState::new(5);
        state.evaluate(trial(5, 100.0), &config);
        let verdict = state.evaluate(trial(10, 90.0), &config);
        assert!(matches!(verdict, Verdict::Acceptable { .. }));
        assert_eq!(state.optimal_worker_count, 5);
        assert!((state.baseline_throughput.unwrap() - 100.0).abs() < 1e-3);
    }

    #[test]
    fn degradation_is_measured_against_raised_baseline() {
        // 84 is within 15% of the first baseline but not of the raised one.
        let (report, _) = search(config(5, 5, 50), &[80.0, 100.0, 84.0]);
        assert_eq!(report.termination, Termination::DegradationDetected { failed_at: 15 });
        assert_eq!(report.optimal_worker_count, 10);
    }

    #[test]
    fn optimal_is_never_a_degraded_count() {
        let scripts: &[&[f64]] = &[
            &[100.0, 50.0],
            &[10.0, 20.0, 40.0, 10.0],
            &[0.0, 100.0, 99.0, 98.0, 97.0, 60.0],
            &[100.0, 0.0],
        ];
        for script in scripts {
            let (report, _) = search(config(1, 1, 50), script);
            let Termination::DegradationDetected { failed_at } = report.termination else {
                panic!("script {script:?} should degrade");
            };
            assert_ne!(report.optimal_worker_count, failed_at);
            assert!(report.optimal_worker_count < failed_at);
            for step in &report.history {
                if matches!(step.verdict, Verdict::Degraded { .. }) {
                    assert_ne!(step.trial.worker_count, report.optimal_worker_count);
                }
            }
        }
    }

    #[test]
    fn ceiling_stops_the_search() {
        let (report, requested) = search(config(5, 5, 15), &[10.0, 10.0, 10.0, 10.0]);
        assert_eq!(requested, vec![5, 10, 15]);
        assert_eq!(report.termination, Termination::CeilingReached);
        assert_eq!(report.optimal_worker_count, 15);
        assert_eq!(report.history.len(), 3);
    }

    #[test]
    fn step_past_usize_max_is_the_ceiling() {
        let (report, requested) = search(config(usize::MAX - 1, 5, usize::MAX), &[10.0]);
        assert_eq!(requested, vec![usize::MAX - 1]);
        assert_eq!(report.termination, Termination::CeilingReached);
        assert_eq!(report.optimal_worker_count, usize::MAX - 1);
    }

    #[test]
    fn interruption_keeps_history() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut runner = ScriptedRunner::new(&[10.0, 12.0, 14.0]);
        runner.interrupt_after = Some((2, flag.clone()));
        let mut controller = ProbeController::new(config(5, 5, 50), runner, flag);
        let report = controller.run();
        assert_eq!(report.termination, Termination::Interrupted);
        assert_eq!(report.history.len(), 2);
        assert_eq!(report.optimal_worker_count, 10);
    }

    #[test]
    fn sleep_returns_early_on_interrupt() {
        let flag = AtomicBool::new(true);
        let started = Instant::now();
        assert!(!sleep_unless_interrupted(&flag, Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(sleep_unless_interrupted(&AtomicBool::new(false), Duration::from_millis(10)));
    }
}
