use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 5005;
pub const DEFAULT_RECV_BUFFER: usize = 256 * 1024;
pub const MAX_DATAGRAM_SIZE: usize = 65535;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must be between 1 and 65535")]
    InvalidPort,
    #[error("{0} must be at least 1")]
    ZeroCount(&'static str),
    #[error("starting worker count {start} exceeds the ceiling of {max}")]
    StartAboveCeiling { start: usize, max: usize },
    #[error("degradation threshold must be in (0, 1), got {0}")]
    InvalidThreshold(f64),
    #[error("near-baseline fraction must be in [0, 1], got {0}")]
    InvalidTolerance(f64),
    #[error("{name} must be a non-negative number of seconds, got {value}")]
    InvalidDuration { name: &'static str, value: f64 },
    #[error("{0} must be longer than zero")]
    ZeroDuration(&'static str),
    #[error("invalid worker count {0:?}")]
    InvalidWorkerCount(String),
}

/// How workers reach the port under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReceiveMode {
    /// One socket per trial, receives serialized through the arbiter.
    Shared,
    /// Every worker binds its own socket with address reuse.
    PerWorker,
}

/// What a worker does with a datagram larger than its receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OversizedPolicy {
    /// Count it as one datagram of the maximum datagram size.
    Cap,
    /// Treat it as a transport error and stop the worker.
    Error,
}

#[derive(Debug, Parser)]
#[command(name = "burstprobe", version)]
#[command(about = "Finds how many concurrent UDP receive workers one port sustains")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
    /// Log every burst (same as RUST_LOG=burstprobe=debug).
    #[arg(short, long, global = true)]
    pub verbose: bool,
    /// Print the final report as JSON instead of a table.
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search for the worker count with the best aggregate throughput.
    Probe(ProbeArgs),
    /// Run a fixed number of workers until Ctrl+C and print every burst.
    Listen(ListenArgs),
}

#[derive(Debug, Clone, Args)]
pub struct SocketArgs {
    /// Address to bind; the wildcard receives broadcasts on every interface.
    #[arg(long, env = "BURSTPROBE_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,
    #[arg(short, long, env = "BURSTPROBE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// SO_RCVBUF hint in bytes.
    #[arg(long, env = "BURSTPROBE_RECV_BUFFER", default_value_t = DEFAULT_RECV_BUFFER)]
    pub recv_buffer: usize,
    /// Do not set SO_BROADCAST.
    #[arg(long)]
    pub no_broadcast: bool,
    /// Do not set SO_REUSEADDR.
    #[arg(long)]
    pub no_reuse: bool,
    /// Seconds a single receive attempt may block.
    #[arg(long, env = "BURSTPROBE_RECV_TIMEOUT", default_value_t = 0.1)]
    pub recv_timeout: f64,
    /// Seconds of silence that close a burst.
    #[arg(long, env = "BURSTPROBE_IDLE_TIMEOUT", default_value_t = 1.0)]
    pub idle_timeout: f64,
    #[arg(long, default_value_t = MAX_DATAGRAM_SIZE)]
    pub max_datagram: usize,
    #[arg(long, value_enum, default_value_t = OversizedPolicy::Cap)]
    pub oversized: OversizedPolicy,
    #[arg(long, value_enum, env = "BURSTPROBE_MODE", default_value_t = ReceiveMode::Shared)]
    pub mode: ReceiveMode,
}

#[derive(Debug, Clone, Args)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub socket: SocketArgs,
    /// Worker count of the first trial.
    #[arg(long, env = "BURSTPROBE_START_WORKERS", default_value_t = 5)]
    pub start_workers: usize,
    /// Workers added after every trial.
    #[arg(long, env = "BURSTPROBE_STEP", default_value_t = 5)]
    pub step: usize,
    /// Stop once the worker count would exceed this.
    #[arg(long, env = "BURSTPROBE_MAX_WORKERS", default_value_t = 50)]
    pub max_workers: usize,
    /// Seconds measured per trial.
    #[arg(long, env = "BURSTPROBE_WINDOW", default_value_t = 7.0)]
    pub window: f64,
    /// Seconds discarded at the start of each trial.
    #[arg(long, env = "BURSTPROBE_WARMUP", default_value_t = 1.0)]
    pub warmup: f64,
    /// Fractional drop from the baseline that ends the search.
    #[arg(long, env = "BURSTPROBE_THRESHOLD", default_value_t = 0.15)]
    pub threshold: f64,
    /// Share of the threshold within which a trial still counts as near baseline.
    #[arg(long, default_value_t = DEFAULT_NEAR_BASELINE_FRACTION)]
    pub near_baseline: f64,
    /// Seconds to wait for workers to exit before abandoning them.
    #[arg(long, default_value_t = 2.0)]
    pub join_timeout: f64,
    /// Seconds to pause between trials.
    #[arg(long, default_value_t = 1.0)]
    pub pause: f64,
}

#[derive(Debug, Clone, Args)]
pub struct ListenArgs {
    #[command(flatten)]
    pub socket: SocketArgs,
    /// Number of workers; prompted for on stdin when omitted.
    #[arg(short, long, env = "BURSTPROBE_WORKERS")]
    pub workers: Option<usize>,
    #[arg(long, default_value_t = 2.0)]
    pub join_timeout: f64,
}

pub const DEFAULT_NEAR_BASELINE_FRACTION: f64 = 1.0 / 3.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SocketConfig {
    pub bind_addr: SocketAddr,
    pub recv_buffer_size: usize,
    pub broadcast: bool,
    pub reuse_address: bool,
    pub recv_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_datagram_size: usize,
    pub oversized: OversizedPolicy,
    pub mode: ReceiveMode,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            recv_buffer_size: DEFAULT_RECV_BUFFER,
            broadcast: true,
            reuse_address: true,
            recv_timeout: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(1),
            max_datagram_size: MAX_DATAGRAM_SIZE,
            oversized: OversizedPolicy::Cap,
            mode: ReceiveMode::Shared,
        }
    }
}

impl TryFrom<&SocketArgs> for SocketConfig {
    type Error = ConfigError;

    fn try_from(args: &SocketArgs) -> Result<Self, Self::Error> {
        if args.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if args.max_datagram == 0 {
            return Err(ConfigError::ZeroCount("max datagram size"));
        }
        Ok(SocketConfig {
            bind_addr: SocketAddr::new(args.bind, args.port),
            recv_buffer_size: args.recv_buffer,
            broadcast: !args.no_broadcast,
            reuse_address: !args.no_reuse,
            recv_timeout: positive_secs("receive timeout", args.recv_timeout)?,
            idle_timeout: positive_secs("idle timeout", args.idle_timeout)?,
            max_datagram_size: args.max_datagram,
            oversized: args.oversized,
            mode: args.mode,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    pub start_workers: usize,
    pub worker_step: usize,
    pub max_workers: usize,
    pub window: Duration,
    pub warmup: Duration,
    pub degradation_threshold: f64,
    pub near_baseline_fraction: f64,
    pub join_timeout: Duration,
    pub trial_pause: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            start_workers: 5,
            worker_step: 5,
            max_workers: 50,
            window: Duration::from_secs(7),
            warmup: Duration::from_secs(1),
            degradation_threshold: 0.15,
            near_baseline_fraction: DEFAULT_NEAR_BASELINE_FRACTION,
            join_timeout: Duration::from_secs(2),
            trial_pause: Duration::from_secs(1),
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_workers == 0 {
            return Err(ConfigError::ZeroCount("starting worker count"));
        }
        if self.worker_step == 0 {
            return Err(ConfigError::ZeroCount("worker step"));
        }
        if self.start_workers > self.max_workers {
            return Err(ConfigError::StartAboveCeiling {
                start: self.start_workers,
                max: self.max_workers,
            });
        }
        if !(self.degradation_threshold > 0.0 && self.degradation_threshold < 1.0) {
            return Err(ConfigError::InvalidThreshold(self.degradation_threshold));
        }
        if !(0.0..=1.0).contains(&self.near_baseline_fraction) {
            return Err(ConfigError::InvalidTolerance(self.near_baseline_fraction));
        }
        if self.window.is_zero() {
            return Err(ConfigError::ZeroDuration("measurement window"));
        }
        Ok(())
    }

    /// Fraction below the baseline that still moves the optimum.
    pub fn tolerance_band(&self) -> f64 {
        self.degradation_threshold * self.near_baseline_fraction
    }
}

impl TryFrom<&ProbeArgs> for ProbeConfig {
    type Error = ConfigError;

    fn try_from(args: &ProbeArgs) -> Result<Self, Self::Error> {
        let config = ProbeConfig {
            start_workers: args.start_workers,
            worker_step: args.step,
            max_workers: args.max_workers,
            window: secs("measurement window", args.window)?,
            warmup: secs("warm-up", args.warmup)?,
            degradation_threshold: args.threshold,
            near_baseline_fraction: args.near_baseline,
            join_timeout: secs("join timeout", args.join_timeout)?,
            trial_pause: secs("trial pause", args.pause)?,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Validated settings of the `listen` command.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenConfig {
    pub socket: SocketConfig,
    /// `None` means ask on stdin.
    pub workers: Option<usize>,
    pub join_timeout: Duration,
}

impl TryFrom<&ListenArgs> for ListenConfig {
    type Error = ConfigError;

    fn try_from(args: &ListenArgs) -> Result<Self, Self::Error> {
        if args.workers == Some(0) {
            return Err(ConfigError::ZeroCount("worker count"));
        }
        Ok(ListenConfig {
            socket: SocketConfig::try_from(&args.socket)?,
            workers: args.workers,
            join_timeout: secs("join timeout", args.join_timeout)?,
        })
    }
}

pub fn parse_worker_count(input: &str) -> Result<usize, ConfigError> {
    match input.trim().parse::<usize>() {
        Ok(0) => Err(ConfigError::ZeroCount("worker count")),
        Ok(n) => Ok(n),
        Err(_) => Err(ConfigError::InvalidWorkerCount(input.trim().to_string())),
    }
}

fn secs(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration { name, value })
}

fn positive_secs(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    let duration = secs(name, value)?;
    if duration.is_zero() {
        return Err(ConfigError::ZeroDuration(name));
    }
    Ok(duration)
}
