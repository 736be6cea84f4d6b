// src/receiver.rs
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::arbiter::{ArbiterStats, SharedChannelArbiter};
use crate::config::{OversizedPolicy, SocketConfig};
use crate::models::domain::{current_timestamp, ArrivalEvent, BurstRecord, WorkerId};
use crate::segmenter::BurstSegmenter;
use crate::stats::StatsAggregator;

/// Winsock reports a datagram larger than the buffer as an error instead of truncating.
const WSAEMSGSIZE: i32 = 10040;

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("failed to create socket: {0}")]
    Create(#[source] io::Error),
    #[error("failed to set {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("datagram larger than {limit} bytes")]
    Oversized { limit: usize },
    #[error("socket error: {0}")]
    Transport(#[from] io::Error),
}

/// Result of one bounded receive attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    Datagram(usize),
    /// The datagram did not fit the buffer and was discarded by the OS.
    Oversized,
    /// Nothing arrived (or the channel was busy) before the attempt's deadline.
    Timeout,
}

/// A receive path a worker can poll.
pub trait DatagramSource: Send + Sync {
    fn recv(&self, buf: &mut [u8]) -> Result<RecvOutcome, ReceiveError>;
}

pub fn create_socket(config: &SocketConfig) -> Result<UdpSocket, ReceiveError> {
    let socket = Socket::new(
        Domain::for_address(config.bind_addr),
        Type::DGRAM,
        Some(Protocol::UDP),
    )
    .map_err(ReceiveError::Create)?;
    configure_socket(&socket, config)?;

    socket.bind(&config.bind_addr.into()).map_err(|source| ReceiveError::Bind {
        addr: config.bind_addr,
        source,
    })?;
    Ok(socket.into())
}

fn option_error(option: &'static str) -> impl FnOnce(io::Error) -> ReceiveError {
    move |source| ReceiveError::SocketOption { option, source }
}

fn configure_socket(socket: &Socket, config: &SocketConfig) -> Result<(), ReceiveError> {
    if config.reuse_address {
        socket.set_reuse_address(true).map_err(option_error("SO_REUSEADDR"))?;
    }
    if config.broadcast {
        socket.set_broadcast(true).map_err(option_error("SO_BROADCAST"))?;
    }
    // The buffer size is a hint; the kernel may clamp or refuse it.
    if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_size) {
        warn!("Could not set SO_RCVBUF to {}: {}", config.recv_buffer_size, e);
    }
    socket
        .set_read_timeout(Some(config.recv_timeout))
        .map_err(option_error("SO_RCVTIMEO"))?;
    Ok(())
}

/// One bounded receive on a socket with a read timeout.
pub(crate) fn receive_into(socket: &UdpSocket, buf: &mut [u8]) -> Result<RecvOutcome, ReceiveError> {
    match socket.recv_from(buf) {
        Ok((len, addr)) => {
            trace!("Received datagram of {} bytes from {}", len, addr);
            Ok(RecvOutcome::Datagram(len))
        }
        Err(e) => classify(e),
    }
}

fn classify(err: io::Error) -> Result<RecvOutcome, ReceiveError> {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
            Ok(RecvOutcome::Timeout)
        }
        _ if err.raw_os_error() == Some(WSAEMSGSIZE) && cfg!(windows) => Ok(RecvOutcome::Oversized),
        _ => Err(ReceiveError::Transport(err)),
    }
}

/// A socket owned by a single worker.
pub struct DedicatedSocket {
    socket: UdpSocket,
}

impl DedicatedSocket {
    pub fn bind(config: &SocketConfig) -> Result<Self, ReceiveError> {
        Ok(DedicatedSocket {
            socket: create_socket(config)?,
        })
    }
}

impl DatagramSource for DedicatedSocket {
    fn recv(&self, buf: &mut [u8]) -> Result<RecvOutcome, ReceiveError> {
        receive_into(&self.socket, buf)
    }
}

/// How the workers of one trial reach the port.
#[derive(Clone)]
pub enum ReceiveChannel {
    Shared(Arc<SharedChannelArbiter>),
    Dedicated(SocketConfig),
    /// Any other source, handed to every worker as is.
    Source(Arc<dyn DatagramSource>),
}

impl ReceiveChannel {
    /// Opens the receive path for one worker. Dedicated sockets are bound here,
    /// so a bind failure only affects the calling worker.
    pub fn open(&self) -> Result<Arc<dyn DatagramSource>, ReceiveError> {
        let source: Arc<dyn DatagramSource> = match self {
            ReceiveChannel::Shared(arbiter) => arbiter.clone(),
            ReceiveChannel::Dedicated(config) => Arc::new(DedicatedSocket::bind(config)?),
            ReceiveChannel::Source(source) => source.clone(),
        };
        Ok(source)
    }

    /// Lock counters of the shared channel; other channels have no lock.
    pub fn contention(&self) -> Option<ArbiterStats> {
        match self {
            ReceiveChannel::Shared(arbiter) => Some(arbiter.stats()),
            _ => None,
        }
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Cancelled,
    SetupFailed,
    TransportFailed,
}

pub struct ReceiverWorker {
    id: WorkerId,
    segmenter: BurstSegmenter,
    stats: StatsAggregator,
    cancel: Arc<AtomicBool>,
    max_datagram_size: usize,
    oversized: OversizedPolicy,
    clock: fn() -> f64,
    bursts: usize,
}

impl ReceiverWorker {
    pub fn new(id: WorkerId, config: &SocketConfig, stats: StatsAggregator, cancel: Arc<AtomicBool>) -> Self {
        ReceiverWorker {
            id,
            segmenter: BurstSegmenter::new(id, config.idle_timeout),
            stats,
            cancel,
            max_datagram_size: config.max_datagram_size,
            oversized: config.oversized,
            clock: current_timestamp,
            bursts: 0,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> f64) -> Self {
        self.clock = clock;
        self
    }

    /// Opens the channel and receives until cancelled.
    pub fn start(self, channel: &ReceiveChannel) -> WorkerExit {
        match channel.open() {
            Ok(source) => self.run(source.as_ref()),
            Err(e) => {
                error!("T{}: {}; contributing no bursts", self.id, e);
                WorkerExit::SetupFailed
            }
        }
    }

    pub fn run(mut self, source: &dyn DatagramSource) -> WorkerExit {
        let mut buf = vec![0u8; self.max_datagram_size];
        debug!("T{}: listening", self.id);

        let exit = loop {
            if self.cancel.load(Ordering::Acquire) {
                break WorkerExit::Cancelled;
            }
            match source.recv(&mut buf) {
                Ok(RecvOutcome::Datagram(len)) => self.arrival(len),
                Ok(RecvOutcome::Oversized) => match self.oversized {
                    OversizedPolicy::Cap => {
                        debug!("T{}: oversized datagram counted as {} bytes", self.id, buf.len());
                        self.arrival(buf.len());
                    }
                    OversizedPolicy::Error => {
                        let e = ReceiveError::Oversized { limit: buf.len() };
                        error!("T{}: {}", self.id, e);
                        break WorkerExit::TransportFailed;
                    }
                },
                Ok(RecvOutcome::Timeout) => {
                    if let Some(record) = self.segmenter.on_timeout((self.clock)()) {
                        self.emit(record);
                    }
                }
                Err(e) => {
                    error!("T{}: {}", self.id, e);
                    break WorkerExit::TransportFailed;
                }
            }
        };

        if let Some(record) = self.segmenter.finish() {
            self.emit(record);
        }
        debug!("T{}: stopped after {} bursts ({:?})", self.id, self.bursts, exit);
        exit
    }

    fn arrival(&mut self, byte_size: usize) {
        let event = ArrivalEvent {
            worker_id: self.id,
            timestamp: (self.clock)(),
            byte_size,
        };
        if let Some(record) = self.segmenter.on_arrival(event) {
            self.emit(record);
        }
    }

    fn emit(&mut self, record: BurstRecord) {
        self.bursts += 1;
        self.stats.append(record);
    }
}
