use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use crate::config::SocketConfig;
use crate::receiver::{create_socket, receive_into, DatagramSource, ReceiveError, RecvOutcome};

/// Serializes every worker of a trial onto one socket.
///
/// The lock is held for exactly one bounded receive and released fairly, so
/// the next attempt goes to whichever worker has waited longest. Built per
/// trial and dropped with it; the socket closes when the last worker lets go.
pub struct SharedChannelArbiter {
    socket: Mutex<UdpSocket>,
    local_addr: SocketAddr,
    acquire_timeout: Duration,
    attempts: AtomicU64,
    contended: AtomicU64,
}

/// Receive attempts on the shared channel and how many of them timed out
/// waiting for the lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbiterStats {
    pub attempts: u64,
    pub contended: u64,
}

impl ArbiterStats {
    /// Counts accumulated after `earlier` was taken.
    pub fn since(self, earlier: ArbiterStats) -> ArbiterStats {
        ArbiterStats {
            attempts: self.attempts.saturating_sub(earlier.attempts),
            contended: self.contended.saturating_sub(earlier.contended),
        }
    }
}

impl SharedChannelArbiter {
    pub fn bind(config: &SocketConfig) -> Result<Self, ReceiveError> {
        let socket = create_socket(config)?;
        Self::from_socket(socket, config.recv_timeout)
    }

    /// Wraps an already configured socket. A worker that cannot take the lock
    /// within `acquire_timeout` sees the attempt as a timeout.
    pub fn from_socket(socket: UdpSocket, acquire_timeout: Duration) -> Result<Self, ReceiveError> {
        let local_addr = socket.local_addr()?;
        debug!("Shared channel bound on {}", local_addr);
        Ok(SharedChannelArbiter {
            socket: Mutex::new(socket),
            local_addr,
            acquire_timeout,
            attempts: AtomicU64::new(0),
            contended: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> ArbiterStats {
        ArbiterStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }
}

impl DatagramSource for SharedChannelArbiter {
    fn recv(&self, buf: &mut [u8]) -> Result<RecvOutcome, ReceiveError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let Some(socket) = self.socket.try_lock_for(self.acquire_timeout) else {
            self.contended.fetch_add(1, Ordering::Relaxed);
            return Ok(RecvOutcome::Timeout);
        };
        let outcome = receive_into(&socket, buf);
        MutexGuard::unlock_fair(socket);
        outcome
    }
}
