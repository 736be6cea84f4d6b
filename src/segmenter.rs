//! Turns one worker's arrival stream into burst records.
//!
//! A burst is open (ACTIVE) from the first arrival after silence until no
//! arrival has been seen for the idle timeout. The idle timeout is the only
//! boundary: packet counts and sizes never close a burst.

use std::time::Duration;

use tracing::debug;

use crate::models::domain::{ArrivalEvent, BurstRecord, WorkerId, WorkerState};

#[derive(Debug)]
pub struct BurstSegmenter {
    worker_id: WorkerId,
    idle_timeout: f64,
    state: WorkerState,
}

impl BurstSegmenter {
    pub fn new(worker_id: WorkerId, idle_timeout: Duration) -> Self {
        BurstSegmenter {
            worker_id,
            idle_timeout: idle_timeout.as_secs_f64(),
            state: WorkerState::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.burst_count > 0
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Folds one arrival into the open burst.
    ///
    /// If the gap since the previous arrival already reached the idle timeout
    /// (the worker never got to observe its own timeout, e.g. while waiting on
    /// the arbiter) the stale burst is closed first and returned.
    pub fn on_arrival(&mut self, event: ArrivalEvent) -> Option<BurstRecord> {
        let closed = match self.state.burst_last {
            Some(last) if event.timestamp - last >= self.idle_timeout => self.close(),
            _ => None,
        };

        if self.state.burst_count == 0 {
            self.state.burst_start = Some(event.timestamp);
            self.state.byte_total = 0;
        }
        // Wall-clock time can step backwards; keep end >= start.
        let last = self.state.burst_last.map_or(event.timestamp, |l| l.max(event.timestamp));
        self.state.burst_last = Some(last);
        self.state.burst_count += 1;
        self.state.byte_total += event.byte_size;

        closed
    }

    /// Called when a receive attempt timed out at `now`.
    pub fn on_timeout(&mut self, now: f64) -> Option<BurstRecord> {
        match self.state.burst_last {
            Some(last) if now - last >= self.idle_timeout => self.close(),
            _ => None,
        }
    }

    /// Closes whatever is open, regardless of the idle timeout.
    pub fn finish(&mut self) -> Option<BurstRecord> {
        self.close()
    }

    fn close(&mut self) -> Option<BurstRecord> {
        let state = std::mem::take(&mut self.state);
        let (Some(start), Some(last)) = (state.burst_start, state.burst_last) else {
            return None;
        };
        if state.burst_count == 0 {
            return None;
        }

        let record = BurstRecord::new(self.worker_id, start, last, state.burst_count, state.byte_total);
        debug!(
            worker = self.worker_id,
            packets = record.packet_count,
            bytes = record.byte_total,
            mbps = record.throughput_mbps,
            "burst ended"
        );
        Some(record)
    }
}
