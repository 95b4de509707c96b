//! Per-connection transfer accounting.
//!
//! Counters are owned by the pipeline and sampled roughly once per second to
//! maintain an EWMA throughput estimate. Rendering (progress bars, TUI) is
//! out of scope; `snapshot()` hands the embedding application everything it
//! needs.

use std::time::Instant;

use serde::Serialize;

/// EWMA blend factor applied to each new instantaneous throughput sample.
const EWMA_ALPHA: f64 = 0.2;

/// How the selected path reached the peer. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PathClass {
    /// Host-to-host candidate pair.
    Direct,
    /// At least one side goes through a relay.
    Relayed,
}

/// Transfer counters for one connection.
#[derive(Debug, Clone)]
pub struct TransferMetrics {
    /// Bytes moved across the data stream this session.
    pub bytes_moved: u64,
    /// `bytes_moved` at the previous throughput sample.
    pub last_bytes_moved: u64,
    /// Bytes skipped by resume (already durable on the receiver).
    pub skipped_bytes: u64,
    /// Files fully transferred, counting resumed files.
    pub files_moved: u32,
    /// EWMA throughput in bytes per second.
    pub ewma_throughput: f64,
    /// Set once the first data byte moves.
    pub started: bool,
    /// Set once the completion ACK is exchanged.
    pub complete: bool,
    start_time: Option<Instant>,
    last_sample: Option<Instant>,
    path_class: PathClass,
}

/// Serializable point-in-time view of a transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    pub bytes_moved: u64,
    pub skipped_bytes: u64,
    pub files_moved: u32,
    pub ewma_throughput: f64,
    pub elapsed_secs: f64,
    pub started: bool,
    pub complete: bool,
    pub path_class: PathClass,
}

impl TransferMetrics {
    /// Create counters for a connection over the given path class.
    pub fn new(path_class: PathClass) -> Self {
        Self {
            bytes_moved: 0,
            last_bytes_moved: 0,
            skipped_bytes: 0,
            files_moved: 0,
            ewma_throughput: 0.0,
            started: false,
            complete: false,
            start_time: None,
            last_sample: None,
            path_class,
        }
    }

    /// Mark the transfer as started, anchoring the elapsed-time clock.
    pub fn mark_started(&mut self, now: Instant) {
        if !self.started {
            self.started = true;
            self.start_time = Some(now);
            self.last_sample = Some(now);
        }
    }

    /// Seed the counters from a resume cursor.
    ///
    /// `bytes_moved` starts at the skipped prefix so progress reporting sees
    /// the durable position, not just this session's traffic.
    pub fn resume_from(&mut self, skipped_bytes: u64, files_done: u32) {
        self.skipped_bytes = skipped_bytes;
        self.bytes_moved = skipped_bytes;
        self.last_bytes_moved = skipped_bytes;
        self.files_moved = files_done;
    }

    /// Record bytes moved across the data stream.
    pub fn record_bytes(&mut self, n: usize) {
        self.bytes_moved = self.bytes_moved.saturating_add(n as u64);
    }

    /// Record a fully transferred file.
    pub fn record_file(&mut self) {
        self.files_moved = self.files_moved.saturating_add(1);
    }

    /// Update the EWMA throughput estimate.
    ///
    /// Cheap enough to call every tick; samples closer together than ~100ms
    /// are ignored to keep the estimate stable.
    pub fn sample(&mut self, now: Instant) {
        let Some(last) = self.last_sample else {
            return;
        };
        let delta = now.duration_since(last).as_secs_f64();
        if delta < 0.1 {
            return;
        }
        let instant_tp = (self.bytes_moved - self.last_bytes_moved) as f64 / delta;
        self.ewma_throughput = if self.ewma_throughput == 0.0 {
            instant_tp
        } else {
            EWMA_ALPHA * instant_tp + (1.0 - EWMA_ALPHA) * self.ewma_throughput
        };
        self.last_sample = Some(now);
        self.last_bytes_moved = self.bytes_moved;
    }

    /// Point-in-time view for reporting.
    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            bytes_moved: self.bytes_moved,
            skipped_bytes: self.skipped_bytes,
            files_moved: self.files_moved,
            ewma_throughput: self.ewma_throughput,
            elapsed_secs: self
                .start_time
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            started: self.started,
            complete: self.complete,
            path_class: self.path_class,
        }
    }
}
