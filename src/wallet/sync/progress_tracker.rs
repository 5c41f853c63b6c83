//! Progress tracking for backward history scans.
//!
//! One tracker per (address, token variant) run. It records how deep the
//! scan has reached, counts scanned chunks and emitted transactions, and
//! logs progress at height intervals so long scans stay observable.

use tracing::info;

/// Service for tracking a single scan run's progress
#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
    /// Height the backward scan started from
    start_height: u64,
    /// Deepest chunk start reached so far
    lowest_scanned_height: u64,
    /// Chunks completed in this run
    chunks_scanned: usize,
    /// Raw transfer logs seen across all chunks
    logs_seen: usize,
    /// Canonical transactions emitted to the store
    transactions_emitted: usize,
    /// Height at which progress was last logged
    last_logged_height: u64,
}

impl SyncProgressTracker {
    /// Create a new progress tracker for a scan starting at the given height.
    pub fn new(start_height: u64) -> Self {
        Self {
            start_height,
            lowest_scanned_height: start_height,
            chunks_scanned: 0,
            logs_seen: 0,
            transactions_emitted: 0,
            last_logged_height: start_height,
        }
    }

    /// Record a completed chunk reaching down to `chunk_start`.
    pub fn record_chunk(&mut self, chunk_start: u64, logs_seen: usize) {
        self.lowest_scanned_height = self.lowest_scanned_height.min(chunk_start);
        self.chunks_scanned += 1;
        self.logs_seen += logs_seen;
    }

    /// Record transactions persisted for this run.
    pub fn record_transactions(&mut self, count: usize) {
        self.transactions_emitted += count;
    }

    /// Log progress every 10_000 blocks of depth, or when forced.
    pub fn log_progress(&mut self, force: bool) {
        let depth_since_last_log = self
            .last_logged_height
            .saturating_sub(self.lowest_scanned_height);
        if (force || depth_since_last_log >= 10_000) && self.chunks_scanned > 0 {
            info!(
                "Scan progress: {} chunks, {} logs, {} transactions, down to height {}",
                self.chunks_scanned,
                self.logs_seen,
                self.transactions_emitted,
                self.lowest_scanned_height
            );
            self.last_logged_height = self.lowest_scanned_height;
        }
    }

    /// Get run statistics as a SyncStats struct
    pub fn get_stats(&self) -> SyncStats {
        SyncStats {
            start_height: self.start_height,
            lowest_scanned_height: self.lowest_scanned_height,
            chunks_scanned: self.chunks_scanned,
            logs_seen: self.logs_seen,
            transactions_emitted: self.transactions_emitted,
        }
    }
}

/// Statistics about one scan run
#[derive(Debug, Clone)]
pub struct SyncStats {
    pub start_height: u64,
    pub lowest_scanned_height: u64,
    pub chunks_scanned: usize,
    pub logs_seen: usize,
    pub transactions_emitted: usize,
}

impl SyncStats {
    /// Get a human-readable summary of the run
    pub fn summary(&self) -> String {
        format!(
            "Scanned {} chunks from {} down to {}: {} logs, {} transactions",
            self.chunks_scanned,
            self.start_height,
            self.lowest_scanned_height,
            self.logs_seen,
            self.transactions_emitted
        )
    }
}
