use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// Progress counters for the current resolution run.
///
/// A run starts with the first batch that sees pending IPs and is finalized once
/// the processed count reaches the pending total observed along the way.
#[derive(Debug, Default)]
pub struct ResolveProgress {
    active: AtomicBool,
    pending_total: AtomicU64,
    processed: AtomicU64,
    started_at: AtomicI64,
    finished_at: AtomicI64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub running: bool,
    pub pending_total: u64,
    pub processed: u64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

fn optional_timestamp(value: i64) -> Option<i64> {
    (value > 0).then_some(value)
}

impl ResolveProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the pending count seen at the start of a batch
    pub fn begin_batch(&self, pending: u64, now: i64) {
        if !self.active.swap(true, Ordering::AcqRel) {
            self.processed.store(0, Ordering::Release);
            self.pending_total.store(pending, Ordering::Release);
            self.started_at.store(now, Ordering::Release);
            self.finished_at.store(0, Ordering::Release);
            return;
        }

        // New IPs may have been enqueued since the run started
        let processed = self.processed.load(Ordering::Acquire);
        self.pending_total
            .fetch_max(processed + pending, Ordering::AcqRel);
    }

    /// Count IPs retired by a batch; finalizes the run when everything seen is processed
    pub fn advance(&self, resolved: u64, now: i64) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }

        let processed = self.processed.fetch_add(resolved, Ordering::AcqRel) + resolved;
        if processed >= self.pending_total.load(Ordering::Acquire) {
            self.finalize(now);
        }
    }

    pub fn finalize(&self, now: i64) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.finished_at.store(now, Ordering::Release);
        }
    }

    /// Clear counters when there is nothing pending
    pub fn reset(&self) {
        self.active.store(false, Ordering::Release);
        self.pending_total.store(0, Ordering::Release);
        self.processed.store(0, Ordering::Release);
        self.started_at.store(0, Ordering::Release);
        self.finished_at.store(0, Ordering::Release);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            running: self.active.load(Ordering::Acquire),
            pending_total: self.pending_total.load(Ordering::Acquire),
            processed: self.processed.load(Ordering::Acquire),
            started_at: optional_timestamp(self.started_at.load(Ordering::Acquire)),
            finished_at: optional_timestamp(self.finished_at.load(Ordering::Acquire)),
        }
    }
}
