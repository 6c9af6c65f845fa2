//! Cache statistics
//!
//! Counters are plain atomics bumped on the hot path. `CacheStats` is the
//! serializable snapshot handed to callers; `StatsSink` lets an embedding
//! application observe per-job scheduling events.

use crate::job::{Job, JobStatus, Priority, WorkerKind};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Observer for per-job scheduling events. All methods default to no-ops.
pub trait StatsSink: Send + Sync {
    fn job_pending(&self, _job: &Job, _priority: Priority) {}

    fn job_assigned(&self, _job: &Job, _worker: WorkerKind) {}

    fn job_finished(&self, _job: &Job, _status: JobStatus) {}
}

/// Sink that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub search_attempts: AtomicU64,
    pub hits: AtomicU64,
    pub duplicates: AtomicU64,
    pub remote_queries: AtomicU64,
    pub remote_hits: AtomicU64,
    pub validation_mismatches: AtomicU64,
    pub culled_entries: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Pending job counts per priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounts {
    pub low: usize,
    pub normal: usize,
    pub high: usize,
    pub force_local: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.low + self.normal + self.high + self.force_local
    }
}

/// Point-in-time snapshot of cache activity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub search_attempts: u64,
    pub hits: u64,
    pub duplicates: u64,
    pub remote_queries: u64,
    pub remote_hits: u64,
    pub validation_mismatches: u64,
    pub culled_entries: u64,
    pub unique_inputs: usize,
    pub unique_outputs: usize,
    pub memory_used: usize,
    /// Zero when unlimited
    pub memory_budget: usize,
    pub pending: PendingCounts,
    pub outstanding: usize,
}

impl CacheStats {
    /// Fraction of lookups answered locally or by a duplicate
    pub fn local_hit_rate(&self) -> f64 {
        ratio(self.hits + self.duplicates, self.search_attempts)
    }

    pub fn remote_hit_rate(&self) -> f64 {
        ratio(self.remote_hits, self.remote_queries)
    }

    pub fn memory_status(&self) -> MemoryStatus {
        MemoryStatus::from_usage(self.memory_used as u64, self.memory_budget as u64)
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64
}

/// Memory usage relative to the configured budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryStatus {
    /// Under 80% of budget
    Ok,
    /// Between 80% and 100% of budget
    Warning,
    /// At or over the budget
    Exceeded,
}

impl MemoryStatus {
    pub fn from_usage(current_bytes: u64, budget_bytes: u64) -> Self {
        if budget_bytes == 0 {
            return Self::Ok;
        }
        let percent = Self::percentage(current_bytes, budget_bytes);
        if percent >= 100.0 {
            Self::Exceeded
        } else if percent >= 80.0 {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    pub fn percentage(current_bytes: u64, budget_bytes: u64) -> f64 {
        if budget_bytes == 0 {
            return 0.0;
        }
        (current_bytes as f64 / budget_bytes as f64) * 100.0
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
