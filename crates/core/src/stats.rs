//! Execution statistics shared between the host and the realms.
//!
//! The counters are the only mutation channel from inside the realms back to
//! the host side: the orchestrator hands the realm an `Arc<SharedStats>` and
//! reads a snapshot when the execution ends, on success and failure alike.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Memory-accountant observations for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// Cumulative estimated bytes tracked.
    pub tracked_bytes: u64,
    /// High-water mark of `tracked_bytes`.
    pub peak_tracked_bytes: u64,
    /// Number of accounted allocations.
    pub allocation_count: u64,
}

/// Host-facing statistics for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub duration_ms: u64,
    pub tool_call_count: u64,
    pub iteration_count: u64,
    pub memory_usage: MemorySnapshot,
}

/// The live, atomically-updated form of [`ExecutionStats`].
#[derive(Debug, Default)]
pub struct SharedStats {
    start_time_ms: AtomicU64,
    end_time_ms: AtomicU64,
    tool_call_count: AtomicU64,
    iteration_count: AtomicU64,
}

impl SharedStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Zeroes every counter. Called at execution start so a reused scaffold
    /// never carries counts across runs.
    pub fn reset(&self) {
        self.start_time_ms.store(0, Ordering::Relaxed);
        self.end_time_ms.store(0, Ordering::Relaxed);
        self.tool_call_count.store(0, Ordering::Relaxed);
        self.iteration_count.store(0, Ordering::Relaxed);
    }

    /// Stamps the execution start.
    pub fn mark_start(&self, now_ms: u64) {
        self.start_time_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Stamps the execution end.
    pub fn mark_end(&self, now_ms: u64) {
        self.end_time_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Increments the tool-call count and returns the new value.
    pub fn record_tool_call(&self) -> u64 {
        self.tool_call_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Rolls back one tool-call increment. Used when the increment that
    /// triggered a limit rejection is consumed.
    pub fn unrecord_tool_call(&self) {
        self.tool_call_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Increments the loop-iteration count and returns the new value.
    pub fn record_iteration(&self) -> u64 {
        self.iteration_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Rolls back one iteration increment, mirroring `unrecord_tool_call`.
    pub fn unrecord_iteration(&self) {
        self.iteration_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn tool_call_count(&self) -> u64 {
        self.tool_call_count.load(Ordering::Relaxed)
    }

    pub fn iteration_count(&self) -> u64 {
        self.iteration_count.load(Ordering::Relaxed)
    }

    /// Produces the host-facing snapshot.
    pub fn snapshot(&self, memory_usage: MemorySnapshot) -> ExecutionStats {
        let start = self.start_time_ms.load(Ordering::Relaxed);
        let end = self.end_time_ms.load(Ordering::Relaxed);
        ExecutionStats {
            start_time_ms: start,
            end_time_ms: end,
            duration_ms: end.saturating_sub(start),
            tool_call_count: self.tool_call_count.load(Ordering::Relaxed),
            iteration_count: self.iteration_count.load(Ordering::Relaxed),
            memory_usage,
        }
    }
}

/// Cooperative cancellation flag, polled by loop helpers and `callTool`.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the execution to stop at its next poll point.
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = SharedStats::new();
        stats.mark_start(1_000);
        assert_eq!(stats.record_tool_call(), 1);
        assert_eq!(stats.record_tool_call(), 2);
        assert_eq!(stats.record_iteration(), 1);
        stats.mark_end(1_250);

        let snap = stats.snapshot(MemorySnapshot::default());
        assert_eq!(snap.tool_call_count, 2);
        assert_eq!(snap.iteration_count, 1);
        assert_eq!(snap.duration_ms, 250);
    }

    #[test]
    fn test_consumed_increment_rolls_back() {
        let stats = SharedStats::new();
        assert_eq!(stats.record_tool_call(), 1);
        stats.unrecord_tool_call();
        assert_eq!(stats.tool_call_count(), 0);
    }

    #[test]
    fn test_reset_clears_a_reused_scaffold() {
        let stats = SharedStats::new();
        stats.mark_start(1_000);
        stats.record_tool_call();
        stats.record_iteration();
        stats.reset();
        let snap = stats.snapshot(MemorySnapshot::default());
        assert_eq!(snap, ExecutionStats::default());
    }

    #[test]
    fn test_abort_flag() {
        let abort = AbortFlag::new();
        assert!(!abort.is_set());
        let other = abort.clone();
        other.set();
        assert!(abort.is_set());
    }
}
