//! Allocation accounting for the inner realm.
//!
//! Every allocation primitive that can produce a large result estimates its
//! cost first, charges the accountant, and only then performs the
//! allocation. Charging after allocating is unsafe: the point is that an
//! over-budget string never exists, not that it is noticed afterwards.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use warden_core::stats::MemorySnapshot;

/// Fixed byte cost of a string header.
const STRING_BASE_COST: u64 = 40;
/// Per-code-unit byte cost of string payload.
const STRING_UNIT_COST: u64 = 2;
/// Fixed byte cost of an array header.
const ARRAY_BASE_COST: u64 = 32;
/// Per-element byte cost of array payload.
const ARRAY_SLOT_COST: u64 = 8;
/// Fixed byte cost of an object header.
const OBJECT_BASE_COST: u64 = 56;
/// Per-property byte cost of object payload.
const OBJECT_SLOT_COST: u64 = 32;

#[derive(Debug, Default)]
struct Inner {
    tracked_bytes: u64,
    peak_tracked_bytes: u64,
    allocation_count: u64,
}

/// Cumulative allocation counter with a hard ceiling.
///
/// Shared between the orchestrator (which finalizes it into the execution
/// stats) and the inner realm's instrumented builtins (which charge it).
/// A limit of 0 disables the ceiling but keeps the counters.
#[derive(Debug)]
pub struct MemoryAccountant {
    limit_bytes: u64,
    inner: Mutex<Inner>,
}

impl MemoryAccountant {
    /// Creates an accountant with the given ceiling (0 = unlimited).
    pub fn new(limit_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            limit_bytes,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// The configured ceiling (0 = unlimited).
    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    /// Charges a pre-estimated allocation. When the charge would cross the
    /// ceiling the estimate is not committed and the accountant throws, so
    /// `tracked_bytes` and the peak never exceed the limit.
    pub fn track(&self, bytes: u64) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        let next = inner.tracked_bytes.saturating_add(bytes);
        if bytes > 0 && self.limit_bytes > 0 && next > self.limit_bytes {
            return Err(EngineError::memory_limit(next, self.limit_bytes));
        }
        inner.tracked_bytes = next;
        inner.peak_tracked_bytes = inner.peak_tracked_bytes.max(next);
        inner.allocation_count += 1;
        Ok(())
    }

    /// Current snapshot of the counters.
    pub fn snapshot(&self) -> MemorySnapshot {
        let inner = self.inner.lock();
        MemorySnapshot {
            tracked_bytes: inner.tracked_bytes,
            peak_tracked_bytes: inner.peak_tracked_bytes,
            allocation_count: inner.allocation_count,
        }
    }

    /// Cost of a string of `len` code units.
    pub fn estimate_string(len: u64) -> u64 {
        len.saturating_mul(STRING_UNIT_COST)
            .saturating_add(STRING_BASE_COST)
    }

    /// Cost of an array of `len` elements.
    pub fn estimate_array(len: u64) -> u64 {
        ARRAY_BASE_COST.saturating_add(len.saturating_mul(ARRAY_SLOT_COST))
    }

    /// Cost of an object of `property_count` properties.
    pub fn estimate_object(property_count: u64) -> u64 {
        OBJECT_BASE_COST.saturating_add(property_count.saturating_mul(OBJECT_SLOT_COST))
    }

    /// Cost of `s.repeat(count)` on a string of `len` code units.
    pub fn estimate_repeat(len: u64, count: u64) -> u64 {
        len.saturating_mul(count).saturating_mul(STRING_UNIT_COST)
    }

    /// Cost of `arr.join(sep)`: the stringified element lengths plus the
    /// separators, in code units.
    pub fn estimate_join(element_len_sum: u64, sep_len: u64, element_count: u64) -> u64 {
        let separators = sep_len.saturating_mul(element_count.saturating_sub(1));
        element_len_sum
            .saturating_add(separators)
            .saturating_mul(STRING_UNIT_COST)
    }

    /// Cost of `s.padStart(target)` / `s.padEnd(target)`.
    pub fn estimate_pad(current_len: u64, target_len: u64) -> u64 {
        current_len.max(target_len).saturating_mul(STRING_UNIT_COST)
    }

    /// Cost of `arr.fill(value, start, end)`.
    pub fn estimate_fill(start: u64, end: u64) -> u64 {
        end.saturating_sub(start).saturating_mul(ARRAY_SLOT_COST)
    }
}
