//! Memory broker: byte accounting, LRU ordering and eviction arbitration
//! for loaded models.
//!
//! The broker never evicts anything itself; it tracks residency, reference
//! counts and recency, and arbitrates which handles an engine *may* unload
//! when a new load would exceed the byte budget. Pressure is reported on the
//! rising edge of the 90%-of-limit threshold, once per crossing, including
//! crossings induced by a limit change.

use crate::types::ModelHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// User callback invoked with `(usage_bytes, limit_bytes)` when resident
/// bytes cross the pressure threshold.
pub type PressureCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct ModelRecord {
    size_bytes: u64,
    ref_count: u32,
    last_access_seq: u64,
}

struct BrokerState {
    records: HashMap<ModelHandle, ModelRecord>,
    total_bytes: u64,
    limit_bytes: u64,
    next_seq: u64,
    above_threshold: bool,
    pressure_callback: Option<PressureCallback>,
}

impl BrokerState {
    /// Re-evaluate the pressure latch; returns the callback to fire (outside
    /// the lock) when a rising edge occurred.
    fn pressure_edge(&mut self) -> Option<(PressureCallback, u64, u64)> {
        let now_above = over_threshold(self.total_bytes, self.limit_bytes);
        let rising = now_above && !self.above_threshold;
        self.above_threshold = now_above;
        if rising {
            warn!(
                usage = self.total_bytes,
                limit = self.limit_bytes,
                "memory pressure: resident models crossed 90% of the limit"
            );
            if let Some(cb) = &self.pressure_callback {
                return Some((Arc::clone(cb), self.total_bytes, self.limit_bytes));
            }
        }
        None
    }
}

/// `usage >= 90% of limit`, for a nonzero limit.
fn over_threshold(usage: u64, limit: u64) -> bool {
    limit > 0 && u128::from(usage) * 10 >= u128::from(limit) * 9
}

/// Shared accounting of resident model bytes with LRU eviction arbitration.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    /// Create a broker with a byte limit; `0` means unlimited.
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            state: Mutex::new(BrokerState {
                records: HashMap::new(),
                total_bytes: 0,
                limit_bytes,
                next_seq: 0,
                above_threshold: false,
                pressure_callback: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        // A poisoned broker lock would mean a panic inside plain arithmetic;
        // recover the inner state rather than propagating poison.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a newly-loaded model. Allocation counts as an access.
    pub fn track_allocation(&self, handle: ModelHandle, size_bytes: u64) {
        let fire = {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            let previous = state.records.insert(
                handle,
                ModelRecord {
                    size_bytes,
                    ref_count: 0,
                    last_access_seq: seq,
                },
            );
            if let Some(old) = previous {
                state.total_bytes = state.total_bytes.saturating_sub(old.size_bytes);
            }
            state.total_bytes = state.total_bytes.saturating_add(size_bytes);
            debug!(handle, size_bytes, total = state.total_bytes, "tracked allocation");
            state.pressure_edge()
        };
        if let Some((cb, usage, limit)) = fire {
            cb(usage, limit);
        }
    }

    /// Unregister a model. Unknown handles are a logged no-op.
    pub fn track_deallocation(&self, handle: ModelHandle) {
        let mut state = self.lock();
        match state.records.remove(&handle) {
            Some(record) => {
                state.total_bytes = state.total_bytes.saturating_sub(record.size_bytes);
                state.above_threshold =
                    over_threshold(state.total_bytes, state.limit_bytes);
                debug!(handle, total = state.total_bytes, "tracked deallocation");
            }
            None => debug!(handle, "deallocation for unknown handle ignored"),
        }
    }

    /// Move `handle` to the MRU end.
    pub fn record_access(&self, handle: ModelHandle) {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        if let Some(record) = state.records.get_mut(&handle) {
            record.last_access_seq = seq;
        }
    }

    /// Pin a model against eviction. Saturating.
    pub fn increment_ref_count(&self, handle: ModelHandle) {
        let mut state = self.lock();
        if let Some(record) = state.records.get_mut(&handle) {
            record.ref_count = record.ref_count.saturating_add(1);
        }
    }

    /// Release a pin. Saturates at zero.
    pub fn decrement_ref_count(&self, handle: ModelHandle) {
        let mut state = self.lock();
        if let Some(record) = state.records.get_mut(&handle) {
            record.ref_count = record.ref_count.saturating_sub(1);
        }
    }

    /// Current reference count; `0` for unknown handles.
    pub fn ref_count(&self, handle: ModelHandle) -> u32 {
        self.lock()
            .records
            .get(&handle)
            .map_or(0, |r| r.ref_count)
    }

    /// Tracked size of a model; `0` for unknown handles.
    pub fn model_bytes(&self, handle: ModelHandle) -> u64 {
        self.lock()
            .records
            .get(&handle)
            .map_or(0, |r| r.size_bytes)
    }

    /// Sum of tracked model bytes.
    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    /// Configured byte limit; `0` = unlimited.
    pub fn memory_limit(&self) -> u64 {
        self.lock().limit_bytes
    }

    /// Change the byte limit. Fires the pressure callback when the new
    /// threshold puts current usage above 90%.
    pub fn set_memory_limit(&self, limit_bytes: u64) {
        let fire = {
            let mut state = self.lock();
            state.limit_bytes = limit_bytes;
            if limit_bytes == 0 {
                state.above_threshold = false;
                None
            } else {
                // A lowered limit is a fresh crossing even if usage was
                // already above the old threshold.
                state.above_threshold = false;
                state.pressure_edge()
            }
        };
        if let Some((cb, usage, limit)) = fire {
            cb(usage, limit);
        }
    }

    /// Register the pressure callback, replacing any previous one.
    pub fn set_memory_pressure_callback(&self, callback: PressureCallback) {
        self.lock().pressure_callback = Some(callback);
    }

    /// Whether resident bytes are at or above 90% of a nonzero limit.
    pub fn is_memory_pressure(&self) -> bool {
        let state = self.lock();
        over_threshold(state.total_bytes, state.limit_bytes)
    }

    /// Whether `handle` may be evicted (tracked and unreferenced).
    pub fn can_evict(&self, handle: ModelHandle) -> bool {
        self.lock()
            .records
            .get(&handle)
            .is_some_and(|r| r.ref_count == 0)
    }

    /// The least-recently-used evictable handle, when any exists.
    pub fn get_lru_model(&self) -> Option<ModelHandle> {
        let state = self.lock();
        state
            .records
            .iter()
            .filter(|(_, r)| r.ref_count == 0)
            .min_by_key(|(_, r)| r.last_access_seq)
            .map(|(h, _)| *h)
    }

    /// Whether loading `required_bytes` more would exceed the limit.
    /// Always `false` for an unlimited broker.
    pub fn needs_eviction(&self, required_bytes: u64) -> bool {
        let state = self.lock();
        state.limit_bytes > 0
            && state.total_bytes.saturating_add(required_bytes) > state.limit_bytes
    }

    /// Evictable handles in LRU→MRU order whose combined sizes bring
    /// `total - freed + required` within the limit.
    ///
    /// Skips handles with a nonzero reference count. When even the full
    /// evictable set is insufficient it is returned whole; the caller
    /// translates that into `ResourceOutOfMemory`.
    pub fn get_eviction_candidates(&self, required_bytes: u64) -> Vec<ModelHandle> {
        let state = self.lock();
        if state.limit_bytes == 0 {
            return Vec::new();
        }
        let mut evictable: Vec<(u64, ModelHandle, u64)> = state
            .records
            .iter()
            .filter(|(_, r)| r.ref_count == 0)
            .map(|(h, r)| (r.last_access_seq, *h, r.size_bytes))
            .collect();
        evictable.sort_by_key(|(seq, _, _)| *seq);

        let mut candidates = Vec::new();
        let mut freed: u64 = 0;
        for (_, handle, size) in evictable {
            let projected = state
                .total_bytes
                .saturating_sub(freed)
                .saturating_add(required_bytes);
            if projected <= state.limit_bytes {
                break;
            }
            candidates.push(handle);
            freed = freed.saturating_add(size);
        }
        candidates
    }
}
