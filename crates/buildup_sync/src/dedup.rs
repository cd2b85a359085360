#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use buildup_contracts::envelope::EnvelopeId;
use buildup_contracts::{ContractViolation, WallTimeMs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupConfig {
    /// How long an envelope id is remembered.
    pub retention_ms: u64,
    /// Hard cap on remembered ids; oldest entries are evicted first.
    pub max_entries: usize,
    /// A full expiry sweep runs every this many inserts.
    pub sweep_every: u64,
}

impl DedupConfig {
    pub fn new(
        retention_ms: u64,
        max_entries: usize,
        sweep_every: u64,
    ) -> Result<Self, ContractViolation> {
        if retention_ms == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "dedup_config.retention_ms",
                reason: "must be > 0",
            });
        }
        if max_entries == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "dedup_config.max_entries",
                reason: "must be > 0",
            });
        }
        if sweep_every == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "dedup_config.sweep_every",
                reason: "must be > 0",
            });
        }
        Ok(Self {
            retention_ms,
            max_entries,
            sweep_every,
        })
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention_ms: 300_000,
            max_entries: 4_096,
            sweep_every: 64,
        }
    }
}

#[derive(Debug)]
struct DedupState {
    seen: BTreeMap<EnvelopeId, WallTimeMs>,
    /// Insertion order for eviction and sweeping. May carry stale rows for
    /// ids that were re-admitted after expiry; those are skipped by
    /// comparing timestamps against the map.
    order: VecDeque<(EnvelopeId, WallTimeMs)>,
    inserts: u64,
}

/// Time-bounded envelope-id memory. First line of defense against duplicate
/// delivery; the durable guard in the project store catches anything that
/// slips past the retention window.
#[derive(Debug)]
pub struct Deduplicator {
    config: DedupConfig,
    state: Mutex<DedupState>,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DedupState {
                seen: BTreeMap::new(),
                order: VecDeque::new(),
                inserts: 0,
            }),
        }
    }

    /// True exactly when this id has not been seen within the retention
    /// window. A fresh or expired id is recorded as seen at `now`.
    pub fn should_process(&self, envelope_id: &EnvelopeId, now: WallTimeMs) -> bool {
        let mut state = self.lock();
        if let Some(seen_at) = state.seen.get(envelope_id) {
            if now.0.saturating_sub(seen_at.0) <= self.config.retention_ms {
                return false;
            }
        }
        state.seen.insert(envelope_id.clone(), now);
        state.order.push_back((envelope_id.clone(), now));
        state.inserts += 1;
        if state.inserts % self.config.sweep_every == 0 {
            Self::sweep_expired(&mut state, now, self.config.retention_ms);
        }
        Self::evict_over_capacity(&mut state, self.config.max_entries);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().seen.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, DedupState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn sweep_expired(state: &mut DedupState, now: WallTimeMs, retention_ms: u64) {
        while let Some((id, queued_at)) = state.order.front().cloned() {
            if now.0.saturating_sub(queued_at.0) <= retention_ms {
                break;
            }
            state.order.pop_front();
            // only drop the map entry if this queue row is the live one
            if state.seen.get(&id) == Some(&queued_at) {
                state.seen.remove(&id);
            }
        }
    }

    fn evict_over_capacity(state: &mut DedupState, max_entries: usize) {
        while state.seen.len() > max_entries {
            match state.order.pop_front() {
                Some((id, queued_at)) => {
                    if state.seen.get(&id) == Some(&queued_at) {
                        state.seen.remove(&id);
                    }
                }
                None => break,
            }
        }
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}
