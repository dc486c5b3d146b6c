//! In-process store with the same transaction semantics as the Redis script.
//!
//! Used by tests and local tooling. A whole plan is applied under one lock on a scratch copy, so a plan
//! is visible entirely or not at all. Transient faults can be injected per primitive.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;

use crate::{
    errors::FleetError,
    runtime::{
        commands::{IndexRange, Presence, StoreOp, TransactOutcome, TransactPlan},
        executor::StoreExecutor,
    },
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    values: BTreeMap<String, String>,
    indexes: BTreeMap<String, BTreeSet<String>>,
    /// History counters: (last timestamp, last sequence).
    counters: HashMap<String, (i64, u64)>,
}

impl MemoryState {
    fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
            || self.indexes.get(key).is_some_and(|members| !members.is_empty())
            || self.counters.contains_key(key)
    }
}

/// Lets the first `skip` calls through, then fails the next `fail` calls.
#[derive(Debug, Clone, Copy, Default)]
struct FaultRule {
    skip: u32,
    fail: u32,
}

impl FaultRule {
    fn trip(&mut self) -> bool {
        if self.skip > 0 {
            self.skip -= 1;
            return false;
        }
        if self.fail > 0 {
            self.fail -= 1;
            return true;
        }
        false
    }
}

#[derive(Debug, Default)]
struct Faults {
    transact: FaultRule,
    get_many: FaultRule,
    index_range: FaultRule,
}

#[derive(Debug, Default)]
struct Counters {
    transact: AtomicU64,
    get_many: AtomicU64,
    index_range: AtomicU64,
}

/// Snapshot of round trips served by a [`MemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub transact_calls: u64,
    pub get_many_calls: u64,
    pub index_range_calls: u64,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
    counters: Arc<Counters>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// After `after` successful transactions, fail the next `times` with a transient error.
    pub fn fail_transacts(&self, after: u32, times: u32) {
        self.lock_faults().transact = FaultRule { skip: after, fail: times };
    }

    pub fn fail_get_many(&self, after: u32, times: u32) {
        self.lock_faults().get_many = FaultRule { skip: after, fail: times };
    }

    pub fn fail_index_ranges(&self, after: u32, times: u32) {
        self.lock_faults().index_range = FaultRule { skip: after, fail: times };
    }

    pub fn clear_faults(&self) {
        *self.lock_faults() = Faults::default();
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            transact_calls: self.counters.transact.load(Ordering::SeqCst),
            get_many_calls: self.counters.get_many.load(Ordering::SeqCst),
            index_range_calls: self.counters.index_range.load(Ordering::SeqCst),
        }
    }

    pub fn reset_stats(&self) {
        self.counters.transact.store(0, Ordering::SeqCst);
        self.counters.get_many.store(0, Ordering::SeqCst);
        self.counters.index_range.store(0, Ordering::SeqCst);
    }

    /// Raw value of a string key.
    pub fn value(&self, key: &str) -> Option<String> {
        self.lock_state().values.get(key).cloned()
    }

    /// Every string or index key starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let state = self.lock_state();
        let mut keys: BTreeSet<String> = state
            .values
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.extend(
            state
                .indexes
                .iter()
                .filter(|(key, members)| key.starts_with(prefix) && !members.is_empty())
                .map(|(key, _)| key.clone()),
        );
        keys.into_iter().collect()
    }

    pub fn index_members(&self, index_key: &str) -> Vec<String> {
        self.lock_state()
            .indexes
            .get(index_key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn trip(&self, pick: impl FnOnce(&mut Faults) -> &mut FaultRule, operation: &str) -> Result<(), FleetError> {
        let mut faults = self.lock_faults();
        if pick(&mut faults).trip() {
            return Err(FleetError::transient(format!("injected {operation} failure")));
        }
        Ok(())
    }
}

fn apply_plan(state: &MemoryState, plan: &TransactPlan) -> Result<(MemoryState, Vec<Value>), FleetError> {
    let mut next = state.clone();
    let mut results = Vec::with_capacity(plan.ops.len());

    for op in &plan.ops {
        let result = match op {
            StoreOp::Put { key, value_json } => {
                next.values.insert(key.clone(), value_json.clone());
                Value::Bool(true)
            }
            StoreOp::Delete { key } => next.values.remove(key).map(Value::String).unwrap_or(Value::Null),
            StoreOp::DeleteIfEquals { key, expected } => {
                if next.values.get(key) == Some(expected) {
                    next.values.remove(key);
                    Value::Bool(true)
                } else {
                    Value::Bool(false)
                }
            }
            StoreOp::Patch { key, fields } => match next.values.get(key) {
                Some(current) => {
                    let mut doc: Value = serde_json::from_str(current)?;
                    if let Value::Object(map) = &mut doc {
                        for (field, value) in fields {
                            map.insert(field.clone(), value.clone());
                        }
                    }
                    next.values.insert(key.clone(), serde_json::to_string(&doc)?);
                    Value::Bool(true)
                }
                None => Value::Bool(false),
            },
            StoreOp::IndexAdd { index_key, member } => {
                Value::Bool(next.indexes.entry(index_key.clone()).or_default().insert(member.clone()))
            }
            StoreOp::IndexRemove { index_key, member } => {
                let removed = next
                    .indexes
                    .get_mut(index_key)
                    .is_some_and(|members| members.remove(member));
                if next.indexes.get(index_key).is_some_and(BTreeSet::is_empty) {
                    next.indexes.remove(index_key);
                }
                Value::Bool(removed)
            }
            StoreOp::Incr { key, by } => {
                let current = match next.values.get(key) {
                    Some(raw) => raw.parse::<i64>().map_err(|_| FleetError::Other {
                        message: format!("value at {key} is not an integer").into(),
                    })?,
                    None => 0,
                };
                let updated = current + by;
                next.values.insert(key.clone(), updated.to_string());
                Value::from(updated)
            }
            StoreOp::AppendHistory {
                record_key,
                record_id,
                record_json,
                timestamp_ms,
                indexes,
            } => {
                let mut timestamp = *timestamp_ms;
                for target in indexes {
                    if let Some((last_ts, _)) = next.counters.get(&target.counter_key) {
                        timestamp = timestamp.max(*last_ts);
                    }
                }
                next.values.insert(record_key.clone(), record_json.clone());
                let mut assigned = Vec::with_capacity(indexes.len());
                for target in indexes {
                    let sequence = next.counters.get(&target.counter_key).map(|(_, seq)| *seq).unwrap_or(0) + 1;
                    next.counters.insert(target.counter_key.clone(), (timestamp, sequence));
                    let member = format!("{timestamp:015}:{sequence:012}:{record_id}");
                    next.indexes.entry(target.index_key.clone()).or_default().insert(member);
                    assigned.push(Value::Array(vec![Value::from(timestamp), Value::from(sequence)]));
                }
                Value::Array(assigned)
            }
        };
        results.push(result);
    }

    Ok((next, results))
}

impl StoreExecutor for MemoryStore {
    async fn transact(&self, plan: &TransactPlan) -> Result<TransactOutcome, FleetError> {
        tokio::task::yield_now().await;
        self.counters.transact.fetch_add(1, Ordering::SeqCst);
        self.trip(|faults| &mut faults.transact, "transact")?;

        let mut state = self.lock_state();
        for guard in &plan.guards {
            let exists = state.contains(&guard.key);
            let held = match guard.expect {
                Presence::Exists => exists,
                Presence::Absent => !exists,
                Presence::Matches => state.values.get(&guard.key) == guard.value.as_ref(),
            };
            if !held {
                return Ok(TransactOutcome::Rejected {
                    tag: guard.tag,
                    key: guard.key.clone(),
                    current: state.values.get(&guard.key).cloned(),
                });
            }
        }

        let (next, results) = apply_plan(&state, plan)?;
        *state = next;
        Ok(TransactOutcome::Committed(results))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, FleetError> {
        tokio::task::yield_now().await;
        self.counters.get_many.fetch_add(1, Ordering::SeqCst);
        self.trip(|faults| &mut faults.get_many, "get_many")?;

        let state = self.lock_state();
        Ok(keys.iter().map(|key| state.values.get(key).cloned()).collect())
    }

    async fn index_range(&self, index_key: &str, range: &IndexRange) -> Result<Vec<String>, FleetError> {
        tokio::task::yield_now().await;
        self.counters.index_range.fetch_add(1, Ordering::SeqCst);
        self.trip(|faults| &mut faults.index_range, "index_range")?;

        let state = self.lock_state();
        let Some(members) = state.indexes.get(index_key) else {
            return Ok(Vec::new());
        };
        let page = match (&range.after, range.descending) {
            (None, false) => members.iter().take(range.limit).cloned().collect(),
            (Some(after), false) => members
                .iter()
                .filter(|member| member.as_str() > after.as_str())
                .take(range.limit)
                .cloned()
                .collect(),
            (None, true) => members.iter().rev().take(range.limit).cloned().collect(),
            (Some(before), true) => members
                .iter()
                .rev()
                .filter(|member| member.as_str() < before.as_str())
                .take(range.limit)
                .cloned()
                .collect(),
        };
        Ok(page)
    }
}
