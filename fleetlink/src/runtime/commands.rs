//! Serializable transaction plans executed atomically by a store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Expected state of a guarded key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Exists,
    Absent,
    /// The key holds exactly the guard's `value`.
    Matches,
}

/// Why a guard was placed; returned when it fails so the caller can map it to a domain error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardTag {
    /// Forward association must not exist yet.
    Unlinked,
    /// Forward association must exist.
    Linked,
    /// Capacity slot of a "one" side must be free.
    SlotFree,
    /// A participating entity record must exist.
    EntityPresent,
    /// A document must still hold the value read before the write.
    Unchanged,
}

impl GuardTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unlinked => "unlinked",
            Self::Linked => "linked",
            Self::SlotFree => "slot_free",
            Self::EntityPresent => "entity_present",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Precondition evaluated before any operation of the plan runs.
#[derive(Debug, Clone, Serialize)]
pub struct Guard {
    pub key: String,
    pub expect: Presence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub tag: GuardTag,
}

impl Guard {
    pub fn exists(key: impl Into<String>, tag: GuardTag) -> Self {
        Self {
            key: key.into(),
            expect: Presence::Exists,
            value: None,
            tag,
        }
    }

    pub fn absent(key: impl Into<String>, tag: GuardTag) -> Self {
        Self {
            key: key.into(),
            expect: Presence::Absent,
            value: None,
            tag,
        }
    }

    /// Holds only while `key` is byte-for-byte `value`, so a read-modify-write cannot overwrite a concurrent one.
    pub fn matches(key: impl Into<String>, value: impl Into<String>, tag: GuardTag) -> Self {
        Self {
            key: key.into(),
            expect: Presence::Matches,
            value: Some(value.into()),
            tag,
        }
    }
}

/// Where a history record is indexed, and the counter that orders that index.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryIndexTarget {
    pub index_key: String,
    pub counter_key: String,
}

/// A single write inside a plan. Each op produces one JSON result value.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreOp {
    /// Unconditional write. Result: `true`.
    Put { key: String, value_json: String },
    /// Removes a key. Result: the previous value, or `null` when it was absent.
    Delete { key: String },
    /// Removes a key only while it still holds `expected`. Result: `true` when removed.
    DeleteIfEquals { key: String, expected: String },
    /// Merges top-level fields into a stored JSON document; absent keys are left absent. Result: `true` when patched.
    ///
    /// The Lua side re-encodes the whole document with cjson, which turns empty arrays into objects and rounds
    /// integers past 14 digits. Use it only on engine-owned documents; entity documents go through a
    /// [`Presence::Matches`] guarded `Put`.
    Patch { key: String, fields: Map<String, Value> },
    /// Adds a member to a lexicographically ordered index. Result: `true` when newly added.
    IndexAdd { index_key: String, member: String },
    /// Result: `true` when the member was present.
    IndexRemove { index_key: String, member: String },
    /// Result: the counter value after increment.
    Incr { key: String, by: i64 },
    /// Stores a history record once and indexes it under every target.
    /// Result: `[[timestamp_ms, sequence], ...]`, one pair per target in order.
    AppendHistory {
        record_key: String,
        record_id: String,
        record_json: String,
        timestamp_ms: i64,
        indexes: Vec<HistoryIndexTarget>,
    },
}

impl StoreOp {
    /// Number of store items this op touches, counted against the transaction item limit.
    pub fn item_count(&self) -> usize {
        match self {
            StoreOp::AppendHistory { indexes, .. } => 1 + indexes.len() * 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TransactPlan {
    pub guards: Vec<Guard>,
    pub ops: Vec<StoreOp>,
}

impl TransactPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&mut self, guard: Guard) -> &mut Self {
        self.guards.push(guard);
        self
    }

    /// Appends an op and returns its position in the result list.
    pub fn push(&mut self, op: StoreOp) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn item_count(&self) -> usize {
        self.guards.len() + self.ops.iter().map(StoreOp::item_count).sum::<usize>()
    }
}

/// Result of submitting a plan.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactOutcome {
    /// Every guard held; one result value per op.
    Committed(Vec<Value>),
    /// The first failing guard, in plan order. Nothing was written.
    Rejected { tag: GuardTag, key: String, current: Option<String> },
}

impl TransactOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }
}

/// Ordered index query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRange {
    /// Exclusive bound: ascending starts after it, descending starts before it.
    pub after: Option<String>,
    pub limit: usize,
    pub descending: bool,
}

impl IndexRange {
    pub fn ascending(after: Option<String>, limit: usize) -> Self {
        Self {
            after,
            limit,
            descending: false,
        }
    }

    pub fn descending(before: Option<String>, limit: usize) -> Self {
        Self {
            after: before,
            limit,
            descending: true,
        }
    }
}
