use std::sync::{Mutex, PoisonError};

use crate::types::HistoryRecord;

/// Receives every history record after the transaction that wrote it has committed.
///
/// Sinks observe; they cannot fail or veto an operation.
pub trait AuditSink {
    fn emit(&self, record: &HistoryRecord);
}

/// Logs each record at info level on the `fleetlink::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn emit(&self, record: &HistoryRecord) {
        log::info!(
            target: "fleetlink::audit",
            "{} {} {} {} by {} (record {}{})",
            record.action,
            record.relation,
            record.entity,
            record.counterpart,
            record.performed_by,
            record.record_id,
            record
                .reason
                .as_deref()
                .map(|reason| format!(", reason: {reason}"))
                .unwrap_or_default()
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, _record: &HistoryRecord) {}
}

/// Keeps every emitted record in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, record: &HistoryRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}
