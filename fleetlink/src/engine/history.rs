use serde_json::Value;

use crate::{
    engine::AssociationEngine,
    errors::FleetError,
    keys::KeyScheme,
    runtime::{
        commands::{HistoryIndexTarget, IndexRange, StoreOp},
        executor::StoreExecutor,
        retry::with_retry,
    },
    types::{EntityRef, HistorySortKey, HistoryRecord, Page, PageRequest},
};

/// Appends history inside link and unlink transactions and serves the read side.
///
/// Records are write-once: nothing here updates or deletes them.
pub struct HistoryAppender<'a, S> {
    engine: &'a AssociationEngine<S>,
}

impl<'a, S: StoreExecutor> HistoryAppender<'a, S> {
    pub fn new(engine: &'a AssociationEngine<S>) -> Self {
        Self { engine }
    }

    /// Op that stores `record` once and indexes it under both participants.
    pub fn append_op(&self, record: &HistoryRecord) -> Result<StoreOp, FleetError> {
        let keys = &self.engine.keys;
        let target = |entity: &EntityRef| HistoryIndexTarget {
            index_key: keys.history_index(entity),
            counter_key: keys.history_counter(entity),
        };
        Ok(StoreOp::AppendHistory {
            record_key: keys.history_record(&record.record_id),
            record_id: record.record_id.clone(),
            record_json: serde_json::to_string(record)?,
            timestamp_ms: record.performed_at.timestamp_millis(),
            indexes: vec![target(&record.entity), target(&record.counterpart)],
        })
    }

    /// Newest first. The cursor is opaque and resumes strictly after the last record returned.
    pub async fn list_history(&self, entity: &EntityRef, page: &PageRequest) -> Result<Page<HistoryRecord>, FleetError> {
        KeyScheme::validate_ref(entity)?;
        let limit = page.effective_limit();
        let store = &self.engine.store;
        let index_key = self.engine.keys.history_index(entity);
        let range = IndexRange::descending(page.cursor.clone(), limit);
        let (index_key, range) = (&index_key, &range);
        let members = with_retry(&self.engine.retry, "list_history", move || store.index_range(index_key, range)).await?;
        if members.is_empty() {
            return Ok(Page::empty());
        }

        let mut parsed = Vec::with_capacity(members.len());
        for member in &members {
            let (sort_key, record_id) = HistorySortKey::parse_member(member).ok_or_else(|| FleetError::Other {
                message: format!("malformed history index member `{member}`").into(),
            })?;
            parsed.push((sort_key, self.engine.keys.history_record(record_id)));
        }

        let record_keys: Vec<String> = parsed.iter().map(|(_, key)| key.clone()).collect();
        let raw = get_chunked(self.engine, &record_keys, "list_history").await?;

        let mut items = Vec::with_capacity(parsed.len());
        for ((sort_key, key), value) in parsed.into_iter().zip(raw) {
            let Some(value) = value else {
                log::warn!("history index of {entity} references missing record {key}");
                continue;
            };
            let mut record: HistoryRecord = serde_json::from_str(&value)?;
            record.sort_key = Some(sort_key);
            items.push(oriented(record, entity));
        }

        let next_cursor = if members.len() == limit { members.last().cloned() } else { None };
        Ok(Page { items, next_cursor })
    }
}

/// Presents a record from the point of view of `entity`.
fn oriented(mut record: HistoryRecord, entity: &EntityRef) -> HistoryRecord {
    if &record.counterpart == entity {
        std::mem::swap(&mut record.entity, &mut record.counterpart);
    }
    record
}

/// Sort keys assigned by an `AppendHistory` op, in target order.
pub(crate) fn parse_sort_keys(result: &Value) -> Option<Vec<HistorySortKey>> {
    result
        .as_array()?
        .iter()
        .map(|pair| {
            let pair = pair.as_array()?;
            Some(HistorySortKey {
                timestamp_ms: integer(pair.first()?)?,
                sequence: u64::try_from(integer(pair.get(1)?)?).ok()?,
            })
        })
        .collect()
}

// Lua numbers are doubles and may come back in float notation.
fn integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().map(|float| float as i64))
}

/// Multi-get split into round trips of at most `batch_get_limit` keys.
pub(crate) async fn get_chunked<S: StoreExecutor>(
    engine: &AssociationEngine<S>,
    keys: &[String],
    operation: &str,
) -> Result<Vec<Option<String>>, FleetError> {
    let mut values = Vec::with_capacity(keys.len());
    let store = &engine.store;
    for chunk in keys.chunks(engine.settings.batch_get_limit.max(1)) {
        let batch = with_retry(&engine.retry, operation, move || store.get_many(chunk)).await?;
        if batch.len() != chunk.len() {
            return Err(FleetError::Other {
                message: format!("multi-get returned {} values for {} keys", batch.len(), chunk.len()).into(),
            });
        }
        values.extend(batch);
    }
    Ok(values)
}
