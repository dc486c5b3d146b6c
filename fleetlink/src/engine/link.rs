use chrono::Utc;
use serde_json::Value;

use crate::{
    engine::{AssociationEngine, check_sides, history::parse_sort_keys, require_actor},
    errors::FleetError,
    id::generate_record_id,
    runtime::{
        commands::{Guard, GuardTag, StoreOp, TransactOutcome, TransactPlan},
        executor::StoreExecutor,
        retry::with_retry,
    },
    types::{
        AssociationRecord, AssociationStatus, EntityRef, HistoryAction, HistoryRecord, LinkResult, OperationMeta,
        RelationType, Side, UnlinkResult,
    },
};

/// Reason recorded on unlinks issued by a cascade delete.
pub const CASCADE_REASON: &str = "cascade delete";

fn history_record(
    relation: RelationType,
    subject: &EntityRef,
    object: &EntityRef,
    action: HistoryAction,
    meta: &OperationMeta,
) -> HistoryRecord {
    HistoryRecord {
        record_id: generate_record_id(),
        relation,
        entity: subject.clone(),
        counterpart: object.clone(),
        action,
        performed_at: Utc::now(),
        performed_by: meta.performed_by.clone(),
        source_address: meta.source_address.clone(),
        reason: meta.reason.clone(),
        sort_key: None,
    }
}

/// Applies the subject-side sort key assigned by the store to the returned history record.
fn assign_sort_key(history: &mut HistoryRecord, results: &[Value], history_op: usize) {
    history.sort_key = results
        .get(history_op)
        .and_then(parse_sort_keys)
        .and_then(|keys| keys.first().copied());
}

fn side_entity<'e>(side: Side, subject: &'e EntityRef, object: &'e EntityRef) -> &'e EntityRef {
    match side {
        Side::Subject => subject,
        Side::Object => object,
    }
}

/// Creates associations in one guarded transaction.
pub struct LinkExecutor<'a, S> {
    engine: &'a AssociationEngine<S>,
}

impl<'a, S: StoreExecutor> LinkExecutor<'a, S> {
    pub fn new(engine: &'a AssociationEngine<S>) -> Self {
        Self { engine }
    }

    /// Guards and ops of a link. Returns the plan and the position of the history op.
    fn plan(&self, record: &AssociationRecord, history: &HistoryRecord) -> Result<(TransactPlan, usize), FleetError> {
        let keys = &self.engine.keys;
        let (relation, subject, object) = (record.relation, &record.subject, &record.object);
        let forward = keys.forward(relation, subject, object);
        let reverse = keys.reverse(relation, subject, object);
        let limited = self.engine.relations.limited_sides(relation);

        let mut plan = TransactPlan::new();
        plan.guard(Guard::absent(forward.clone(), GuardTag::Unlinked));
        plan.guard(Guard::absent(reverse.clone(), GuardTag::Unlinked));
        for side in &limited {
            let holder = side_entity(*side, subject, object);
            plan.guard(Guard::absent(
                keys.slot(relation, *side, &holder.entity_id),
                GuardTag::SlotFree,
            ));
        }
        plan.guard(Guard::exists(keys.entity(subject), GuardTag::EntityPresent));
        plan.guard(Guard::exists(keys.entity(object), GuardTag::EntityPresent));

        let document = serde_json::to_string(record)?;
        plan.push(StoreOp::Put {
            key: forward,
            value_json: document.clone(),
        });
        plan.push(StoreOp::Put {
            key: reverse,
            value_json: document,
        });
        plan.push(StoreOp::IndexAdd {
            index_key: keys.association_index(relation, Side::Subject, &subject.entity_id),
            member: object.entity_id.clone(),
        });
        plan.push(StoreOp::IndexAdd {
            index_key: keys.association_index(relation, Side::Object, &object.entity_id),
            member: subject.entity_id.clone(),
        });
        for side in &limited {
            let (holder, counterpart) = match side {
                Side::Subject => (subject, object),
                Side::Object => (object, subject),
            };
            plan.push(StoreOp::Put {
                key: keys.slot(relation, *side, &holder.entity_id),
                value_json: counterpart.entity_id.clone(),
            });
        }
        let history_op = plan.push(self.engine.history().append_op(history)?);
        Ok((plan, history_op))
    }

    /// Whether `history` is already stored, i.e. an earlier attempt of this call committed.
    async fn wrote_history(&self, history: &HistoryRecord) -> Result<bool, FleetError> {
        let keys = [self.engine.keys.history_record(&history.record_id)];
        let (store, keys) = (&self.engine.store, &keys[..]);
        let found = with_retry(&self.engine.retry, "link", move || store.get_many(keys)).await?;
        Ok(found.into_iter().next().flatten().is_some())
    }

    /// Links `subject` to `object`.
    ///
    /// A commit whose acknowledgement was lost is retried; the retry then finds the record this call wrote and
    /// reports success. The returned history carries no sort key in that case.
    pub async fn link(
        &self,
        subject: &EntityRef,
        object: &EntityRef,
        relation: RelationType,
        meta: &OperationMeta,
    ) -> Result<LinkResult, FleetError> {
        check_sides(relation, subject, object)?;
        require_actor(meta)?;
        let validator = self.engine.validator();
        validator.require_active(&[subject.clone(), object.clone()]).await?;

        let record = AssociationRecord {
            relation,
            subject: subject.clone(),
            object: object.clone(),
            status: AssociationStatus::Active,
            linked_at: Utc::now(),
            linked_by: meta.performed_by.clone(),
            reason: meta.reason.clone(),
            status_changed_at: None,
            status_changed_by: None,
        };
        let mut history = history_record(relation, subject, object, HistoryAction::Linked, meta);
        let (plan, history_op) = self.plan(&record, &history)?;
        let document = serde_json::to_string(&record)?;

        // One extra attempt when an entity guard fails but re-validation still finds both entities.
        let mut entity_guard_failures = 0;
        loop {
            match self.engine.submit(&plan, "link").await? {
                TransactOutcome::Committed(results) => {
                    assign_sort_key(&mut history, &results, history_op);
                    log::info!("linked {subject} -> {object} via {relation}");
                    self.engine.audit.emit(&history);
                    return Ok(LinkResult {
                        association: record,
                        history,
                    });
                }
                TransactOutcome::Rejected { tag, key, current } => match tag {
                    GuardTag::Unlinked => {
                        if current.as_deref() == Some(document.as_str()) && self.wrote_history(&history).await? {
                            log::info!("linked {subject} -> {object} via {relation} (acknowledged on retry)");
                            self.engine.audit.emit(&history);
                            return Ok(LinkResult {
                                association: record,
                                history,
                            });
                        }
                        return Err(FleetError::DuplicateLink {
                            relation,
                            subject: subject.clone(),
                            object: object.clone(),
                        });
                    }
                    GuardTag::SlotFree => {
                        let keys = &self.engine.keys;
                        let entity = if key == keys.slot(relation, Side::Subject, &subject.entity_id) {
                            subject
                        } else {
                            object
                        };
                        return Err(FleetError::CapacityExceeded {
                            relation,
                            entity: entity.clone(),
                            holder: current,
                        });
                    }
                    GuardTag::EntityPresent => {
                        let vanished = if key == self.engine.keys.entity(subject) { subject } else { object };
                        log::debug!("{vanished} disappeared between validation and link; re-validating");
                        validator.require_still_active(&[subject.clone(), object.clone()]).await?;
                        entity_guard_failures += 1;
                        if entity_guard_failures > 1 {
                            return Err(FleetError::PartialInputInvalid {
                                entities: vec![vanished.clone()],
                            });
                        }
                    }
                    GuardTag::Linked | GuardTag::Unchanged => {
                        return Err(FleetError::Other {
                            message: format!("unexpected {} guard failure on {key}", tag.as_str()).into(),
                        });
                    }
                },
            }
        }
    }
}

/// Removes associations in one guarded transaction.
pub struct UnlinkExecutor<'a, S> {
    engine: &'a AssociationEngine<S>,
}

impl<'a, S: StoreExecutor> UnlinkExecutor<'a, S> {
    pub fn new(engine: &'a AssociationEngine<S>) -> Self {
        Self { engine }
    }

    /// Unlinks `subject` from `object`.
    ///
    /// Unlike link, a retried unlink cannot tell its own lost commit from a concurrent unlink: both leave the
    /// pair absent and the call reports [`FleetError::NotLinked`]. The pair's history shows which one happened.
    pub async fn unlink(
        &self,
        subject: &EntityRef,
        object: &EntityRef,
        relation: RelationType,
        meta: &OperationMeta,
    ) -> Result<UnlinkResult, FleetError> {
        check_sides(relation, subject, object)?;
        require_actor(meta)?;
        self.unlink_pair(subject, object, relation, meta, None).await
    }

    /// Unlinks one pair. With `ledger`, the counter at that key is bumped in the same transaction.
    pub(crate) async fn unlink_pair(
        &self,
        subject: &EntityRef,
        object: &EntityRef,
        relation: RelationType,
        meta: &OperationMeta,
        ledger: Option<&str>,
    ) -> Result<UnlinkResult, FleetError> {
        let keys = &self.engine.keys;
        let forward = keys.forward(relation, subject, object);
        let mut history = history_record(relation, subject, object, HistoryAction::Unlinked, meta);

        let mut plan = TransactPlan::new();
        plan.guard(Guard::exists(forward.clone(), GuardTag::Linked));
        let removed_op = plan.push(StoreOp::Delete { key: forward });
        plan.push(StoreOp::Delete {
            key: keys.reverse(relation, subject, object),
        });
        plan.push(StoreOp::IndexRemove {
            index_key: keys.association_index(relation, Side::Subject, &subject.entity_id),
            member: object.entity_id.clone(),
        });
        plan.push(StoreOp::IndexRemove {
            index_key: keys.association_index(relation, Side::Object, &object.entity_id),
            member: subject.entity_id.clone(),
        });
        // Slots are released only while they still name this pair, whatever the current cardinality.
        plan.push(StoreOp::DeleteIfEquals {
            key: keys.slot(relation, Side::Subject, &subject.entity_id),
            expected: object.entity_id.clone(),
        });
        plan.push(StoreOp::DeleteIfEquals {
            key: keys.slot(relation, Side::Object, &object.entity_id),
            expected: subject.entity_id.clone(),
        });
        let history_op = plan.push(self.engine.history().append_op(&history)?);
        if let Some(ledger) = ledger {
            plan.push(StoreOp::Incr {
                key: ledger.to_string(),
                by: 1,
            });
        }

        match self.engine.submit(&plan, "unlink").await? {
            TransactOutcome::Committed(results) => {
                let removed = match results.get(removed_op) {
                    Some(Value::String(raw)) => serde_json::from_str::<AssociationRecord>(raw)?,
                    _ => {
                        return Err(FleetError::Other {
                            message: "unlink committed without returning the removed record".into(),
                        });
                    }
                };
                assign_sort_key(&mut history, &results, history_op);
                log::info!("unlinked {subject} -> {object} via {relation}");
                self.engine.audit.emit(&history);
                Ok(UnlinkResult { removed, history })
            }
            TransactOutcome::Rejected { tag: GuardTag::Linked, .. } => Err(FleetError::NotLinked {
                relation,
                subject: subject.clone(),
                object: object.clone(),
            }),
            TransactOutcome::Rejected { tag, key, .. } => Err(FleetError::Other {
                message: format!("unexpected {} guard failure on {key}", tag.as_str()).into(),
            }),
        }
    }
}
