use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::{
    engine::{AssociationEngine, require_actor},
    entities::EntitySource,
    errors::FleetError,
    keys::KeyScheme,
    runtime::{
        commands::{Guard, GuardTag, StoreOp, TransactOutcome, TransactPlan},
        executor::StoreExecutor,
        retry::with_retry,
    },
    types::{AssociationRecord, AssociationStatus, EntityRef, OperationMeta, RestoreSummary, Side, SoftDeleteSummary},
};

const ENTITY_PATCH_ATTEMPTS: u32 = 3;

/// Flips entities and their associations between active and inactive without removing anything.
///
/// Soft deletes write no history: history only records link and unlink transitions.
pub struct SoftDeleteMarker<'a, S> {
    engine: &'a AssociationEngine<S>,
}

fn status_fields(status: AssociationStatus, meta: &OperationMeta) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("status".to_string(), json!(status.as_str()));
    fields.insert("status_changed_at".to_string(), json!(Utc::now()));
    fields.insert("status_changed_by".to_string(), json!(meta.performed_by));
    fields
}

impl<'a, S: StoreExecutor> SoftDeleteMarker<'a, S> {
    pub fn new(engine: &'a AssociationEngine<S>) -> Self {
        Self { engine }
    }

    async fn require_entity(&self, entity: &EntityRef) -> Result<(), FleetError> {
        KeyScheme::validate_ref(entity)?;
        let presence = self.engine.entities.exists_many(std::slice::from_ref(entity)).await?;
        match presence.first() {
            Some(presence) if presence.exists() => Ok(()),
            _ => Err(FleetError::NotFound { entity: entity.clone() }),
        }
    }

    /// Merges `active` and provenance fields into the entity document.
    ///
    /// The document is rewritten from Rust under a guard on its previous text. Fields the engine does not own keep
    /// their exact encoding; a concurrent write fails the guard and the merge starts over from a fresh read.
    async fn patch_entity(&self, entity: &EntityRef, fields: Map<String, Value>) -> Result<(), FleetError> {
        let key = self.engine.keys.entity(entity);
        let entities = &self.engine.entities;
        for attempt in 1..=ENTITY_PATCH_ATTEMPTS {
            let raw = with_retry(&self.engine.retry, "patch_entity", move || entities.get_raw(entity))
                .await?
                .ok_or_else(|| FleetError::NotFound { entity: entity.clone() })?;
            let mut document: Value = serde_json::from_str(&raw)?;
            let Some(object) = document.as_object_mut() else {
                return Err(FleetError::Other {
                    message: format!("{entity} is not stored as a JSON object").into(),
                });
            };
            object.extend(fields.clone());

            let mut plan = TransactPlan::new();
            plan.guard(Guard::matches(key.clone(), raw, GuardTag::Unchanged));
            plan.push(StoreOp::Put {
                key: key.clone(),
                value_json: serde_json::to_string(&document)?,
            });
            match self.engine.submit(&plan, "patch_entity").await? {
                TransactOutcome::Committed(_) => return Ok(()),
                TransactOutcome::Rejected { current: None, .. } => {
                    return Err(FleetError::NotFound { entity: entity.clone() });
                }
                TransactOutcome::Rejected { .. } => {
                    log::debug!("{entity} changed during patch attempt {attempt}/{ENTITY_PATCH_ATTEMPTS}, re-reading");
                }
            }
        }
        Err(FleetError::TransientStore {
            message: format!("{entity} kept changing while its status was being written"),
            attempts: ENTITY_PATCH_ATTEMPTS,
        })
    }

    /// Deactivates every active association of `entity`, one transaction per pair. Returns how many flipped.
    async fn deactivate_associations(&self, entity: &EntityRef, meta: &OperationMeta) -> Result<u64, FleetError> {
        let keys = &self.engine.keys;
        let views = self.engine.reader().list_all_associations(entity, false).await?;
        let mut deactivated = 0;
        for view in views {
            let AssociationRecord {
                relation,
                subject,
                object,
                ..
            } = view.record;
            let forward = keys.forward(relation, &subject, &object);
            let fields = status_fields(AssociationStatus::Inactive, meta);

            let mut plan = TransactPlan::new();
            plan.guard(Guard::exists(forward.clone(), GuardTag::Linked));
            plan.push(StoreOp::Patch {
                key: forward,
                fields: fields.clone(),
            });
            plan.push(StoreOp::Patch {
                key: keys.reverse(relation, &subject, &object),
                fields,
            });
            plan.push(StoreOp::DeleteIfEquals {
                key: keys.slot(relation, Side::Subject, &subject.entity_id),
                expected: object.entity_id.clone(),
            });
            plan.push(StoreOp::DeleteIfEquals {
                key: keys.slot(relation, Side::Object, &object.entity_id),
                expected: subject.entity_id.clone(),
            });

            match self.engine.submit(&plan, "soft_delete").await? {
                TransactOutcome::Committed(_) => deactivated += 1,
                TransactOutcome::Rejected { .. } => {
                    log::debug!("{subject} -> {object} was unlinked during soft delete, skipping");
                }
            }
        }
        Ok(deactivated)
    }

    /// Sets `active = false` on `entity` after deactivating its associations.
    pub async fn mark_inactive(&self, entity: &EntityRef, meta: &OperationMeta) -> Result<SoftDeleteSummary, FleetError> {
        require_actor(meta)?;
        self.require_entity(entity).await?;

        let mut associations_deactivated = self.deactivate_associations(entity, meta).await?;
        let mut fields = Map::new();
        fields.insert("active".to_string(), json!(false));
        fields.insert("deactivated_at".to_string(), json!(Utc::now()));
        fields.insert("deactivated_by".to_string(), json!(meta.performed_by));
        self.patch_entity(entity, fields).await?;
        // Links that committed between the first sweep and the entity patch.
        associations_deactivated += self.deactivate_associations(entity, meta).await?;

        log::info!("soft-deleted {entity} and {associations_deactivated} association(s)");
        Ok(SoftDeleteSummary {
            associations_deactivated,
        })
    }

    /// Reactivates `entity` and each inactive association whose counterpart is active and whose capacity slots
    /// are still free. Pairs that cannot be restored stay inactive and are reported.
    pub async fn mark_active(&self, entity: &EntityRef, meta: &OperationMeta) -> Result<RestoreSummary, FleetError> {
        require_actor(meta)?;
        self.require_entity(entity).await?;

        let mut fields = Map::new();
        fields.insert("active".to_string(), json!(true));
        fields.insert("deactivated_at".to_string(), Value::Null);
        fields.insert("deactivated_by".to_string(), Value::Null);
        fields.insert("restored_at".to_string(), json!(Utc::now()));
        fields.insert("restored_by".to_string(), json!(meta.performed_by));
        self.patch_entity(entity, fields).await?;

        let inactive: Vec<_> = self
            .engine
            .reader()
            .list_all_associations(entity, true)
            .await?
            .into_iter()
            .filter(|view| !view.record.status.is_active())
            .collect();
        let counterparts: Vec<EntityRef> = inactive.iter().map(|view| view.counterpart.clone()).collect();
        let presence = self.engine.validator().validate(&counterparts).await?;

        let keys = &self.engine.keys;
        let mut summary = RestoreSummary::default();
        for view in inactive {
            if presence.reason_for(&view.counterpart).is_some() {
                summary.skipped_inactive_counterparts.push(view.counterpart);
                continue;
            }
            let AssociationRecord {
                relation,
                subject,
                object,
                ..
            } = view.record;
            let forward = keys.forward(relation, &subject, &object);
            let fields = status_fields(AssociationStatus::Active, meta);

            let mut plan = TransactPlan::new();
            plan.guard(Guard::exists(forward.clone(), GuardTag::Linked));
            let limited = self.engine.relations.limited_sides(relation);
            for side in &limited {
                let holder = if *side == Side::Subject { &subject } else { &object };
                plan.guard(Guard::absent(
                    keys.slot(relation, *side, &holder.entity_id),
                    GuardTag::SlotFree,
                ));
            }
            plan.push(StoreOp::Patch {
                key: forward,
                fields: fields.clone(),
            });
            plan.push(StoreOp::Patch {
                key: keys.reverse(relation, &subject, &object),
                fields,
            });
            for side in &limited {
                let (holder, counterpart) = if *side == Side::Subject {
                    (&subject, &object)
                } else {
                    (&object, &subject)
                };
                plan.push(StoreOp::Put {
                    key: keys.slot(relation, *side, &holder.entity_id),
                    value_json: counterpart.entity_id.clone(),
                });
            }

            match self.engine.submit(&plan, "restore").await? {
                TransactOutcome::Committed(_) => summary.associations_reactivated += 1,
                TransactOutcome::Rejected {
                    tag: GuardTag::SlotFree,
                    current,
                    ..
                } => {
                    log::info!(
                        "left {subject} -> {object} inactive: {relation} slot is held by {}",
                        current.as_deref().unwrap_or("another entity")
                    );
                    summary.conflicts.push(view.counterpart);
                }
                TransactOutcome::Rejected { .. } => {
                    log::debug!("{subject} -> {object} was unlinked during restore, skipping");
                }
            }
        }

        log::info!(
            "restored {entity}: {} association(s) reactivated, {} conflict(s)",
            summary.associations_reactivated,
            summary.conflicts.len()
        );
        Ok(summary)
    }
}
