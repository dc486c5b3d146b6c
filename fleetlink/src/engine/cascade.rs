use tokio::time::Instant;

use crate::{
    engine::{
        AssociationEngine,
        history::get_chunked,
        link::{CASCADE_REASON, UnlinkExecutor},
    },
    errors::FleetError,
    keys::KeyScheme,
    runtime::{
        commands::{Guard, GuardTag, StoreOp, TransactOutcome, TransactPlan},
        executor::StoreExecutor,
    },
    types::{CascadeSummary, EntityRef, OperationMeta},
};

/// Enumerate-and-delete passes attempted before giving up on associations created concurrently.
const MAX_CASCADE_PASSES: usize = 3;

/// Provenance and deadline of a cascade delete.
#[derive(Debug, Clone, Default)]
pub struct CascadeOptions {
    pub performed_by: String,
    /// Recorded on every unlink; defaults to `cascade delete`.
    pub reason: Option<String>,
    pub source_address: Option<String>,
    pub deadline: Option<Instant>,
}

impl CascadeOptions {
    pub fn new(performed_by: impl Into<String>) -> Self {
        Self {
            performed_by: performed_by.into(),
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_source_address(mut self, address: impl Into<String>) -> Self {
        self.source_address = Some(address.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn unlink_meta(&self) -> OperationMeta {
        OperationMeta {
            performed_by: self.performed_by.clone(),
            source_address: self.source_address.clone(),
            reason: Some(self.reason.clone().unwrap_or_else(|| CASCADE_REASON.to_string())),
            deadline: None,
        }
    }
}

/// Deletes an entity and every association referencing it, one transaction per association.
///
/// Re-issuing the same call after a failure continues where the previous run stopped. Progress is counted in a
/// per-entity ledger bumped inside each unlink transaction, so the reported total counts every pair once.
pub struct CascadeDeleter<'a, S> {
    engine: &'a AssociationEngine<S>,
}

impl<'a, S: StoreExecutor> CascadeDeleter<'a, S> {
    pub fn new(engine: &'a AssociationEngine<S>) -> Self {
        Self { engine }
    }

    pub async fn cascade_delete(
        &self,
        entity: &EntityRef,
        options: &CascadeOptions,
    ) -> Result<CascadeSummary, FleetError> {
        KeyScheme::validate_ref(entity)?;
        if options.performed_by.trim().is_empty() {
            return Err(FleetError::invalid("performed_by must not be empty"));
        }

        let keys = &self.engine.keys;
        let ledger = keys.cascade_ledger(entity);
        let meta = options.unlink_meta();
        let unlinker = UnlinkExecutor::new(self.engine);
        let mut summary = CascadeSummary {
            entity: Some(entity.clone()),
            ..CascadeSummary::default()
        };

        for pass in 1..=MAX_CASCADE_PASSES {
            let views = match self.engine.reader().list_all_associations(entity, true).await {
                Ok(views) => views,
                Err(err) => return Err(self.partial_failure(entity, &ledger, err).await),
            };
            log::debug!("cascade of {entity}, pass {pass}: {} association(s) to remove", views.len());

            for view in views {
                let record = view.record;
                match unlinker
                    .unlink_pair(&record.subject, &record.object, record.relation, &meta, Some(&ledger))
                    .await
                {
                    Ok(_) => {
                        summary.associations_deleted_this_run += 1;
                        summary.history_records_written += 1;
                        *summary.per_relation.entry(record.relation).or_default() += 1;
                    }
                    Err(FleetError::NotLinked { .. }) => {
                        log::debug!("{} -> {} already unlinked, skipping", record.subject, record.object);
                    }
                    Err(err) => return Err(self.partial_failure(entity, &ledger, err).await),
                }
            }

            let total = match self.read_ledger(&ledger).await {
                Ok(total) => total,
                Err(err) => return Err(self.partial_failure(entity, &ledger, err).await),
            };

            // Index keys disappear with their last member, so absent indexes mean no association is left.
            let mut plan = TransactPlan::new();
            for (relation, side) in self.engine.relations.relations_of(entity) {
                plan.guard(Guard::absent(
                    keys.association_index(relation, side, &entity.entity_id),
                    GuardTag::Unlinked,
                ));
            }
            let entity_op = plan.push(StoreOp::Delete {
                key: keys.entity(entity),
            });
            plan.push(StoreOp::Delete { key: ledger.clone() });

            match self.engine.submit(&plan, "cascade_delete").await {
                Ok(TransactOutcome::Committed(results)) => {
                    summary.entity_deleted = results.get(entity_op).is_some_and(|value| !value.is_null());
                    summary.associations_deleted = total;
                    log::info!(
                        "cascade delete of {entity} removed {} association(s) ({} this run), entity deleted: {}",
                        summary.associations_deleted,
                        summary.associations_deleted_this_run,
                        summary.entity_deleted
                    );
                    return Ok(summary);
                }
                Ok(TransactOutcome::Rejected { key, .. }) => {
                    log::debug!("cascade of {entity}: {key} gained members during pass {pass}, re-enumerating");
                }
                Err(err) => return Err(self.partial_failure(entity, &ledger, err).await),
            }
        }

        let source = FleetError::Other {
            message: format!("associations kept appearing after {MAX_CASCADE_PASSES} passes").into(),
        };
        Err(self.partial_failure(entity, &ledger, source).await)
    }

    async fn read_ledger(&self, ledger: &str) -> Result<u64, FleetError> {
        let values = get_chunked(self.engine, &[ledger.to_string()], "cascade_delete").await?;
        match values.into_iter().next().flatten() {
            Some(raw) => raw.parse().map_err(|_| FleetError::Other {
                message: format!("cascade ledger {ledger} holds `{raw}`").into(),
            }),
            None => Ok(0),
        }
    }

    async fn partial_failure(&self, entity: &EntityRef, ledger: &str, source: FleetError) -> FleetError {
        let deleted_count = self.read_ledger(ledger).await.unwrap_or_else(|err| {
            log::warn!("could not read cascade ledger of {entity}: {err}");
            0
        });
        log::warn!("cascade delete of {entity} stopped after {deleted_count} association(s): {source}");
        FleetError::PartialCascadeFailure {
            entity: entity.clone(),
            deleted_count,
            source: Box::new(source),
        }
    }
}
