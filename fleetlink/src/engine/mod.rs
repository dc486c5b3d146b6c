//! The association engine: link, unlink, listing, history, cascades and soft deletes over a [`StoreExecutor`].
//!
//! The engine keeps no state between calls. Every invariant is enforced by guarded store transactions, so any
//! number of engine instances can share one store.

pub mod cascade;
pub mod history;
pub mod link;
pub mod reader;
pub mod soft_delete;
pub mod validator;

use std::{collections::HashMap, sync::Arc};

use crate::{
    audit::{AuditSink, LogAuditSink},
    config::{EngineConfig, StoreSettings},
    entities::EntityRepo,
    errors::FleetError,
    keys::KeyScheme,
    registry::RelationRegistry,
    runtime::{
        commands::{TransactOutcome, TransactPlan},
        executor::StoreExecutor,
        retry::{RetryPolicy, with_deadline, with_retry},
    },
    types::{
        AssociationView, CascadeSummary, EntityRef, EntitySummary, HistoryRecord, LinkMeta, LinkResult, OperationMeta, Page,
        PageRequest, RelationType, RestoreSummary, SoftDeleteSummary, UnlinkMeta, UnlinkResult,
    },
};

pub use cascade::{CascadeDeleter, CascadeOptions};
pub use history::HistoryAppender;
pub use link::{LinkExecutor, UnlinkExecutor};
pub use reader::AssociationReader;
pub use soft_delete::SoftDeleteMarker;
pub use validator::{ExistenceValidator, InvalidReason, InvalidRef, ValidationOutcome};

pub struct AssociationEngine<S> {
    pub(crate) store: S,
    pub(crate) keys: KeyScheme,
    pub(crate) relations: RelationRegistry,
    pub(crate) settings: StoreSettings,
    pub(crate) retry: RetryPolicy,
    pub(crate) audit: Arc<dyn AuditSink + Send + Sync>,
    pub(crate) entities: EntityRepo<S>,
}

impl<S: StoreExecutor + Clone> AssociationEngine<S> {
    pub fn new(store: S, config: &EngineConfig) -> Result<Self, FleetError> {
        config.validate()?;
        let keys = config.key_scheme();
        Ok(Self {
            entities: EntityRepo::new(store.clone(), keys.clone()),
            store,
            keys,
            relations: config.relation_registry()?,
            settings: config.store,
            retry: config.retry.clone(),
            audit: Arc::new(LogAuditSink),
        })
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink + Send + Sync>) -> Self {
        self.audit = sink;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_relations(mut self, relations: RelationRegistry) -> Self {
        self.relations = relations;
        self
    }
}

impl<S: StoreExecutor> AssociationEngine<S> {
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn keys(&self) -> &KeyScheme {
        &self.keys
    }

    pub fn relations(&self) -> &RelationRegistry {
        &self.relations
    }

    pub fn entities(&self) -> &EntityRepo<S> {
        &self.entities
    }

    /// Submits a plan, retrying transient failures. Rejected guards are returned, not raised.
    pub(crate) async fn submit(&self, plan: &TransactPlan, operation: &str) -> Result<TransactOutcome, FleetError> {
        let items = plan.item_count();
        if items > self.settings.max_transaction_items {
            return Err(FleetError::TransactionTooLarge {
                items,
                limit: self.settings.max_transaction_items,
            });
        }
        let store = &self.store;
        with_retry(&self.retry, operation, move || store.transact(plan)).await
    }

    pub(crate) fn validator(&self) -> ExistenceValidator<'_, EntityRepo<S>> {
        ExistenceValidator::new(&self.entities, self.settings.batch_get_limit, &self.retry)
    }

    pub(crate) fn reader(&self) -> AssociationReader<'_, S> {
        AssociationReader::new(self)
    }

    pub(crate) fn history(&self) -> HistoryAppender<'_, S> {
        HistoryAppender::new(self)
    }

    /// Creates an active association between `subject` and `object`.
    pub async fn link(
        &self,
        subject: &EntityRef,
        object: &EntityRef,
        relation: RelationType,
        meta: LinkMeta,
    ) -> Result<LinkResult, FleetError> {
        with_deadline(
            meta.deadline,
            "link",
            LinkExecutor::new(self).link(subject, object, relation, &meta),
        )
        .await
    }

    /// Removes the association between `subject` and `object`, active or not.
    pub async fn unlink(
        &self,
        subject: &EntityRef,
        object: &EntityRef,
        relation: RelationType,
        meta: UnlinkMeta,
    ) -> Result<UnlinkResult, FleetError> {
        with_deadline(
            meta.deadline,
            "unlink",
            UnlinkExecutor::new(self).unlink(subject, object, relation, &meta),
        )
        .await
    }

    pub async fn list_associations(
        &self,
        entity: &EntityRef,
        relation: RelationType,
        page: &PageRequest,
    ) -> Result<Page<AssociationView>, FleetError> {
        self.reader().list_associations(entity, relation, page).await
    }

    /// Every association of `entity` across all relations it takes part in.
    pub async fn list_all_associations(
        &self,
        entity: &EntityRef,
        include_inactive: bool,
    ) -> Result<Vec<AssociationView>, FleetError> {
        self.reader().list_all_associations(entity, include_inactive).await
    }

    pub async fn list_history(
        &self,
        entity: &EntityRef,
        page: &PageRequest,
    ) -> Result<Page<HistoryRecord>, FleetError> {
        self.history().list_history(entity, page).await
    }

    pub async fn batch_hydrate(&self, refs: &[EntityRef]) -> Result<HashMap<EntityRef, EntitySummary>, FleetError> {
        self.reader().batch_hydrate(refs).await
    }

    /// Fills `summary` on each view with its counterpart's summary.
    pub async fn hydrate_views(&self, views: &mut [AssociationView]) -> Result<(), FleetError> {
        self.reader().hydrate_views(views).await
    }

    pub async fn validate_batch(&self, refs: &[EntityRef]) -> Result<ValidationOutcome, FleetError> {
        self.validator().validate(refs).await
    }

    /// Hard-deletes `entity` and every association that references it.
    pub async fn cascade_delete(
        &self,
        entity: &EntityRef,
        performed_by: &str,
    ) -> Result<CascadeSummary, FleetError> {
        self.cascade_delete_with(entity, &CascadeOptions::new(performed_by)).await
    }

    pub async fn cascade_delete_with(
        &self,
        entity: &EntityRef,
        options: &CascadeOptions,
    ) -> Result<CascadeSummary, FleetError> {
        with_deadline(
            options.deadline,
            "cascade_delete",
            CascadeDeleter::new(self).cascade_delete(entity, options),
        )
        .await
    }

    /// Marks `entity` and its active associations inactive.
    pub async fn soft_delete(&self, entity: &EntityRef, meta: OperationMeta) -> Result<SoftDeleteSummary, FleetError> {
        with_deadline(
            meta.deadline,
            "soft_delete",
            SoftDeleteMarker::new(self).mark_inactive(entity, &meta),
        )
        .await
    }

    /// Reactivates a soft-deleted entity and the associations that can still be restored.
    pub async fn restore(&self, entity: &EntityRef, meta: OperationMeta) -> Result<RestoreSummary, FleetError> {
        with_deadline(
            meta.deadline,
            "restore",
            SoftDeleteMarker::new(self).mark_active(entity, &meta),
        )
        .await
    }
}

/// Rejects refs whose types do not match the relation's declared sides.
pub(crate) fn check_sides(relation: RelationType, subject: &EntityRef, object: &EntityRef) -> Result<(), FleetError> {
    if subject.entity_type != relation.subject_type() || object.entity_type != relation.object_type() {
        return Err(FleetError::invalid(format!(
            "{relation} links {} to {}, got {} and {}",
            relation.subject_type(),
            relation.object_type(),
            subject,
            object
        )));
    }
    KeyScheme::validate_ref(subject)?;
    KeyScheme::validate_ref(object)
}

pub(crate) fn require_actor(meta: &OperationMeta) -> Result<(), FleetError> {
    if meta.performed_by.trim().is_empty() {
        return Err(FleetError::invalid("performed_by must not be empty"));
    }
    Ok(())
}
