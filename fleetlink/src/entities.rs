//! Read access to entity documents, which are owned by the surrounding CRUD layer.

use serde_json::Value;

use crate::{
    errors::FleetError,
    keys::KeyScheme,
    runtime::{
        commands::{StoreOp, TransactOutcome, TransactPlan},
        executor::StoreExecutor,
    },
    types::{EntityRef, EntitySummary},
};

/// Whether an entity record exists and can take part in new associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityPresence {
    Missing,
    Active,
    /// Soft-deleted: stored with `active = false`.
    Inactive,
}

impl EntityPresence {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn exists(&self) -> bool {
        !matches!(self, Self::Missing)
    }
}

/// Batched entity lookups. Each call is one store round trip; callers chunk.
#[allow(async_fn_in_trait)]
pub trait EntitySource {
    /// Presence of every ref, positionally aligned with the input.
    async fn exists_many(&self, refs: &[EntityRef]) -> Result<Vec<EntityPresence>, FleetError>;

    /// Summaries of every ref, positionally aligned; `None` for missing entities.
    async fn read_many(&self, refs: &[EntityRef]) -> Result<Vec<Option<EntitySummary>>, FleetError>;
}

/// Entity documents stored as JSON strings under [`KeyScheme::entity`].
#[derive(Clone)]
pub struct EntityRepo<S> {
    store: S,
    keys: KeyScheme,
}

impl<S: StoreExecutor> EntityRepo<S> {
    pub fn new(store: S, keys: KeyScheme) -> Self {
        Self { store, keys }
    }

    /// Writes (or replaces) an entity document. Used by tooling and tests to seed entities.
    pub async fn put(&self, entity: &EntityRef, document: &Value) -> Result<(), FleetError> {
        KeyScheme::validate_ref(entity)?;
        let mut plan = TransactPlan::new();
        plan.push(StoreOp::Put {
            key: self.keys.entity(entity),
            value_json: serde_json::to_string(document)?,
        });
        match self.store.transact(&plan).await? {
            TransactOutcome::Committed(_) => Ok(()),
            TransactOutcome::Rejected { key, .. } => Err(FleetError::Other {
                message: format!("unguarded write to {key} was rejected").into(),
            }),
        }
    }

    pub async fn get(&self, entity: &EntityRef) -> Result<Option<Value>, FleetError> {
        match self.get_raw(entity).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// The stored document text, untouched.
    pub async fn get_raw(&self, entity: &EntityRef) -> Result<Option<String>, FleetError> {
        let values = self.store.get_many(&[self.keys.entity(entity)]).await?;
        Ok(values.into_iter().next().flatten())
    }

    async fn documents(&self, refs: &[EntityRef]) -> Result<Vec<Option<Value>>, FleetError> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = refs.iter().map(|entity| self.keys.entity(entity)).collect();
        let raw = self.store.get_many(&keys).await?;
        raw.into_iter()
            .map(|value| value.map(|raw| serde_json::from_str(&raw)).transpose())
            .collect::<Result<Vec<_>, _>>()
            .map_err(FleetError::from)
    }
}

fn presence_of(document: Option<&Value>) -> EntityPresence {
    match document {
        None => EntityPresence::Missing,
        Some(doc) if doc.get("active").and_then(Value::as_bool) == Some(false) => EntityPresence::Inactive,
        Some(_) => EntityPresence::Active,
    }
}

impl<S: StoreExecutor> EntitySource for EntityRepo<S> {
    async fn exists_many(&self, refs: &[EntityRef]) -> Result<Vec<EntityPresence>, FleetError> {
        let documents = self.documents(refs).await?;
        Ok(documents.iter().map(|doc| presence_of(doc.as_ref())).collect())
    }

    async fn read_many(&self, refs: &[EntityRef]) -> Result<Vec<Option<EntitySummary>>, FleetError> {
        let documents = self.documents(refs).await?;
        Ok(refs
            .iter()
            .zip(documents)
            .map(|(entity, doc)| doc.map(|doc| EntitySummary::from_document(entity.clone(), doc)))
            .collect())
    }
}
