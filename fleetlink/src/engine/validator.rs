use std::collections::HashSet;

use serde::Serialize;

use crate::{
    entities::{EntityPresence, EntitySource},
    errors::FleetError,
    keys::KeyScheme,
    runtime::retry::{RetryPolicy, with_retry},
    types::EntityRef,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    Missing,
    /// Soft-deleted entities cannot take part in new associations.
    Inactive,
    /// The lookup kept failing; the entity is treated as invalid.
    Indeterminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidRef {
    pub entity: EntityRef,
    pub reason: InvalidReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub valid: Vec<EntityRef>,
    pub invalid: Vec<InvalidRef>,
}

impl ValidationOutcome {
    pub fn all_valid(&self) -> bool {
        self.invalid.is_empty()
    }

    pub fn reason_for(&self, entity: &EntityRef) -> Option<InvalidReason> {
        self.invalid
            .iter()
            .find(|invalid| &invalid.entity == entity)
            .map(|invalid| invalid.reason)
    }
}

/// Batch existence check in chunks of at most `batch_limit` refs.
pub struct ExistenceValidator<'a, E> {
    source: &'a E,
    batch_limit: usize,
    retry: &'a RetryPolicy,
}

impl<'a, E: EntitySource> ExistenceValidator<'a, E> {
    pub fn new(source: &'a E, batch_limit: usize, retry: &'a RetryPolicy) -> Self {
        Self {
            source,
            batch_limit: batch_limit.max(1),
            retry,
        }
    }

    /// Partitions `refs` into valid and invalid. Duplicates are checked and reported once.
    ///
    /// A chunk that still fails transiently after retries marks each of its refs `indeterminate`.
    pub async fn validate(&self, refs: &[EntityRef]) -> Result<ValidationOutcome, FleetError> {
        let mut seen = HashSet::new();
        let mut outcome = ValidationOutcome::default();
        let mut lookups = Vec::new();
        for entity in refs {
            if !seen.insert(entity) {
                continue;
            }
            if KeyScheme::validate_ref(entity).is_err() {
                outcome.invalid.push(InvalidRef {
                    entity: entity.clone(),
                    reason: InvalidReason::Missing,
                });
                continue;
            }
            lookups.push(entity.clone());
        }

        for chunk in lookups.chunks(self.batch_limit) {
            let source = self.source;
            let presence = match with_retry(self.retry, "validate_batch", move || source.exists_many(chunk)).await {
                Ok(presence) if presence.len() == chunk.len() => presence,
                Ok(presence) => {
                    return Err(FleetError::Other {
                        message: format!("expected {} presence results, got {}", chunk.len(), presence.len()).into(),
                    });
                }
                Err(err) if err.is_transient() => {
                    log::warn!("existence check of {} ref(s) is indeterminate: {err}", chunk.len());
                    outcome.invalid.extend(chunk.iter().map(|entity| InvalidRef {
                        entity: entity.clone(),
                        reason: InvalidReason::Indeterminate,
                    }));
                    continue;
                }
                Err(err) => return Err(err),
            };

            for (entity, presence) in chunk.iter().zip(presence) {
                match presence {
                    EntityPresence::Active => outcome.valid.push(entity.clone()),
                    EntityPresence::Inactive => outcome.invalid.push(InvalidRef {
                        entity: entity.clone(),
                        reason: InvalidReason::Inactive,
                    }),
                    EntityPresence::Missing => outcome.invalid.push(InvalidRef {
                        entity: entity.clone(),
                        reason: InvalidReason::Missing,
                    }),
                }
            }
        }

        Ok(outcome)
    }

    /// Fails with the first invalid ref mapped to an engine error.
    pub async fn require_active(&self, refs: &[EntityRef]) -> Result<(), FleetError> {
        let outcome = self.validate(refs).await?;
        match outcome.invalid.into_iter().next() {
            None => Ok(()),
            Some(InvalidRef {
                entity,
                reason: InvalidReason::Missing | InvalidReason::Inactive,
            }) => Err(FleetError::NotFound { entity }),
            Some(InvalidRef {
                entity,
                reason: InvalidReason::Indeterminate,
            }) => Err(self.unconfirmed(&entity)),
        }
    }

    /// Re-checks refs that already passed validation earlier in the same operation.
    ///
    /// Refs that have since gone missing or inactive are reported together as
    /// [`FleetError::PartialInputInvalid`]; an unconfirmed lookup still fails as transient.
    pub async fn require_still_active(&self, refs: &[EntityRef]) -> Result<(), FleetError> {
        let outcome = self.validate(refs).await?;
        if let Some(unknown) = outcome
            .invalid
            .iter()
            .find(|invalid| invalid.reason == InvalidReason::Indeterminate)
        {
            return Err(self.unconfirmed(&unknown.entity));
        }
        if outcome.invalid.is_empty() {
            return Ok(());
        }
        Err(FleetError::PartialInputInvalid {
            entities: outcome.invalid.into_iter().map(|invalid| invalid.entity).collect(),
        })
    }

    fn unconfirmed(&self, entity: &EntityRef) -> FleetError {
        FleetError::TransientStore {
            message: format!("could not confirm that {entity} exists"),
            attempts: self.retry.max_attempts,
        }
    }
}
