//! Storage key derivation for entities, association records and their side indexes.

use crate::{
    errors::FleetError,
    types::{EntityRef, EntityType, RelationType, Side},
};

/// Maximum accepted identifier length.
const MAX_ID_LENGTH: usize = 256;

#[derive(Debug, Clone)]
pub struct KeyScheme {
    prefix: String,
    service: String,
}

impl KeyScheme {
    pub fn new(prefix: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            service: service.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Rejects identifiers that would collide with the key layout.
    pub fn validate_ref(entity: &EntityRef) -> Result<(), FleetError> {
        let id = entity.entity_id.as_str();
        if id.is_empty() {
            return Err(FleetError::invalid(format!("empty {} id", entity.entity_type)));
        }
        if id.len() > MAX_ID_LENGTH {
            return Err(FleetError::invalid(format!(
                "{} id exceeds {MAX_ID_LENGTH} bytes",
                entity.entity_type
            )));
        }
        if id.contains(':') || id.chars().any(char::is_whitespace) {
            return Err(FleetError::invalid(format!(
                "{} id `{id}` contains a reserved character",
                entity.entity_type
            )));
        }
        Ok(())
    }

    pub fn entity(&self, entity: &EntityRef) -> String {
        self.entity_parts(entity.entity_type, &entity.entity_id)
    }

    pub fn entity_parts(&self, entity_type: EntityType, entity_id: &str) -> String {
        format!("{}:{}:{}:{}", self.prefix, self.service, entity_type.as_str(), entity_id)
    }

    /// Glob matching every key written under this prefix and service.
    pub fn service_pattern(&self) -> String {
        format!("{}:{}:*", self.prefix, self.service)
    }

    /// Index of counterparts for one side of a relation.
    /// Forward: `prefix:service:rel:alias:subject_id`, reverse: `prefix:service:rel:alias_reverse:object_id`.
    pub fn association_index(&self, relation: RelationType, side: Side, entity_id: &str) -> String {
        format!("{}:{}:rel:{}:{}", self.prefix, self.service, index_alias(relation, side), entity_id)
    }

    /// Association document as seen from `side`; `left_id` belongs to that side.
    pub fn association_record(&self, relation: RelationType, side: Side, left_id: &str, right_id: &str) -> String {
        format!(
            "{}:{}:rel:{}:{}:{}",
            self.prefix,
            self.service,
            index_alias(relation, side),
            left_id,
            right_id
        )
    }

    pub fn forward(&self, relation: RelationType, subject: &EntityRef, object: &EntityRef) -> String {
        self.association_record(relation, Side::Subject, &subject.entity_id, &object.entity_id)
    }

    pub fn reverse(&self, relation: RelationType, subject: &EntityRef, object: &EntityRef) -> String {
        self.association_record(relation, Side::Object, &object.entity_id, &subject.entity_id)
    }

    /// Capacity slot held by a "one" side while it has an active association.
    pub fn slot(&self, relation: RelationType, side: Side, entity_id: &str) -> String {
        let side = match side {
            Side::Subject => "subject",
            Side::Object => "object",
        };
        format!("{}:{}:slot:{}:{}:{}", self.prefix, self.service, relation.as_str(), side, entity_id)
    }

    pub fn history_record(&self, record_id: &str) -> String {
        format!("{}:{}:history:record:{}", self.prefix, self.service, record_id)
    }

    pub fn history_index(&self, entity: &EntityRef) -> String {
        format!(
            "{}:{}:history:{}:{}",
            self.prefix,
            self.service,
            entity.entity_type.as_str(),
            entity.entity_id
        )
    }

    /// Hash holding the last timestamp and sequence assigned in an entity's history index.
    pub fn history_counter(&self, entity: &EntityRef) -> String {
        format!(
            "{}:{}:history_seq:{}:{}",
            self.prefix,
            self.service,
            entity.entity_type.as_str(),
            entity.entity_id
        )
    }

    /// Running count of associations removed by cascades of `entity`.
    pub fn cascade_ledger(&self, entity: &EntityRef) -> String {
        format!(
            "{}:{}:cascade:{}:{}",
            self.prefix,
            self.service,
            entity.entity_type.as_str(),
            entity.entity_id
        )
    }
}

fn index_alias(relation: RelationType, side: Side) -> String {
    match side {
        Side::Subject => relation.as_str().to_string(),
        Side::Object => format!("{}_reverse", relation.as_str()),
    }
}
