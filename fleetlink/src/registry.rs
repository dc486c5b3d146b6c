use std::collections::BTreeMap;

use crate::types::{Cardinality, EntityRef, EntityType, RelationType, Side};

/// Cardinality policy for every relation type.
///
/// Built from configuration and owned by the engine; there is no process-wide registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRegistry {
    cardinalities: BTreeMap<RelationType, Cardinality>,
}

impl Default for RelationRegistry {
    fn default() -> Self {
        let cardinalities = RelationType::ALL
            .into_iter()
            .map(|relation| (relation, default_cardinality(relation)))
            .collect();
        Self { cardinalities }
    }
}

fn default_cardinality(relation: RelationType) -> Cardinality {
    match relation {
        RelationType::DeviceInstallation | RelationType::InstallationContact => Cardinality::ManyToMany,
        RelationType::DeviceSim => Cardinality::OneToOne,
    }
}

impl RelationRegistry {
    pub fn set(&mut self, relation: RelationType, cardinality: Cardinality) -> &mut Self {
        self.cardinalities.insert(relation, cardinality);
        self
    }

    pub fn with(mut self, relation: RelationType, cardinality: Cardinality) -> Self {
        self.set(relation, cardinality);
        self
    }

    pub fn cardinality(&self, relation: RelationType) -> Cardinality {
        self.cardinalities
            .get(&relation)
            .copied()
            .unwrap_or_else(|| default_cardinality(relation))
    }

    /// Sides of `relation` that own a capacity slot.
    pub fn limited_sides(&self, relation: RelationType) -> Vec<Side> {
        let cardinality = self.cardinality(relation);
        [Side::Subject, Side::Object]
            .into_iter()
            .filter(|side| cardinality.limits(*side))
            .collect()
    }

    /// Relations `entity` takes part in, with the side it sits on.
    pub fn relations_of(&self, entity: &EntityRef) -> Vec<(RelationType, Side)> {
        relations_of_type(entity.entity_type)
    }
}

fn relations_of_type(entity_type: EntityType) -> Vec<(RelationType, Side)> {
    RelationType::involving(entity_type)
        .filter_map(|relation| relation.side_of(entity_type).map(|side| (relation, side)))
        .collect()
}
