use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::errors::FleetError;

// ═══════════════════════════════════════════════════════════════════════════════
// Entities
// ═══════════════════════════════════════════════════════════════════════════════

/// Kinds of independently stored fleet entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Device,
    Installation,
    Contact,
    SimCard,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [Self::Device, Self::Installation, Self::Contact, Self::SimCard];

    /// Collection segment used in storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Installation => "installation",
            Self::Contact => "contact",
            Self::SimCard => "sim_card",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = FleetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "device" | "devices" => Ok(Self::Device),
            "installation" | "installations" => Ok(Self::Installation),
            "contact" | "contacts" => Ok(Self::Contact),
            "sim_card" | "sim" | "sim_cards" | "sims" => Ok(Self::SimCard),
            other => Err(FleetError::invalid(format!("unknown entity type `{other}`"))),
        }
    }
}

/// Opaque `(type, id)` pair identifying a stored entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }

    pub fn device(id: impl Into<String>) -> Self {
        Self::new(EntityType::Device, id)
    }

    pub fn installation(id: impl Into<String>) -> Self {
        Self::new(EntityType::Installation, id)
    }

    pub fn contact(id: impl Into<String>) -> Self {
        Self::new(EntityType::Contact, id)
    }

    pub fn sim_card(id: impl Into<String>) -> Self {
        Self::new(EntityType::SimCard, id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Parses `type:id`, e.g. `device:D1`.
impl FromStr for EntityRef {
    type Err = FleetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (kind, id) = value
            .split_once(':')
            .ok_or_else(|| FleetError::invalid(format!("expected `type:id`, got `{value}`")))?;
        Ok(Self::new(kind.parse()?, id))
    }
}

/// Lightweight projection of an entity document, used to hydrate association lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub entity: EntityRef,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub document: Value,
}

/// Document fields tried, in order, when deriving a display label.
const LABEL_FIELDS: &[&str] = &["name", "label", "serial_number", "iccid", "email"];

impl EntitySummary {
    pub fn from_document(entity: EntityRef, document: Value) -> Self {
        let active = document.get("active").and_then(Value::as_bool).unwrap_or(true);
        let label = LABEL_FIELDS
            .iter()
            .find_map(|field| document.get(*field).and_then(Value::as_str))
            .map(str::to_string);
        Self {
            entity,
            active,
            label,
            document,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Relations
// ═══════════════════════════════════════════════════════════════════════════════

/// Semantic kind of a relationship between two entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    /// Device (subject) installed at an installation (object).
    DeviceInstallation,
    /// Installation (subject) with a customer contact (object).
    InstallationContact,
    /// Device (subject) carrying a SIM card (object).
    DeviceSim,
}

impl RelationType {
    pub const ALL: [RelationType; 3] = [Self::DeviceInstallation, Self::InstallationContact, Self::DeviceSim];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceInstallation => "device_installation",
            Self::InstallationContact => "installation_contact",
            Self::DeviceSim => "device_sim",
        }
    }

    pub fn subject_type(&self) -> EntityType {
        match self {
            Self::DeviceInstallation | Self::DeviceSim => EntityType::Device,
            Self::InstallationContact => EntityType::Installation,
        }
    }

    pub fn object_type(&self) -> EntityType {
        match self {
            Self::DeviceInstallation => EntityType::Installation,
            Self::InstallationContact => EntityType::Contact,
            Self::DeviceSim => EntityType::SimCard,
        }
    }

    /// Which side of this relation an entity type sits on, if any.
    pub fn side_of(&self, entity_type: EntityType) -> Option<Side> {
        if entity_type == self.subject_type() {
            Some(Side::Subject)
        } else if entity_type == self.object_type() {
            Some(Side::Object)
        } else {
            None
        }
    }

    /// Relation types an entity type participates in.
    pub fn involving(entity_type: EntityType) -> impl Iterator<Item = RelationType> {
        Self::ALL
            .into_iter()
            .filter(move |relation| relation.side_of(entity_type).is_some())
    }

    /// Resolves the relation joining two entity types, in either order.
    pub fn between(a: EntityType, b: EntityType) -> Option<RelationType> {
        Self::ALL.into_iter().find(|relation| {
            (relation.subject_type() == a && relation.object_type() == b)
                || (relation.subject_type() == b && relation.object_type() == a)
        })
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = FleetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|relation| relation.as_str() == value)
            .ok_or_else(|| FleetError::invalid(format!("unknown relation type `{value}`")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Subject,
    Object,
}

/// Subject-to-object cardinality of a relation type.
///
/// `many_to_one` means every subject holds at most one object (the subject side is limited);
/// `one_to_many` means every object belongs to at most one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    #[default]
    ManyToMany,
}

impl Cardinality {
    /// A subject may hold at most one active object.
    pub fn limits_subject(&self) -> bool {
        matches!(self, Self::OneToOne | Self::ManyToOne)
    }

    /// An object may hold at most one active subject.
    pub fn limits_object(&self) -> bool {
        matches!(self, Self::OneToOne | Self::OneToMany)
    }

    pub fn limits(&self, side: Side) -> bool {
        match side {
            Side::Subject => self.limits_subject(),
            Side::Object => self.limits_object(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Association records
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssociationStatus {
    #[default]
    Active,
    Inactive,
}

impl AssociationStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

/// One live relationship instance. The same document is stored under the forward and reverse keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationRecord {
    pub relation: RelationType,
    pub subject: EntityRef,
    pub object: EntityRef,
    pub status: AssociationStatus,
    pub linked_at: DateTime<Utc>,
    pub linked_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_changed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_changed_by: Option<String>,
}

impl AssociationRecord {
    /// The other participant, seen from `entity`.
    pub fn counterpart_of(&self, entity: &EntityRef) -> &EntityRef {
        if &self.subject == entity { &self.object } else { &self.subject }
    }
}

/// An association as seen from one of its participants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssociationView {
    pub relation: RelationType,
    pub counterpart: EntityRef,
    pub side: &'static str,
    pub record: AssociationRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<EntitySummary>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// History
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryAction {
    Linked,
    Unlinked,
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linked => f.write_str("LINKED"),
            Self::Unlinked => f.write_str("UNLINKED"),
        }
    }
}

/// Store-assigned ordering key of a history record within one entity's history.
///
/// Ordered by timestamp first, then by a per-entity sequence that breaks ties and absorbs clock skew.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HistorySortKey {
    pub timestamp_ms: i64,
    pub sequence: u64,
}

impl HistorySortKey {
    /// Index member layout: `{timestamp:015}:{sequence:012}:{record_id}`. Lexicographic order equals key order.
    pub fn member(&self, record_id: &str) -> String {
        format!("{:015}:{:012}:{}", self.timestamp_ms, self.sequence, record_id)
    }

    /// Splits an index member into its sort key and record id.
    pub fn parse_member(member: &str) -> Option<(HistorySortKey, &str)> {
        let mut parts = member.splitn(3, ':');
        let timestamp_ms = parts.next()?.parse().ok()?;
        let sequence = parts.next()?.parse().ok()?;
        let record_id = parts.next()?;
        Some((
            HistorySortKey {
                timestamp_ms,
                sequence,
            },
            record_id,
        ))
    }
}

/// Immutable description of one link/unlink transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub record_id: String,
    pub relation: RelationType,
    pub entity: EntityRef,
    pub counterpart: EntityRef,
    pub action: HistoryAction,
    pub performed_at: DateTime<Utc>,
    pub performed_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Position in the history of the entity the record was listed for. Absent until stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_key: Option<HistorySortKey>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Operation inputs and results
// ═══════════════════════════════════════════════════════════════════════════════

/// Provenance and deadline attached to a state-changing call.
#[derive(Debug, Clone, Default)]
pub struct OperationMeta {
    pub performed_by: String,
    pub source_address: Option<String>,
    pub reason: Option<String>,
    pub deadline: Option<Instant>,
}

pub type LinkMeta = OperationMeta;
pub type UnlinkMeta = OperationMeta;

impl OperationMeta {
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
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkResult {
    pub association: AssociationRecord,
    pub history: HistoryRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnlinkResult {
    /// The association document as it was stored right before removal.
    pub removed: AssociationRecord,
    pub history: HistoryRecord,
}

/// Default page size for association and history listings.
pub const DEFAULT_PAGE_LIMIT: usize = 50;
/// Maximum allowed page size.
pub const MAX_PAGE_LIMIT: usize = 500;

/// Cursor-based page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub limit: usize,
    /// Include soft-deleted associations (audit views).
    pub include_inactive: bool,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            cursor: None,
            limit: DEFAULT_PAGE_LIMIT,
            include_inactive: false,
        }
    }
}

impl PageRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn including_inactive(mut self) -> Self {
        self.include_inactive = true;
        self
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
        }
    }

    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}

/// Outcome of a cascade delete. `associations_deleted` is the retry-safe running total.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CascadeSummary {
    pub entity: Option<EntityRef>,
    pub associations_deleted: u64,
    pub associations_deleted_this_run: u64,
    pub history_records_written: u64,
    pub entity_deleted: bool,
    pub per_relation: BTreeMap<RelationType, u64>,
}

/// Outcome of a soft delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SoftDeleteSummary {
    pub associations_deactivated: u64,
}

/// Outcome of restoring a soft-deleted entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RestoreSummary {
    pub associations_reactivated: u64,
    /// Pairs left inactive because a one-to-one slot was taken in the meantime.
    pub conflicts: Vec<EntityRef>,
    /// Pairs left inactive because the counterpart is itself soft-deleted.
    pub skipped_inactive_counterparts: Vec<EntityRef>,
}
