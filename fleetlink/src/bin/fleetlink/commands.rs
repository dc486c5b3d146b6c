use anyhow::{Result, bail};
use clap::Args;
use fleetlink::{
    AssociationEngine, CascadeOptions, EntityRef, OperationMeta, Page, PageRequest, RedisStore, RelationType,
};

use crate::output::OutputManager;

pub const LINK_EXAMPLES: &[&str] = &[
    "fleetlink link device:D1 installation:I1 --by ops@example.com",
    "fleetlink link device:D1 sim:8931 --reason \"field swap\"",
];
pub const LIST_EXAMPLES: &[&str] = &[
    "fleetlink list installation:I1",
    "fleetlink list device:D1 --relation device_sim --include-inactive --hydrate",
];
pub const CASCADE_EXAMPLES: &[&str] = &["fleetlink cascade-delete installation:I1 --by ops@example.com"];

/// Who performed a change and where it came from
#[derive(Args, Debug, Clone)]
pub struct ActorArgs {
    /// Recorded as performed_by on every change
    #[arg(long = "by", env = "FLEETLINK_ACTOR", default_value = "fleetlink-cli")]
    pub performed_by: String,

    /// Free-text reason stored with the change
    #[arg(long)]
    pub reason: Option<String>,

    /// Client address recorded in history
    #[arg(long)]
    pub source_address: Option<String>,
}

impl ActorArgs {
    fn meta(&self) -> OperationMeta {
        OperationMeta {
            performed_by: self.performed_by.clone(),
            source_address: self.source_address.clone(),
            reason: self.reason.clone(),
            deadline: None,
        }
    }
}

#[derive(Args, Debug)]
pub struct PairArgs {
    /// First entity as type:id, e.g. device:D1
    pub first: EntityRef,

    /// Second entity as type:id, e.g. installation:I1
    pub second: EntityRef,

    /// Relation type; inferred from the entity types when omitted
    #[arg(long)]
    pub relation: Option<RelationType>,

    #[command(flatten)]
    pub actor: ActorArgs,
}

impl PairArgs {
    /// Resolves the relation and orders the pair as (subject, object).
    pub fn resolve(&self) -> Result<(RelationType, EntityRef, EntityRef)> {
        let relation = match self.relation {
            Some(relation) => relation,
            None => match RelationType::between(self.first.entity_type, self.second.entity_type) {
                Some(relation) => relation,
                None => bail!(
                    "no relation joins {} and {}",
                    self.first.entity_type,
                    self.second.entity_type
                ),
            },
        };
        if self.first.entity_type == relation.subject_type() {
            Ok((relation, self.first.clone(), self.second.clone()))
        } else {
            Ok((relation, self.second.clone(), self.first.clone()))
        }
    }
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Entity as type:id
    pub entity: EntityRef,

    /// Only this relation; every relation of the entity type when omitted
    #[arg(long)]
    pub relation: Option<RelationType>,

    #[arg(long, default_value_t = fleetlink::DEFAULT_PAGE_LIMIT)]
    pub limit: usize,

    /// Resume after this cursor (single relation only)
    #[arg(long)]
    pub cursor: Option<String>,

    /// Include soft-deleted associations
    #[arg(long)]
    pub include_inactive: bool,

    /// Attach counterpart summaries
    #[arg(long)]
    pub hydrate: bool,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Entity as type:id
    pub entity: EntityRef,

    #[arg(long, default_value_t = fleetlink::DEFAULT_PAGE_LIMIT)]
    pub limit: usize,

    #[arg(long)]
    pub cursor: Option<String>,
}

#[derive(Args, Debug)]
pub struct EntityArgs {
    /// Entity as type:id
    pub entity: EntityRef,

    #[command(flatten)]
    pub actor: ActorArgs,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Entities as type:id
    #[arg(required = true)]
    pub entities: Vec<EntityRef>,
}

type Engine = AssociationEngine<RedisStore>;

pub async fn handle_link(engine: &Engine, args: PairArgs, output: &OutputManager) -> Result<()> {
    let (relation, subject, object) = args.resolve()?;
    let result = engine.link(&subject, &object, relation, args.actor.meta()).await?;
    output.success(&format!("Linked {subject} to {object} ({relation})"));
    output.display(&result)
}

pub async fn handle_unlink(engine: &Engine, args: PairArgs, output: &OutputManager) -> Result<()> {
    let (relation, subject, object) = args.resolve()?;
    let result = engine.unlink(&subject, &object, relation, args.actor.meta()).await?;
    output.success(&format!("Unlinked {subject} from {object} ({relation})"));
    output.display(&result)
}

pub async fn handle_list(engine: &Engine, args: ListArgs, output: &OutputManager) -> Result<()> {
    let mut request = PageRequest::new().with_limit(args.limit);
    request.include_inactive = args.include_inactive;
    request.cursor = args.cursor.clone();

    let mut page = match args.relation {
        Some(relation) => engine.list_associations(&args.entity, relation, &request).await?,
        None => {
            if args.cursor.is_some() {
                bail!("--cursor requires --relation");
            }
            Page {
                items: engine.list_all_associations(&args.entity, args.include_inactive).await?,
                next_cursor: None,
            }
        }
    };
    if args.hydrate {
        engine.hydrate_views(&mut page.items).await?;
    }
    if page.items.is_empty() {
        output.info(&format!("{} has no associations", args.entity));
    }
    output.display(&page)
}

pub async fn handle_history(engine: &Engine, args: HistoryArgs, output: &OutputManager) -> Result<()> {
    let mut request = PageRequest::new().with_limit(args.limit);
    request.cursor = args.cursor;
    let page = engine.list_history(&args.entity, &request).await?;
    output.display(&page)
}

pub async fn handle_cascade_delete(engine: &Engine, args: EntityArgs, output: &OutputManager) -> Result<()> {
    let mut options = CascadeOptions::new(&args.actor.performed_by);
    options.reason = args.actor.reason.clone();
    options.source_address = args.actor.source_address.clone();
    let summary = engine.cascade_delete_with(&args.entity, &options).await?;
    if summary.entity_deleted {
        output.success(&format!("Deleted {} and its associations", args.entity));
    } else {
        output.warning(&format!("{} had no record left to delete", args.entity));
    }
    output.display(&summary)
}

pub async fn handle_soft_delete(engine: &Engine, args: EntityArgs, output: &OutputManager) -> Result<()> {
    let summary = engine.soft_delete(&args.entity, args.actor.meta()).await?;
    output.success(&format!("Deactivated {}", args.entity));
    output.display(&summary)
}

pub async fn handle_restore(engine: &Engine, args: EntityArgs, output: &OutputManager) -> Result<()> {
    let summary = engine.restore(&args.entity, args.actor.meta()).await?;
    output.success(&format!("Restored {}", args.entity));
    for conflict in &summary.conflicts {
        output.bullet(&format!("left inactive, slot taken: {conflict}"));
    }
    output.display(&summary)
}

pub async fn handle_validate(engine: &Engine, args: ValidateArgs, output: &OutputManager) -> Result<()> {
    let outcome = engine.validate_batch(&args.entities).await?;
    output.display(&outcome)
}
