use std::collections::{HashMap, HashSet};

use crate::{
    engine::{AssociationEngine, history::get_chunked},
    entities::EntitySource,
    errors::FleetError,
    keys::KeyScheme,
    runtime::{commands::IndexRange, executor::StoreExecutor, retry::with_retry},
    types::{
        AssociationRecord, AssociationView, EntityRef, EntitySummary, MAX_PAGE_LIMIT, Page, PageRequest, RelationType,
        Side,
    },
};

/// Paginated association listings and batched counterpart hydration.
pub struct AssociationReader<'a, S> {
    engine: &'a AssociationEngine<S>,
}

impl<'a, S: StoreExecutor> AssociationReader<'a, S> {
    pub fn new(engine: &'a AssociationEngine<S>) -> Self {
        Self { engine }
    }

    /// One page of `entity`'s associations for `relation`, ordered by counterpart id.
    ///
    /// The direction follows the side `entity` sits on. Pages are filled up to the limit even when inactive
    /// associations are skipped.
    pub async fn list_associations(
        &self,
        entity: &EntityRef,
        relation: RelationType,
        page: &PageRequest,
    ) -> Result<Page<AssociationView>, FleetError> {
        KeyScheme::validate_ref(entity)?;
        let side = relation.side_of(entity.entity_type).ok_or_else(|| {
            FleetError::invalid(format!("{} does not take part in {relation}", entity.entity_type))
        })?;
        let keys = &self.engine.keys;
        let index_key = keys.association_index(relation, side, &entity.entity_id);
        let limit = page.effective_limit();
        let store = &self.engine.store;

        let mut items = Vec::with_capacity(limit);
        let mut cursor = page.cursor.clone();
        loop {
            let wanted = limit - items.len();
            let range = IndexRange::ascending(cursor.clone(), wanted);
            let (index_key_ref, range_ref) = (&index_key, &range);
            let members = with_retry(&self.engine.retry, "list_associations", move || {
                store.index_range(index_key_ref, range_ref)
            })
            .await?;
            let exhausted = members.len() < wanted;

            let record_keys: Vec<String> = members
                .iter()
                .map(|counterpart_id| keys.association_record(relation, side, &entity.entity_id, counterpart_id))
                .collect();
            let records = get_chunked(self.engine, &record_keys, "list_associations").await?;

            for (member, raw) in members.into_iter().zip(records) {
                let Some(raw) = raw else {
                    log::warn!("association index {index_key} lists {member} without a record");
                    cursor = Some(member);
                    continue;
                };
                let record: AssociationRecord = serde_json::from_str(&raw)?;
                cursor = Some(member);
                if !page.include_inactive && !record.status.is_active() {
                    continue;
                }
                items.push(view(entity, side, record));
            }

            if exhausted {
                return Ok(Page {
                    items,
                    next_cursor: None,
                });
            }
            if items.len() >= limit {
                return Ok(Page {
                    items,
                    next_cursor: cursor,
                });
            }
        }
    }

    /// Every association of `entity` across the relations its type takes part in.
    pub async fn list_all_associations(
        &self,
        entity: &EntityRef,
        include_inactive: bool,
    ) -> Result<Vec<AssociationView>, FleetError> {
        let mut all = Vec::new();
        let page_size = self.engine.settings.batch_get_limit.clamp(1, MAX_PAGE_LIMIT);
        for (relation, _) in self.engine.relations.relations_of(entity) {
            let mut request = PageRequest::new().with_limit(page_size);
            request.include_inactive = include_inactive;
            loop {
                let page = self.list_associations(entity, relation, &request).await?;
                all.extend(page.items);
                match page.next_cursor {
                    Some(cursor) => request.cursor = Some(cursor),
                    None => break,
                }
            }
        }
        Ok(all)
    }

    /// Summaries of `refs`, one multi-get per `batch_get_limit` refs. Missing entities are left out.
    pub async fn batch_hydrate(&self, refs: &[EntityRef]) -> Result<HashMap<EntityRef, EntitySummary>, FleetError> {
        let mut seen = HashSet::new();
        let unique: Vec<EntityRef> = refs
            .iter()
            .filter(|entity| KeyScheme::validate_ref(entity).is_ok() && seen.insert(*entity))
            .cloned()
            .collect();

        let mut summaries = HashMap::with_capacity(unique.len());
        let source = &self.engine.entities;
        for chunk in unique.chunks(self.engine.settings.batch_get_limit.max(1)) {
            let batch = with_retry(&self.engine.retry, "batch_hydrate", move || source.read_many(chunk)).await?;
            summaries.extend(
                chunk
                    .iter()
                    .cloned()
                    .zip(batch)
                    .filter_map(|(entity, summary)| summary.map(|summary| (entity, summary))),
            );
        }
        Ok(summaries)
    }

    pub async fn hydrate_views(&self, views: &mut [AssociationView]) -> Result<(), FleetError> {
        let counterparts: Vec<EntityRef> = views.iter().map(|view| view.counterpart.clone()).collect();
        let summaries = self.batch_hydrate(&counterparts).await?;
        for view in views.iter_mut() {
            view.summary = summaries.get(&view.counterpart).cloned();
        }
        Ok(())
    }
}

fn view(entity: &EntityRef, side: Side, record: AssociationRecord) -> AssociationView {
    AssociationView {
        relation: record.relation,
        counterpart: record.counterpart_of(entity).clone(),
        side: match side {
            Side::Subject => "forward",
            Side::Object => "reverse",
        },
        record,
        summary: None,
    }
}
