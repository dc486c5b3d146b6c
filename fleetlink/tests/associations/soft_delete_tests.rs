use super::support::*;
use fleetlink::runtime::{GuardTag, IndexRange, StoreOp, TransactOutcome, TransactPlan};

struct Fleet {
    device: EntityRef,
    installation: EntityRef,
    sim: EntityRef,
}

async fn linked_device(h: &Harness) -> Fleet {
    let fleet = Fleet {
        device: EntityRef::device("D1"),
        installation: EntityRef::installation("I1"),
        sim: EntityRef::sim_card("S1"),
    };
    h.seed_all(&[fleet.device.clone(), fleet.installation.clone(), fleet.sim.clone()])
        .await;
    h.link(&fleet.device, &fleet.installation, RelationType::DeviceInstallation)
        .await;
    h.link(&fleet.device, &fleet.sim, RelationType::DeviceSim).await;
    fleet
}

#[tokio::test]
async fn soft_delete_hides_the_entity_and_its_associations() {
    let h = Harness::new();
    let fleet = linked_device(&h).await;
    let history_before = h.history_actions(&fleet.device).await;

    let summary = h
        .engine
        .soft_delete(&fleet.device, OperationMeta::new("ops"))
        .await
        .expect("soft delete");
    assert_eq!(summary.associations_deactivated, 2);

    assert!(h.counterparts(&fleet.installation, RelationType::DeviceInstallation).await.is_empty());
    let audit_view = h
        .engine
        .list_associations(
            &fleet.installation,
            RelationType::DeviceInstallation,
            &PageRequest::new().including_inactive(),
        )
        .await
        .expect("audit view")
        .items;
    assert_eq!(audit_view.len(), 1);
    assert!(!audit_view[0].record.status.is_active());
    assert_eq!(audit_view[0].record.status_changed_by.as_deref(), Some("ops"));

    // The device-side copy flips in the same transaction.
    let forward_view = h
        .engine
        .list_associations(
            &fleet.device,
            RelationType::DeviceInstallation,
            &PageRequest::new().including_inactive(),
        )
        .await
        .expect("device-side view")
        .items;
    assert_eq!(forward_view.len(), 1);
    assert!(!forward_view[0].record.status.is_active());
    assert_eq!(forward_view[0].record.status_changed_by.as_deref(), Some("ops"));
    assert_eq!(forward_view[0].record, audit_view[0].record);
    assert!(h.counterparts(&fleet.device, RelationType::DeviceInstallation).await.is_empty());

    let document = h
        .engine
        .entities()
        .get(&fleet.device)
        .await
        .expect("get")
        .expect("entity kept");
    assert_eq!(document["active"], json!(false));
    assert_eq!(document["deactivated_by"], json!("ops"));

    let outcome = h.engine.validate_batch(&[fleet.device.clone()]).await.expect("validate");
    assert_eq!(outcome.reason_for(&fleet.device), Some(InvalidReason::Inactive));
    assert_eq!(h.history_actions(&fleet.device).await, history_before, "no history for status changes");
}

#[tokio::test]
async fn soft_delete_frees_capacity_and_restore_reports_conflicts() {
    let h = Harness::new();
    let fleet = linked_device(&h).await;
    let replacement = EntityRef::device("D2");
    h.seed(&replacement).await;

    h.engine
        .soft_delete(&fleet.device, OperationMeta::new("ops"))
        .await
        .expect("soft delete");
    h.link(&replacement, &fleet.sim, RelationType::DeviceSim).await;

    let summary = h
        .engine
        .restore(&fleet.device, OperationMeta::new("ops"))
        .await
        .expect("restore");
    assert_eq!(summary.associations_reactivated, 1);
    assert_eq!(summary.conflicts, vec![fleet.sim.clone()]);
    assert!(summary.skipped_inactive_counterparts.is_empty());

    assert_eq!(
        h.counterparts(&fleet.device, RelationType::DeviceInstallation).await,
        vec![fleet.installation.clone()]
    );
    assert_eq!(h.counterparts(&fleet.sim, RelationType::DeviceSim).await, vec![replacement]);
    let document = h
        .engine
        .entities()
        .get(&fleet.device)
        .await
        .expect("get")
        .expect("entity");
    assert_eq!(document["active"], json!(true));
    assert_eq!(document["restored_by"], json!("ops"));
}

#[tokio::test]
async fn restore_skips_pairs_whose_counterpart_is_inactive() {
    let h = Harness::new();
    let fleet = linked_device(&h).await;
    h.engine
        .soft_delete(&fleet.installation, OperationMeta::new("ops"))
        .await
        .expect("soft delete installation");
    h.engine
        .soft_delete(&fleet.device, OperationMeta::new("ops"))
        .await
        .expect("soft delete device");

    let summary = h
        .engine
        .restore(&fleet.device, OperationMeta::new("ops"))
        .await
        .expect("restore");
    assert_eq!(summary.associations_reactivated, 1);
    assert_eq!(summary.skipped_inactive_counterparts, vec![fleet.installation.clone()]);
    assert_eq!(h.counterparts(&fleet.device, RelationType::DeviceSim).await, vec![fleet.sim.clone()]);
    assert!(h.counterparts(&fleet.device, RelationType::DeviceInstallation).await.is_empty());
}

#[tokio::test]
async fn inactive_associations_can_still_be_unlinked() {
    let h = Harness::new();
    let fleet = linked_device(&h).await;
    h.engine
        .soft_delete(&fleet.device, OperationMeta::new("ops"))
        .await
        .expect("soft delete");

    let result = h
        .engine
        .unlink(&fleet.device, &fleet.installation, RelationType::DeviceInstallation, UnlinkMeta::new("ops"))
        .await
        .expect("unlink inactive pair");
    assert!(!result.removed.status.is_active());

    let err = h
        .engine
        .link(&fleet.device, &fleet.installation, RelationType::DeviceInstallation, LinkMeta::new("ops"))
        .await
        .expect_err("inactive device");
    assert!(matches!(err, FleetError::NotFound { ref entity } if entity == &fleet.device));
}

#[tokio::test]
async fn soft_delete_of_a_missing_entity_is_not_found() {
    let h = Harness::new();
    let ghost = EntityRef::device("ghost");
    let err = h
        .engine
        .soft_delete(&ghost, OperationMeta::new("ops"))
        .await
        .expect_err("nothing to deactivate");
    assert!(matches!(err, FleetError::NotFound { ref entity } if entity == &ghost));

    let err = h
        .engine
        .restore(&ghost, OperationMeta::new("ops"))
        .await
        .expect_err("nothing to restore");
    assert!(matches!(err, FleetError::NotFound { .. }));
}

#[tokio::test]
async fn status_changes_keep_unrelated_document_fields_intact() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    h.engine
        .entities()
        .put(
            &device,
            &json!({ "name": "tracker", "imei": 356938035643809_u64, "tags": [], "firmware": { "build": 9007199254740993_u64 } }),
        )
        .await
        .expect("seed device");

    h.engine.soft_delete(&device, OperationMeta::new("ops")).await.expect("soft delete");
    h.engine.restore(&device, OperationMeta::new("ops")).await.expect("restore");

    let document = h.engine.entities().get(&device).await.expect("get").expect("entity kept");
    assert_eq!(document["imei"], json!(356938035643809_u64));
    assert_eq!(document["tags"], json!([]));
    assert_eq!(document["firmware"]["build"], json!(9007199254740993_u64));
    assert_eq!(document["active"], json!(true));
    assert_eq!(document["restored_by"], json!("ops"));
}

/// Rewrites the entity document once, right before the first status write lands.
#[derive(Clone)]
struct ConcurrentEditStore {
    inner: MemoryStore,
    entity_key: String,
    edits_left: Arc<AtomicUsize>,
}

impl StoreExecutor for ConcurrentEditStore {
    async fn transact(&self, plan: &TransactPlan) -> Result<TransactOutcome, FleetError> {
        let touches_entity = plan.guards.iter().any(|guard| guard.tag == GuardTag::Unchanged);
        let edit = touches_entity
            && self
                .edits_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
        if edit {
            let mut rename = TransactPlan::new();
            rename.push(StoreOp::Put {
                key: self.entity_key.clone(),
                value_json: json!({ "name": "renamed", "active": true }).to_string(),
            });
            self.inner.transact(&rename).await?;
        }
        self.inner.transact(plan).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, FleetError> {
        self.inner.get_many(keys).await
    }

    async fn index_range(&self, index_key: &str, range: &IndexRange) -> Result<Vec<String>, FleetError> {
        self.inner.index_range(index_key, range).await
    }
}

#[tokio::test]
async fn concurrent_document_edit_is_not_overwritten_by_soft_delete() {
    let config = TestNamespace::unique().config();
    let device = EntityRef::device("D1");
    let store = ConcurrentEditStore {
        inner: MemoryStore::new(),
        entity_key: config.key_scheme().entity(&device),
        edits_left: Arc::new(AtomicUsize::new(1)),
    };
    let h = Harness::over(store, &config);
    h.seed(&device).await;

    h.engine.soft_delete(&device, OperationMeta::new("ops")).await.expect("soft delete");

    assert_eq!(h.store.edits_left.load(Ordering::SeqCst), 0);
    let document = h.engine.entities().get(&device).await.expect("get").expect("entity kept");
    assert_eq!(document["name"], json!("renamed"));
    assert_eq!(document["active"], json!(false));
    assert_eq!(document["deactivated_by"], json!("ops"));
}
