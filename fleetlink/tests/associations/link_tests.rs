use super::support::*;
use fleetlink::{
    AssociationRecord, Cardinality, RelationRegistry,
    runtime::{GuardTag, IndexRange, StoreOp, TransactOutcome, TransactPlan},
};
use tokio::time::{Duration, Instant};

#[tokio::test]
async fn link_writes_matching_forward_and_reverse_records() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    let installation = EntityRef::installation("I1");
    h.seed_all(&[device.clone(), installation.clone()]).await;

    let result = h
        .engine
        .link(
            &device,
            &installation,
            RelationType::DeviceInstallation,
            LinkMeta::new("alice").with_reason("commissioning"),
        )
        .await
        .expect("link");
    assert_eq!(result.history.action, HistoryAction::Linked);
    assert!(result.history.sort_key.is_some(), "stored history carries its sort key");

    let keys = h.engine.keys();
    let forward = h
        .store
        .value(&keys.forward(RelationType::DeviceInstallation, &device, &installation))
        .expect("forward record");
    let reverse = h
        .store
        .value(&keys.reverse(RelationType::DeviceInstallation, &device, &installation))
        .expect("reverse record");
    assert_eq!(forward, reverse);
    let record: AssociationRecord = serde_json::from_str(&forward).expect("record json");
    assert_eq!(record, result.association);
    assert_eq!(record.linked_by, "alice");
    assert_eq!(record.reason.as_deref(), Some("commissioning"));

    assert_eq!(h.counterparts(&device, RelationType::DeviceInstallation).await, vec![installation.clone()]);
    assert_eq!(h.counterparts(&installation, RelationType::DeviceInstallation).await, vec![device.clone()]);
    assert_eq!(h.audit.len(), 1);
}

#[tokio::test]
async fn linking_an_existing_pair_is_a_duplicate() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    let installation = EntityRef::installation("I1");
    h.seed_all(&[device.clone(), installation.clone()]).await;
    h.link(&device, &installation, RelationType::DeviceInstallation).await;

    let err = h
        .engine
        .link(&device, &installation, RelationType::DeviceInstallation, LinkMeta::new("bob"))
        .await
        .expect_err("second link must fail");
    assert!(matches!(err, FleetError::DuplicateLink { .. }), "got {err:?}");
    assert_eq!(h.history_actions(&device).await.len(), 1);
}

#[tokio::test]
async fn concurrent_links_of_one_pair_commit_once() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    let installation = EntityRef::installation("I1");
    h.seed_all(&[device.clone(), installation.clone()]).await;

    let (first, second) = tokio::join!(
        h.engine
            .link(&device, &installation, RelationType::DeviceInstallation, LinkMeta::new("alice")),
        h.engine
            .link(&device, &installation, RelationType::DeviceInstallation, LinkMeta::new("bob")),
    );
    let results = [first, second];
    let committed = results.iter().filter(|result| result.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|result| matches!(result, Err(FleetError::DuplicateLink { .. })))
        .count();
    assert_eq!((committed, duplicates), (1, 1));

    assert_eq!(h.history_actions(&device).await, vec![(HistoryAction::Linked, installation.clone())]);
    assert_eq!(h.history_actions(&installation).await, vec![(HistoryAction::Linked, device.clone())]);
    assert_eq!(h.audit.len(), 1);
}

#[tokio::test]
async fn concurrent_unlinks_of_one_pair_commit_once() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    let installation = EntityRef::installation("I1");
    h.seed_all(&[device.clone(), installation.clone()]).await;
    h.link(&device, &installation, RelationType::DeviceInstallation).await;

    let (first, second) = tokio::join!(
        h.engine
            .unlink(&device, &installation, RelationType::DeviceInstallation, LinkMeta::new("alice")),
        h.engine
            .unlink(&device, &installation, RelationType::DeviceInstallation, LinkMeta::new("bob")),
    );
    assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
    assert!(matches!(
        first.err().or(second.err()),
        Some(FleetError::NotLinked { .. })
    ));

    let unlinked = h
        .history_actions(&device)
        .await
        .into_iter()
        .filter(|(action, _)| *action == HistoryAction::Unlinked)
        .count();
    assert_eq!(unlinked, 1);
    assert!(h.association_keys().is_empty());
}

#[tokio::test]
async fn unlink_removes_both_records_and_indexes() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    let installation = EntityRef::installation("I1");
    h.seed_all(&[device.clone(), installation.clone()]).await;
    h.link(&device, &installation, RelationType::DeviceInstallation).await;

    let result = h
        .engine
        .unlink(
            &device,
            &installation,
            RelationType::DeviceInstallation,
            UnlinkMeta::new("alice").with_source_address("10.0.0.7"),
        )
        .await
        .expect("unlink");
    assert_eq!(result.removed.subject, device);
    assert_eq!(result.history.action, HistoryAction::Unlinked);
    assert_eq!(result.history.source_address.as_deref(), Some("10.0.0.7"));

    assert!(h.association_keys().is_empty(), "left behind: {:?}", h.association_keys());
    assert!(h.counterparts(&installation, RelationType::DeviceInstallation).await.is_empty());

    let err = h
        .engine
        .unlink(&device, &installation, RelationType::DeviceInstallation, UnlinkMeta::new("alice"))
        .await
        .expect_err("nothing left to unlink");
    assert!(matches!(err, FleetError::NotLinked { .. }));
    assert_eq!(h.history_actions(&device).await.len(), 2);
}

#[tokio::test]
async fn mismatched_entity_types_are_rejected_before_any_write() {
    let h = Harness::new();
    let contact = EntityRef::contact("C1");
    let installation = EntityRef::installation("I1");
    h.seed_all(&[contact.clone(), installation.clone()]).await;
    h.store.reset_stats();

    let err = h
        .engine
        .link(&contact, &installation, RelationType::DeviceInstallation, LinkMeta::new("alice"))
        .await
        .expect_err("contact is not a device");
    assert!(matches!(err, FleetError::InvalidRequest { .. }));

    let err = h
        .engine
        .link(
            &EntityRef::device("bad:id"),
            &installation,
            RelationType::DeviceInstallation,
            LinkMeta::new("alice"),
        )
        .await
        .expect_err("reserved character");
    assert!(matches!(err, FleetError::InvalidRequest { .. }));

    let err = h
        .engine
        .link(
            &EntityRef::device("D1"),
            &installation,
            RelationType::DeviceInstallation,
            LinkMeta::new("  "),
        )
        .await
        .expect_err("actor required");
    assert!(matches!(err, FleetError::InvalidRequest { .. }));
    assert_eq!(h.store.stats().transact_calls, 0);
}

#[tokio::test]
async fn missing_or_inactive_entities_cannot_be_linked() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    let ghost = EntityRef::installation("ghost");
    h.seed(&device).await;

    let err = h
        .engine
        .link(&device, &ghost, RelationType::DeviceInstallation, LinkMeta::new("alice"))
        .await
        .expect_err("installation missing");
    assert!(matches!(err, FleetError::NotFound { ref entity } if entity == &ghost), "got {err:?}");

    let retired = EntityRef::installation("retired");
    h.engine
        .entities()
        .put(&retired, &json!({ "name": "retired", "active": false }))
        .await
        .expect("seed inactive");
    let err = h
        .engine
        .link(&device, &retired, RelationType::DeviceInstallation, LinkMeta::new("alice"))
        .await
        .expect_err("installation inactive");
    assert!(matches!(err, FleetError::NotFound { ref entity } if entity == &retired));

    assert!(h.association_keys().is_empty());
    assert!(h.history_actions(&device).await.is_empty());
    assert!(h.audit.is_empty());
}

#[tokio::test]
async fn one_to_one_slots_report_the_current_holder() {
    let h = Harness::new();
    let (d1, d2) = (EntityRef::device("D1"), EntityRef::device("D2"));
    let (s1, s2) = (EntityRef::sim_card("S1"), EntityRef::sim_card("S2"));
    h.seed_all(&[d1.clone(), d2.clone(), s1.clone(), s2.clone()]).await;
    h.link(&d1, &s1, RelationType::DeviceSim).await;

    let err = h
        .engine
        .link(&d2, &s1, RelationType::DeviceSim, LinkMeta::new("alice"))
        .await
        .expect_err("sim already in use");
    match err {
        FleetError::CapacityExceeded { entity, holder, .. } => {
            assert_eq!(entity, s1);
            assert_eq!(holder.as_deref(), Some("D1"));
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }

    let err = h
        .engine
        .link(&d1, &s2, RelationType::DeviceSim, LinkMeta::new("alice"))
        .await
        .expect_err("device already has a sim");
    match err {
        FleetError::CapacityExceeded { entity, holder, .. } => {
            assert_eq!(entity, d1);
            assert_eq!(holder.as_deref(), Some("S1"));
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }

    h.engine
        .unlink(&d1, &s1, RelationType::DeviceSim, UnlinkMeta::new("alice"))
        .await
        .expect("unlink");
    h.link(&d2, &s1, RelationType::DeviceSim).await;
    assert_eq!(h.counterparts(&s1, RelationType::DeviceSim).await, vec![d2]);
}

#[tokio::test]
async fn many_to_one_override_limits_only_the_subject() {
    let h = Harness::new();
    let engine = h
        .engine
        .with_relations(RelationRegistry::default().with(RelationType::DeviceInstallation, Cardinality::ManyToOne));
    let (d1, d2) = (EntityRef::device("D1"), EntityRef::device("D2"));
    let (i1, i2) = (EntityRef::installation("I1"), EntityRef::installation("I2"));
    for entity in [&d1, &d2, &i1, &i2] {
        engine
            .entities()
            .put(entity, &json!({ "name": entity.entity_id }))
            .await
            .expect("seed");
    }

    engine
        .link(&d1, &i1, RelationType::DeviceInstallation, LinkMeta::new("alice"))
        .await
        .expect("first link");
    engine
        .link(&d2, &i1, RelationType::DeviceInstallation, LinkMeta::new("alice"))
        .await
        .expect("installations take many devices");
    let err = engine
        .link(&d1, &i2, RelationType::DeviceInstallation, LinkMeta::new("alice"))
        .await
        .expect_err("device already installed");
    assert!(matches!(err, FleetError::CapacityExceeded { ref entity, .. } if entity == &d1));
}

#[tokio::test]
async fn transient_store_errors_are_retried() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    let installation = EntityRef::installation("I1");
    h.seed_all(&[device.clone(), installation.clone()]).await;
    h.store.reset_stats();
    h.store.fail_transacts(0, 2);

    h.link(&device, &installation, RelationType::DeviceInstallation).await;
    assert_eq!(h.store.stats().transact_calls, 3);
    assert_eq!(h.history_actions(&device).await.len(), 1);
}

#[tokio::test]
async fn exhausted_retries_surface_as_transient_and_write_nothing() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    let installation = EntityRef::installation("I1");
    h.seed_all(&[device.clone(), installation.clone()]).await;
    h.store.fail_transacts(0, 10);

    let err = h
        .engine
        .link(&device, &installation, RelationType::DeviceInstallation, LinkMeta::new("alice"))
        .await
        .expect_err("store keeps failing");
    assert!(err.is_transient());
    match err {
        FleetError::TransientStore { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected TransientStore, got {other:?}"),
    }
    h.store.clear_faults();
    assert!(h.association_keys().is_empty());
    assert!(h.history_actions(&device).await.is_empty());
}

#[tokio::test]
async fn expired_deadline_reports_indeterminate_outcome() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    let installation = EntityRef::installation("I1");
    h.seed_all(&[device.clone(), installation.clone()]).await;

    let deadline = Instant::now() - Duration::from_millis(1);
    let err = h
        .engine
        .link(
            &device,
            &installation,
            RelationType::DeviceInstallation,
            LinkMeta::new("alice").with_deadline(deadline),
        )
        .await
        .expect_err("deadline already passed");
    assert!(matches!(err, FleetError::DeadlineExceeded { operation: "link" }), "got {err:?}");
}

/// Deletes an entity record right before each link transaction, optionally putting it back afterwards.
#[derive(Clone)]
struct VanishingEntityStore {
    inner: MemoryStore,
    entity_key: String,
    restore: bool,
}

impl StoreExecutor for VanishingEntityStore {
    async fn transact(&self, plan: &TransactPlan) -> Result<TransactOutcome, FleetError> {
        let is_link = plan.guards.iter().any(|guard| guard.tag == GuardTag::EntityPresent);
        if !is_link {
            return self.inner.transact(plan).await;
        }
        let saved = self.inner.value(&self.entity_key);
        let mut remove = TransactPlan::new();
        remove.push(StoreOp::Delete {
            key: self.entity_key.clone(),
        });
        self.inner.transact(&remove).await?;
        let outcome = self.inner.transact(plan).await;
        if let (true, Some(value_json)) = (self.restore, saved) {
            let mut put_back = TransactPlan::new();
            put_back.push(StoreOp::Put {
                key: self.entity_key.clone(),
                value_json,
            });
            self.inner.transact(&put_back).await?;
        }
        outcome
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, FleetError> {
        self.inner.get_many(keys).await
    }

    async fn index_range(&self, index_key: &str, range: &IndexRange) -> Result<Vec<String>, FleetError> {
        self.inner.index_range(index_key, range).await
    }
}

async fn vanishing_harness(restore: bool) -> (Harness<VanishingEntityStore>, EntityRef, EntityRef) {
    let config = TestNamespace::unique().config();
    let keys = config.key_scheme();
    let device = EntityRef::device("D1");
    let installation = EntityRef::installation("I1");
    let store = VanishingEntityStore {
        inner: MemoryStore::new(),
        entity_key: keys.entity(&installation),
        restore,
    };
    let h = Harness::over(store, &config);
    h.seed_all(&[device.clone(), installation.clone()]).await;
    (h, device, installation)
}

#[tokio::test]
async fn entity_deleted_after_validation_is_partial_input() {
    let (h, device, installation) = vanishing_harness(false).await;
    let err = h
        .engine
        .link(&device, &installation, RelationType::DeviceInstallation, LinkMeta::new("alice"))
        .await
        .expect_err("installation vanished");
    match err {
        FleetError::PartialInputInvalid { entities } => assert_eq!(entities, vec![installation]),
        other => panic!("expected PartialInputInvalid, got {other:?}"),
    }
    assert!(h.inner_association_keys().is_empty());
}

#[tokio::test]
async fn entity_guard_failing_twice_is_partial_input() {
    let (h, device, installation) = vanishing_harness(true).await;
    let err = h
        .engine
        .link(&device, &installation, RelationType::DeviceInstallation, LinkMeta::new("alice"))
        .await
        .expect_err("guard keeps failing");
    match err {
        FleetError::PartialInputInvalid { entities } => assert_eq!(entities, vec![installation]),
        other => panic!("expected PartialInputInvalid, got {other:?}"),
    }
    assert!(h.inner_association_keys().is_empty());
}

impl Harness<VanishingEntityStore> {
    fn inner_association_keys(&self) -> Vec<String> {
        let keys = self.engine.keys();
        self.store
            .inner
            .keys_with_prefix(&format!("{}:{}:rel:", keys.prefix(), keys.service()))
    }
}

/// Applies link transactions but drops the reply of the first `drop_replies` that commit.
#[derive(Clone)]
struct LostReplyStore {
    inner: MemoryStore,
    drop_replies: Arc<AtomicUsize>,
}

impl StoreExecutor for LostReplyStore {
    async fn transact(&self, plan: &TransactPlan) -> Result<TransactOutcome, FleetError> {
        let outcome = self.inner.transact(plan).await?;
        let is_link = plan.guards.iter().any(|guard| guard.tag == GuardTag::EntityPresent);
        let drop_reply = is_link
            && outcome.is_committed()
            && self
                .drop_replies
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
        if drop_reply {
            return Err(FleetError::transient("connection reset before reply"));
        }
        Ok(outcome)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, FleetError> {
        self.inner.get_many(keys).await
    }

    async fn index_range(&self, index_key: &str, range: &IndexRange) -> Result<Vec<String>, FleetError> {
        self.inner.index_range(index_key, range).await
    }
}

#[tokio::test]
async fn link_whose_reply_was_lost_succeeds_on_retry() {
    let config = TestNamespace::unique().config();
    let store = LostReplyStore {
        inner: MemoryStore::new(),
        drop_replies: Arc::new(AtomicUsize::new(1)),
    };
    let h = Harness::over(store, &config);
    let device = EntityRef::device("D1");
    let installation = EntityRef::installation("I1");
    h.seed_all(&[device.clone(), installation.clone()]).await;

    let linked = h
        .engine
        .link(&device, &installation, RelationType::DeviceInstallation, LinkMeta::new("alice"))
        .await
        .expect("retry finds the committed link");
    assert_eq!(linked.association.subject, device);
    assert_eq!(linked.history.sort_key, None);
    assert_eq!(h.store.drop_replies.load(Ordering::SeqCst), 0);
    assert_eq!(h.history_actions(&device).await, vec![(HistoryAction::Linked, installation.clone())]);
    assert_eq!(h.audit.len(), 1);

    // A second call is a real duplicate.
    let err = h
        .engine
        .link(&device, &installation, RelationType::DeviceInstallation, LinkMeta::new("alice"))
        .await
        .expect_err("already linked");
    assert!(matches!(err, FleetError::DuplicateLink { .. }), "got {err:?}");
}
