use super::support::*;
use tokio::time::Instant;

/// Installation I1 linked to `device_count` devices and `contact_count` contacts.
async fn busy_installation(h: &Harness, device_count: usize, contact_count: usize) -> EntityRef {
    let installation = EntityRef::installation("I1");
    h.seed(&installation).await;
    for device in devices(device_count) {
        h.seed(&device).await;
        h.link(&device, &installation, RelationType::DeviceInstallation).await;
    }
    for n in 1..=contact_count {
        let contact = EntityRef::contact(format!("C{n}"));
        h.seed(&contact).await;
        h.link(&installation, &contact, RelationType::InstallationContact).await;
    }
    installation
}

#[tokio::test]
async fn cascade_removes_the_entity_and_every_association() {
    let h = Harness::new();
    let installation = busy_installation(&h, 4, 2).await;

    let summary = h
        .engine
        .cascade_delete(&installation, "janitor")
        .await
        .expect("cascade");
    assert_eq!(summary.associations_deleted, 6);
    assert_eq!(summary.associations_deleted_this_run, 6);
    assert_eq!(summary.history_records_written, 6);
    assert!(summary.entity_deleted);
    assert_eq!(summary.per_relation.get(&RelationType::DeviceInstallation), Some(&4));
    assert_eq!(summary.per_relation.get(&RelationType::InstallationContact), Some(&2));

    assert!(h.association_keys().is_empty(), "left behind: {:?}", h.association_keys());
    assert!(h.engine.entities().get(&installation).await.expect("get").is_none());
    for device in devices(4) {
        assert!(h.counterparts(&device, RelationType::DeviceInstallation).await.is_empty());
        let history = h
            .engine
            .list_history(&device, &PageRequest::new())
            .await
            .expect("history")
            .items;
        assert_eq!(history[0].action, HistoryAction::Unlinked);
        assert_eq!(history[0].reason.as_deref(), Some("cascade delete"));
        assert_eq!(history[0].performed_by, "janitor");
    }
}

#[tokio::test]
async fn interrupted_cascade_resumes_and_counts_each_pair_once() {
    let h = Harness::new();
    let installation = busy_installation(&h, 4, 2).await;
    let engine = AssociationEngine::new(h.store.clone(), &{
        let mut config = TestNamespace::unique().config();
        config.prefix = h.engine.keys().prefix().to_string();
        config
    })
    .expect("engine")
    .with_retry_policy(RetryPolicy::none());

    h.store.fail_transacts(3, 1);
    let err = engine
        .cascade_delete(&installation, "janitor")
        .await
        .expect_err("fourth unlink fails");
    match err {
        FleetError::PartialCascadeFailure {
            entity,
            deleted_count,
            source,
        } => {
            assert_eq!(entity, installation);
            assert_eq!(deleted_count, 3);
            assert!(source.is_transient());
        }
        other => panic!("expected PartialCascadeFailure, got {other:?}"),
    }
    assert!(engine.entities().get(&installation).await.expect("get").is_some());

    let summary = engine
        .cascade_delete(&installation, "janitor")
        .await
        .expect("resumed cascade");
    assert_eq!(summary.associations_deleted, 6);
    assert_eq!(summary.associations_deleted_this_run, 3);
    assert!(summary.entity_deleted);
    assert!(h.association_keys().is_empty(), "left behind: {:?}", h.association_keys());

    let again = engine
        .cascade_delete(&installation, "janitor")
        .await
        .expect("idempotent re-run");
    assert_eq!(again.associations_deleted, 0);
    assert!(!again.entity_deleted);
}

#[tokio::test]
async fn cascade_of_an_unknown_entity_is_a_no_op() {
    let h = Harness::new();
    let summary = h
        .engine
        .cascade_delete(&EntityRef::device("ghost"), "janitor")
        .await
        .expect("cascade");
    assert_eq!(summary.associations_deleted, 0);
    assert!(!summary.entity_deleted);
}

#[tokio::test]
async fn cascade_also_removes_inactive_associations_and_slots() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    let (installation, sim) = (EntityRef::installation("I1"), EntityRef::sim_card("S1"));
    h.seed_all(&[device.clone(), installation.clone(), sim.clone()]).await;
    h.link(&device, &installation, RelationType::DeviceInstallation).await;
    h.link(&device, &sim, RelationType::DeviceSim).await;
    h.engine
        .soft_delete(&installation, OperationMeta::new("tester"))
        .await
        .expect("soft delete");

    let summary = h
        .engine
        .cascade_delete_with(&device, &CascadeOptions::new("janitor").with_reason("decommissioned"))
        .await
        .expect("cascade");
    assert_eq!(summary.associations_deleted, 2);
    assert!(h.association_keys().is_empty(), "left behind: {:?}", h.association_keys());

    let history = h
        .engine
        .list_history(&sim, &PageRequest::new())
        .await
        .expect("history")
        .items;
    assert_eq!(history[0].reason.as_deref(), Some("decommissioned"));
}

#[tokio::test]
async fn cascade_respects_the_deadline() {
    let h = Harness::new();
    let installation = busy_installation(&h, 2, 0).await;
    let err = h
        .engine
        .cascade_delete_with(&installation, &CascadeOptions::new("janitor").with_deadline(Instant::now()))
        .await
        .expect_err("deadline already passed");
    assert!(matches!(err, FleetError::DeadlineExceeded { operation: "cascade_delete" }));
}

#[tokio::test]
async fn cascade_requires_an_actor() {
    let h = Harness::new();
    let err = h
        .engine
        .cascade_delete(&EntityRef::device("D1"), "")
        .await
        .expect_err("actor required");
    assert!(matches!(err, FleetError::InvalidRequest { .. }));
}
