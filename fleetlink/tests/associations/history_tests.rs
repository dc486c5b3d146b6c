use super::support::*;

async fn churn(h: &Harness, device: &EntityRef) -> Vec<(HistoryAction, EntityRef)> {
    let (i1, i2, i3) = (
        EntityRef::installation("I1"),
        EntityRef::installation("I2"),
        EntityRef::installation("I3"),
    );
    h.seed_all(&[device.clone(), i1.clone(), i2.clone(), i3.clone()]).await;
    let relation = RelationType::DeviceInstallation;

    h.link(device, &i1, relation).await;
    h.link(device, &i2, relation).await;
    h.engine
        .unlink(device, &i1, relation, UnlinkMeta::new("tester"))
        .await
        .expect("unlink I1");
    h.link(device, &i3, relation).await;
    h.engine
        .unlink(device, &i2, relation, UnlinkMeta::new("tester"))
        .await
        .expect("unlink I2");

    vec![
        (HistoryAction::Unlinked, i2),
        (HistoryAction::Linked, i3),
        (HistoryAction::Unlinked, i1.clone()),
        (HistoryAction::Linked, EntityRef::installation("I2")),
        (HistoryAction::Linked, i1),
    ]
}

#[tokio::test]
async fn history_lists_every_transition_newest_first() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    let expected = churn(&h, &device).await;

    let first = h
        .engine
        .list_history(&device, &PageRequest::new())
        .await
        .expect("history");
    assert_eq!(h.history_actions(&device).await, expected);
    assert!(first.next_cursor.is_none());

    let sort_keys: Vec<_> = first
        .items
        .iter()
        .map(|record| record.sort_key.expect("stored records carry a sort key"))
        .collect();
    assert!(sort_keys.windows(2).all(|pair| pair[0] > pair[1]), "not strictly descending: {sort_keys:?}");

    let second = h
        .engine
        .list_history(&device, &PageRequest::new())
        .await
        .expect("history");
    assert_eq!(first.items, second.items, "repeated reads must agree");
}

#[tokio::test]
async fn history_pages_follow_the_cursor() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    churn(&h, &device).await;
    let full = h
        .engine
        .list_history(&device, &PageRequest::new())
        .await
        .expect("history")
        .items;

    let mut collected = Vec::new();
    let mut request = PageRequest::new().with_limit(2);
    let mut pages = 0;
    loop {
        let page = h.engine.list_history(&device, &request).await.expect("page");
        pages += 1;
        collected.extend(page.items);
        match page.next_cursor {
            Some(cursor) => request = PageRequest::new().with_limit(2).after(cursor),
            None => break,
        }
    }
    assert_eq!(pages, 3);
    assert_eq!(collected, full);
}

#[tokio::test]
async fn both_participants_see_the_same_record() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    let installation = EntityRef::installation("I1");
    h.seed_all(&[device.clone(), installation.clone()]).await;

    h.engine
        .link(
            &device,
            &installation,
            RelationType::DeviceInstallation,
            LinkMeta::new("alice").with_source_address("192.0.2.10"),
        )
        .await
        .expect("link");
    assert_eq!(h.counterparts(&device, RelationType::DeviceInstallation).await, vec![installation.clone()]);
    assert_eq!(h.counterparts(&installation, RelationType::DeviceInstallation).await, vec![device.clone()]);

    let from_device = h
        .engine
        .list_history(&device, &PageRequest::new())
        .await
        .expect("device history")
        .items;
    let from_installation = h
        .engine
        .list_history(&installation, &PageRequest::new())
        .await
        .expect("installation history")
        .items;
    assert_eq!(from_device.len(), 1);
    assert_eq!(from_installation.len(), 1);
    let (d, i) = (&from_device[0], &from_installation[0]);
    assert_eq!(d.record_id, i.record_id);
    assert_eq!((&d.entity, &d.counterpart), (&device, &installation));
    assert_eq!((&i.entity, &i.counterpart), (&installation, &device));
    assert_eq!(d.performed_by, "alice");
    assert_eq!(i.source_address.as_deref(), Some("192.0.2.10"));

    h.engine
        .unlink(&device, &installation, RelationType::DeviceInstallation, UnlinkMeta::new("alice"))
        .await
        .expect("unlink");
    assert!(h.counterparts(&device, RelationType::DeviceInstallation).await.is_empty());
    assert!(h.counterparts(&installation, RelationType::DeviceInstallation).await.is_empty());
    assert_eq!(
        h.history_actions(&installation).await,
        vec![
            (HistoryAction::Unlinked, device.clone()),
            (HistoryAction::Linked, device.clone())
        ]
    );
}

#[tokio::test]
async fn audit_sink_sees_each_committed_transition() {
    let h = Harness::new();
    let device = EntityRef::device("D1");
    churn(&h, &device).await;

    let mut emitted: Vec<String> = h.audit.records().into_iter().map(|record| record.record_id).collect();
    let mut stored: Vec<String> = h
        .engine
        .list_history(&device, &PageRequest::new())
        .await
        .expect("history")
        .items
        .into_iter()
        .map(|record| record.record_id)
        .collect();
    emitted.sort();
    stored.sort();
    assert_eq!(emitted, stored);
}

#[tokio::test]
async fn history_of_an_unknown_entity_is_empty() {
    let h = Harness::new();
    let page = h
        .engine
        .list_history(&EntityRef::contact("nobody"), &PageRequest::new())
        .await
        .expect("history");
    assert!(page.items.is_empty());
    assert!(!page.has_more());
}
