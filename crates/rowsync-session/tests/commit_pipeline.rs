//! End-to-end commit pipeline tests over the mock adapter: key generation,
//! FK resolution, batching shapes, optimistic locking and rollback.

use rowsync_core::{DbAdapter, DmlKind, Error, ObjectId, TopologicalSorter, Value};
use rowsync_session::testing::{
    gallery_registry, locked_registry, snapshot_of, MapResolver, MockAdapter,
};
use rowsync_session::{commit, delete_object, ObjectStore, PersistenceState};
use std::collections::HashMap;
use std::sync::Arc;

fn adapters(adapter: &Arc<MockAdapter>) -> HashMap<String, Arc<dyn DbAdapter>> {
    let mut map: HashMap<String, Arc<dyn DbAdapter>> = HashMap::new();
    map.insert("default".to_string(), adapter.clone() as Arc<dyn DbAdapter>);
    map
}

fn run_commit(
    store: &mut ObjectStore,
    adapter: &Arc<MockAdapter>,
) -> rowsync_core::Result<(commit::CommitStats, rowsync_cache::SnapshotChanges)> {
    commit::commit(store, &adapters(adapter), &TopologicalSorter)
}

fn gallery_store() -> ObjectStore {
    ObjectStore::new(Arc::new(gallery_registry()))
}

fn column_index(columns: &[String], name: &str) -> usize {
    columns.iter().position(|c| c == name).unwrap()
}

#[test]
fn insert_pipeline_keys_masters_first() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = gallery_store();

    // Register the dependent before the master; the sorter must still put
    // ARTIST rows first.
    let painting = store.register_new("painting").unwrap();
    store
        .modify_scalar(&painting, "title", Value::Text("Water Lilies".into()))
        .unwrap();
    let artist = store.register_new("artist").unwrap();
    store
        .modify_scalar(&artist, "name", Value::Text("Monet".into()))
        .unwrap();
    store
        .set_to_one(&painting, "artist", Some(artist.clone()))
        .unwrap();

    let (stats, changes) = run_commit(&mut store, &adapter).unwrap();
    assert_eq!(stats.inserted, 2);
    assert_eq!(adapter.log.tables(), vec!["ARTIST".to_string(), "PAINTING".to_string()]);
    assert_eq!(adapter.log.tx.lock().as_slice(), &["begin", "commit"]);

    // The painting's FK carries the artist's generated key.
    let painting_op = &adapter.log.ops_for("PAINTING")[0];
    let fk = column_index(&painting_op.template.columns, "ARTIST_ID");
    let artist_key = Value::BigInt(1000);
    assert_eq!(painting_op.rows[0].values[fk], artist_key);

    // Both objects settled under permanent identities.
    let artist_final = ObjectId::single("artist", "ARTIST_ID", artist_key);
    assert_eq!(store.state_of(&artist_final), PersistenceState::Committed);
    assert!(!store.contains(&artist));
    assert_eq!(changes.updated.len(), 2);
}

#[test]
fn flattened_arcs_become_join_rows() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = gallery_store();
    let artist = ObjectId::single("artist", "ARTIST_ID", Value::BigInt(1));
    let gallery = ObjectId::single("gallery", "GALLERY_ID", Value::BigInt(2));
    store
        .register_committed(artist.clone(), &snapshot_of(&[("ARTIST_ID", Value::BigInt(1))]))
        .unwrap();
    store
        .register_committed(gallery.clone(), &snapshot_of(&[("GALLERY_ID", Value::BigInt(2))]))
        .unwrap();

    store.add_flattened(&artist, "exhibits", &gallery).unwrap();
    let (stats, _) = run_commit(&mut store, &adapter).unwrap();
    // Join rows are counted separately from object rows.
    assert_eq!(stats.inserted, 0);
    assert_eq!(stats.join_rows, 1);

    let insert = &adapter.log.ops_for("ARTIST_EXHIBIT")[0];
    assert_eq!(insert.template.kind, DmlKind::Insert);
    assert_eq!(
        insert.template.columns,
        vec!["ARTIST_ID".to_string(), "GALLERY_ID".to_string()]
    );
    assert_eq!(insert.rows[0].values, vec![Value::BigInt(1), Value::BigInt(2)]);

    // Unlinking after the commit produces a join-row delete.
    store.remove_flattened(&artist, "exhibits", &gallery).unwrap();
    run_commit(&mut store, &adapter).unwrap();
    let ops = adapter.log.ops_for("ARTIST_EXHIBIT");
    let delete = ops.last().unwrap();
    assert_eq!(delete.template.kind, DmlKind::Delete);
    assert_eq!(
        delete.template.qualifier,
        vec!["ARTIST_ID".to_string(), "GALLERY_ID".to_string()]
    );
    assert_eq!(
        delete.rows[0].qualifier_values,
        vec![Value::BigInt(1), Value::BigInt(2)]
    );
}

#[test]
fn updates_batch_by_statement_shape() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = gallery_store();
    for n in 1..=2 {
        let id = ObjectId::single("gallery", "GALLERY_ID", Value::BigInt(n));
        store
            .register_committed(
                id.clone(),
                &snapshot_of(&[
                    ("GALLERY_ID", Value::BigInt(n)),
                    ("GALLERY_NAME", Value::Text("old".into())),
                ]),
            )
            .unwrap();
        store
            .modify_scalar(&id, "name", Value::Text(format!("new-{n}")))
            .unwrap();
    }
    let painting = ObjectId::single("painting", "PAINTING_ID", Value::BigInt(9));
    store
        .register_committed(
            painting.clone(),
            &snapshot_of(&[("PAINTING_ID", Value::BigInt(9)), ("ESTIMATE", Value::BigInt(100))]),
        )
        .unwrap();
    store
        .modify_scalar(&painting, "estimate", Value::BigInt(200))
        .unwrap();

    let (stats, _) = run_commit(&mut store, &adapter).unwrap();
    assert_eq!(stats.updated, 3);

    // Same table + same changed columns = one batched statement.
    let gallery_ops = adapter.log.ops_for("GALLERY");
    assert_eq!(gallery_ops.len(), 1);
    assert!(gallery_ops[0].batched);
    assert_eq!(gallery_ops[0].rows.len(), 2);
    assert_eq!(gallery_ops[0].template.columns, vec!["GALLERY_NAME".to_string()]);
    assert_eq!(gallery_ops[0].template.qualifier, vec!["GALLERY_ID".to_string()]);

    let painting_ops = adapter.log.ops_for("PAINTING");
    assert_eq!(painting_ops.len(), 1);
    assert_eq!(painting_ops[0].template.columns, vec!["ESTIMATE".to_string()]);
}

#[test]
fn repointing_at_a_new_master_updates_the_fk() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = gallery_store();
    let painting = ObjectId::single("painting", "PAINTING_ID", Value::BigInt(5));
    store
        .register_committed(
            painting.clone(),
            &snapshot_of(&[
                ("PAINTING_ID", Value::BigInt(5)),
                ("TITLE", Value::Text("t".into())),
                ("ESTIMATE", Value::BigInt(100)),
                ("ARTIST_ID", Value::BigInt(1)),
            ]),
        )
        .unwrap();
    let artist = store.register_new("artist").unwrap();
    store
        .modify_scalar(&artist, "name", Value::Text("Seurat".into()))
        .unwrap();
    store.set_to_one(&painting, "artist", Some(artist)).unwrap();

    let (stats, _) = run_commit(&mut store, &adapter).unwrap();
    assert_eq!((stats.inserted, stats.updated), (1, 1));

    // The new artist row lands first, then the existing painting's FK is
    // rewritten to the generated key.
    assert_eq!(
        adapter.log.tables(),
        vec!["ARTIST".to_string(), "PAINTING".to_string()]
    );
    let update = &adapter.log.ops_for("PAINTING")[0];
    assert_eq!(update.template.kind, DmlKind::Update);
    assert_eq!(update.template.columns, vec!["ARTIST_ID".to_string()]);
    assert_eq!(update.rows[0].values, vec![Value::BigInt(1000)]);
    assert_eq!(update.rows[0].qualifier_values, vec![Value::BigInt(5)]);
}

#[test]
fn merged_peer_change_is_not_written_back() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = gallery_store();
    let painting = ObjectId::single("painting", "PAINTING_ID", Value::BigInt(5));
    store
        .register_committed(
            painting.clone(),
            &snapshot_of(&[
                ("PAINTING_ID", Value::BigInt(5)),
                ("TITLE", Value::Text("t".into())),
                ("ESTIMATE", Value::BigInt(100)),
                ("ARTIST_ID", Value::BigInt(1)),
            ]),
        )
        .unwrap();
    store
        .modify_scalar(&painting, "title", Value::Text("t-local".into()))
        .unwrap();

    // A peer commit raised the estimate before this session commits.
    let mut event = rowsync_core::SnapshotEvent::new("peer");
    event.updated.push((
        painting.clone(),
        snapshot_of(&[
            ("PAINTING_ID", Value::BigInt(5)),
            ("TITLE", Value::Text("t".into())),
            ("ESTIMATE", Value::BigInt(999)),
            ("ARTIST_ID", Value::BigInt(1)),
        ]),
    ));
    store.merge_external(&event);

    run_commit(&mut store, &adapter).unwrap();

    // Only the locally edited column is written; the peer's estimate is
    // left alone.
    let update = &adapter.log.ops_for("PAINTING")[0];
    assert_eq!(update.template.columns, vec!["TITLE".to_string()]);
    assert_eq!(update.rows[0].values, vec![Value::Text("t-local".into())]);
}

#[test]
fn rewriting_the_same_value_emits_no_update() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = gallery_store();
    let gallery = ObjectId::single("gallery", "GALLERY_ID", Value::BigInt(1));
    store
        .register_committed(
            gallery.clone(),
            &snapshot_of(&[
                ("GALLERY_ID", Value::BigInt(1)),
                ("GALLERY_NAME", Value::Text("same".into())),
            ]),
        )
        .unwrap();
    store
        .modify_scalar(&gallery, "name", Value::Text("same".into()))
        .unwrap();
    assert_eq!(store.state_of(&gallery), PersistenceState::Modified);

    run_commit(&mut store, &adapter).unwrap();

    // No statement reached the database and the object settled cleanly.
    assert!(adapter.log.ops.lock().is_empty());
    assert_eq!(store.state_of(&gallery), PersistenceState::Committed);
}

#[test]
fn lock_qualifier_uses_retained_values() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = ObjectStore::new(Arc::new(locked_registry()));
    let painting = ObjectId::single("painting", "PAINTING_ID", Value::BigInt(5));
    store
        .register_committed(
            painting.clone(),
            &snapshot_of(&[
                ("PAINTING_ID", Value::BigInt(5)),
                ("TITLE", Value::Text("Old".into())),
                ("ARTIST_ID", Value::BigInt(1)),
            ]),
        )
        .unwrap();
    store
        .modify_scalar(&painting, "title", Value::Text("New".into()))
        .unwrap();

    run_commit(&mut store, &adapter).unwrap();

    let op = &adapter.log.ops_for("PAINTING")[0];
    // Locking rows execute one-by-one so each row's count is observable.
    assert!(!op.batched);
    assert_eq!(
        op.template.qualifier,
        vec![
            "PAINTING_ID".to_string(),
            "TITLE".to_string(),
            "ARTIST_ID".to_string()
        ]
    );
    // The qualifier compares against the retained image, not the new value.
    assert_eq!(
        op.rows[0].qualifier_values,
        vec![Value::BigInt(5), Value::Text("Old".into()), Value::BigInt(1)]
    );
}

#[test]
fn join_only_peer_change_does_not_alter_lock_qualifier() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = ObjectStore::new(Arc::new(locked_registry()));
    let painting = ObjectId::single("painting", "PAINTING_ID", Value::BigInt(5));
    store
        .register_committed(
            painting.clone(),
            &snapshot_of(&[
                ("PAINTING_ID", Value::BigInt(5)),
                ("TITLE", Value::Text("Old".into())),
                ("ARTIST_ID", Value::BigInt(1)),
            ]),
        )
        .unwrap();
    store
        .modify_scalar(&painting, "estimate", Value::BigInt(500))
        .unwrap();

    // A peer's commit touched only a join table involving this row; no
    // attribute column changed on the row itself.
    let mut event = rowsync_core::SnapshotEvent::new("peer");
    event.indirectly_modified.push(painting.clone());
    store.merge_external(&event);

    run_commit(&mut store, &adapter).unwrap();

    // The lock qualifier is built from the retained attribute columns and
    // is unaffected by the relationship-only change.
    let op = &adapter.log.ops_for("PAINTING")[0];
    assert_eq!(op.template.columns, vec!["ESTIMATE".to_string()]);
    assert_eq!(
        op.rows[0].qualifier_values,
        vec![Value::BigInt(5), Value::Text("Old".into()), Value::BigInt(1)]
    );
}

#[test]
fn null_lock_qualifiers_split_batches() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = ObjectStore::new(Arc::new(locked_registry()));
    let with_title = ObjectId::single("painting", "PAINTING_ID", Value::BigInt(1));
    let without_title = ObjectId::single("painting", "PAINTING_ID", Value::BigInt(2));
    store
        .register_committed(
            with_title.clone(),
            &snapshot_of(&[
                ("PAINTING_ID", Value::BigInt(1)),
                ("TITLE", Value::Text("x".into())),
                ("ARTIST_ID", Value::BigInt(1)),
            ]),
        )
        .unwrap();
    store
        .register_committed(
            without_title.clone(),
            &snapshot_of(&[
                ("PAINTING_ID", Value::BigInt(2)),
                ("TITLE", Value::Null),
                ("ARTIST_ID", Value::BigInt(1)),
            ]),
        )
        .unwrap();
    store
        .modify_scalar(&with_title, "estimate", Value::BigInt(10))
        .unwrap();
    store
        .modify_scalar(&without_title, "estimate", Value::BigInt(10))
        .unwrap();

    run_commit(&mut store, &adapter).unwrap();

    // One statement qualifies TITLE = ?, the other TITLE IS NULL; they must
    // not share a prepared shape.
    assert_eq!(adapter.log.ops_for("PAINTING").len(), 2);
}

#[test]
fn stale_lock_qualifier_rolls_everything_back() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = ObjectStore::new(Arc::new(locked_registry()));
    let painting = ObjectId::single("painting", "PAINTING_ID", Value::BigInt(5));
    store
        .register_committed(
            painting.clone(),
            &snapshot_of(&[
                ("PAINTING_ID", Value::BigInt(5)),
                ("TITLE", Value::Text("Old".into())),
                ("ARTIST_ID", Value::BigInt(1)),
            ]),
        )
        .unwrap();
    store
        .modify_scalar(&painting, "title", Value::Text("New".into()))
        .unwrap();
    adapter.stale.lock().push(Value::BigInt(5));

    let err = run_commit(&mut store, &adapter).unwrap_err();
    assert!(err.is_recoverable());
    let Error::OptimisticLock(lock) = err else {
        panic!("expected an optimistic lock failure, got {err}");
    };
    assert_eq!(lock.object, painting);
    assert!(lock.qualifier.contains("PAINTING_ID"));

    // Transaction rolled back, store still dirty and retryable.
    assert_eq!(adapter.log.tx.lock().as_slice(), &["begin", "rollback"]);
    assert_eq!(store.state_of(&painting), PersistenceState::Modified);
    assert!(store.has_pending_changes());
}

#[test]
fn read_only_entities_are_rejected_before_sql() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = gallery_store();
    let archive = ObjectId::single("archive", "ARCHIVE_ID", Value::BigInt(1));
    store
        .register_committed(
            archive.clone(),
            &snapshot_of(&[
                ("ARCHIVE_ID", Value::BigInt(1)),
                ("ARCHIVE_NAME", Value::Text("a".into())),
            ]),
        )
        .unwrap();
    store
        .modify_scalar(&archive, "name", Value::Text("b".into()))
        .unwrap();

    let err = run_commit(&mut store, &adapter).unwrap_err();
    assert!(matches!(err, Error::ReadOnly(_)));
    // Rejected before a connection was even opened.
    assert!(adapter.log.ops.lock().is_empty());
    assert!(adapter.log.tx.lock().is_empty());
}

#[test]
fn pk_change_replaces_the_identity() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = gallery_store();
    let old = ObjectId::single("gallery", "GALLERY_ID", Value::BigInt(7));
    store
        .register_committed(
            old.clone(),
            &snapshot_of(&[
                ("GALLERY_ID", Value::BigInt(7)),
                ("GALLERY_NAME", Value::Text("g".into())),
            ]),
        )
        .unwrap();
    store.modify_scalar(&old, "id", Value::BigInt(8)).unwrap();

    let (stats, changes) = run_commit(&mut store, &adapter).unwrap();
    assert_eq!(stats.updated, 1);

    // The UPDATE qualifies on the old key value.
    let op = &adapter.log.ops_for("GALLERY")[0];
    assert_eq!(op.rows[0].qualifier_values, vec![Value::BigInt(7)]);

    // The store now tracks the row under its new identity; the old one is
    // retired from caches.
    let new = ObjectId::single("gallery", "GALLERY_ID", Value::BigInt(8));
    assert_eq!(store.state_of(&new), PersistenceState::Committed);
    assert!(!store.contains(&old));
    assert!(changes.deleted.contains(&old));
    assert!(changes.updated.iter().any(|(id, _)| *id == new));
}

#[test]
fn dependent_pk_propagates_from_master() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = gallery_store();
    let artist = store.register_new("artist").unwrap();
    store
        .modify_scalar(&artist, "name", Value::Text("Klimt".into()))
        .unwrap();
    let detail = store.register_new("artist_detail").unwrap();
    store
        .modify_scalar(&detail, "bio", Value::Text("Vienna".into()))
        .unwrap();
    store.set_to_one(&detail, "artist", Some(artist)).unwrap();

    run_commit(&mut store, &adapter).unwrap();

    assert_eq!(
        adapter.log.tables(),
        vec!["ARTIST".to_string(), "ARTIST_DETAIL".to_string()]
    );
    let detail_op = &adapter.log.ops_for("ARTIST_DETAIL")[0];
    let pk = column_index(&detail_op.template.columns, "ARTIST_ID");
    assert_eq!(detail_op.rows[0].values[pk], Value::BigInt(1000));

    let detail_final = ObjectId::single("artist_detail", "ARTIST_ID", Value::BigInt(1000));
    assert_eq!(store.state_of(&detail_final), PersistenceState::Committed);
}

#[test]
fn deletes_run_dependents_before_masters() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = gallery_store();
    let resolver = MapResolver::default();
    let artist = ObjectId::single("artist", "ARTIST_ID", Value::BigInt(1));
    let painting = ObjectId::single("painting", "PAINTING_ID", Value::BigInt(2));
    store
        .register_committed(artist.clone(), &snapshot_of(&[("ARTIST_ID", Value::BigInt(1))]))
        .unwrap();
    store
        .register_committed(
            painting.clone(),
            &snapshot_of(&[("PAINTING_ID", Value::BigInt(2)), ("ARTIST_ID", Value::BigInt(1))]),
        )
        .unwrap();

    delete_object(&mut store, &resolver, &artist).unwrap();
    delete_object(&mut store, &resolver, &painting).unwrap();

    let (stats, changes) = run_commit(&mut store, &adapter).unwrap();
    assert_eq!(stats.deleted, 2);
    // PAINTING rows drop before the ARTIST row they reference.
    assert_eq!(
        adapter.log.tables(),
        vec!["PAINTING".to_string(), "ARTIST".to_string()]
    );
    assert!(changes.deleted.contains(&artist));
    assert!(changes.deleted.contains(&painting));
    assert_eq!(store.len(), 0);
}

#[test]
fn mixed_commit_reports_counts_and_changes() {
    let adapter = Arc::new(MockAdapter::new());
    let mut store = gallery_store();
    let resolver = MapResolver::default();

    let new_artist = store.register_new("artist").unwrap();
    store
        .modify_scalar(&new_artist, "name", Value::Text("a".into()))
        .unwrap();

    let gallery = ObjectId::single("gallery", "GALLERY_ID", Value::BigInt(1));
    store
        .register_committed(
            gallery.clone(),
            &snapshot_of(&[
                ("GALLERY_ID", Value::BigInt(1)),
                ("GALLERY_NAME", Value::Text("old".into())),
            ]),
        )
        .unwrap();
    store
        .modify_scalar(&gallery, "name", Value::Text("new".into()))
        .unwrap();

    let dealer = ObjectId::single("dealer", "DEALER_ID", Value::BigInt(2));
    store
        .register_committed(dealer.clone(), &snapshot_of(&[("DEALER_ID", Value::BigInt(2))]))
        .unwrap();
    delete_object(&mut store, &resolver, &dealer).unwrap();

    let (stats, changes) = run_commit(&mut store, &adapter).unwrap();
    assert_eq!(
        (stats.inserted, stats.updated, stats.deleted),
        (1, 1, 1)
    );
    assert_eq!(changes.updated.len(), 2); // insert + update snapshots
    assert_eq!(changes.deleted, vec![dealer]);
    assert!(!store.has_pending_changes());
}

#[test]
fn non_batching_adapters_execute_row_by_row() {
    let mut mock = MockAdapter::new();
    mock.batching = false;
    let adapter = Arc::new(mock);
    let mut store = gallery_store();
    for n in 0..2 {
        let id = store.register_new("gallery").unwrap();
        store
            .modify_scalar(&id, "name", Value::Text(format!("g{n}")))
            .unwrap();
    }

    run_commit(&mut store, &adapter).unwrap();

    let ops = adapter.log.ops_for("GALLERY");
    assert_eq!(ops.len(), 2);
    assert!(ops.iter().all(|op| !op.batched && op.rows.len() == 1));
}

#[test]
fn failed_statement_rolls_back_and_preserves_the_store() {
    let adapter = Arc::new(MockAdapter::new());
    *adapter.fail_table.lock() = Some("GALLERY".to_string());
    let mut store = gallery_store();
    let id = store.register_new("gallery").unwrap();
    store
        .modify_scalar(&id, "name", Value::Text("g".into()))
        .unwrap();

    let err = run_commit(&mut store, &adapter).unwrap_err();
    assert!(matches!(err, Error::Driver(_)));
    assert_eq!(adapter.log.tx.lock().as_slice(), &["begin", "rollback"]);
    // The new object is still pending, the commit can be retried.
    assert_eq!(store.state_of(&id), PersistenceState::New);
    assert!(store.has_pending_changes());
}
