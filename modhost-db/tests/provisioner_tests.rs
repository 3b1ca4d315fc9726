use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;

use modhost_db::{
    EntityDescriptor, PersistenceError, PersistenceProvisioner, ProvisionerConfig, SchemaSource,
};
use pretty_assertions::assert_eq;

fn make_provisioner(dir: &tempfile::TempDir) -> PersistenceProvisioner {
    PersistenceProvisioner::new(ProvisionerConfig::new(dir.path().join("modules-db")))
}

fn note_entity() -> EntityDescriptor {
    EntityDescriptor::with_ddl(
        "note",
        "CREATE TABLE IF NOT EXISTS note (id TEXT PRIMARY KEY, body TEXT NOT NULL);",
    )
}

/// Schema source backed by a map, standing in for a plugin's archives.
struct MapSource(HashMap<String, String>);

impl SchemaSource for MapSource {
    fn resolve_schema(&self, entity: &EntityDescriptor) -> Option<String> {
        self.0.get(&entity.schema_entry()).cloned()
    }
}

// ── Single construction ───────────────────────────────────────────

#[test]
fn concurrent_first_access_builds_once() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(make_provisioner(&dir));
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let p = Arc::clone(&provisioner);
            let b = Arc::clone(&barrier);
            thread::spawn(move || {
                b.wait();
                p.session_factory("Alpha", &[note_entity()], None).unwrap()
            })
        })
        .collect();

    let factories: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for f in &factories[1..] {
        assert!(Arc::ptr_eq(&factories[0], f));
    }

    let stats = provisioner.stats();
    assert_eq!(stats.pools_built, 1);
    assert_eq!(stats.factories_built, 1);
    assert_eq!(stats.active_tenants, 1);
}

#[test]
fn data_source_is_cached() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = make_provisioner(&dir);
    let a = provisioner.data_source("alpha").unwrap();
    let b = provisioner.data_source("alpha").unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(provisioner.stats().pools_built, 1);
}

// ── Isolation ─────────────────────────────────────────────────────

#[test]
fn tenants_use_separate_databases() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = make_provisioner(&dir);

    let alpha = provisioner.session_factory("alpha", &[note_entity()], None).unwrap();
    let beta = provisioner.session_factory("beta", &[note_entity()], None).unwrap();
    assert!(!Arc::ptr_eq(alpha.pool(), beta.pool()));

    alpha
        .open_session()
        .unwrap()
        .execute("INSERT INTO note (id, body) VALUES ('1', 'only alpha')", [])
        .unwrap();

    let count: i64 = beta
        .open_session()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM note", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn database_path_uses_lowercased_sanitized_name() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = make_provisioner(&dir);
    provisioner.data_source("Chat Service").unwrap();

    let expected = dir.path().join("modules-db").join("chat_service").join("global.db");
    assert_eq!(provisioner.database_path("Chat Service"), expected);
    assert!(expected.exists());
}

// ── Schema discovery ──────────────────────────────────────────────

#[test]
fn schema_resolved_through_source() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = make_provisioner(&dir);
    let source = MapSource(HashMap::from([(
        "schema/task.sql".to_string(),
        "CREATE TABLE task (id INTEGER PRIMARY KEY, title TEXT);".to_string(),
    )]));

    let factory = provisioner
        .session_factory("gamma", &[EntityDescriptor::named("task")], Some(&source))
        .unwrap();
    assert!(factory.has_entity("task"));

    let mut session = factory.open_session().unwrap();
    session
        .transaction(|tx| {
            tx.execute("INSERT INTO task (title) VALUES ('write tests')", [])?;
            Ok(())
        })
        .unwrap();
    let title: String = session
        .query_row("SELECT title FROM task", [], |r| r.get(0))
        .unwrap();
    assert_eq!(title, "write tests");
}

#[test]
fn unknown_entity_fails_and_is_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = make_provisioner(&dir);

    let err = provisioner
        .session_factory("delta", &[EntityDescriptor::named("ghost")], None)
        .unwrap_err();
    assert!(matches!(err, PersistenceError::UnknownEntity { ref entity, .. } if entity == "ghost"));
    assert!(!provisioner.is_provisioned("delta"));
}

#[test]
fn invalid_ddl_reports_schema_error() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = make_provisioner(&dir);
    let bad = EntityDescriptor::with_ddl("bad", "CREATE TABLEE nope");
    let err = provisioner.session_factory("eps", &[bad], None).unwrap_err();
    assert!(matches!(err, PersistenceError::Schema { .. }));
}

// ── JSON sessions ─────────────────────────────────────────────────

#[test]
fn json_statements_round_trip_rows() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = make_provisioner(&dir);
    let factory = provisioner.session_factory("alpha", &[note_entity()], None).unwrap();
    let session = factory.open_session().unwrap();

    let changed = session
        .execute_json(
            "INSERT INTO note (id, body) VALUES (?1, ?2)",
            &[serde_json::json!("n1"), serde_json::json!("first")],
        )
        .unwrap();
    assert_eq!(changed, 1);

    let rows = session
        .query_json("SELECT id, body FROM note WHERE id = ?1", &[serde_json::json!("n1")])
        .unwrap();
    assert_eq!(rows, vec![serde_json::json!({ "id": "n1", "body": "first" })]);
}

#[test]
fn json_statement_errors_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = make_provisioner(&dir);
    let factory = provisioner.session_factory("alpha", &[note_entity()], None).unwrap();
    let session = factory.open_session().unwrap();

    let err = session.query_json("SELECT * FROM missing", &[]).unwrap_err();
    assert!(matches!(err, PersistenceError::Database(_)));
}

// ── Teardown ──────────────────────────────────────────────────────

#[test]
fn close_evicts_and_rebuilds_on_next_use() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = make_provisioner(&dir);

    let first = provisioner.session_factory("alpha", &[note_entity()], None).unwrap();
    provisioner.close("alpha");
    assert!(!provisioner.is_provisioned("alpha"));

    let second = provisioner.session_factory("alpha", &[note_entity()], None).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(provisioner.stats().factories_built, 2);
}

#[test]
fn shutdown_all_clears_every_tenant() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = make_provisioner(&dir);
    provisioner.data_source("a").unwrap();
    provisioner.data_source("b").unwrap();

    provisioner.shutdown_all();
    assert_eq!(provisioner.stats().active_tenants, 0);
}
