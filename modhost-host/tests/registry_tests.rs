//! Registry lifecycle and dispatch, driven through built-in Rust modules.

mod common;

use std::sync::Arc;

use modhost_db::{PersistenceProvisioner, ProvisionerConfig};
use modhost_host::{
    DispatchOutcome, HostError, ModuleRegistry, RegisterOutcome, SandboxMediator,
};
use modhost_types::{LifecycleState, ResponseStatus, UNSPECIFIED_ID};
use pretty_assertions::assert_eq;

use common::{MockModule, MockReply, RecordingConnection};

fn registry(dir: &std::path::Path) -> ModuleRegistry {
    let mediator = Arc::new(SandboxMediator::new(dir.join("data"), false));
    let provisioner = Arc::new(PersistenceProvisioner::new(ProvisionerConfig::new(dir.join("db"))));
    ModuleRegistry::new(mediator, provisioner)
}

// =============================================================================
// REGISTRATION
// =============================================================================

#[test]
fn auto_start_module_ends_up_running() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let module = MockModule::new("alpha").build();

    let outcome = registry.register(module.clone(), None).unwrap();

    assert!(matches!(outcome, RegisterOutcome::Running));
    assert_eq!(registry.module_state("alpha"), Some(LifecycleState::Running));
    assert_eq!(module.calls(), vec!["init", "start"]);
    assert!(registry.mediator().is_active("alpha"));
    assert!(registry.provisioner().is_provisioned("alpha"));
}

#[test]
fn manual_start_module_stays_registered() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let module = MockModule::new("alpha").manual_start().build();

    let outcome = registry.register(module.clone(), None).unwrap();

    assert!(matches!(outcome, RegisterOutcome::Registered));
    assert_eq!(registry.module_state("alpha"), Some(LifecycleState::Registered));
    assert_eq!(module.calls(), vec!["init"]);

    registry.start("alpha").unwrap();
    assert_eq!(registry.module_state("alpha"), Some(LifecycleState::Running));
}

#[test]
fn failed_auto_start_leaves_module_registered_and_degraded() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());

    let outcome = registry
        .register(MockModule::new("alpha").failing_start().build(), None)
        .unwrap();

    assert!(matches!(outcome, RegisterOutcome::Degraded(HostError::ModuleCrashed { .. })));
    assert!(registry.contains("alpha"));
    assert_eq!(registry.module_state("alpha"), Some(LifecycleState::Registered));
}

#[test]
fn failed_init_is_not_registered() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());

    let err = registry
        .register(MockModule::new("alpha").failing_init().build(), None)
        .unwrap_err();

    assert!(matches!(err, HostError::InitFailed { ref module, .. } if module == "alpha"));
    assert!(!registry.contains("alpha"));
    assert!(registry.is_empty());
}

#[test]
fn re_registering_replaces_and_stops_previous_module() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let first = MockModule::new("alpha").build();
    let second = MockModule::new("alpha").build();

    registry.register(first.clone(), None).unwrap();
    registry.register(second.clone(), None).unwrap();

    assert_eq!(registry.len(), 1);
    assert_eq!(first.calls(), vec!["init", "start", "stop"]);
    assert_eq!(second.calls(), vec!["init", "start"]);
    assert_eq!(registry.module_state("alpha"), Some(LifecycleState::Running));
}

#[test]
fn names_sharing_storage_keys_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    registry.register(MockModule::new("alpha").build(), None).unwrap();
    registry.register(MockModule::new("a b").build(), None).unwrap();

    for clash in ["Alpha", "a_b", "a:b"] {
        let module = MockModule::new(clash).build();
        match registry.register(module.clone(), None) {
            Err(HostError::NameCollision { module: refused, .. }) => assert_eq!(refused, clash),
            other => panic!("expected a collision for {clash}, got {:?}", other.map(|_| ())),
        }
        assert!(module.calls().is_empty());
        assert!(!registry.contains(clash));
    }

    assert_eq!(registry.len(), 2);
    assert_eq!(registry.module_state("alpha"), Some(LifecycleState::Running));
    assert_eq!(registry.module_state("a b"), Some(LifecycleState::Running));
}

#[test]
fn unregister_unknown_module_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    assert!(matches!(
        registry.unregister("ghost"),
        Err(HostError::ModuleNotFound(ref name)) if name == "ghost"
    ));
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[test]
fn stop_swallows_module_errors_and_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let module = MockModule::new("alpha").failing_stop().build();
    registry.register(module.clone(), None).unwrap();

    registry.stop("alpha").unwrap();

    assert_eq!(registry.module_state("alpha"), Some(LifecycleState::Stopped));
    assert!(!registry.mediator().is_active("alpha"));
    assert!(!registry.provisioner().is_provisioned("alpha"));
}

#[test]
fn stopped_module_can_be_started_again() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let module = MockModule::new("alpha").build();
    registry.register(module.clone(), None).unwrap();

    registry.stop("alpha").unwrap();
    registry.start("alpha").unwrap();

    assert_eq!(registry.module_state("alpha"), Some(LifecycleState::Running));
    assert_eq!(module.calls(), vec!["init", "start", "stop", "start"]);
    assert!(registry.mediator().is_active("alpha"));
}

#[test]
fn pause_requires_running() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    registry
        .register(MockModule::new("alpha").manual_start().build(), None)
        .unwrap();

    assert!(matches!(registry.pause("alpha"), Err(HostError::Types(_))));

    registry.start("alpha").unwrap();
    registry.pause("alpha").unwrap();
    assert_eq!(registry.module_state("alpha"), Some(LifecycleState::Paused));
}

#[test]
fn shutdown_stops_everything() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let alpha = MockModule::new("alpha").build();
    let beta = MockModule::new("beta").manual_start().build();
    registry.register(alpha.clone(), None).unwrap();
    registry.register(beta.clone(), None).unwrap();

    registry.shutdown();

    assert!(registry.is_empty());
    assert_eq!(alpha.calls().last(), Some(&"stop"));
    assert_eq!(beta.calls().last(), Some(&"stop"));
}

// =============================================================================
// DISPATCH
// =============================================================================

#[test]
fn dispatch_routes_by_address_and_echoes_id() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    registry.register(MockModule::new("alpha").build(), None).unwrap();
    let conn = RecordingConnection::new();

    let outcome = registry.dispatch(conn.handle(), r#"{"moduleAddress":"alpha","id":"req-7","op":"ping"}"#);

    assert_eq!(outcome, DispatchOutcome::Replied(ResponseStatus::Ok));
    let reply = conn.last_response();
    assert_eq!(reply.status, ResponseStatus::Ok);
    assert_eq!(reply.id.as_deref(), Some("req-7"));
    assert_eq!(reply.payload["op"], "ping");
}

#[test]
fn dispatch_without_id_stamps_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    registry.register(MockModule::new("alpha").build(), None).unwrap();
    let conn = RecordingConnection::new();

    registry.dispatch(conn.handle(), r#"{"moduleAddress":"alpha"}"#);

    assert_eq!(conn.last_response().id.as_deref(), Some(UNSPECIFIED_ID));
}

#[test]
fn unknown_module_gets_failed_reply() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let conn = RecordingConnection::new();

    let outcome = registry.dispatch(conn.handle(), r#"{"moduleAddress":"nosuch","id":"1"}"#);

    assert_eq!(outcome, DispatchOutcome::Replied(ResponseStatus::Failed));
    let reply = conn.last_response();
    assert_eq!(reply.reason(), Some("Unknown module: nosuch"));
    assert_eq!(reply.id.as_deref(), Some("1"));
}

#[test]
fn unaddressed_message_is_dropped_without_reply() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let conn = RecordingConnection::new();

    let outcome = registry.dispatch(conn.handle(), r#"{"id":"1","op":"ping"}"#);

    assert_eq!(outcome, DispatchOutcome::Dropped);
    assert!(conn.sent().is_empty());
}

#[test]
fn malformed_message_gets_failed_reply() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let conn = RecordingConnection::new();

    let outcome = registry.dispatch(conn.handle(), "{not json");

    assert_eq!(outcome, DispatchOutcome::Replied(ResponseStatus::Failed));
    let reply = conn.last_response();
    assert!(reply.reason().unwrap().starts_with("Malformed request"));
    assert_eq!(reply.id.as_deref(), Some(UNSPECIFIED_ID));
}

#[test]
fn handler_without_response_gets_generic_failure() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    registry
        .register(MockModule::new("alpha").reply(MockReply::Nothing).build(), None)
        .unwrap();
    let conn = RecordingConnection::new();

    registry.dispatch(conn.handle(), r#"{"moduleAddress":"alpha"}"#);

    assert_eq!(
        conn.last_response().reason(),
        Some("Unexpected Module Error occurred: alpha")
    );
}

#[test]
fn crashing_handler_fails_the_request_and_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let crashing = MockModule::new("alpha").reply(MockReply::Crash).build();
    registry.register(crashing.clone(), None).unwrap();
    registry.register(MockModule::new("beta").build(), None).unwrap();
    let conn = RecordingConnection::new();

    registry.dispatch(conn.handle(), r#"{"moduleAddress":"alpha","id":"a"}"#);
    registry.dispatch(conn.handle(), r#"{"moduleAddress":"beta","id":"b"}"#);
    registry.dispatch(conn.handle(), r#"{"moduleAddress":"alpha","id":"c"}"#);

    let replies = conn.responses();
    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0].status, ResponseStatus::Failed);
    assert!(replies[0].reason().unwrap().contains("handler blew up"));
    assert_eq!(replies[1].status, ResponseStatus::Ok);
    assert_eq!(replies[2].status, ResponseStatus::Failed);
    assert_eq!(replies[2].id.as_deref(), Some("c"));
    assert_eq!(registry.module_state("alpha"), Some(LifecycleState::Running));
}

#[test]
fn transport_owning_module_replies_itself() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    let module = MockModule::new("stream").transport_owning().build();
    registry.register(module.clone(), None).unwrap();
    let conn = RecordingConnection::new();
    let raw = r#"{"moduleAddress":"stream","chunk":1}"#;

    let outcome = registry.dispatch(conn.handle(), raw);

    assert_eq!(outcome, DispatchOutcome::Forwarded);
    assert_eq!(conn.sent(), vec![raw.to_string()]);
    assert_eq!(module.calls().last(), Some(&"dispatched"));
}

#[test]
fn replies_on_one_connection_keep_order() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    registry.register(MockModule::new("alpha").build(), None).unwrap();
    let conn = RecordingConnection::new();

    for i in 0..20 {
        registry.dispatch(conn.handle(), &format!(r#"{{"moduleAddress":"alpha","id":"{i}"}}"#));
    }

    let ids: Vec<String> = conn.responses().into_iter().filter_map(|r| r.id).collect();
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(ids, expected);
}

#[test]
fn metrics_count_traffic_per_module() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    registry.register(MockModule::new("alpha").build(), None).unwrap();
    let conn = RecordingConnection::new();
    let raw = r#"{"moduleAddress":"alpha"}"#;

    registry.dispatch(conn.handle(), raw);
    registry.dispatch(conn.handle(), raw);

    let metrics = registry.metrics_snapshot("alpha").unwrap();
    assert_eq!(metrics.messages_handled, 2);
    assert_eq!(metrics.bytes_received, 2 * raw.len() as u64);
    let sent: usize = conn.sent().iter().map(String::len).sum();
    assert_eq!(metrics.bytes_sent, sent as u64);
}

#[test]
fn list_modules_reports_state_and_kind() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(dir.path());
    registry.register(MockModule::new("beta").manual_start().build(), None).unwrap();
    registry.register(MockModule::new("alpha").build(), None).unwrap();

    let infos = registry.list_modules();
    let names: Vec<&str> = infos.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
    assert_eq!(infos[0].state, LifecycleState::Running);
    assert_eq!(infos[1].state, LifecycleState::Registered);
}
