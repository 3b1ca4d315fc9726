//! Dependency materialization against a mock artifact repository.

use std::time::Duration;

use modhost_host::{DependencyMaterializer, HostError};
use modhost_package::{ArtifactCoordinate, PackageBuilder, PluginPackage};
use pretty_assertions::assert_eq;

fn coordinate(s: &str) -> ArtifactCoordinate {
    s.parse().unwrap()
}

fn materializer(libs: &std::path::Path, repository: &str) -> DependencyMaterializer {
    DependencyMaterializer::new(libs, repository, Duration::from_secs(2), Duration::from_secs(2)).unwrap()
}

// =============================================================================
// REMOTE ARTIFACTS
// =============================================================================

#[test]
fn fetched_artifact_is_stored_under_its_file_name() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/org/acme/util/2.1/util-2.1.jar")
        .with_status(200)
        .with_body("jar-bytes")
        .expect(1)
        .create();
    let libs = dir.path().join("libs");

    let path = materializer(&libs, &server.url())
        .fetch_one(&coordinate("org.acme:util:2.1"))
        .unwrap();

    mock.assert();
    assert_eq!(path, libs.join("util-2.1.jar"));
    assert_eq!(std::fs::read(&path).unwrap(), b"jar-bytes");
}

#[test]
fn cached_artifact_is_not_fetched_again() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/org/acme/util/2.1/util-2.1.jar")
        .with_status(200)
        .with_body("jar-bytes")
        .expect(1)
        .create();
    let m = materializer(dir.path(), &server.url());

    m.fetch_one(&coordinate("org.acme:util:2.1")).unwrap();
    m.fetch_one(&coordinate("org.acme:util:2.1")).unwrap();

    mock.assert();
}

#[test]
fn missing_artifact_is_a_fetch_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new();
    let _mock = server
        .mock("GET", "/org/acme/gone/1.0/gone-1.0.jar")
        .with_status(404)
        .create();

    let err = materializer(dir.path(), &server.url())
        .fetch_one(&coordinate("org.acme:gone:1.0"))
        .unwrap_err();

    assert!(matches!(err, HostError::Fetch { ref url, .. } if url.ends_with("/org/acme/gone/1.0/gone-1.0.jar")));
    assert!(!dir.path().join("gone-1.0.jar").exists());
}

#[test]
fn coordinate_naming_a_path_outside_libs_is_refused_before_any_request() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", mockito::Matcher::Any)
        .with_status(200)
        .with_body("payload")
        .expect(0)
        .create();
    let libs = dir.path().join("libs");
    let escaping = ArtifactCoordinate {
        group: "g".into(),
        artifact: "../../escaped".into(),
        version: "1".into(),
    };

    let err = materializer(&libs, &server.url()).fetch_one(&escaping).unwrap_err();

    mock.assert();
    assert!(matches!(err, HostError::Package(_)));
    assert!(!libs.exists() || std::fs::read_dir(&libs).unwrap().next().is_none());
}

#[test]
fn failed_artifacts_are_dropped_and_the_rest_kept() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new();
    let _gone = server
        .mock("GET", "/org/acme/gone/1.0/gone-1.0.jar")
        .with_status(500)
        .create();
    let _util = server
        .mock("GET", "/org/acme/util/2.1/util-2.1.jar")
        .with_status(200)
        .with_body("jar-bytes")
        .create();

    let fetched = materializer(dir.path(), &server.url())
        .fetch_remote(&[coordinate("org.acme:gone:1.0"), coordinate("org.acme:util:2.1")]);

    assert_eq!(fetched, vec![dir.path().join("util-2.1.jar")]);
}

#[test]
fn unreachable_repository_drops_without_failing() {
    let dir = tempfile::tempdir().unwrap();
    let fetched = materializer(dir.path(), "http://127.0.0.1:9")
        .fetch_remote(&[coordinate("org.acme:util:2.1")]);
    assert!(fetched.is_empty());
}

// =============================================================================
// EMBEDDED LIBRARIES AND SEARCH ORDER
// =============================================================================

#[test]
fn materialize_orders_package_then_embedded_then_remote() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new();
    let _util = server
        .mock("GET", "/org/acme/util/2.1/util-2.1.jar")
        .with_status(200)
        .with_body("jar-bytes")
        .create();
    let package_path = PackageBuilder::new()
        .descriptor(
            "main: a.Main\nmodule_name: alpha\nembeddedLibs:\n  - lib/one.jar\n  - lib/missing.jar\n  - lib/two.jar\nmavenDeps: org.acme:util:2.1\n",
        )
        .entry("lib/one.jar", b"one".to_vec())
        .entry("lib/two.jar", b"two".to_vec())
        .write_to(dir.path().join("alpha-plugin.jar"))
        .unwrap();
    let libs = dir.path().join("libs");
    let mut package = PluginPackage::open(&package_path).unwrap();
    let descriptor = package.read_descriptor().unwrap().unwrap();

    let search_path = materializer(&libs, &server.url())
        .materialize(&mut package, &descriptor)
        .unwrap();

    assert_eq!(
        search_path,
        vec![
            package_path,
            libs.join("alpha-plugin_one.jar"),
            libs.join("alpha-plugin_two.jar"),
            libs.join("util-2.1.jar"),
        ]
    );
    assert_eq!(std::fs::read(libs.join("alpha-plugin_two.jar")).unwrap(), b"two");
}
