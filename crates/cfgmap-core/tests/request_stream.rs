//! Request Stream Replay Tests
//!
//! Replays recorded request streams (JSON under `tests/fixtures/`) into a
//! store with a routing-instance consumer attached, the way a parsed
//! configuration session would feed it.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package cfgmap-core --test request_stream
//! cargo test --package cfgmap-core --test request_stream -- --nocapture
//! ```

mod common;

use std::sync::Arc;

use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;

use cfgmap_core::instance::{INSTANCE_TARGET, ROUTE_TARGET, ROUTING_INSTANCE};
use cfgmap_core::{link_attr_key, Database, InstanceManager, Request};

// ============================================================================
// Test Helpers
// ============================================================================

const BLUE_RI: &str = "default-domain:admin:blue:blue";
const BLUE_RT: &str = "target:64512:8000001";

fn session_db() -> (Arc<Database>, InstanceManager) {
    let db = shared_db();
    for id_type in ["domain", "project", "virtual-network"] {
        db.create_node_table(id_type).unwrap();
    }
    let manager = InstanceManager::new(&db).unwrap();
    (db, manager)
}

fn replay(db: &Database, requests: impl IntoIterator<Item = Request>) {
    for request in requests {
        db.enqueue(request);
        db.run_until_idle();
    }
}

fn attr_node_key() -> cfgmap_core::NodeKey {
    key(
        INSTANCE_TARGET,
        &link_attr_key(&key(ROUTING_INSTANCE, BLUE_RI), &key(ROUTE_TARGET, BLUE_RT)),
    )
}

fn assert_initial_sync(db: &Database, manager: &InstanceManager) {
    assert_eq!(db.deferred_count(), 0);

    let domain = key("domain", "default-domain");
    let project = key("project", "default-domain:admin");
    let network = key("virtual-network", "default-domain:admin:blue");
    let instance = key(ROUTING_INSTANCE, BLUE_RI);
    let target = key(ROUTE_TARGET, BLUE_RT);
    let attr = attr_node_key();

    assert_adjacent(db, &domain, &project);
    assert_adjacent(db, &project, &network);
    assert_adjacent(db, &network, &instance);
    assert_adjacent(db, &instance, &attr);
    assert_adjacent(db, &attr, &target);

    assert_eq!(
        db.find_node(&attr).unwrap().property("import-export"),
        Some(&json!("both"))
    );

    let stats = db.stats();
    assert_eq!(stats.nodes, 6);
    assert_eq!(stats.links, 5);

    let blue = manager.find(BLUE_RI).expect("routing instance created");
    let config = blue.config().unwrap();
    assert_eq!(config.properties["routing-instance-is-default"], json!(true));
    assert_eq!(
        config.route_targets.into_iter().collect::<Vec<_>>(),
        vec![BLUE_RT.to_string()]
    );
}

// ============================================================================
// Replay
// ============================================================================

#[test]
fn test_fixture_streams_parse() {
    for name in ["initial_sync.json", "resync.json"] {
        assert!(!load_requests(name).is_empty(), "{} is empty", name);
    }
}

#[test]
fn test_initial_sync_builds_graph() {
    let (db, manager) = session_db();
    replay(&db, load_requests("initial_sync.json"));
    assert_initial_sync(&db, &manager);
    assert_eq!(manager.created_count(), 1);
}

#[test]
fn test_initial_sync_reversed_builds_same_graph() {
    let (db, manager) = session_db();
    let mut requests = load_requests("initial_sync.json");
    requests.reverse();
    replay(&db, requests);
    assert_initial_sync(&db, &manager);
}

#[test]
fn test_initial_sync_batched_builds_same_graph() {
    let (db, manager) = session_db();
    for request in load_requests("initial_sync.json") {
        db.enqueue(request);
    }
    db.run_until_idle();
    assert_initial_sync(&db, &manager);
}

#[test]
fn test_replaying_stream_twice_is_idempotent() {
    let (db, manager) = session_db();
    replay(&db, load_requests("initial_sync.json"));
    replay(&db, load_requests("initial_sync.json"));
    assert_initial_sync(&db, &manager);
    assert_eq!(manager.created_count(), 1);
}

// ============================================================================
// Reconnect
// ============================================================================

#[test]
fn test_resync_then_sweep_removes_unrefreshed_config() {
    let (db, manager) = session_db();
    replay(&db, load_requests("initial_sync.json"));
    let blue = manager.find(BLUE_RI).unwrap();

    db.advance_epoch(2);
    replay(&db, load_requests("resync.json"));
    db.sweep_stale(2);
    db.run_until_idle();

    assert_adjacent(
        &db,
        &key("domain", "default-domain"),
        &key("project", "default-domain:admin"),
    );
    assert!(db
        .find_node(&key("virtual-network", "default-domain:admin:blue"))
        .is_none());
    assert!(db.find_node(&key(ROUTING_INSTANCE, BLUE_RI)).is_none());
    assert!(db.find_node(&attr_node_key()).is_none());

    let stats = db.stats();
    assert_eq!(stats.nodes, 2);
    assert_eq!(stats.links, 1);
    assert_eq!(stats.deferred_links, 0);

    assert!(blue.deleter().is_destroyed());
    assert_eq!(manager.count(), 0);
}
