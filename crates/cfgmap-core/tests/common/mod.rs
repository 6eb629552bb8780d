//! Common test utilities for integration tests.
//!
//! Builds stores with the node tables the scenarios use and provides
//! shorthand for the requests and assertions they repeat.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use cfgmap_core::{Database, LinkRequest, NodeKey, NodeRequest, Request, StoreConfig};

pub const FOO: &str = "foo";
pub const BAR: &str = "bar";
pub const FOO_BAR: &str = "foo-bar";

/// Store with the `foo` and `bar` tables.
pub fn foo_bar_db() -> Database {
    db_with_tables(&[FOO, BAR], StoreConfig::default())
}

/// Store with the given tables created up front.
pub fn db_with_tables(id_types: &[&str], config: StoreConfig) -> Database {
    let db = Database::new(&config).expect("Failed to create store");
    for id_type in id_types {
        db.create_node_table(id_type)
            .expect("Failed to create node table");
    }
    db
}

/// Shared store, for consumers that keep a weak handle.
pub fn shared_db() -> Arc<Database> {
    Arc::new(Database::new(&StoreConfig::default()).expect("Failed to create store"))
}

pub fn key(id_type: &str, id_name: &str) -> NodeKey {
    NodeKey::new(id_type, id_name)
}

pub fn add_node(id_type: &str, id_name: &str, seq: u64) -> NodeRequest {
    NodeRequest::add(id_type, id_name, seq)
}

pub fn foo_bar_link(foo: &str, bar: &str, seq: u64) -> LinkRequest {
    LinkRequest::add((FOO, foo), (BAR, bar), FOO_BAR, seq)
}

/// Enqueue one request and run the store until idle.
pub fn apply(db: &Database, request: impl Into<Request>) -> usize {
    db.enqueue(request);
    db.run_until_idle()
}

/// Assert `a` and `b` are adjacent, seen from both sides.
pub fn assert_adjacent(db: &Database, a: &NodeKey, b: &NodeKey) {
    assert!(
        db.neighbors(a).contains(b),
        "{} should be adjacent to {}",
        a,
        b
    );
    assert!(
        db.neighbors(b).contains(a),
        "{} should be adjacent to {}",
        b,
        a
    );
}

pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// Load a recorded request stream.
pub fn load_requests(name: &str) -> Vec<Request> {
    let path = fixtures_dir().join(name);
    let content = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
    serde_json::from_str(&content)
        .unwrap_or_else(|e| panic!("Failed to parse {}: {}", path.display(), e))
}
