//! Generation Sweep Tests
//!
//! After a reconnect the store is swept of everything the new session did
//! not refresh. These tests validate:
//! - Objects refreshed at or after the watermark survive
//! - Objects older than the watermark are removed, links first
//! - Link origins are swept individually
//! - Refreshes applied after the sweep was scheduled are honoured
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package cfgmap-core --test generation_sweep
//! cargo test --package cfgmap-core --test generation_sweep -- --nocapture
//! ```

mod common;

use common::*;
use pretty_assertions::assert_eq;

use cfgmap_core::{LinkRequest, Origin, StoreConfig};

// ============================================================================
// Test Helpers
// ============================================================================

/// Epoch 1: nodes a, b, c and link a-b.
fn populated_db(batch_size: usize) -> cfgmap_core::Database {
    let mut config = StoreConfig::default();
    config.sweep.batch_size = batch_size;
    let db = db_with_tables(&[FOO, BAR], config);

    db.advance_epoch(1);
    db.enqueue(add_node(FOO, "a", 1));
    db.enqueue(add_node(BAR, "b", 1));
    db.enqueue(add_node(FOO, "c", 1));
    db.enqueue(foo_bar_link("a", "b", 1));
    db.run_until_idle();
    db
}

/// Re-send nodes at `seq`.
fn refresh(db: &cfgmap_core::Database, names: &[(&str, &str)], seq: u64) {
    for (id_type, id_name) in names {
        db.enqueue(add_node(id_type, id_name, seq));
    }
    db.run_until_idle();
}

// ============================================================================
// Watermarks
// ============================================================================

#[test]
fn test_refreshed_objects_survive_sweep() {
    let db = populated_db(2);

    db.advance_epoch(2);
    refresh(&db, &[(FOO, "a"), (BAR, "b")], 2);
    apply(&db, foo_bar_link("a", "b", 2));

    db.sweep_stale(2);
    db.run_until_idle();

    assert!(db.find_node(&key(FOO, "a")).is_some());
    assert!(db.find_node(&key(BAR, "b")).is_some());
    assert!(db.find_node(&key(FOO, "c")).is_none());
    assert_adjacent(&db, &key(FOO, "a"), &key(BAR, "b"));

    let stats = db.last_sweep().unwrap();
    assert_eq!(stats.watermark, 2);
    assert_eq!(stats.nodes_removed, 1);
    assert_eq!(stats.links_removed, 0);
}

#[test]
fn test_objects_not_refreshed_for_an_epoch_are_removed() {
    let db = populated_db(2);

    db.advance_epoch(2);
    refresh(&db, &[(FOO, "a"), (BAR, "b")], 2);
    apply(&db, foo_bar_link("a", "b", 2));
    db.sweep_stale(2);
    db.run_until_idle();

    // Epoch 3 only refreshes a
    db.advance_epoch(3);
    refresh(&db, &[(FOO, "a")], 3);
    db.sweep_stale(3);
    db.run_until_idle();

    assert!(db.find_node(&key(FOO, "a")).is_some());
    assert!(db.find_node(&key(BAR, "b")).is_none());
    assert!(db.link(FOO_BAR, &key(FOO, "a"), &key(BAR, "b")).is_none());
    assert!(db.neighbors(&key(FOO, "a")).is_empty());

    let stats = db.last_sweep().unwrap();
    assert_eq!(stats.links_removed, 1);
    assert_eq!(stats.nodes_removed, 1);
}

#[test]
fn test_sweep_leaves_store_consistent() {
    let db = populated_db(1);
    db.advance_epoch(5);
    db.sweep_stale(5);
    db.run_until_idle();

    let stats = db.stats();
    assert_eq!(stats.nodes, 0);
    assert_eq!(stats.links, 0);
    assert_eq!(stats.vertices, 0);
    assert_eq!(stats.edges, 0);
    assert!(!stats.sweep_active);
}

// ============================================================================
// Link origins
// ============================================================================

#[test]
fn test_stale_link_origin_removed_individually() {
    let db = populated_db(4);
    let a = key(FOO, "a");
    let b = key(BAR, "b");

    db.advance_epoch(2);
    refresh(&db, &[(FOO, "a"), (BAR, "b")], 2);
    apply(&db, foo_bar_link("a", "b", 2).with_origin(Origin::Xmpp));

    // Unknown origin is still at 1, Xmpp at 2
    assert_eq!(db.link(FOO_BAR, &a, &b).unwrap().origins().len(), 2);

    db.sweep_stale(2);
    db.run_until_idle();

    let link = db.link(FOO_BAR, &a, &b).expect("refreshed origin keeps link");
    assert_eq!(link.origins().len(), 1);
    assert_eq!(link.sequence_number(Origin::Xmpp), Some(2));
    assert_eq!(db.last_sweep().unwrap().link_origins_removed, 1);
}

// ============================================================================
// Scheduling
// ============================================================================

#[test]
fn test_refresh_queued_with_sweep_is_honoured() {
    let db = populated_db(1);

    db.advance_epoch(2);
    db.sweep_stale(2);
    // Input runs ahead of sweep batches
    db.enqueue(add_node(FOO, "c", 2));
    db.run_until_idle();

    assert!(db.find_node(&key(FOO, "c")).is_some());
    assert!(db.find_node(&key(FOO, "a")).is_none());
    assert!(db.find_node(&key(BAR, "b")).is_none());
}

#[test]
fn test_newer_sweep_supersedes_pending_one() {
    let db = populated_db(1);
    db.advance_epoch(2);
    refresh(&db, &[(FOO, "a"), (BAR, "b"), (FOO, "c")], 2);

    db.sweep_stale(1);
    db.sweep_stale(3);
    db.run_until_idle();

    assert_eq!(db.last_sweep().unwrap().watermark, 3);
    assert_eq!(db.stats().nodes, 0);
}

#[test]
fn test_sweep_batches_are_bounded() {
    let db = populated_db(1);
    db.advance_epoch(2);
    db.sweep_stale(2);
    db.run_until_idle();

    let stats = db.last_sweep().unwrap();
    // One batch per examined object plus phase transitions
    assert!(stats.batches > stats.links_examined + stats.nodes_examined);
    assert_eq!(stats.nodes_removed, 3);
}

#[test]
fn test_parked_link_for_swept_node_is_dropped() {
    let db = populated_db(4);
    apply(&db, LinkRequest::add((FOO, "c"), (BAR, "missing"), FOO_BAR, 1));
    assert_eq!(db.deferred_count(), 1);

    db.advance_epoch(2);
    db.sweep_stale(2);
    db.run_until_idle();
    assert_eq!(db.deferred_count(), 0);
}
