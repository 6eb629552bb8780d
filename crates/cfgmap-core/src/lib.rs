//! cfgmap Core - partitioned configuration graph store
//!
//! This crate provides an in-memory store for typed configuration objects
//! (nodes) and the relations between them (links):
//! - Partitioned tables with ordered change notification
//! - An undirected property graph with name-ordered adjacency
//! - Order-independent link identities
//! - Deferred resolution of links whose endpoints are not yet usable
//! - Reference-counted, pausable deletion of derived objects
//! - Generation sweeps removing objects not refreshed after a reconnect

pub mod arena;
pub mod database;
pub mod deferred;
pub mod entry;
pub mod error;
pub mod graph;
pub mod instance;
pub mod key;
pub mod lifetime;
pub mod request;
pub mod sweeper;
pub mod table;
pub mod telemetry;
pub mod walker;

// Re-exports for convenience
pub use database::{Database, DatabaseStats, PreFilter};
pub use deferred::{DeferredLink, DeferredLinkResolver};
pub use entry::{EntryFlags, Link, Node, PropertySet, TableEntry};
pub use error::StoreError;
pub use graph::{GraphEdge, PropertyGraph, Vertex};
pub use key::{link_attr_key, link_key, table_name, NodeKey, LINK_TABLE_NAME};
pub use lifetime::{LifetimeActor, LifetimeManager, LifetimeRef, LifetimeState, Resurrector};
pub use request::{
    LinkData, LinkRequest, LinkRequestKey, NodeData, NodeRequest, NodeRequestKey, Operation,
    Origin, Properties, Request,
};
pub use sweeper::{GenerationSweeper, SweepPhase, SweepStats};
pub use table::{EntryRef, Listener, ListenerId, PartitionId, PartitionedTable};
pub use walker::{TableWalker, WalkBatch};

// Instance re-exports
pub use instance::{InstanceConfig, InstanceManager, RoutingInstance};

// Config re-exports
pub use cfgmap_config::{ConfigLoader, ConfigOverrides, StoreConfig};
