//! Database
//!
//! Composition root of the store: owns the node tables, the link table,
//! the property graph, the deferred link resolver, the lifetime manager
//! and the generation sweeper. Tests and embedding processes construct
//! independent instances; there is no process-wide registry.
//!
//! ## Scheduling
//!
//! Work is cooperative. [`Database::enqueue`] only queues a request on the
//! partition owning its key; [`Database::run_until_idle`] then repeatedly
//! runs the highest-priority class that has work:
//!
//! 1. request input, per table and partition, in arrival order
//! 2. change notification to table listeners
//! 3. lifetime destruction
//! 4. one generation-sweep batch
//!
//! Each request runs to completion. Locks are held only for the in-memory
//! edit and never across a listener callback. The deferred-link lock may be
//! held while reading a table partition, never the other way round.

use crate::deferred::DeferredLinkResolver;
use crate::entry::{Link, Node, PropertySet, TableEntry};
use crate::error::StoreError;
use crate::graph::PropertyGraph;
use crate::key::{link_attr_key, link_key, table_name, NodeKey, LINK_TABLE_NAME};
use crate::lifetime::LifetimeManager;
use crate::request::{
    LinkRequest, LinkRequestKey, NodeData, NodeRequest, NodeRequestKey, Operation, Origin,
    Properties, Request,
};
use crate::sweeper::{GenerationSweeper, SweepStats};
use crate::table::{EntryRef, ListenerId, PartitionId, PartitionedTable};
use crate::walker::TableWalker;
use cfgmap_config::{ConfigLoader, ConfigOverrides, StoreConfig, MAX_PARTITIONS};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Hook run on every request for one node table before it is applied.
///
/// Receives the live node, if any, and may rewrite the request, for
/// example turning an update into a delete. Returning false drops the
/// request. The request key cannot be changed.
pub type PreFilter = Arc<dyn Fn(Option<&Node>, &mut NodeRequest) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
enum ListenerTarget {
    Node(String),
    Link,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub node_tables: usize,
    pub nodes: usize,
    pub links: usize,
    pub vertices: usize,
    pub edges: usize,
    pub deferred_links: usize,
    pub pending_requests: usize,
    pub pending_destroy: usize,
    pub generation: u64,
    pub sweep_active: bool,
}

/// The configuration graph store.
pub struct Database {
    config: StoreConfig,
    /// Node tables keyed by id type
    node_tables: DashMap<String, Arc<PartitionedTable<Node>>>,
    link_table: Arc<PartitionedTable<Link>>,
    graph: Mutex<PropertyGraph>,
    deferred: Mutex<DeferredLinkResolver>,
    lifetime: LifetimeManager,
    sweeper: GenerationSweeper,
    generation: AtomicU64,
    listeners: DashMap<ListenerId, ListenerTarget>,
    /// Pre-filters keyed by id type
    filters: DashMap<String, PreFilter>,
}

impl Database {
    /// Create an empty store.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let partitions = config.store.partitions;
        if partitions == 0 || partitions > MAX_PARTITIONS {
            return Err(StoreError::InvalidPartitionCount {
                count: partitions,
                max: MAX_PARTITIONS,
            });
        }
        config.validate()?;

        info!(partitions, "Creating configuration store");
        Ok(Self {
            config: config.clone(),
            node_tables: DashMap::new(),
            link_table: Arc::new(PartitionedTable::new(LINK_TABLE_NAME, partitions)),
            graph: Mutex::new(PropertyGraph::new()),
            deferred: Mutex::new(DeferredLinkResolver::new()),
            lifetime: LifetimeManager::new(),
            sweeper: GenerationSweeper::new(config.sweep.batch_size),
            generation: AtomicU64::new(0),
            listeners: DashMap::new(),
            filters: DashMap::new(),
        })
    }

    /// Load the configuration of the deployment under `root` (global file,
    /// then `root/.cfgmap/config.toml`, then `overrides`) and create a
    /// store from it.
    pub fn open(root: &Path, overrides: Option<&ConfigOverrides>) -> Result<Self, StoreError> {
        Self::open_with(&ConfigLoader::new(), root, overrides)
    }

    /// [`open`](Self::open) with an explicit loader.
    pub fn open_with(
        loader: &ConfigLoader,
        root: &Path,
        overrides: Option<&ConfigOverrides>,
    ) -> Result<Self, StoreError> {
        let config = loader.load(root, overrides)?;
        Self::new(&config)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------------

    /// Create the table for nodes of `id_type`.
    pub fn create_node_table(&self, id_type: &str) -> Result<Arc<PartitionedTable<Node>>, StoreError> {
        match self.node_tables.entry(id_type.to_string()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateTable(table_name(id_type))),
            Entry::Vacant(slot) => {
                let table = Arc::new(PartitionedTable::new(
                    table_name(id_type),
                    self.config.store.partitions,
                ));
                slot.insert(table.clone());
                debug!(table = %table.name(), "Node table created");
                Ok(table)
            }
        }
    }

    /// The table for `id_type`, created if missing.
    pub fn ensure_node_table(&self, id_type: &str) -> Arc<PartitionedTable<Node>> {
        if let Some(table) = self.node_table(id_type) {
            return table;
        }
        self.node_tables
            .entry(id_type.to_string())
            .or_insert_with(|| {
                debug!(table = %table_name(id_type), "Node table created on demand");
                Arc::new(PartitionedTable::new(
                    table_name(id_type),
                    self.config.store.partitions,
                ))
            })
            .value()
            .clone()
    }

    pub fn node_table(&self, id_type: &str) -> Option<Arc<PartitionedTable<Node>>> {
        self.node_tables.get(id_type).map(|t| t.value().clone())
    }

    /// All node tables in table-name order.
    pub fn node_tables(&self) -> Vec<Arc<PartitionedTable<Node>>> {
        let mut tables: Vec<_> = self
            .node_tables
            .iter()
            .map(|t| t.value().clone())
            .collect();
        tables.sort_by(|a, b| a.name().cmp(b.name()));
        tables
    }

    /// Install the pre-filter for `id_type`, replacing any previous one.
    pub fn set_pre_filter(
        &self,
        id_type: &str,
        filter: impl Fn(Option<&Node>, &mut NodeRequest) -> bool + Send + Sync + 'static,
    ) -> Result<(), StoreError> {
        if self.node_table(id_type).is_none() {
            return Err(StoreError::TableNotFound(table_name(id_type)));
        }
        self.filters.insert(id_type.to_string(), Arc::new(filter));
        debug!(table = %table_name(id_type), "Pre-filter installed");
        Ok(())
    }

    pub fn clear_pre_filter(&self, id_type: &str) -> bool {
        self.filters.remove(id_type).is_some()
    }

    pub fn link_table(&self) -> &Arc<PartitionedTable<Link>> {
        &self.link_table
    }

    pub fn lifetime_manager(&self) -> &LifetimeManager {
        &self.lifetime
    }

    pub fn walker(&self) -> TableWalker {
        TableWalker::new(self.config.store.walk_batch_size)
    }

    /// Run `f` against the graph under its lock. `f` must not call back
    /// into the database.
    pub fn with_graph<R>(&self, f: impl FnOnce(&PropertyGraph) -> R) -> R {
        f(&self.graph.lock())
    }

    /// Allocate a graph walk id.
    pub fn graph_walk_number(&self) -> u64 {
        self.graph.lock().get_walk_number()
    }

    // ------------------------------------------------------------------------
    // Requests and scheduling
    // ------------------------------------------------------------------------

    /// Queue a request on the partition owning its key.
    ///
    /// A node request for an unknown table is traced and dropped.
    pub fn enqueue(&self, request: impl Into<Request>) {
        match request.into() {
            Request::Node(req) => match self.node_table(&req.key.id_type) {
                Some(table) => {
                    let key = req.key.id_name.clone();
                    table.enqueue(&key, req);
                }
                None => trace!(
                    seq = req.key.sequence_number,
                    id_type = %req.key.id_type,
                    "Table not found, request dropped"
                ),
            },
            Request::Link(req) => {
                let key = req.key.link_key();
                self.link_table.enqueue(&key, req);
            }
        }
    }

    /// Run every task class until none has work. Returns the number of
    /// requests applied.
    pub fn run_until_idle(&self) -> usize {
        let mut applied = 0;
        loop {
            let inputs = self.process_requests();
            if inputs > 0 {
                applied += inputs;
                continue;
            }
            if self.notify_all() > 0 {
                continue;
            }
            if self.lifetime.run() > 0 {
                continue;
            }
            if self.sweeper.is_active() {
                self.sweeper.run_batch(self);
                continue;
            }
            break;
        }
        applied
    }

    fn process_requests(&self) -> usize {
        let mut processed = 0;
        for table in self.node_tables() {
            for partition in 0..table.partition_count() {
                while let Some(req) = table.dequeue(partition) {
                    self.input_node(&table, req);
                    processed += 1;
                }
            }
        }
        for partition in 0..self.link_table.partition_count() {
            while let Some(req) = self.link_table.dequeue(partition) {
                self.input_link(req);
                processed += 1;
            }
        }
        processed
    }

    fn notify_all(&self) -> usize {
        let nodes: usize = self.node_tables().iter().map(|t| t.notify()).sum();
        nodes + self.link_table.notify()
    }

    // ------------------------------------------------------------------------
    // Node input
    // ------------------------------------------------------------------------

    fn input_node(&self, table: &Arc<PartitionedTable<Node>>, mut req: NodeRequest) {
        if !self.pre_filter(table, &mut req) {
            return;
        }
        let key = req.key.node_key();
        let seq = req.key.sequence_number;
        match req.operation {
            Operation::Delete => self.input_node_delete(table, &key, seq, req.origin),
            Operation::AddOrChange => {
                self.upsert_node(table, &key, seq, req.data.unwrap_or_default());
            }
            Operation::Notify => match table.find(&key.id_name) {
                Some(entry) => {
                    table.change(entry);
                    trace!(seq, node = %key, "Node re-notified");
                }
                None => trace!(seq, node = %key, "Node not found in notify"),
            },
        }
    }

    /// Run the table's pre-filter, if any. False means drop the request.
    fn pre_filter(&self, table: &PartitionedTable<Node>, req: &mut NodeRequest) -> bool {
        let Some(filter) = self
            .filters
            .get(&req.key.id_type)
            .map(|f| f.value().clone())
        else {
            return true;
        };
        let current = table.find(&req.key.id_name).and_then(|entry| table.get(entry));
        let key = req.key.clone();
        let before = req.operation;

        if !filter(current.as_ref(), req) {
            trace!(seq = key.sequence_number, node = %key.node_key(), "Request suppressed by filter");
            return false;
        }
        // The partition was chosen from the original key.
        req.key = key;
        if before != Operation::Delete && req.operation == Operation::Delete {
            debug!(
                seq = req.key.sequence_number,
                node = %req.key.node_key(),
                "Filter turned request into delete"
            );
        }
        true
    }

    fn input_node_delete(
        &self,
        table: &Arc<PartitionedTable<Node>>,
        key: &NodeKey,
        seq: u64,
        origin: Option<Origin>,
    ) {
        let Some(entry) = table.find_any(&key.id_name) else {
            trace!(seq, node = %key, "Node not found in delete");
            return;
        };
        let Some((deleted, current)) =
            table.read(entry, |n| (n.is_deleted(), n.sequence_number()))
        else {
            return;
        };
        if deleted {
            trace!(seq, node = %key, "Node already deleted");
            return;
        }
        if seq < current {
            trace!(seq, current, node = %key, "Stale delete ignored");
            return;
        }

        match origin {
            Some(origin) => {
                let removed = table
                    .update(entry, |n| n.remove(origin).is_some())
                    .unwrap_or(false);
                if removed {
                    trace!(seq, node = %key, origin = origin.as_str(), "Property set removed");
                    table.change(entry);
                    self.delete_if_empty(key);
                }
            }
            None => {
                table.update(entry, |n| n.set_sequence_number(seq));
                self.delete_node(table, key, entry);
            }
        }
    }

    /// Create or refresh a node and re-evaluate links waiting on it.
    fn upsert_node(
        &self,
        table: &Arc<PartitionedTable<Node>>,
        key: &NodeKey,
        seq: u64,
        data: NodeData,
    ) -> Option<EntryRef> {
        let entry = match table.find_any(&key.id_name) {
            Some(entry) => {
                let (deleted, current) =
                    table.read(entry, |n| (n.is_deleted(), n.sequence_number()))?;
                if seq < current {
                    trace!(seq, current, node = %key, "Stale update ignored");
                    return None;
                }
                if deleted {
                    table.clear_delete(entry);
                    self.graph.lock().add_node(key.clone(), entry);
                    debug!(seq, node = %key, "Node resurrected");
                }
                entry
            }
            None => {
                let entry = table.add(Node::new(key.clone()))?;
                self.graph.lock().add_node(key.clone(), entry);
                trace!(seq, node = %key, "Node added");
                entry
            }
        };

        table.update(entry, |n| {
            n.insert(PropertySet {
                origin: data.origin,
                sequence_number: seq,
                properties: data.properties,
            });
            n.set_sequence_number(seq);
        });
        table.change(entry);
        self.eval_deferred(key, seq);
        Some(entry)
    }

    fn eval_deferred(&self, key: &NodeKey, seq: u64) {
        let ready = self
            .deferred
            .lock()
            .eval(key, seq, |other| self.live_sequence(other));
        for req in ready {
            trace!(seq, link = %req.key.link_key(), "Deferred link ready");
            self.enqueue(req);
        }
    }

    /// Current sequence number of a live node.
    fn live_sequence(&self, key: &NodeKey) -> Option<u64> {
        let table = self.node_table(&key.id_type)?;
        let entry = table.find(&key.id_name)?;
        table.read(entry, Node::sequence_number)
    }

    /// Remove a node, moving each of its links to the deferred map first so
    /// they return if the node is re-created.
    fn delete_node(&self, table: &PartitionedTable<Node>, key: &NodeKey, entry: EntryRef) {
        let edges: Vec<EntryRef> = self
            .graph
            .lock()
            .edges(key)
            .into_iter()
            .map(|(edge, _)| edge.link)
            .collect();

        for link_ref in edges {
            let Some(link) = self.link_table.get(link_ref) else {
                continue;
            };
            let seq = link.max_sequence_number();
            let parked = LinkRequestKey {
                left: NodeRequestKey::new(&link.left().id_type, &link.left().id_name, seq),
                right: NodeRequestKey::new(&link.right().id_type, &link.right().id_name, seq),
                relation: link.relation().to_string(),
            };
            self.deferred.lock().park(
                &parked,
                None,
                link.origins().iter().map(|(&origin, &seq)| (origin, seq)),
            );
            self.remove_link(link_ref, Some(key));
        }

        // A re-created node starts from its new property sets only.
        table.update(entry, |n| n.clear_property_sets());
        self.graph.lock().remove_node(key);
        table.delete(entry);
        debug!(node = %key, "Node deleted");
    }

    /// Remove a live node that has no property sets and no edges.
    fn delete_if_empty(&self, key: &NodeKey) -> bool {
        let Some(table) = self.node_table(&key.id_type) else {
            return false;
        };
        let Some(entry) = table.find(&key.id_name) else {
            return false;
        };
        if !table.read(entry, Node::is_empty).unwrap_or(false) {
            return false;
        }
        let adjacent = {
            let graph = self.graph.lock();
            graph
                .vertex_of(key)
                .is_some_and(|v| graph.has_adjacencies(v))
        };
        if adjacent {
            return false;
        }
        debug!(node = %key, "Removing empty node");
        self.graph.lock().remove_node(key);
        table.delete(entry);
        true
    }

    fn change_node(&self, key: &NodeKey) {
        if let Some(table) = self.node_table(&key.id_type) {
            if let Some(entry) = table.find(&key.id_name) {
                table.change(entry);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Link input
    // ------------------------------------------------------------------------

    /// Why `side` cannot be used as a link endpoint right now.
    fn unresolved(&self, side: &NodeRequestKey) -> Option<&'static str> {
        let Some(table) = self.node_table(&side.id_type) else {
            return Some("table not found");
        };
        let Some(entry) = table.find_any(&side.id_name) else {
            return Some("endpoint not present");
        };
        match table.read(entry, |n| (n.is_deleted(), n.sequence_number())) {
            None => Some("endpoint not present"),
            Some((true, _)) => Some("endpoint delete-marked"),
            Some((false, seq)) if seq < side.sequence_number => Some("endpoint generation behind"),
            Some(_) => None,
        }
    }

    fn input_link(&self, req: LinkRequest) {
        let name = req.key.link_key();
        let seq = req.key.sequence_number();
        let left = req.key.left.node_key();
        let right = req.key.right.node_key();

        if req.operation == Operation::Notify {
            self.notify_link(&req.key.relation, &left, &right);
            return;
        }

        let blocked = self
            .unresolved(&req.key.left)
            .or_else(|| self.unresolved(&req.key.right));
        if let Some(reason) = blocked {
            self.deferred.lock().defer(&req);
            if req.operation == Operation::Delete {
                trace!(seq, link = %name, reason, "Link delete with unresolved endpoint");
                // Legs through an attribute node are parked and live under
                // their own keys.
                self.delete_attr_link(&req.key.relation, &left, &right, req.origin);
            } else {
                trace!(seq, link = %name, reason, "Link deferred");
            }
            return;
        }
        if self.deferred.lock().remove(&name).is_some() {
            trace!(seq, link = %name, "Deferred link superseded");
        }

        match req.operation {
            Operation::AddOrChange => {
                let data = req.data.unwrap_or_default();
                match data.attr {
                    Some(attr) => {
                        self.add_attr_link(&req.key, &left, &right, data.origin, seq, attr);
                    }
                    None => {
                        self.add_link(&req.key.relation, &left, &right, data.origin, seq);
                    }
                }
            }
            Operation::Delete => {
                if !self.delete_attr_link(&req.key.relation, &left, &right, req.origin) {
                    self.delete_link(&name, req.origin);
                }
            }
            Operation::Notify => {}
        }
    }

    /// Re-announce a link, or the attribute node standing for it.
    fn notify_link(&self, relation: &str, left: &NodeKey, right: &NodeKey) {
        let name = link_key(relation, left, right);
        if let Some(link_ref) = self.link_table.find(&name) {
            self.link_table.change(link_ref);
            trace!(link = %name, "Link re-notified");
            return;
        }
        let attr_key = Self::attr_node_key(relation, left, right);
        match self
            .node_table(relation)
            .and_then(|table| table.find(&attr_key.id_name).map(|entry| (table, entry)))
        {
            Some((table, entry)) => {
                table.change(entry);
                trace!(link = %name, node = %attr_key, "Link attribute re-notified");
            }
            None => trace!(link = %name, "Link not found in notify"),
        }
    }

    fn add_link(
        &self,
        relation: &str,
        left: &NodeKey,
        right: &NodeKey,
        origin: Origin,
        seq: u64,
    ) -> Option<EntryRef> {
        let name = link_key(relation, left, right);
        let link_ref = match self.link_table.find(&name) {
            Some(link_ref) => {
                let current = self
                    .link_table
                    .read(link_ref, |l| l.sequence_number(origin))
                    .flatten();
                if current.is_some_and(|current| seq < current) {
                    trace!(seq, link = %name, "Stale link update ignored");
                    return None;
                }
                self.link_table
                    .update(link_ref, |l| l.update_origin(origin, seq));
                link_ref
            }
            None => {
                let mut link = Link::new(relation, left.clone(), right.clone());
                link.update_origin(origin, seq);
                let link_ref = self.link_table.add(link)?;
                if self
                    .graph
                    .lock()
                    .link(left, right, &name, link_ref)
                    .is_none()
                {
                    warn!(link = %name, "Link endpoints have no vertex");
                }
                trace!(seq, link = %name, "Link added");
                link_ref
            }
        };
        self.link_table.change(link_ref);
        self.change_node(left);
        self.change_node(right);
        Some(link_ref)
    }

    fn delete_link(&self, name: &str, origin: Option<Origin>) {
        let Some(link_ref) = self.link_table.find(name) else {
            trace!(link = %name, "Link not found in delete");
            return;
        };
        if let Some(origin) = origin {
            let empty = self
                .link_table
                .update(link_ref, |l| {
                    l.remove_origin(origin);
                    l.is_empty()
                })
                .unwrap_or(false);
            if !empty {
                self.link_table.change(link_ref);
                return;
            }
        }
        self.remove_link(link_ref, None);
    }

    /// Unlink and delete a link entry. Endpoints other than `except` are
    /// notified and collected if left empty.
    fn remove_link(&self, link_ref: EntryRef, except: Option<&NodeKey>) -> bool {
        let Some(link) = self.link_table.get(link_ref) else {
            return false;
        };
        self.graph
            .lock()
            .unlink(link.left(), link.right(), link.name());
        self.link_table.delete(link_ref);
        trace!(link = %link.name(), "Link removed");

        for endpoint in [link.left(), link.right()] {
            if Some(endpoint) == except {
                continue;
            }
            self.change_node(endpoint);
            self.delete_if_empty(endpoint);
        }
        true
    }

    fn attr_node_key(relation: &str, left: &NodeKey, right: &NodeKey) -> NodeKey {
        NodeKey::new(relation, link_attr_key(left, right))
    }

    /// Route a relation carrying data through a link-attribute node linked
    /// to both endpoints.
    fn add_attr_link(
        &self,
        key: &LinkRequestKey,
        left: &NodeKey,
        right: &NodeKey,
        origin: Origin,
        seq: u64,
        attr: Properties,
    ) {
        let attr_key = Self::attr_node_key(&key.relation, left, right);
        let table = self.ensure_node_table(&key.relation);
        let data = NodeData {
            origin,
            properties: attr,
        };
        if self.upsert_node(&table, &attr_key, seq, data).is_none() {
            return;
        }
        self.add_link(&key.relation, left, &attr_key, origin, seq);
        self.add_link(&key.relation, &attr_key, right, origin, seq);
    }

    /// Remove both legs and the link-attribute node, if one exists.
    ///
    /// Legs parked in the deferred map are cancelled too. Returns true if
    /// a live attribute node was found.
    fn delete_attr_link(
        &self,
        relation: &str,
        left: &NodeKey,
        right: &NodeKey,
        origin: Option<Origin>,
    ) -> bool {
        let attr_key = Self::attr_node_key(relation, left, right);
        let legs = [
            link_key(relation, left, &attr_key),
            link_key(relation, &attr_key, right),
        ];
        {
            let mut deferred = self.deferred.lock();
            for leg in &legs {
                deferred.cancel(leg, origin);
            }
        }

        let Some(table) = self.node_table(relation) else {
            return false;
        };
        if table.find(&attr_key.id_name).is_none() {
            return false;
        }
        for leg in &legs {
            self.delete_link(leg, origin);
        }

        if let Some(entry) = table.find(&attr_key.id_name) {
            let adjacent = {
                let graph = self.graph.lock();
                graph
                    .vertex_of(&attr_key)
                    .is_some_and(|v| graph.has_adjacencies(v))
            };
            if !adjacent {
                self.delete_node(&table, &attr_key, entry);
            }
        }
        true
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    /// Snapshot of a live node.
    pub fn find_node(&self, key: &NodeKey) -> Option<Node> {
        let table = self.node_table(&key.id_type)?;
        let entry = table.find(&key.id_name)?;
        table.get(entry)
    }

    pub fn node(&self, id_type: &str, id_name: &str) -> Option<Node> {
        self.find_node(&NodeKey::new(id_type, id_name))
    }

    /// Snapshot of a live link.
    pub fn link(&self, relation: &str, a: &NodeKey, b: &NodeKey) -> Option<Link> {
        let entry = self.link_table.find(&link_key(relation, a, b))?;
        self.link_table.get(entry)
    }

    /// Adjacent node keys, in edge-name order.
    pub fn neighbors(&self, key: &NodeKey) -> Vec<NodeKey> {
        self.graph.lock().neighbors(key)
    }

    /// First link between `a` and `b` in name order.
    pub fn edge_between(&self, a: &NodeKey, b: &NodeKey) -> Option<Link> {
        let link_ref = self.graph.lock().get_edge(a, b)?.link;
        self.link_table.get(link_ref)
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    pub fn is_deferred(&self, link_key: &str) -> bool {
        self.deferred.lock().contains(link_key)
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    pub fn register_node_listener(
        &self,
        id_type: &str,
        listener: impl Fn(PartitionId, &Node) + Send + Sync + 'static,
    ) -> Result<ListenerId, StoreError> {
        let table = self
            .node_table(id_type)
            .ok_or_else(|| StoreError::TableNotFound(table_name(id_type)))?;
        let id = table.register(Arc::new(listener));
        self.listeners
            .insert(id, ListenerTarget::Node(id_type.to_string()));
        Ok(id)
    }

    pub fn register_link_listener(
        &self,
        listener: impl Fn(PartitionId, &Link) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.link_table.register(Arc::new(listener));
        self.listeners.insert(id, ListenerTarget::Link);
        id
    }

    pub fn unregister(&self, id: ListenerId) -> Result<(), StoreError> {
        let (_, target) = self
            .listeners
            .remove(&id)
            .ok_or(StoreError::ListenerNotFound(id.0))?;
        match target {
            ListenerTarget::Node(id_type) => self
                .node_table(&id_type)
                .ok_or_else(|| StoreError::TableNotFound(table_name(&id_type)))?
                .unregister(id),
            ListenerTarget::Link => self.link_table.unregister(id),
        }
    }

    // ------------------------------------------------------------------------
    // Generations
    // ------------------------------------------------------------------------

    /// Record the sequence number of a new reconnect epoch. Generations
    /// never go backwards; a lower value is ignored.
    pub fn advance_epoch(&self, seq: u64) -> u64 {
        let previous = self.generation.fetch_max(seq, Ordering::AcqRel);
        if seq < previous {
            warn!(seq, current = previous, "Epoch moved backwards, ignored");
            return previous;
        }
        info!(seq, "Epoch advanced");
        seq
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Schedule a sweep of objects not refreshed since `watermark`. The
    /// sweep runs in batches from [`run_until_idle`](Self::run_until_idle).
    pub fn sweep_stale(&self, watermark: u64) {
        self.sweeper.start(watermark);
    }

    pub fn last_sweep(&self) -> Option<SweepStats> {
        self.sweeper.last_completed()
    }

    /// Drop link origins older than `watermark`, removing the link once no
    /// origin remains. Returns (origins removed, link removed).
    pub(crate) fn sweep_link(&self, name: &str, watermark: u64) -> (usize, bool) {
        let Some(link_ref) = self.link_table.find(name) else {
            return (0, false);
        };
        let Some((removed, empty)) = self.link_table.update(link_ref, |l| {
            let removed = l.remove_stale_origins(watermark);
            (removed, l.is_empty())
        }) else {
            return (0, false);
        };
        if removed == 0 {
            return (0, false);
        }
        if empty {
            trace!(link = %name, watermark, "Deleting stale link");
            self.remove_link(link_ref, None);
            (removed, true)
        } else {
            self.link_table.change(link_ref);
            (removed, false)
        }
    }

    /// Delete the node `name` if its generation is older than `watermark`.
    pub(crate) fn sweep_node(
        &self,
        table: &PartitionedTable<Node>,
        name: &str,
        watermark: u64,
    ) -> bool {
        let Some(entry) = table.find(name) else {
            return false;
        };
        let Some((key, seq)) =
            table.read(entry, |n| (n.node_key().clone(), n.sequence_number()))
        else {
            return false;
        };
        if seq >= watermark {
            return false;
        }
        trace!(node = %key, seq, watermark, "Deleting stale node");
        self.delete_node(table, &key, entry);
        true
    }

    pub(crate) fn purge_deferred(&self, watermark: u64) -> usize {
        self.deferred.lock().purge_stale(watermark)
    }

    // ------------------------------------------------------------------------
    // Teardown and stats
    // ------------------------------------------------------------------------

    /// Remove every link, node and deferred record, then notify.
    /// Returns the number of entries removed.
    pub fn clear(&self) -> usize {
        let walker = self.walker();
        let mut removed = 0;

        let mut links = Vec::new();
        walker.walk(&self.link_table, |entry, _| links.push(entry));
        for link_ref in links {
            if self.remove_link(link_ref, None) {
                removed += 1;
            }
        }

        for table in self.node_tables() {
            let mut nodes = Vec::new();
            walker.walk(&table, |entry, node| nodes.push((entry, node.node_key().clone())));
            for (entry, key) in nodes {
                if table.read(entry, |n| n.is_deleted()) == Some(false) {
                    self.delete_node(&table, &key, entry);
                    removed += 1;
                }
            }
        }

        self.deferred.lock().destroy();
        self.notify_all();
        info!(removed, "Store cleared");
        removed
    }

    pub fn stats(&self) -> DatabaseStats {
        let tables = self.node_tables();
        let (vertices, edges) = {
            let graph = self.graph.lock();
            (graph.node_count(), graph.edge_count())
        };
        DatabaseStats {
            node_tables: tables.len(),
            nodes: tables.iter().map(|t| t.len()).sum(),
            links: self.link_table.len(),
            vertices,
            edges,
            deferred_links: self.deferred_count(),
            pending_requests: tables.iter().map(|t| t.pending_requests()).sum::<usize>()
                + self.link_table.pending_requests(),
            pending_destroy: self.lifetime.pending(),
            generation: self.generation(),
            sweep_active: self.sweeper.is_active(),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("partitions", &self.config.store.partitions)
            .field("node_tables", &self.node_tables.len())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> Database {
        let db = Database::new(&StoreConfig::default()).unwrap();
        for id_type in ["foo", "bar"] {
            db.create_node_table(id_type).unwrap();
        }
        db
    }

    fn foo() -> NodeKey {
        NodeKey::new("foo", "testfoo")
    }

    fn bar() -> NodeKey {
        NodeKey::new("bar", "testbar")
    }

    #[test]
    fn test_rejects_bad_partition_count() {
        let mut config = StoreConfig::default();
        config.store.partitions = 0;
        assert!(matches!(
            Database::new(&config),
            Err(StoreError::InvalidPartitionCount { count: 0, .. })
        ));
    }

    #[test]
    fn test_duplicate_table() {
        let db = db();
        let err = db.create_node_table("foo").unwrap_err();
        assert!(matches!(err, StoreError::DuplicateTable(name) if name == "__ifmap__.foo.0"));
    }

    #[test]
    fn test_request_for_unknown_table_dropped() {
        let db = db();
        db.enqueue(NodeRequest::add("nope", "x", 1));
        assert_eq!(db.run_until_idle(), 0);
        assert!(db.node_table("nope").is_none());
    }

    #[test]
    fn test_add_node_with_properties() {
        let db = db();
        db.enqueue(NodeRequest::add("foo", "testfoo", 1).with_property("mtu", json!(1500)));
        assert_eq!(db.run_until_idle(), 1);

        let node = db.find_node(&foo()).unwrap();
        assert_eq!(node.sequence_number(), 1);
        assert_eq!(node.property("mtu"), Some(&json!(1500)));
        assert!(db.with_graph(|g| g.contains_node(&foo())));
    }

    #[test]
    fn test_stale_node_update_ignored() {
        let db = db();
        db.enqueue(NodeRequest::add("foo", "testfoo", 5).with_property("v", json!("new")));
        db.enqueue(NodeRequest::add("foo", "testfoo", 3).with_property("v", json!("old")));
        db.run_until_idle();
        let node = db.find_node(&foo()).unwrap();
        assert_eq!(node.property("v"), Some(&json!("new")));
        assert_eq!(node.sequence_number(), 5);
    }

    #[test]
    fn test_link_between_existing_nodes() {
        let db = db();
        db.enqueue(NodeRequest::add("foo", "testfoo", 1));
        db.enqueue(NodeRequest::add("bar", "testbar", 1));
        db.enqueue(LinkRequest::add(("foo", "testfoo"), ("bar", "testbar"), "foo-bar", 1));
        db.run_until_idle();

        assert_eq!(db.neighbors(&foo()), vec![bar()]);
        let link = db.edge_between(&bar(), &foo()).unwrap();
        assert_eq!(link.relation(), "foo-bar");
        assert_eq!(db.deferred_count(), 0);
    }

    #[test]
    fn test_repeated_link_add_is_idempotent() {
        let db = db();
        db.enqueue(NodeRequest::add("foo", "testfoo", 1));
        db.enqueue(NodeRequest::add("bar", "testbar", 1));
        for _ in 0..3 {
            db.enqueue(LinkRequest::add(("bar", "testbar"), ("foo", "testfoo"), "foo-bar", 1));
        }
        db.run_until_idle();
        assert_eq!(db.stats().links, 1);
        assert_eq!(db.stats().edges, 1);
    }

    #[test]
    fn test_node_delete_defers_links() {
        let db = db();
        db.enqueue(NodeRequest::add("foo", "testfoo", 1));
        db.enqueue(NodeRequest::add("bar", "testbar", 1));
        db.enqueue(LinkRequest::add(("foo", "testfoo"), ("bar", "testbar"), "foo-bar", 1));
        db.run_until_idle();

        db.enqueue(NodeRequest::delete("foo", "testfoo", 1));
        db.run_until_idle();
        assert!(db.find_node(&foo()).is_none());
        assert!(db.neighbors(&bar()).is_empty());
        assert_eq!(db.deferred_count(), 1);

        db.enqueue(NodeRequest::add("foo", "testfoo", 1));
        db.run_until_idle();
        assert_eq!(db.neighbors(&bar()), vec![foo()]);
        assert_eq!(db.deferred_count(), 0);
    }

    #[test]
    fn test_link_delete_with_missing_endpoint_cancels_deferred() {
        let db = db();
        db.enqueue(LinkRequest::add(("foo", "testfoo"), ("bar", "testbar"), "foo-bar", 1));
        db.run_until_idle();
        assert_eq!(db.deferred_count(), 1);

        db.enqueue(LinkRequest::delete(("foo", "testfoo"), ("bar", "testbar"), "foo-bar", 1));
        db.run_until_idle();
        assert_eq!(db.deferred_count(), 0);
    }

    #[test]
    fn test_origin_scoped_delete_collects_empty_node() {
        let db = db();
        db.enqueue(NodeRequest::add("foo", "testfoo", 1).with_origin(Origin::Xmpp));
        db.run_until_idle();
        assert!(db.find_node(&foo()).is_some());

        db.enqueue(NodeRequest::delete("foo", "testfoo", 1).with_origin(Origin::Xmpp));
        db.run_until_idle();
        assert!(db.find_node(&foo()).is_none());
        assert!(!db.with_graph(|g| g.contains_node(&foo())));
    }

    #[test]
    fn test_origin_scoped_delete_keeps_other_origins() {
        let db = db();
        db.enqueue(NodeRequest::add("foo", "testfoo", 1).with_origin(Origin::Xmpp));
        db.enqueue(NodeRequest::add("foo", "testfoo", 1).with_origin(Origin::MapServer));
        db.enqueue(NodeRequest::delete("foo", "testfoo", 1).with_origin(Origin::Xmpp));
        db.run_until_idle();

        let node = db.find_node(&foo()).unwrap();
        assert_eq!(node.property_sets().len(), 1);
        assert!(node.find(Origin::MapServer).is_some());
    }

    #[test]
    fn test_link_origins_keep_link_alive() {
        let db = db();
        db.enqueue(NodeRequest::add("foo", "testfoo", 1));
        db.enqueue(NodeRequest::add("bar", "testbar", 1));
        let add = |origin| {
            LinkRequest::add(("foo", "testfoo"), ("bar", "testbar"), "foo-bar", 1).with_origin(origin)
        };
        db.enqueue(add(Origin::MapServer));
        db.enqueue(add(Origin::Xmpp));
        db.enqueue(
            LinkRequest::delete(("foo", "testfoo"), ("bar", "testbar"), "foo-bar", 1)
                .with_origin(Origin::Xmpp),
        );
        db.run_until_idle();

        let link = db.link("foo-bar", &foo(), &bar()).unwrap();
        assert_eq!(link.origins().len(), 1);

        db.enqueue(
            LinkRequest::delete(("foo", "testfoo"), ("bar", "testbar"), "foo-bar", 1)
                .with_origin(Origin::MapServer),
        );
        db.run_until_idle();
        assert!(db.link("foo-bar", &foo(), &bar()).is_none());
        assert!(db.edge_between(&foo(), &bar()).is_none());
    }

    #[test]
    fn test_attr_link_creates_attribute_node() {
        let db = db();
        db.enqueue(NodeRequest::add("foo", "testfoo", 1));
        db.enqueue(NodeRequest::add("bar", "testbar", 1));
        let mut attr = Properties::new();
        attr.insert("weight".to_string(), json!(10));
        db.enqueue(
            LinkRequest::add(("foo", "testfoo"), ("bar", "testbar"), "foo-bar-attr", 1)
                .with_attr(attr),
        );
        db.run_until_idle();

        let attr_key = NodeKey::new("foo-bar-attr", link_attr_key(&foo(), &bar()));
        let attr_node = db.find_node(&attr_key).unwrap();
        assert_eq!(attr_node.property("weight"), Some(&json!(10)));
        assert_eq!(db.neighbors(&attr_key).len(), 2);
        assert_eq!(db.neighbors(&foo()), vec![attr_key.clone()]);

        db.enqueue(LinkRequest::delete(
            ("bar", "testbar"),
            ("foo", "testfoo"),
            "foo-bar-attr",
            1,
        ));
        db.run_until_idle();
        assert!(db.find_node(&attr_key).is_none());
        assert!(db.neighbors(&foo()).is_empty());
        assert_eq!(db.stats().links, 0);
    }

    #[test]
    fn test_listener_sees_endpoint_changes() {
        let db = db();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        db.register_node_listener("foo", move |_, node: &Node| {
            sink.lock().push(node.name().to_string());
        })
        .unwrap();

        db.enqueue(NodeRequest::add("foo", "testfoo", 1));
        db.enqueue(NodeRequest::add("bar", "testbar", 1));
        db.run_until_idle();
        assert_eq!(seen.lock().len(), 1);

        db.enqueue(LinkRequest::add(("foo", "testfoo"), ("bar", "testbar"), "foo-bar", 1));
        db.run_until_idle();
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_register_listener_unknown_table() {
        let db = db();
        let err = db.register_node_listener("nope", |_, _: &Node| {}).unwrap_err();
        assert!(matches!(err, StoreError::TableNotFound(_)));
    }

    #[test]
    fn test_unregister_listener() {
        let db = db();
        let id = db.register_link_listener(|_, _: &Link| {});
        db.unregister(id).unwrap();
        assert!(matches!(db.unregister(id), Err(StoreError::ListenerNotFound(_))));
    }

    #[test]
    fn test_advance_epoch_is_monotonic() {
        let db = db();
        assert_eq!(db.advance_epoch(3), 3);
        assert_eq!(db.advance_epoch(2), 3);
        assert_eq!(db.generation(), 3);
    }

    #[test]
    fn test_recreated_node_drops_old_property_sets() {
        let db = db();
        db.enqueue(
            NodeRequest::add("foo", "testfoo", 1)
                .with_origin(Origin::MapServer)
                .with_property("mtu", json!(9000)),
        );
        db.run_until_idle();

        // Delete and re-create before the deleted entry is released
        db.enqueue(NodeRequest::delete("foo", "testfoo", 2));
        db.enqueue(NodeRequest::add("foo", "testfoo", 2).with_origin(Origin::Xmpp));
        db.run_until_idle();

        let node = db.find_node(&foo()).unwrap();
        assert_eq!(node.property("mtu"), None);
        let origins: Vec<_> = node.property_sets().iter().map(|p| p.origin).collect();
        assert_eq!(origins, vec![Origin::Xmpp]);
    }

    #[test]
    fn test_notify_re_announces_unchanged_node() {
        let db = db();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        db.register_node_listener("foo", move |_, node: &Node| {
            sink.lock().push(node.sequence_number());
        })
        .unwrap();

        db.enqueue(NodeRequest::add("foo", "testfoo", 1).with_property("mtu", json!(1500)));
        db.run_until_idle();
        db.enqueue(NodeRequest::notify("foo", "testfoo", 9));
        db.run_until_idle();

        assert_eq!(*seen.lock(), vec![1, 1]);
        let node = db.find_node(&foo()).unwrap();
        assert_eq!(node.sequence_number(), 1);
        assert_eq!(node.property("mtu"), Some(&json!(1500)));

        db.enqueue(NodeRequest::notify("foo", "missing", 1));
        db.run_until_idle();
        assert_eq!(seen.lock().len(), 2);
        assert!(db.node("foo", "missing").is_none());
    }

    #[test]
    fn test_notify_re_announces_link() {
        let db = db();
        db.enqueue(NodeRequest::add("foo", "testfoo", 1));
        db.enqueue(NodeRequest::add("bar", "testbar", 1));
        db.enqueue(LinkRequest::add(("foo", "testfoo"), ("bar", "testbar"), "foo-bar", 1));
        db.run_until_idle();

        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        db.register_link_listener(move |_, _: &Link| *sink.lock() += 1);

        db.enqueue(LinkRequest::notify(("bar", "testbar"), ("foo", "testfoo"), "foo-bar", 1));
        db.run_until_idle();
        assert_eq!(*seen.lock(), 1);

        // Unresolvable endpoints: nothing announced, nothing parked
        db.enqueue(LinkRequest::notify(("foo", "x"), ("bar", "y"), "foo-bar", 1));
        db.run_until_idle();
        assert_eq!(*seen.lock(), 1);
        assert_eq!(db.deferred_count(), 0);
    }

    #[test]
    fn test_pre_filter_drops_request() {
        let db = db();
        db.set_pre_filter("foo", |_, req: &mut NodeRequest| {
            req.data
                .as_ref()
                .map_or(true, |data| !data.properties.contains_key("skip"))
        })
        .unwrap();

        db.enqueue(NodeRequest::add("foo", "testfoo", 1).with_property("skip", json!(true)));
        db.enqueue(NodeRequest::add("foo", "kept", 1));
        db.enqueue(NodeRequest::add("bar", "testbar", 1).with_property("skip", json!(true)));
        db.run_until_idle();

        assert!(db.find_node(&foo()).is_none());
        assert!(db.node("foo", "kept").is_some());
        assert!(db.find_node(&bar()).is_some());
    }

    #[test]
    fn test_pre_filter_turns_update_into_delete() {
        let db = db();
        db.enqueue(NodeRequest::add("foo", "testfoo", 1).with_property("id-perms", json!({})));
        db.run_until_idle();

        db.set_pre_filter("foo", |current: Option<&Node>, req: &mut NodeRequest| {
            let no_perms = req
                .data
                .as_ref()
                .is_some_and(|data| !data.properties.contains_key("id-perms"));
            if current.is_some() && req.operation == Operation::AddOrChange && no_perms {
                req.operation = Operation::Delete;
                req.data = None;
            }
            true
        })
        .unwrap();

        db.enqueue(NodeRequest::add("foo", "testfoo", 2));
        db.run_until_idle();
        assert!(db.find_node(&foo()).is_none());

        // With no live node the update goes through
        db.enqueue(NodeRequest::add("foo", "testfoo", 3));
        db.run_until_idle();
        assert!(db.find_node(&foo()).is_some());

        assert!(db.clear_pre_filter("foo"));
        assert!(!db.clear_pre_filter("foo"));
    }

    #[test]
    fn test_pre_filter_requires_table() {
        let db = db();
        let err = db.set_pre_filter("nope", |_, _| true).unwrap_err();
        assert!(matches!(err, StoreError::TableNotFound(name) if name == "__ifmap__.nope.0"));
    }

    #[test]
    fn test_open_loads_deployment_config() {
        let temp = tempfile::TempDir::new().unwrap();
        let local = temp.path().join(".cfgmap");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(
            local.join("config.toml"),
            "[store]\npartitions = 2\n\n[sweep]\nbatch_size = 16\n",
        )
        .unwrap();

        let loader = ConfigLoader::with_global_dir(temp.path().join("global"));
        let db = Database::open_with(&loader, temp.path(), None).unwrap();
        assert_eq!(db.config().store.partitions, 2);
        assert_eq!(db.config().sweep.batch_size, 16);
        assert_eq!(db.link_table().partition_count(), 2);

        let overrides = ConfigOverrides {
            partitions: Some(0),
            ..Default::default()
        };
        let err = Database::open_with(&loader, temp.path(), Some(&overrides)).unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn test_clear() {
        let db = db();
        db.enqueue(NodeRequest::add("foo", "testfoo", 1));
        db.enqueue(NodeRequest::add("bar", "testbar", 1));
        db.enqueue(LinkRequest::add(("foo", "testfoo"), ("bar", "testbar"), "foo-bar", 1));
        db.enqueue(LinkRequest::add(("foo", "other"), ("bar", "testbar"), "foo-bar", 1));
        db.run_until_idle();

        assert_eq!(db.clear(), 3);
        let stats = db.stats();
        assert_eq!(stats.nodes, 0);
        assert_eq!(stats.links, 0);
        assert_eq!(stats.vertices, 0);
        assert_eq!(stats.deferred_links, 0);
    }
}
