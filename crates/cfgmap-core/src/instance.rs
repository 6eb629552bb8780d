//! Routing instances derived from the configuration graph.
//!
//! [`InstanceManager`] listens on the `routing-instance` node table and keeps
//! one [`RoutingInstance`] per live node. Each instance owns a
//! [`LifetimeActor`]; deleting the node requests deletion of the instance,
//! which is destroyed once every holder has released it.
//!
//! If the node comes back while the old instance is still being destroyed,
//! the new configuration is parked in a [`Resurrector`] and a fresh instance
//! is built from the latest parked value when the old one is gone.

use crate::database::Database;
use crate::entry::{Node, TableEntry};
use crate::error::StoreError;
use crate::lifetime::{LifetimeActor, LifetimeManager, Resurrector};
use crate::request::Properties;
use crate::table::{ListenerId, PartitionId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

pub const ROUTING_INSTANCE: &str = "routing-instance";
pub const ROUTE_TARGET: &str = "route-target";
/// Relation between a routing instance and its route targets
pub const INSTANCE_TARGET: &str = "instance-target";

/// Configuration of one routing instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceConfig {
    pub name: String,
    pub properties: Properties,
    pub route_targets: BTreeSet<String>,
}

impl InstanceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Properties::new(),
            route_targets: BTreeSet::new(),
        }
    }

    /// Build from a routing-instance node and its `instance-target`
    /// relations, either direct links or through an attribute node.
    pub fn from_node(db: &Database, node: &Node) -> Self {
        let (mut route_targets, direct) = db.with_graph(|graph| {
            let mut via_attr = BTreeSet::new();
            let mut direct = Vec::new();
            for (edge, other) in graph.edges(node.node_key()) {
                if other.id_type == INSTANCE_TARGET {
                    via_attr.extend(
                        graph
                            .neighbors(other)
                            .into_iter()
                            .filter(|n| n.id_type == ROUTE_TARGET)
                            .map(|n| n.id_name),
                    );
                } else if other.id_type == ROUTE_TARGET {
                    direct.push((edge.link, other.id_name.clone()));
                }
            }
            (via_attr, direct)
        });
        route_targets.extend(
            direct
                .into_iter()
                .filter(|(link, _)| {
                    db.link_table()
                        .read(*link, |l| l.relation() == INSTANCE_TARGET)
                        .unwrap_or(false)
                })
                .map(|(_, name)| name),
        );

        Self {
            name: node.name().to_string(),
            properties: node.merged_properties(),
            route_targets,
        }
    }
}

/// A routing instance built from configuration.
pub struct RoutingInstance {
    name: String,
    incarnation: u64,
    config: Mutex<InstanceConfig>,
    deleter: LifetimeActor,
}

impl RoutingInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Distinguishes successive instances with the same name.
    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// Current configuration; `None` once deletion was requested.
    pub fn config(&self) -> Option<InstanceConfig> {
        if self.deleter.is_deleted() {
            return None;
        }
        Some(self.config.lock().clone())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleter.is_deleted()
    }

    pub fn deleter(&self) -> &LifetimeActor {
        &self.deleter
    }
}

impl std::fmt::Debug for RoutingInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingInstance")
            .field("name", &self.name)
            .field("incarnation", &self.incarnation)
            .field("state", &self.deleter.state())
            .finish()
    }
}

struct Inner {
    db: Weak<Database>,
    lifetime: LifetimeManager,
    instances: Mutex<BTreeMap<String, Arc<RoutingInstance>>>,
    pending: Resurrector<InstanceConfig>,
    created: AtomicU64,
    listener: Mutex<Option<ListenerId>>,
}

impl Inner {
    fn on_node(self: &Arc<Self>, node: &Node) {
        let Some(db) = self.db.upgrade() else {
            return;
        };
        // The snapshot may be out of date by now; act on the current node.
        match db.find_node(node.node_key()) {
            Some(current) => self.update(InstanceConfig::from_node(&db, &current)),
            None => {
                if node.is_deleted() {
                    self.delete(node.name());
                }
            }
        }
    }

    fn update(self: &Arc<Self>, config: InstanceConfig) {
        let mut instances = self.instances.lock();
        match instances.get(&config.name) {
            Some(instance) if !instance.is_deleted() => {
                *instance.config.lock() = config;
            }
            Some(_) => {
                debug!(instance = %config.name, "Re-creation held until destroy completes");
                let name = config.name.clone();
                self.pending.stash(&name, Some(config));
            }
            None => {
                let name = config.name.clone();
                let instance = self.create(config);
                instances.insert(name, instance);
            }
        }
    }

    fn delete(&self, name: &str) {
        let instance = {
            let instances = self.instances.lock();
            match instances.get(name) {
                Some(instance) if !instance.is_deleted() => instance.clone(),
                Some(_) => {
                    self.pending.stash(name, None);
                    return;
                }
                None => {
                    trace!(instance = %name, "Delete for unknown instance");
                    return;
                }
            }
        };
        debug!(instance = %name, "Instance delete requested");
        instance.deleter.delete_request();
    }

    fn create(self: &Arc<Self>, config: InstanceConfig) -> Arc<RoutingInstance> {
        let incarnation = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        let name = config.name.clone();
        let deleter = self.lifetime.actor(format!("{}:{}", ROUTING_INSTANCE, name));

        let weak = Arc::downgrade(self);
        let hook_name = name.clone();
        deleter.on_destroy(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_destroyed(&hook_name, incarnation);
            }
        });

        debug!(instance = %name, incarnation, "Instance created");
        Arc::new(RoutingInstance {
            name,
            incarnation,
            config: Mutex::new(config),
            deleter,
        })
    }

    fn on_destroyed(self: &Arc<Self>, name: &str, incarnation: u64) {
        {
            let mut instances = self.instances.lock();
            if instances
                .get(name)
                .is_some_and(|instance| instance.incarnation == incarnation)
            {
                instances.remove(name);
            }
        }
        debug!(instance = %name, incarnation, "Instance destroyed");

        if let Some(Some(config)) = self.pending.take(name) {
            self.update(config);
        }
    }
}

/// Maintains routing instances from the `routing-instance` table.
pub struct InstanceManager {
    inner: Arc<Inner>,
}

impl InstanceManager {
    /// Start tracking routing-instance nodes of `db`. Creates the
    /// routing-instance and route-target tables if needed.
    pub fn new(db: &Arc<Database>) -> Result<Self, StoreError> {
        db.ensure_node_table(ROUTING_INSTANCE);
        db.ensure_node_table(ROUTE_TARGET);

        let inner = Arc::new(Inner {
            db: Arc::downgrade(db),
            lifetime: db.lifetime_manager().clone(),
            instances: Mutex::new(BTreeMap::new()),
            pending: Resurrector::new(),
            created: AtomicU64::new(0),
            listener: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let id = db.register_node_listener(ROUTING_INSTANCE, move |_: PartitionId, node: &Node| {
            if let Some(inner) = weak.upgrade() {
                inner.on_node(node);
            }
        })?;
        *inner.listener.lock() = Some(id);

        Ok(Self { inner })
    }

    /// Live (not delete-requested) instance.
    pub fn find(&self, name: &str) -> Option<Arc<RoutingInstance>> {
        self.find_any(name).filter(|instance| !instance.is_deleted())
    }

    /// Instance in any state short of destroyed.
    pub fn find_any(&self, name: &str) -> Option<Arc<RoutingInstance>> {
        self.inner.instances.lock().get(name).cloned()
    }

    /// Instances not yet destroyed, including ones being deleted.
    pub fn count(&self) -> usize {
        self.inner.instances.lock().len()
    }

    /// Total instances ever created.
    pub fn created_count(&self) -> u64 {
        self.inner.created.load(Ordering::Relaxed)
    }

    /// A re-creation is parked for `name`.
    pub fn is_recreate_pending(&self, name: &str) -> bool {
        self.inner.pending.is_pending(name)
    }

    /// Stop listening and request deletion of every instance.
    pub fn shutdown(&self) -> Result<(), StoreError> {
        if let Some(id) = self.inner.listener.lock().take() {
            if let Some(db) = self.inner.db.upgrade() {
                db.unregister(id)?;
            }
        }
        let names: Vec<String> = self.inner.instances.lock().keys().cloned().collect();
        for name in names {
            self.inner.pending.take(&name);
            self.inner.delete(&name);
        }
        Ok(())
    }
}

impl Drop for InstanceManager {
    fn drop(&mut self) {
        if let Some(id) = self.inner.listener.lock().take() {
            if let Some(db) = self.inner.db.upgrade() {
                let _ = db.unregister(id);
            }
        }
    }
}
