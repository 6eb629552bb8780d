//! Table entries: configuration nodes and the links between them.

use crate::key::{link_key, NodeKey};
use crate::request::{LinkRequest, NodeRequest, Origin, Properties};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Lifecycle flags carried by every table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntryFlags {
    /// Logically removed; lookups no longer find it
    pub deleted: bool,
    /// Waiting on the partition's change list
    pub on_change_list: bool,
    /// Waiting for physical release
    pub on_remove_queue: bool,
}

/// Behaviour shared by everything a [`PartitionedTable`](crate::table::PartitionedTable) stores.
pub trait TableEntry: Clone + Send + Sync + 'static {
    /// Request type accepted by the table holding this entry.
    type Request: Send + 'static;

    /// Key within the table.
    fn key(&self) -> &str;

    fn flags(&self) -> &EntryFlags;

    fn flags_mut(&mut self) -> &mut EntryFlags;

    fn is_deleted(&self) -> bool {
        self.flags().deleted
    }
}

/// Properties asserted by one origin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertySet {
    pub origin: Origin,
    pub sequence_number: u64,
    pub properties: Properties,
}

/// A typed, named configuration object.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    key: NodeKey,
    /// Sorted by origin
    property_sets: Vec<PropertySet>,
    sequence_number: u64,
    flags: EntryFlags,
}

impl Node {
    pub fn new(key: NodeKey) -> Self {
        Self {
            key,
            property_sets: Vec::new(),
            sequence_number: 0,
            flags: EntryFlags::default(),
        }
    }

    pub fn node_key(&self) -> &NodeKey {
        &self.key
    }

    pub fn id_type(&self) -> &str {
        &self.key.id_type
    }

    pub fn name(&self) -> &str {
        &self.key.id_name
    }

    /// Generation of the most recent refresh.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, seq: u64) {
        self.sequence_number = seq;
    }

    pub fn property_sets(&self) -> &[PropertySet] {
        &self.property_sets
    }

    pub fn find(&self, origin: Origin) -> Option<&PropertySet> {
        self.property_sets.iter().find(|p| p.origin == origin)
    }

    /// Insert or replace the property set of `set.origin`.
    ///
    /// Returns true if the stored content changed.
    pub fn insert(&mut self, set: PropertySet) -> bool {
        match self
            .property_sets
            .binary_search_by(|p| p.origin.cmp(&set.origin))
        {
            Ok(pos) => {
                let changed = self.property_sets[pos].properties != set.properties;
                self.property_sets[pos] = set;
                changed
            }
            Err(pos) => {
                self.property_sets.insert(pos, set);
                true
            }
        }
    }

    pub fn remove(&mut self, origin: Origin) -> Option<PropertySet> {
        let pos = self.property_sets.iter().position(|p| p.origin == origin)?;
        Some(self.property_sets.remove(pos))
    }

    /// Drop every property set. Returns how many were held.
    pub fn clear_property_sets(&mut self) -> usize {
        let count = self.property_sets.len();
        self.property_sets.clear();
        count
    }

    /// Value of `name`, taken from the highest-priority origin that sets it.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.property_sets
            .iter()
            .find_map(|p| p.properties.get(name))
    }

    /// Union of all property sets, higher-priority origins winning.
    pub fn merged_properties(&self) -> Properties {
        let mut merged = Properties::new();
        for set in self.property_sets.iter().rev() {
            for (name, value) in &set.properties {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }

    /// No origin asserts anything about this node.
    pub fn is_empty(&self) -> bool {
        self.property_sets.is_empty()
    }
}

impl TableEntry for Node {
    type Request = NodeRequest;

    fn key(&self) -> &str {
        &self.key.id_name
    }

    fn flags(&self) -> &EntryFlags {
        &self.flags
    }

    fn flags_mut(&mut self) -> &mut EntryFlags {
        &mut self.flags
    }
}

/// A relation between two nodes, claimed by one or more origins.
#[derive(Debug, Clone, Serialize)]
pub struct Link {
    name: String,
    relation: String,
    left: NodeKey,
    right: NodeKey,
    origins: BTreeMap<Origin, u64>,
    flags: EntryFlags,
}

impl Link {
    pub fn new(relation: impl Into<String>, left: NodeKey, right: NodeKey) -> Self {
        let relation = relation.into();
        Self {
            name: link_key(&relation, &left, &right),
            relation,
            left,
            right,
            origins: BTreeMap::new(),
            flags: EntryFlags::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn relation(&self) -> &str {
        &self.relation
    }

    pub fn left(&self) -> &NodeKey {
        &self.left
    }

    pub fn right(&self) -> &NodeKey {
        &self.right
    }

    /// The endpoint opposite `key`, if `key` is an endpoint.
    pub fn other(&self, key: &NodeKey) -> Option<&NodeKey> {
        if &self.left == key {
            Some(&self.right)
        } else if &self.right == key {
            Some(&self.left)
        } else {
            None
        }
    }

    pub fn origins(&self) -> &BTreeMap<Origin, u64> {
        &self.origins
    }

    pub fn sequence_number(&self, origin: Origin) -> Option<u64> {
        self.origins.get(&origin).copied()
    }

    /// Newest sequence number across all origins.
    pub fn max_sequence_number(&self) -> u64 {
        self.origins.values().copied().max().unwrap_or(0)
    }

    /// Record `origin` at `seq`; returns true if the origin is new.
    pub fn update_origin(&mut self, origin: Origin, seq: u64) -> bool {
        self.origins.insert(origin, seq).is_none()
    }

    pub fn remove_origin(&mut self, origin: Origin) -> bool {
        self.origins.remove(&origin).is_some()
    }

    /// Drop every origin last refreshed before `watermark`.
    pub fn remove_stale_origins(&mut self, watermark: u64) -> usize {
        let before = self.origins.len();
        self.origins.retain(|_, seq| *seq >= watermark);
        before - self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

impl TableEntry for Link {
    type Request = LinkRequest;

    fn key(&self) -> &str {
        &self.name
    }

    fn flags(&self) -> &EntryFlags {
        &self.flags
    }

    fn flags_mut(&mut self) -> &mut EntryFlags {
        &mut self.flags
    }
}
