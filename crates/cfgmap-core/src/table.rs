//! Partitioned Table
//!
//! A named collection of entries sharded into a fixed number of partitions.
//! Each partition owns its storage, its ordered key index, its change list
//! and its request queue. Partitions are picked by hashing the entry key.
//!
//! Thread-safe via interior mutability: every partition sits behind its own
//! `parking_lot::Mutex`, and no partition lock is held while listeners run.
//!
//! Deleting an entry only marks it and removes it from lookups. The entry
//! stays in the arena until it has been notified and no listener holds it.

use crate::arena::{Arena, EntryId};
use crate::entry::TableEntry;
use crate::error::StoreError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Index of a partition within a table.
pub type PartitionId = usize;

/// Handle to an entry: its partition plus a generation-checked arena id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntryRef {
    pub partition: PartitionId,
    pub id: EntryId,
}

/// Identifies a registered listener. Unique across all tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ListenerId(pub u64);

/// Change callback: receives the partition and a snapshot of the entry.
pub type Listener<E> = Arc<dyn Fn(PartitionId, &E) + Send + Sync>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

struct Stored<E> {
    entry: E,
    /// Listener-held references delaying physical release
    holds: usize,
}

struct TablePartition<E> {
    arena: Arena<Stored<E>>,
    index: BTreeMap<String, EntryId>,
    change_list: VecDeque<EntryId>,
}

impl<E: TableEntry> TablePartition<E> {
    fn new() -> Self {
        Self {
            arena: Arena::new(),
            index: BTreeMap::new(),
            change_list: VecDeque::new(),
        }
    }

    fn live(&self, id: EntryId) -> bool {
        self.arena
            .get(id)
            .is_some_and(|stored| !stored.entry.is_deleted())
    }

    fn change(&mut self, id: EntryId) -> bool {
        let Some(stored) = self.arena.get_mut(id) else {
            return false;
        };
        let flags = stored.entry.flags_mut();
        if !flags.on_change_list {
            flags.on_change_list = true;
            self.change_list.push_back(id);
        }
        true
    }

    /// Physically drop `id` if it is deleted, notified and unheld.
    fn try_release(&mut self, id: EntryId) -> bool {
        let releasable = self.arena.get(id).is_some_and(|stored| {
            stored.entry.is_deleted() && !stored.entry.flags().on_change_list && stored.holds == 0
        });
        if !releasable {
            return false;
        }
        if let Some(stored) = self.arena.remove(id) {
            let key = stored.entry.key();
            if self.index.get(key) == Some(&id) {
                self.index.remove(key);
            }
        }
        true
    }

    fn range(
        &self,
        partition: PartitionId,
        lower: Bound<&str>,
        limit: usize,
    ) -> Vec<(String, EntryRef)> {
        let lower = match lower {
            Bound::Included(k) => Bound::Included(k.to_string()),
            Bound::Excluded(k) => Bound::Excluded(k.to_string()),
            Bound::Unbounded => Bound::Unbounded,
        };
        self.index
            .range((lower, Bound::Unbounded))
            .filter(|(_, id)| self.live(**id))
            .take(limit)
            .map(|(key, id)| (key.clone(), EntryRef { partition, id: *id }))
            .collect()
    }
}

/// A named, partitioned collection of entries with change notification.
pub struct PartitionedTable<E: TableEntry> {
    name: String,
    partitions: Vec<Mutex<TablePartition<E>>>,
    requests: Vec<Mutex<VecDeque<E::Request>>>,
    /// Kept in registration order
    listeners: RwLock<Vec<(ListenerId, Listener<E>)>>,
}

impl<E: TableEntry> PartitionedTable<E> {
    pub fn new(name: impl Into<String>, partitions: usize) -> Self {
        assert!(partitions > 0, "table needs at least one partition");
        Self {
            name: name.into(),
            partitions: (0..partitions)
                .map(|_| Mutex::new(TablePartition::new()))
                .collect(),
            requests: (0..partitions).map(|_| Mutex::new(VecDeque::new())).collect(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Partition owning `key`.
    pub fn partition_of(&self, key: &str) -> PartitionId {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as PartitionId
    }

    // ------------------------------------------------------------------------
    // Request queues
    // ------------------------------------------------------------------------

    /// Queue a request on the partition owning `key`.
    pub fn enqueue(&self, key: &str, request: E::Request) {
        let partition = self.partition_of(key);
        self.requests[partition].lock().push_back(request);
    }

    pub fn dequeue(&self, partition: PartitionId) -> Option<E::Request> {
        self.requests[partition].lock().pop_front()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.iter().map(|q| q.lock().len()).sum()
    }

    // ------------------------------------------------------------------------
    // Entry operations
    // ------------------------------------------------------------------------

    /// Insert a new entry.
    ///
    /// A live entry with the same key makes this a no-op returning `None`.
    /// A delete-marked entry with the same key loses its lookup path to the
    /// new one and is released once notified.
    pub fn add(&self, entry: E) -> Option<EntryRef> {
        let key = entry.key().to_string();
        let partition = self.partition_of(&key);
        let mut guard = self.partitions[partition].lock();
        let part = &mut *guard;

        if let Some(&id) = part.index.get(&key) {
            if part.live(id) {
                trace!(table = %self.name, key = %key, "Duplicate add ignored");
                return None;
            }
        }

        let id = part.arena.insert(Stored { entry, holds: 0 });
        part.index.insert(key, id);
        Some(EntryRef { partition, id })
    }

    /// Look up a live entry.
    pub fn find(&self, key: &str) -> Option<EntryRef> {
        let partition = self.partition_of(key);
        let part = self.partitions[partition].lock();
        let id = *part.index.get(key)?;
        part.live(id).then_some(EntryRef { partition, id })
    }

    /// Look up an entry, including one that is delete-marked but not yet
    /// released.
    pub fn find_any(&self, key: &str) -> Option<EntryRef> {
        let partition = self.partition_of(key);
        let part = self.partitions[partition].lock();
        let id = *part.index.get(key)?;
        part.arena
            .contains(id)
            .then_some(EntryRef { partition, id })
    }

    pub fn read<R>(&self, entry: EntryRef, f: impl FnOnce(&E) -> R) -> Option<R> {
        let part = self.partitions.get(entry.partition)?.lock();
        part.arena.get(entry.id).map(|stored| f(&stored.entry))
    }

    pub fn update<R>(&self, entry: EntryRef, f: impl FnOnce(&mut E) -> R) -> Option<R> {
        let mut part = self.partitions.get(entry.partition)?.lock();
        part.arena.get_mut(entry.id).map(|stored| f(&mut stored.entry))
    }

    /// Snapshot of an entry.
    pub fn get(&self, entry: EntryRef) -> Option<E> {
        self.read(entry, E::clone)
    }

    /// Put the entry on its partition's change list (once).
    pub fn change(&self, entry: EntryRef) -> bool {
        self.partitions[entry.partition].lock().change(entry.id)
    }

    /// Mark the entry deleted and queue it for notification.
    pub fn delete(&self, entry: EntryRef) -> bool {
        let mut part = self.partitions[entry.partition].lock();
        let Some(stored) = part.arena.get_mut(entry.id) else {
            return false;
        };
        let flags = stored.entry.flags_mut();
        flags.deleted = true;
        flags.on_remove_queue = true;
        part.change(entry.id)
    }

    /// Revive a delete-marked entry that has not been released yet.
    pub fn clear_delete(&self, entry: EntryRef) -> bool {
        let mut guard = self.partitions[entry.partition].lock();
        let part = &mut *guard;
        let Some(stored) = part.arena.get_mut(entry.id) else {
            return false;
        };
        if !stored.entry.is_deleted() {
            return false;
        }
        let flags = stored.entry.flags_mut();
        flags.deleted = false;
        flags.on_remove_queue = false;
        let key = stored.entry.key().to_string();
        part.index.entry(key).or_insert(entry.id);
        true
    }

    /// Keep the entry's storage alive past deletion until [`release`](Self::release).
    pub fn hold(&self, entry: EntryRef) -> bool {
        let mut part = self.partitions[entry.partition].lock();
        match part.arena.get_mut(entry.id) {
            Some(stored) => {
                stored.holds += 1;
                true
            }
            None => false,
        }
    }

    pub fn release(&self, entry: EntryRef) {
        let mut part = self.partitions[entry.partition].lock();
        if let Some(stored) = part.arena.get_mut(entry.id) {
            assert!(
                stored.holds > 0,
                "release without hold on {} in {}",
                stored.entry.key(),
                self.name
            );
            stored.holds -= 1;
            part.try_release(entry.id);
        }
    }

    // ------------------------------------------------------------------------
    // Iteration
    // ------------------------------------------------------------------------

    /// First live entry with key `>= key`, across all partitions.
    pub fn lower_bound(&self, key: &str) -> Option<(String, EntryRef)> {
        self.partitions
            .iter()
            .enumerate()
            .filter_map(|(pid, p)| p.lock().range(pid, Bound::Included(key), 1).pop())
            .min_by(|a, b| a.0.cmp(&b.0))
    }

    /// Up to `limit` live entries with keys strictly after `cursor`, in key
    /// order across all partitions.
    ///
    /// Keys removed between calls are skipped, never reported as errors.
    pub fn walk_from(&self, cursor: Option<&str>, limit: usize) -> Vec<(String, EntryRef)> {
        let lower = match cursor {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let mut batch: Vec<_> = self
            .partitions
            .iter()
            .enumerate()
            .flat_map(|(pid, p)| p.lock().range(pid, lower, limit))
            .collect();
        batch.sort_by(|a, b| a.0.cmp(&b.0));
        batch.truncate(limit);
        batch
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| {
                let part = p.lock();
                part.index.values().filter(|id| part.live(**id)).count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries still in storage, including delete-marked ones.
    pub fn stored_len(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().arena.len()).sum()
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    pub fn register(&self, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        debug!(table = %self.name, listener = id.0, "Listener registered");
        id
    }

    pub fn unregister(&self, id: ListenerId) -> Result<(), StoreError> {
        let mut listeners = self.listeners.write();
        let pos = listeners
            .iter()
            .position(|(lid, _)| *lid == id)
            .ok_or(StoreError::ListenerNotFound(id.0))?;
        listeners.remove(pos);
        debug!(table = %self.name, listener = id.0, "Listener unregistered");
        Ok(())
    }

    pub fn is_registered(&self, id: ListenerId) -> bool {
        self.listeners.read().iter().any(|(lid, _)| *lid == id)
    }

    pub fn has_pending_changes(&self) -> bool {
        self.partitions
            .iter()
            .any(|p| !p.lock().change_list.is_empty())
    }

    /// Drain every partition's change list, calling each listener in
    /// registration order for each dirty entry in list order.
    ///
    /// Returns the number of entries notified.
    pub fn notify(&self) -> usize {
        let mut notified = 0;
        for (pid, partition) in self.partitions.iter().enumerate() {
            let dirty: Vec<(EntryId, E)> = {
                let mut guard = partition.lock();
                let part = &mut *guard;
                let ids: Vec<EntryId> = part.change_list.drain(..).collect();
                ids.into_iter()
                    .filter_map(|id| {
                        let stored = part.arena.get_mut(id)?;
                        stored.entry.flags_mut().on_change_list = false;
                        Some((id, stored.entry.clone()))
                    })
                    .collect()
            };
            if dirty.is_empty() {
                continue;
            }

            let listeners: Vec<(ListenerId, Listener<E>)> = self.listeners.read().clone();
            for (_, entry) in &dirty {
                for (id, listener) in &listeners {
                    // A listener may unregister another one mid-drain
                    if self.is_registered(*id) {
                        listener(pid, entry);
                    }
                }
            }
            notified += dirty.len();

            let mut part = partition.lock();
            for (id, _) in &dirty {
                part.try_release(*id);
            }
        }
        if notified > 0 {
            trace!(table = %self.name, notified, "Change list drained");
        }
        notified
    }

    /// Drop every entry and queued request.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for partition in &self.partitions {
            let mut part = partition.lock();
            removed += part.arena.len();
            part.arena.clear();
            part.index.clear();
            part.change_list.clear();
        }
        for queue in &self.requests {
            queue.lock().clear();
        }
        debug!(table = %self.name, removed, "Table cleared");
        removed
    }
}

impl<E: TableEntry> std::fmt::Debug for PartitionedTable<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedTable")
            .field("name", &self.name)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}
