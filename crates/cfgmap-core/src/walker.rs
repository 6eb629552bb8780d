//! Chunked table walks.
//!
//! Table-wide operations go through a [`TableWalker`] instead of touching
//! partitions directly. Each batch takes the partition locks only long
//! enough to copy out the next run of keys, so entries added or deleted
//! between batches are picked up or skipped instead of invalidating the walk.

use crate::entry::TableEntry;
use crate::table::{EntryRef, PartitionedTable};

/// One batch of a walk plus the cursor to resume from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkBatch {
    pub entries: Vec<(String, EntryRef)>,
    /// `None` once the table is exhausted
    pub next: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct TableWalker {
    batch_size: usize,
}

impl TableWalker {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Next batch after `cursor`.
    pub fn batch<E: TableEntry>(&self, table: &PartitionedTable<E>, cursor: Option<&str>) -> WalkBatch {
        let entries = table.walk_from(cursor, self.batch_size);
        let next = if entries.len() < self.batch_size {
            None
        } else {
            entries.last().map(|(key, _)| key.clone())
        };
        WalkBatch { entries, next }
    }

    /// Visit every live entry in key order. The callback receives a
    /// snapshot and may mutate the table. Returns the number visited.
    pub fn walk<E: TableEntry>(
        &self,
        table: &PartitionedTable<E>,
        mut visit: impl FnMut(EntryRef, &E),
    ) -> usize {
        let mut visited = 0;
        let mut cursor: Option<String> = None;
        loop {
            let batch = self.batch(table, cursor.as_deref());
            for (_, entry) in &batch.entries {
                if let Some(snapshot) = table.get(*entry) {
                    if !snapshot.is_deleted() {
                        visit(*entry, &snapshot);
                        visited += 1;
                    }
                }
            }
            match batch.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        visited
    }

    /// Keys of every live entry, in order.
    pub fn keys<E: TableEntry>(&self, table: &PartitionedTable<E>) -> Vec<String> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let batch = self.batch(table, cursor.as_deref());
            keys.extend(batch.entries.into_iter().map(|(key, _)| key));
            match batch.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        keys
    }
}
