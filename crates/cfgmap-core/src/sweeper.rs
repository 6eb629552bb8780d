//! Generation Sweeper
//!
//! After a reconnect epoch the store may still hold objects the new session
//! never refreshed. A sweep to watermark `W` removes, in bounded batches:
//!
//! 1. every link origin last refreshed before `W` (a link with no origin
//!    left is removed),
//! 2. every node last refreshed before `W`,
//! 3. every deferred link with a side older than `W`.
//!
//! Links go first so that stale nodes have no stale edges left when they
//! are reached. Sequence numbers are read at the moment each object is
//! examined, so an object refreshed after the sweep started survives.
//!
//! Starting a sweep while another is in progress supersedes it.

use crate::database::Database;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepPhase {
    Links,
    Nodes,
    Deferred,
    Done,
}

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub watermark: u64,
    pub batches: usize,
    pub links_examined: usize,
    pub link_origins_removed: usize,
    pub links_removed: usize,
    pub nodes_examined: usize,
    pub nodes_removed: usize,
    pub deferred_purged: usize,
}

#[derive(Debug)]
struct SweepTask {
    phase: SweepPhase,
    cursor: Option<String>,
    /// Name of the node table being swept. Tables created on demand
    /// mid-sweep do not move it.
    table: Option<String>,
    stats: SweepStats,
}

/// Bounded, resumable stale-object sweep.
#[derive(Debug)]
pub struct GenerationSweeper {
    batch_size: usize,
    task: Mutex<Option<SweepTask>>,
    last: Mutex<Option<SweepStats>>,
}

impl GenerationSweeper {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            task: Mutex::new(None),
            last: Mutex::new(None),
        }
    }

    /// Begin a sweep to `watermark`, replacing any sweep in progress.
    pub fn start(&self, watermark: u64) {
        let previous = self.task.lock().replace(SweepTask {
            phase: SweepPhase::Links,
            cursor: None,
            table: None,
            stats: SweepStats {
                watermark,
                ..Default::default()
            },
        });
        if let Some(previous) = previous {
            debug!(
                old = previous.stats.watermark,
                new = watermark,
                "Sweep superseded"
            );
        }
        info!(watermark, "Stale sweep started");
    }

    pub fn is_active(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn phase(&self) -> SweepPhase {
        self.task
            .lock()
            .as_ref()
            .map_or(SweepPhase::Done, |task| task.phase)
    }

    /// Stats of the most recently completed sweep.
    pub fn last_completed(&self) -> Option<SweepStats> {
        self.last.lock().clone()
    }

    /// Run one bounded batch. Returns true while work remains.
    pub fn run_batch(&self, db: &Database) -> bool {
        let mut guard = self.task.lock();
        let Some(task) = guard.as_mut() else {
            return false;
        };
        let watermark = task.stats.watermark;
        task.stats.batches += 1;

        match task.phase {
            SweepPhase::Links => {
                let batch = db
                    .link_table()
                    .walk_from(task.cursor.as_deref(), self.batch_size);
                for (key, _) in &batch {
                    task.stats.links_examined += 1;
                    let (origins, removed) = db.sweep_link(key, watermark);
                    task.stats.link_origins_removed += origins;
                    task.stats.links_removed += usize::from(removed);
                }
                if batch.len() < self.batch_size {
                    task.phase = SweepPhase::Nodes;
                    task.cursor = None;
                } else {
                    task.cursor = batch.last().map(|(key, _)| key.clone());
                }
            }
            SweepPhase::Nodes => {
                let tables = db.node_tables();
                let current = match task.table.as_deref() {
                    Some(name) => tables.iter().find(|t| t.name() >= name),
                    None => tables.first(),
                };
                match current {
                    Some(table) => {
                        if task.table.as_deref() != Some(table.name()) {
                            task.table = Some(table.name().to_string());
                            task.cursor = None;
                        }
                        let batch = table.walk_from(task.cursor.as_deref(), self.batch_size);
                        for (key, _) in &batch {
                            task.stats.nodes_examined += 1;
                            if db.sweep_node(table, key, watermark) {
                                task.stats.nodes_removed += 1;
                            }
                        }
                        if batch.len() < self.batch_size {
                            task.cursor = None;
                            task.table = tables
                                .iter()
                                .find(|t| t.name() > table.name())
                                .map(|t| t.name().to_string());
                            if task.table.is_none() {
                                task.phase = SweepPhase::Deferred;
                            }
                        } else {
                            task.cursor = batch.last().map(|(key, _)| key.clone());
                        }
                    }
                    None => task.phase = SweepPhase::Deferred,
                }
            }
            SweepPhase::Deferred => {
                task.stats.deferred_purged = db.purge_deferred(watermark);
                task.phase = SweepPhase::Done;
            }
            SweepPhase::Done => {}
        }

        if task.phase != SweepPhase::Done {
            return true;
        }
        let stats = task.stats.clone();
        *guard = None;
        drop(guard);

        info!(
            watermark = stats.watermark,
            links_removed = stats.links_removed,
            nodes_removed = stats.nodes_removed,
            deferred_purged = stats.deferred_purged,
            batches = stats.batches,
            "Stale sweep complete"
        );
        *self.last.lock() = Some(stats);
        false
    }
}
