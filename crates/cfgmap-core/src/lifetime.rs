//! Lifetime Manager
//!
//! Coordinates deletion of objects that other objects or external holders
//! may still be using.
//!
//! Each managed object owns a [`LifetimeActor`]. A delete request moves the
//! actor from `Alive` to `DeleteRequested`; from then on it can no longer be
//! acquired. The actor is queued for destruction once its reference count
//! reaches zero and it is not paused. [`LifetimeManager::run`] performs the
//! queued destructions, running each actor's destroy hook exactly once.
//!
//! References are scoped guards ([`LifetimeRef`]): dropping the guard
//! releases the reference and may queue the actor.
//!
//! Lock order: actor state before the manager's ready queue. Destroy hooks
//! run with no lifetime lock held.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Externally visible lifecycle state of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeState {
    Alive,
    DeleteRequested { paused: bool },
    Destroyed,
}

type DestroyHook = Box<dyn FnOnce() + Send>;

#[derive(Debug, Default)]
struct ActorState {
    delete_requested: bool,
    destroyed: bool,
    paused: bool,
    refs: usize,
}

impl ActorState {
    fn destroyable(&self) -> bool {
        self.delete_requested && !self.destroyed && !self.paused && self.refs == 0
    }
}

struct ActorShared {
    name: String,
    state: Mutex<ActorState>,
    queued: AtomicBool,
    on_destroy: Mutex<Option<DestroyHook>>,
    /// Actors holding a reference on this one
    dependents: Mutex<Vec<Weak<ActorShared>>>,
    /// References this actor holds on others, dropped at destruction
    held: Mutex<Vec<LifetimeRef>>,
    manager: Weak<ManagerShared>,
}

impl ActorShared {
    fn maybe_schedule(self: &Arc<Self>) {
        let state = self.state.lock();
        if !state.destroyable() || self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.manager.upgrade() {
            Some(manager) => {
                manager.ready.lock().push_back(self.clone());
                trace!(actor = %self.name, "Queued for destruction");
            }
            None => self.queued.store(false, Ordering::Release),
        }
    }

    fn delete_request(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.delete_requested {
                return;
            }
            state.delete_requested = true;
        }
        debug!(actor = %self.name, "Delete requested");

        let dependents: Vec<_> = self
            .dependents
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for dependent in dependents {
            dependent.delete_request();
        }
        self.maybe_schedule();
    }
}

struct ManagerShared {
    ready: Mutex<VecDeque<Arc<ActorShared>>>,
    destroyed: AtomicUsize,
}

/// Shared destruction queue.
#[derive(Clone)]
pub struct LifetimeManager {
    shared: Arc<ManagerShared>,
}

impl Default for LifetimeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifetimeManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                ready: Mutex::new(VecDeque::new()),
                destroyed: AtomicUsize::new(0),
            }),
        }
    }

    /// Create an actor in the `Alive` state.
    pub fn actor(&self, name: impl Into<String>) -> LifetimeActor {
        LifetimeActor {
            shared: Arc::new(ActorShared {
                name: name.into(),
                state: Mutex::new(ActorState::default()),
                queued: AtomicBool::new(false),
                on_destroy: Mutex::new(None),
                dependents: Mutex::new(Vec::new()),
                held: Mutex::new(Vec::new()),
                manager: Arc::downgrade(&self.shared),
            }),
        }
    }

    /// Destroy every queued actor, including ones queued by the
    /// destructions themselves. Returns the number destroyed.
    ///
    /// # Panics
    ///
    /// If a queued actor has regained references.
    pub fn run(&self) -> usize {
        let mut destroyed = 0;
        loop {
            let next = self.shared.ready.lock().pop_front();
            let Some(actor) = next else {
                break;
            };
            actor.queued.store(false, Ordering::Release);

            {
                let mut state = actor.state.lock();
                if state.destroyed || state.paused {
                    continue;
                }
                assert!(
                    state.refs == 0,
                    "destroying {} with {} live references",
                    actor.name,
                    state.refs
                );
                state.destroyed = true;
            }

            let held = std::mem::take(&mut *actor.held.lock());
            drop(held);
            let hook = actor.on_destroy.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            debug!(actor = %actor.name, "Destroyed");
            destroyed += 1;
        }
        self.shared
            .destroyed
            .fetch_add(destroyed, Ordering::Relaxed);
        destroyed
    }

    /// Actors waiting for [`run`](Self::run).
    pub fn pending(&self) -> usize {
        self.shared.ready.lock().len()
    }

    pub fn destroyed_count(&self) -> usize {
        self.shared.destroyed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for LifetimeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifetimeManager")
            .field("pending", &self.pending())
            .field("destroyed", &self.destroyed_count())
            .finish()
    }
}

/// Per-object delete coordinator.
#[derive(Clone)]
pub struct LifetimeActor {
    shared: Arc<ActorShared>,
}

impl LifetimeActor {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> LifetimeState {
        let state = self.shared.state.lock();
        if state.destroyed {
            LifetimeState::Destroyed
        } else if state.delete_requested {
            LifetimeState::DeleteRequested {
                paused: state.paused,
            }
        } else {
            LifetimeState::Alive
        }
    }

    /// Delete requested, whether or not destroyed yet.
    pub fn is_deleted(&self) -> bool {
        self.shared.state.lock().delete_requested
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.state.lock().destroyed
    }

    pub fn is_delete_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    pub fn ref_count(&self) -> usize {
        self.shared.state.lock().refs
    }

    /// Install the hook run once at destruction.
    pub fn on_destroy(&self, hook: impl FnOnce() + Send + 'static) {
        *self.shared.on_destroy.lock() = Some(Box::new(hook));
    }

    /// Take a reference. Fails once a delete has been requested.
    pub fn acquire(&self) -> Option<LifetimeRef> {
        let mut state = self.shared.state.lock();
        if state.delete_requested {
            return None;
        }
        state.refs += 1;
        Some(LifetimeRef {
            actor: self.shared.clone(),
        })
    }

    /// Move to `DeleteRequested`, propagating to dependents. Idempotent.
    pub fn delete_request(&self) {
        self.shared.delete_request();
    }

    /// Hold off destruction regardless of the reference count.
    pub fn pause_delete(&self) {
        let mut state = self.shared.state.lock();
        assert!(!state.destroyed, "pausing destroyed {}", self.shared.name);
        state.paused = true;
    }

    /// Undo [`pause_delete`](Self::pause_delete); destruction proceeds if
    /// nothing else holds the actor.
    ///
    /// # Panics
    ///
    /// If the actor is not paused.
    pub fn resume_delete(&self) {
        {
            let mut state = self.shared.state.lock();
            assert!(
                state.paused,
                "resuming delete on {} which is not paused",
                self.shared.name
            );
            state.paused = false;
        }
        self.shared.maybe_schedule();
    }

    /// Make this actor depend on `parent`: it holds a reference on the
    /// parent until destroyed, and a delete of the parent is propagated.
    ///
    /// Returns false if the parent can no longer be acquired.
    pub fn depend_on(&self, parent: &LifetimeActor) -> bool {
        let Some(reference) = parent.acquire() else {
            return false;
        };
        parent
            .shared
            .dependents
            .lock()
            .push(Arc::downgrade(&self.shared));
        self.shared.held.lock().push(reference);
        true
    }
}

impl fmt::Debug for LifetimeActor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifetimeActor")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Scoped reference on an actor. Released on drop.
pub struct LifetimeRef {
    actor: Arc<ActorShared>,
}

impl LifetimeRef {
    pub fn name(&self) -> &str {
        &self.actor.name
    }
}

impl Clone for LifetimeRef {
    fn clone(&self) -> Self {
        self.actor.state.lock().refs += 1;
        Self {
            actor: self.actor.clone(),
        }
    }
}

impl Drop for LifetimeRef {
    fn drop(&mut self) {
        {
            let mut state = self.actor.state.lock();
            state.refs -= 1;
        }
        self.actor.maybe_schedule();
    }
}

impl fmt::Debug for LifetimeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LifetimeRef").field(&self.actor.name).finish()
    }
}

/// Configuration held back while an old incarnation is being destroyed.
///
/// Only the latest value per name is kept: `Some(config)` re-creates the
/// object once the old incarnation is gone, `None` cancels the re-creation.
#[derive(Debug)]
pub struct Resurrector<C> {
    pending: Mutex<HashMap<String, Option<C>>>,
}

impl<C> Default for Resurrector<C> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<C> Resurrector<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest configuration for `name`. Returns true if it
    /// replaced an earlier pending value.
    pub fn stash(&self, name: &str, config: Option<C>) -> bool {
        self.pending
            .lock()
            .insert(name.to_string(), config)
            .is_some()
    }

    pub fn take(&self, name: &str) -> Option<Option<C>> {
        self.pending.lock().remove(name)
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
