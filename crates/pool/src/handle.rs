//! Pooled handle: one physical connection plus its lifecycle bookkeeping.

use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::state::{AtomicState, State};

/// Pool-unique identifier of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HandleId(u64);

impl HandleId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who checked a handle out, recorded for leak attribution.
#[derive(Debug, Clone)]
pub struct Owner {
    /// Thread that called `acquire`.
    pub thread_id: ThreadId,
    /// Name of that thread, if it has one.
    pub thread_name: Option<String>,
    /// Source location of the `acquire` call.
    pub location: &'static Location<'static>,
    /// When the handle was checked out.
    pub acquired_at: Instant,
}

impl Owner {
    pub(crate) fn current(location: &'static Location<'static>) -> Self {
        let thread = std::thread::current();
        Self {
            thread_id: thread.id(),
            thread_name: thread.name().map(str::to_owned),
            location,
            acquired_at: Instant::now(),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.thread_name {
            Some(name) => write!(f, "thread '{name}' at {}", self.location),
            None => write!(f, "thread {:?} at {}", self.thread_id, self.location),
        }
    }
}

/// One physical connection and its pool state.
///
/// The state machine guarantees a single logical holder at a time (a
/// caller's guard, the validator, or the destroyer). A caller's guard moves
/// the connection out of its slot for as long as it is held and puts it back
/// before returning the handle, so the slot is empty exactly while a guard
/// is alive.
pub(crate) struct Handle<C> {
    id: HandleId,
    state: AtomicState,
    connection: Mutex<Option<C>>,
    created_at: Instant,
    /// Nanoseconds since `created_at`.
    last_access: AtomicU64,
    owner: Mutex<Option<Owner>>,
    /// An entry for this handle sits in the handoff pool.
    enqueued: AtomicBool,
    /// Thread token of the private cache that owns this handle, 0 for none.
    cached_by: AtomicU64,
}

impl<C> Handle<C> {
    pub(crate) fn new(id: HandleId, connection: C) -> Self {
        Self {
            id,
            state: AtomicState::new(State::New),
            connection: Mutex::new(Some(connection)),
            created_at: Instant::now(),
            last_access: AtomicU64::new(0),
            owner: Mutex::new(None),
            enqueued: AtomicBool::new(false),
            cached_by: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn state(&self) -> State {
        self.state.load()
    }

    /// Raw CAS on the state cell. The pool wraps this to keep its gauges in
    /// sync; call that wrapper instead.
    pub(crate) fn cas_state(&self, from: State, to: State) -> bool {
        self.state.transition(from, to)
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Stamp `last_access` with the current time, returning the previous stamp.
    pub(crate) fn touch(&self) -> Instant {
        let now = self.created_at.elapsed().as_nanos() as u64;
        let previous = self.last_access.swap(now, Ordering::SeqCst);
        self.created_at + Duration::from_nanos(previous)
    }

    pub(crate) fn last_access(&self) -> Instant {
        self.created_at + Duration::from_nanos(self.last_access.load(Ordering::SeqCst))
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_access().elapsed()
    }

    pub(crate) fn set_owner(&self, owner: Owner) {
        *self.owner.lock() = Some(owner);
    }

    pub(crate) fn clear_owner(&self) {
        self.owner.lock().take();
    }

    pub(crate) fn owner(&self) -> Option<Owner> {
        self.owner.lock().clone()
    }

    /// Record that an entry is about to be put into the handoff pool.
    ///
    /// Returns `false` when an entry is already there, in which case the
    /// caller must not put another one.
    pub(crate) fn mark_enqueued(&self) -> bool {
        !self.enqueued.swap(true, Ordering::SeqCst)
    }

    /// Called by a taker right after it popped this handle's entry.
    pub(crate) fn clear_enqueued(&self) {
        self.enqueued.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_cache_owner(&self, token: u64) {
        self.cached_by.store(token, Ordering::SeqCst);
    }

    pub(crate) fn cache_owner(&self) -> u64 {
        self.cached_by.load(Ordering::SeqCst)
    }

    /// Lock the connection slot. Callers that must check the state and the
    /// slot together hold this across both.
    pub(crate) fn slot(&self) -> MutexGuard<'_, Option<C>> {
        self.connection.lock()
    }

    /// Move the connection out for a guard, but only while the handle is in
    /// `state`.
    pub(crate) fn take_connection_in(&self, state: State) -> Option<C> {
        let mut slot = self.connection.lock();
        if self.state() == state { slot.take() } else { None }
    }

    /// Put back a connection moved out by a guard.
    pub(crate) fn restore_connection(&self, connection: C) {
        *self.connection.lock() = Some(connection);
    }

    /// Run `f` on the connection, if it has not been taken yet.
    pub(crate) fn with_connection<R>(&self, f: impl FnOnce(&mut C) -> R) -> Option<R> {
        self.connection.lock().as_mut().map(f)
    }

    /// Remove the connection for closing or detaching.
    pub(crate) fn take_connection(&self) -> Option<C> {
        self.connection.lock().take()
    }
}

impl<C> fmt::Debug for Handle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("idle_for", &self.idle_for())
            .finish()
    }
}

/// Point-in-time view of one handle, returned by
/// [`Pool::handles`](crate::Pool::handles).
#[derive(Debug, Clone)]
pub struct HandleInfo {
    /// The handle identifier.
    pub id: HandleId,
    /// State at the time of the snapshot.
    pub state: State,
    /// Age of the underlying connection.
    pub age: Duration,
    /// Time since the handle was last acquired or returned.
    pub idle_for: Duration,
    /// Current holder, set only while checked out.
    pub owner: Option<Owner>,
}

impl<C> From<&Handle<C>> for HandleInfo {
    fn from(handle: &Handle<C>) -> Self {
        Self {
            id: handle.id(),
            state: handle.state(),
            age: handle.created_at().elapsed(),
            idle_for: handle.idle_for(),
            owner: handle.owner(),
        }
    }
}
