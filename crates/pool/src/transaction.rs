//! Unit-of-work integration.
//!
//! A unit of work pins one connection to a scope (typically a transaction)
//! so that every `acquire` inside the scope gets the same connection back and
//! nothing is returned to the pool until the scope completes.

use std::thread::{self, ThreadId};

use dashmap::DashMap;

use crate::handle::HandleId;

/// Hook the pool consults before its normal acquire and return paths.
pub trait UnitOfWork: Send + Sync {
    /// Handle enlisted in the caller's active unit of work, if any.
    fn get_current(&self) -> Option<HandleId>;

    /// Enlist a freshly acquired handle. Implementations ignore the call when
    /// no unit of work is active or one is already enlisted.
    fn associate(&self, id: HandleId);

    /// Forget `id`. Returns `true` if it was enlisted anywhere.
    fn disassociate(&self, id: HandleId) -> bool;
}

/// [`UnitOfWork`] scoped to the calling thread.
///
/// ```no_run
/// use std::sync::Arc;
/// use reservoir_pool::{FnFactory, Pool, ThreadUnitOfWork};
///
/// let unit = Arc::new(ThreadUnitOfWork::new());
/// let factory = FnFactory::new(|| Ok::<_, reservoir_pool::BoxError>(()));
/// let pool = Pool::builder(factory).unit_of_work(unit.clone()).build()?;
///
/// unit.begin();
/// let first = pool.acquire()?.id();
/// let second = pool.acquire()?.id();
/// assert_eq!(first, second);
/// if let Some(id) = unit.end() {
///     pool.release_enlisted(id);
/// }
/// # Ok::<(), reservoir_pool::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct ThreadUnitOfWork {
    active: DashMap<ThreadId, Option<HandleId>>,
}

impl ThreadUnitOfWork {
    /// Create a tracker with no unit of work active on any thread.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a unit of work on the calling thread. A no-op if one is active.
    pub fn begin(&self) {
        self.active.entry(thread::current().id()).or_insert(None);
    }

    /// End the calling thread's unit of work, returning the enlisted handle
    /// for [`Pool::release_enlisted`](crate::Pool::release_enlisted).
    pub fn end(&self) -> Option<HandleId> {
        self.active
            .remove(&thread::current().id())
            .and_then(|(_, enlisted)| enlisted)
    }

    /// Whether the calling thread has an active unit of work.
    pub fn is_active(&self) -> bool {
        self.active.contains_key(&thread::current().id())
    }
}

impl UnitOfWork for ThreadUnitOfWork {
    fn get_current(&self) -> Option<HandleId> {
        self.active
            .get(&thread::current().id())
            .and_then(|entry| *entry)
    }

    fn associate(&self, id: HandleId) {
        if let Some(mut entry) = self.active.get_mut(&thread::current().id()) {
            entry.get_or_insert(id);
        }
    }

    fn disassociate(&self, id: HandleId) -> bool {
        let mut found = false;
        for mut entry in self.active.iter_mut() {
            if *entry == Some(id) {
                *entry = None;
                found = true;
            }
        }
        found
    }
}
