//! Lifecycle listeners.
//!
//! Listeners observe the pool and never influence control flow: every hook is
//! fire-and-forget and a panicking listener is caught, logged and skipped.

use std::error::Error as StdError;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::Error;
use crate::handle::{HandleId, Owner};

/// Error reported by a factory, as seen by listeners.
pub type FactoryError<'a> = &'a (dyn StdError + Send + Sync + 'static);

/// Observer of pool lifecycle events.
///
/// All methods default to no-ops, so implementations override only what they
/// need. Hooks run inline on the thread that triggered them and should return
/// quickly.
#[allow(unused_variables)]
pub trait PoolListener: Send + Sync {
    /// The factory is about to be asked for a connection.
    fn before_create(&self, pool: &str) {}

    /// The factory returned, successfully or not.
    fn after_create(&self, pool: &str, result: Result<HandleId, FactoryError<'_>>, elapsed: Duration) {}

    /// A caller entered `acquire`.
    fn before_acquire(&self, pool: &str) {}

    /// `acquire` finished.
    fn after_acquire(&self, pool: &str, result: Result<HandleId, &Error>, waited: Duration) {}

    /// A connection came back to the pool.
    fn after_return(&self, pool: &str, handle: HandleId, held: Duration) {}

    /// The validation sweep probed an idle connection.
    fn on_validation(&self, pool: &str, handle: HandleId, valid: bool) {}

    /// A checked-out connection has been held longer than the leak timeout.
    fn on_leak(&self, pool: &str, handle: HandleId, owner: Option<&Owner>, held: Duration) {}

    /// An idle connection was reaped.
    fn on_timeout(&self, pool: &str, handle: HandleId, idle: Duration) {}

    /// A connection was closed and left the pool.
    fn on_close(&self, pool: &str, handle: HandleId, result: Result<(), FactoryError<'_>>) {}

    /// Something unexpected happened that did not fail any caller.
    fn on_warning(&self, pool: &str, message: &str) {}
}

/// Registered listeners of one pool.
#[derive(Default)]
pub(crate) struct Listeners {
    listeners: RwLock<Vec<Arc<dyn PoolListener>>>,
}

impl Listeners {
    pub(crate) fn register(&self, listener: Arc<dyn PoolListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Call `hook` on every listener, isolating panics.
    pub(crate) fn notify(&self, pool: &str, name: &'static str, hook: impl Fn(&dyn PoolListener)) {
        // Snapshot so listeners may register further listeners.
        let listeners: Vec<Arc<dyn PoolListener>> = {
            let guard = self.listeners.read();
            if guard.is_empty() {
                return;
            }
            guard.clone()
        };
        for listener in &listeners {
            if catch_unwind(AssertUnwindSafe(|| hook(listener.as_ref()))).is_err() {
                tracing::warn!(pool, hook = name, "Pool listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}

/// Listener that writes every event to `tracing` at debug level, and leaks
/// and warnings at warn level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl PoolListener for TracingListener {
    fn after_create(&self, pool: &str, result: Result<HandleId, FactoryError<'_>>, elapsed: Duration) {
        match result {
            Ok(handle) => tracing::debug!(pool, %handle, ?elapsed, "Connection created"),
            Err(error) => tracing::debug!(pool, %error, ?elapsed, "Connection creation failed"),
        }
    }

    fn after_acquire(&self, pool: &str, result: Result<HandleId, &Error>, waited: Duration) {
        match result {
            Ok(handle) => tracing::debug!(pool, %handle, ?waited, "Connection acquired"),
            Err(error) => tracing::debug!(pool, %error, ?waited, "Acquire failed"),
        }
    }

    fn after_return(&self, pool: &str, handle: HandleId, held: Duration) {
        tracing::debug!(pool, %handle, ?held, "Connection returned");
    }

    fn on_validation(&self, pool: &str, handle: HandleId, valid: bool) {
        tracing::debug!(pool, %handle, valid, "Connection validated");
    }

    fn on_leak(&self, pool: &str, handle: HandleId, owner: Option<&Owner>, held: Duration) {
        match owner {
            Some(owner) => tracing::warn!(pool, %handle, %owner, ?held, "Connection leak suspected"),
            None => tracing::warn!(pool, %handle, ?held, "Connection leak suspected"),
        }
    }

    fn on_timeout(&self, pool: &str, handle: HandleId, idle: Duration) {
        tracing::debug!(pool, %handle, ?idle, "Idle connection reaped");
    }

    fn on_close(&self, pool: &str, handle: HandleId, result: Result<(), FactoryError<'_>>) {
        if let Err(error) = result {
            tracing::debug!(pool, %handle, %error, "Connection closed with error");
        } else {
            tracing::debug!(pool, %handle, "Connection closed");
        }
    }

    fn on_warning(&self, pool: &str, message: &str) {
        tracing::warn!(pool, warning = message, "Pool warning");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        validations: AtomicUsize,
    }

    impl PoolListener for Counter {
        fn on_validation(&self, _pool: &str, _handle: HandleId, _valid: bool) {
            self.validations.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicky;

    impl PoolListener for Panicky {
        fn on_validation(&self, _pool: &str, _handle: HandleId, _valid: bool) {
            panic!("listener bug");
        }
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let listeners = Listeners::default();
        let counter = Arc::new(Counter::default());
        listeners.register(Arc::new(Panicky));
        listeners.register(counter.clone());

        listeners.notify("db", "on_validation", |l| {
            l.on_validation("db", HandleId::new(1), true);
        });
        assert_eq!(counter.validations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tracing_listener_accepts_every_hook() {
        let listener = TracingListener;
        let error = std::io::Error::other("boom");
        listener.before_create("db");
        listener.after_create("db", Err(&error), Duration::ZERO);
        listener.after_create("db", Ok(HandleId::new(1)), Duration::ZERO);
        listener.on_leak("db", HandleId::new(1), None, Duration::from_secs(3));
        listener.on_close("db", HandleId::new(1), Err(&error));
        listener.on_warning("db", "careful");
    }
}
