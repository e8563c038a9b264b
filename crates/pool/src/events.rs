//! Event broadcasting for pool observability.
//!
//! Provides [`PoolEvent`] variants emitted on the acquire/return path and by
//! housekeeping, and an [`EventBus`] backed by `tokio::sync::broadcast`.

use std::time::Duration;

use tokio::sync::broadcast;

use crate::handle::HandleId;

// ---------------------------------------------------------------------------
// PoolEvent
// ---------------------------------------------------------------------------

/// Events emitted by a pool.
///
/// All variants carry the pool name. Subscribers receive cloned copies via
/// [`EventBus::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A new connection joined the pool.
    Created {
        /// The pool name.
        pool: String,
        /// The new handle.
        handle: HandleId,
        /// How long the factory took.
        elapsed: Duration,
    },
    /// The factory failed to open a connection.
    CreationFailed {
        /// The pool name.
        pool: String,
        /// Human-readable error description.
        error: String,
    },
    /// A connection was handed to a caller.
    Acquired {
        /// The pool name.
        pool: String,
        /// The handle handed out.
        handle: HandleId,
        /// How long the caller waited.
        waited: Duration,
    },
    /// A connection came back to the pool.
    Returned {
        /// The pool name.
        pool: String,
        /// The handle returned.
        handle: HandleId,
        /// How long the caller held it.
        held: Duration,
    },
    /// A caller gave up waiting.
    AcquireTimedOut {
        /// The pool name.
        pool: String,
        /// How long the caller waited.
        waited: Duration,
    },
    /// A checked-out connection has been held past the leak timeout.
    LeakSuspected {
        /// The pool name.
        pool: String,
        /// The suspect handle.
        handle: HandleId,
        /// How long it has been held.
        held: Duration,
    },
    /// A connection left the pool for good.
    Destroyed {
        /// The pool name.
        pool: String,
        /// The destroyed handle.
        handle: HandleId,
        /// Why it was destroyed.
        reason: DestroyReason,
    },
}

impl PoolEvent {
    /// The pool that emitted this event.
    #[must_use]
    pub fn pool(&self) -> &str {
        match self {
            Self::Created { pool, .. }
            | Self::CreationFailed { pool, .. }
            | Self::Acquired { pool, .. }
            | Self::Returned { pool, .. }
            | Self::AcquireTimedOut { pool, .. }
            | Self::LeakSuspected { pool, .. }
            | Self::Destroyed { pool, .. } => pool,
        }
    }
}

// ---------------------------------------------------------------------------
// DestroyReason
// ---------------------------------------------------------------------------

/// Reason a connection was permanently removed from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestroyReason {
    /// The validation sweep found it unusable.
    ValidationFailed,
    /// It sat idle longer than the reap timeout.
    IdleTimeout,
    /// The caller invalidated it through its guard.
    Invalidated,
    /// The caller detached it from the pool.
    Detached,
    /// The pool is shutting down.
    Shutdown,
}

impl std::fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ValidationFailed => write!(f, "validation failed"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Invalidated => write!(f, "invalidated"),
            Self::Detached => write!(f, "detached"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast-based event bus for pool events.
///
/// Emission is fire-and-forget: if no subscribers are listening or the
/// channel is full, events are silently dropped (no backpressure on the
/// acquire path).
pub struct EventBus {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer size.
    ///
    /// A zero buffer is raised to one.
    #[must_use]
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: PoolEvent) {
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }

    /// Whether anyone is listening; lets callers skip building events.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    /// Subscribe to events emitted after this call.
    ///
    /// A subscriber that falls more than `buffer_size` events behind gets a
    /// `Lagged` error and skips to the latest.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.sender.receiver_count())
            .finish()
    }
}
