//! Handoff pools: containers that move an item from a producer to exactly one
//! waiting consumer.
//!
//! Three algorithms share the [`Handoff`] contract:
//!
//! - [`FifoQueue`]: mutex and condvar around a `VecDeque`.
//! - [`Rendezvous`]: a lock-free shared queue plus a queue of parked waiters
//!   that producers hand items to directly.
//! - [`Bag`]: per-thread lists of recently released entries over a shared
//!   list, with a sequence-number wait for the slow path.
//!
//! [`AnyHandoff`] selects one of them at runtime from a [`HandoffStrategy`].

mod bag;
mod fifo;
mod rendezvous;

use std::fmt;
use std::time::Instant;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub use bag::Bag;
pub use fifo::FifoQueue;
pub use rendezvous::Rendezvous;

/// Outcome of a blocking [`Handoff::take`].
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub enum Take<T> {
    /// An item no other taker has seen.
    Item(T),
    /// The deadline passed first.
    TimedOut,
    /// The pool was closed.
    Closed,
}

impl<T> Take<T> {
    /// Convert into the item, discarding the failure reason.
    pub fn into_item(self) -> Option<T> {
        match self {
            Self::Item(item) => Some(item),
            Self::TimedOut | Self::Closed => None,
        }
    }
}

/// A concurrent put/take container.
///
/// Implementations guarantee that every item passed to a successful
/// [`put`](Self::put) is returned by exactly one [`take`](Self::take),
/// [`try_take`](Self::try_take) or [`close`](Self::close), and that blocked
/// takers park rather than spin.
pub trait Handoff<T>: Send + Sync {
    /// Make `item` available to one future taker.
    ///
    /// Returns the item back when the pool is closed.
    fn put(&self, item: T) -> Result<(), T>;

    /// Take an item, blocking until one is available, `deadline` passes, or
    /// the pool is closed. `None` waits without bound.
    fn take(&self, deadline: Option<Instant>) -> Take<T>;

    /// Take an item only if one is immediately available.
    fn try_take(&self) -> Option<T>;

    /// Close the pool, wake every blocked taker with [`Take::Closed`], and
    /// hand back the items still queued.
    fn close(&self) -> Vec<T>;

    /// Items currently available.
    fn len(&self) -> usize;

    /// Whether no item is currently available.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takers currently blocked.
    fn waiters(&self) -> usize;

    /// Whether [`close`](Self::close) has been called.
    fn is_closed(&self) -> bool;
}

/// Which handoff algorithm a pool uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum HandoffStrategy {
    /// Mutex and condvar protected queue.
    Fifo,
    /// Direct producer-to-waiter handoff.
    Rendezvous,
    /// Thread-affine free list.
    #[default]
    Bag,
}

impl HandoffStrategy {
    /// Every strategy.
    pub const ALL: [Self; 3] = [Self::Fifo, Self::Rendezvous, Self::Bag];
}

impl fmt::Display for HandoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fifo => write!(f, "fifo"),
            Self::Rendezvous => write!(f, "rendezvous"),
            Self::Bag => write!(f, "bag"),
        }
    }
}

/// A handoff pool whose algorithm is chosen at construction.
pub enum AnyHandoff<T> {
    /// See [`FifoQueue`].
    Fifo(FifoQueue<T>),
    /// See [`Rendezvous`].
    Rendezvous(Rendezvous<T>),
    /// See [`Bag`].
    Bag(Bag<T>),
}

impl<T: Send + 'static> AnyHandoff<T> {
    /// Build an empty pool using `strategy`.
    #[must_use]
    pub fn new(strategy: HandoffStrategy) -> Self {
        match strategy {
            HandoffStrategy::Fifo => Self::Fifo(FifoQueue::new()),
            HandoffStrategy::Rendezvous => Self::Rendezvous(Rendezvous::new()),
            HandoffStrategy::Bag => Self::Bag(Bag::new()),
        }
    }

    /// The algorithm in use.
    #[must_use]
    pub fn strategy(&self) -> HandoffStrategy {
        match self {
            Self::Fifo(_) => HandoffStrategy::Fifo,
            Self::Rendezvous(_) => HandoffStrategy::Rendezvous,
            Self::Bag(_) => HandoffStrategy::Bag,
        }
    }

    fn inner(&self) -> &dyn Handoff<T> {
        match self {
            Self::Fifo(h) => h,
            Self::Rendezvous(h) => h,
            Self::Bag(h) => h,
        }
    }
}

impl<T: Send + 'static> Handoff<T> for AnyHandoff<T> {
    fn put(&self, item: T) -> Result<(), T> {
        self.inner().put(item)
    }

    fn take(&self, deadline: Option<Instant>) -> Take<T> {
        self.inner().take(deadline)
    }

    fn try_take(&self) -> Option<T> {
        self.inner().try_take()
    }

    fn close(&self) -> Vec<T> {
        self.inner().close()
    }

    fn len(&self) -> usize {
        self.inner().len()
    }

    fn waiters(&self) -> usize {
        self.inner().waiters()
    }

    fn is_closed(&self) -> bool {
        self.inner().is_closed()
    }
}

impl<T> fmt::Debug for AnyHandoff<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fifo(_) => "Fifo",
            Self::Rendezvous(_) => "Rendezvous",
            Self::Bag(_) => "Bag",
        };
        f.debug_tuple("AnyHandoff").field(&name).finish()
    }
}
