//! # Reservoir Pool
//!
//! A concurrent pool of reusable connections for synchronous callers.
//! Provides bounded sizing, pre-fill, three interchangeable handoff
//! strategies, per-thread affinity, background validation, leak detection
//! and idle reaping, lifecycle listeners and a broadcast event stream.

pub mod config;
pub mod error;
pub mod events;
pub mod factory;
pub mod guard;
pub mod handle;
pub mod handoff;
pub mod listener;
pub mod pool;
pub mod state;
pub mod stats;
pub mod transaction;

mod housekeeping;
mod local;

pub use config::{PoolConfig, PrefillMode};
pub use error::{BoxError, Error, Result};
pub use events::{DestroyReason, EventBus, PoolEvent};
pub use factory::{ConnectionFactory, FnFactory};
pub use guard::PooledConnection;
pub use handle::{HandleId, HandleInfo, Owner};
pub use handoff::{AnyHandoff, Bag, FifoQueue, Handoff, HandoffStrategy, Rendezvous, Take};
pub use listener::{FactoryError, PoolListener, TracingListener};
pub use pool::{Pool, PoolBuilder};
pub use state::{AtomicState, State};
pub use stats::PoolStats;
pub use transaction::{ThreadUnitOfWork, UnitOfWork};
