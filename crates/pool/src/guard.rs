//! RAII guard for checked-out connections

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::events::DestroyReason;
use crate::factory::ConnectionFactory;
use crate::handle::{HandleId, Owner};
use crate::pool::{HandleRef, PoolInner};

/// A connection checked out of a [`Pool`](crate::Pool).
///
/// Owns the connection while it is held, so it can be moved to another
/// thread. Dereferences to the connection. Dropping the guard returns the
/// connection to the pool exactly once, including on early returns and
/// unwinding. Use [`invalidate`](Self::invalidate) to have it closed
/// instead, or [`detach`](Self::detach) to take it out of the pool for good.
///
/// A guard for a connection enlisted in a unit of work only releases its
/// borrow on drop; the connection stays checked out until
/// [`Pool::release_enlisted`](crate::Pool::release_enlisted).
pub struct PooledConnection<F: ConnectionFactory> {
    pool: Arc<PoolInner<F>>,
    handle: HandleRef<F>,
    connection: Option<F::Connection>,
    acquired_at: Instant,
    enlisted: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub(crate) fn new(
        pool: Arc<PoolInner<F>>,
        handle: HandleRef<F>,
        connection: F::Connection,
        enlisted: bool,
    ) -> Self {
        Self {
            pool,
            handle,
            connection: Some(connection),
            acquired_at: Instant::now(),
            enlisted,
        }
    }

    /// Identifier of the underlying handle.
    pub fn id(&self) -> HandleId {
        self.handle.id()
    }

    /// When this guard was handed out.
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Who holds the connection, as recorded at checkout.
    pub fn owner(&self) -> Option<Owner> {
        self.handle.owner()
    }

    /// How long this guard has held the connection.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Whether the connection is enlisted in a unit of work.
    pub fn is_enlisted(&self) -> bool {
        self.enlisted
    }

    /// Close the connection instead of returning it.
    pub fn invalidate(mut self) {
        if let Some(connection) = self.connection.take() {
            self.handle.restore_connection(connection);
        }
        tracing::debug!(pool = %self.pool.name, handle = %self.handle.id(), "Connection invalidated");
        self.pool.retire(&self.handle, DestroyReason::Invalidated);
    }

    /// Take the connection out of the pool. The pool frees its slot and
    /// never closes the connection.
    #[must_use]
    pub fn detach(mut self) -> F::Connection {
        let connection = self
            .connection
            .take()
            .expect("guard holds the connection until consumed");
        tracing::debug!(pool = %self.pool.name, handle = %self.handle.id(), "Connection detached");
        self.pool.retire(&self.handle, DestroyReason::Detached);
        connection
    }
}

impl<F: ConnectionFactory> std::ops::Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &F::Connection {
        self.connection
            .as_ref()
            .expect("connection used after release")
    }
}

impl<F: ConnectionFactory> std::ops::DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut F::Connection {
        self.connection
            .as_mut()
            .expect("connection used after release")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            // back in the slot before the handle becomes visible to takers
            self.handle.restore_connection(connection);
            if !self.enlisted {
                self.pool.release(&self.handle, self.acquired_at);
            }
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F>
where
    F::Connection: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.handle.id())
            .field("connection", &self.connection)
            .field("enlisted", &self.enlisted)
            .finish()
    }
}
