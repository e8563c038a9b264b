//! Connection factory trait.
//!
//! The pool never speaks a wire protocol itself. Opening, probing and closing
//! a physical connection is delegated to a [`ConnectionFactory`] supplied by
//! the embedding application.

use crate::error::BoxError;

/// Creates, validates and closes physical connections.
///
/// All methods are called from blocking contexts: the caller's thread on the
/// acquire path, or a blocking housekeeping task. They may block on I/O.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The connection type handed out by the pool.
    type Connection: Send + 'static;

    /// Open a new connection.
    fn create(&self) -> Result<Self::Connection, BoxError>;

    /// Check whether an idle connection is still usable.
    ///
    /// A panic is treated as `false`.
    fn is_valid(&self, _connection: &mut Self::Connection) -> bool {
        true
    }

    /// Close a connection that is permanently leaving the pool.
    ///
    /// Errors are logged and otherwise ignored.
    fn close(&self, connection: Self::Connection) -> Result<(), BoxError> {
        drop(connection);
        Ok(())
    }
}

/// Factory built from a plain creation closure.
///
/// Connections are always considered valid and are closed by dropping them.
///
/// ```
/// use reservoir_pool::{ConnectionFactory, FnFactory};
///
/// let factory = FnFactory::new(|| Ok::<_, reservoir_pool::BoxError>(String::from("conn")));
/// assert_eq!(factory.create().unwrap(), "conn");
/// ```
pub struct FnFactory<F> {
    create: F,
}

impl<F> FnFactory<F> {
    /// Wrap `create`.
    pub fn new(create: F) -> Self {
        Self { create }
    }
}

impl<F, C> ConnectionFactory for FnFactory<F>
where
    F: Fn() -> Result<C, BoxError> + Send + Sync + 'static,
    C: Send + 'static,
{
    type Connection = C;

    fn create(&self) -> Result<C, BoxError> {
        (self.create)()
    }
}

impl<F> std::fmt::Debug for FnFactory<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnFactory").finish_non_exhaustive()
    }
}
