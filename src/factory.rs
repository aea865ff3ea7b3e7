use std::marker::PhantomData;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{config, DbConnection, PgDbConnection, UnitOfWork, UnitOfWorkResult};

/// Creates units of work, each over a freshly opened physical connection.
///
/// The factory keeps only the connection string; it never holds on to the
/// connections it opens.
pub struct UnitOfWorkFactory<C: DbConnection = PgDbConnection> {
    connection_string: String,
    _connection: PhantomData<fn() -> C>,
}

impl<C: DbConnection> UnitOfWorkFactory<C> {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            _connection: PhantomData,
        }
    }

    /// Create a factory from the `DATABASE_URL` environment variable.
    pub fn from_env() -> UnitOfWorkResult<Self> {
        Ok(Self::new(config::database_url()?))
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Open a connection and wrap it in a new unit of work.
    ///
    /// Open failures are returned unchanged.
    pub fn create(&self) -> UnitOfWorkResult<UnitOfWork<C>> {
        let connection = C::open(&self.connection_string)?;
        let unit_of_work = UnitOfWork::new(connection);
        debug!(unit_of_work = %unit_of_work.id(), "Unit of work opened");
        Ok(unit_of_work)
    }

    /// Open a connection without blocking and wrap it in a new unit of work.
    ///
    /// When `cancel` fires first, no unit of work is returned and releasing
    /// the half-open connection is left to the driver.
    pub async fn create_async(&self, cancel: &CancellationToken) -> UnitOfWorkResult<UnitOfWork<C>> {
        if cancel.is_cancelled() {
            return Err(crate::UnitOfWorkError::Cancelled);
        }
        let connection = C::open_async(&self.connection_string, cancel).await?;
        let unit_of_work = UnitOfWork::new(connection);
        debug!(unit_of_work = %unit_of_work.id(), "Unit of work opened");
        Ok(unit_of_work)
    }
}

impl<C: DbConnection> Clone for UnitOfWorkFactory<C> {
    fn clone(&self) -> Self {
        Self::new(self.connection_string.clone())
    }
}

impl<C: DbConnection> std::fmt::Debug for UnitOfWorkFactory<C> {
    // The connection string usually carries credentials.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWorkFactory").finish_non_exhaustive()
    }
}
