//! Command and query handler contracts.
//!
//! Handlers receive the live connection and the (possibly absent) transaction
//! rather than the unit of work itself, so the same handler can run against a
//! bare connection. Single and multi-result variants differ only in `Output`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::{DbConnection, UnitOfWorkError};

/// Blocking query. Runs with or without a transaction.
pub trait QueryHandler<C: DbConnection> {
    type Output;
    type Error: From<UnitOfWorkError>;

    fn handle(
        &self,
        connection: &mut C,
        transaction: Option<&C::Transaction>,
    ) -> Result<Self::Output, Self::Error>;
}

/// Cancellable async query.
#[async_trait]
pub trait AsyncQueryHandler<C: DbConnection>: Send + Sync {
    type Output: Send;
    type Error: From<UnitOfWorkError> + Send;

    async fn handle(
        &self,
        connection: &mut C,
        transaction: Option<&C::Transaction>,
        cancel: &CancellationToken,
    ) -> Result<Self::Output, Self::Error>;
}

/// Query whose rows are produced lazily as a stream.
pub trait StreamQueryHandler<C: DbConnection> {
    type Item: Send;
    type Error: From<UnitOfWorkError> + Send;

    fn handle<'c>(
        &'c self,
        connection: &'c mut C,
        transaction: Option<&'c C::Transaction>,
    ) -> BoxStream<'c, Result<Self::Item, Self::Error>>;
}

/// Blocking command.
pub trait CommandHandler<C: DbConnection> {
    type Output;
    type Error: From<UnitOfWorkError>;

    /// Whether the unit of work must hold an active transaction before dispatch.
    fn requires_transaction(&self) -> bool {
        true
    }

    fn handle(
        &self,
        connection: &mut C,
        transaction: Option<&C::Transaction>,
    ) -> Result<Self::Output, Self::Error>;
}

/// Cancellable async command.
#[async_trait]
pub trait AsyncCommandHandler<C: DbConnection>: Send + Sync {
    type Output: Send;
    type Error: From<UnitOfWorkError> + Send;

    /// Whether the unit of work must hold an active transaction before dispatch.
    fn requires_transaction(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        connection: &mut C,
        transaction: Option<&C::Transaction>,
        cancel: &CancellationToken,
    ) -> Result<Self::Output, Self::Error>;
}
