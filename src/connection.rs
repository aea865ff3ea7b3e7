use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{IsolationLevel, UnitOfWorkError, UnitOfWorkResult};

/// A transaction scoped to exactly one [`DbConnection`].
pub trait DbTransaction: Send + Sync {
    fn isolation_level(&self) -> IsolationLevel;

    /// True once the transaction has been committed or rolled back.
    fn is_completed(&self) -> bool;
}

/// Driver-level database connection consumed by the unit of work.
///
/// Transaction operations take the transaction handle explicitly because the
/// handle cannot outlive or borrow the connection it belongs to. Every
/// operation comes in a blocking and a cancellable async form.
#[async_trait]
pub trait DbConnection: Send + Sized {
    type Transaction: DbTransaction;

    /// Command bound to this connection and, optionally, its transaction.
    type Command<'c>
    where
        Self: 'c;

    /// Open a new physical connection.
    fn open(connection_string: &str) -> UnitOfWorkResult<Self>;

    /// Open a new physical connection without blocking the caller.
    ///
    /// A partially opened connection must be released by the implementation
    /// when `cancel` fires.
    async fn open_async(
        connection_string: &str,
        cancel: &CancellationToken,
    ) -> UnitOfWorkResult<Self>;

    fn is_open(&self) -> bool;

    fn create_command<'c>(
        &'c mut self,
        text: &str,
        transaction: Option<&'c Self::Transaction>,
    ) -> Self::Command<'c>;

    fn begin_transaction(&mut self, level: IsolationLevel) -> UnitOfWorkResult<Self::Transaction>;

    async fn begin_transaction_async(
        &mut self,
        level: IsolationLevel,
        cancel: &CancellationToken,
    ) -> UnitOfWorkResult<Self::Transaction>;

    fn commit(&mut self, transaction: &mut Self::Transaction) -> UnitOfWorkResult<()>;

    async fn commit_async(
        &mut self,
        transaction: &mut Self::Transaction,
        cancel: &CancellationToken,
    ) -> UnitOfWorkResult<()>;

    fn rollback(&mut self, transaction: &mut Self::Transaction) -> UnitOfWorkResult<()>;

    async fn rollback_async(
        &mut self,
        transaction: &mut Self::Transaction,
        cancel: &CancellationToken,
    ) -> UnitOfWorkResult<()>;

    /// Dispose of a transaction handle, rolling it back if still pending.
    fn release_transaction(&mut self, transaction: Self::Transaction) -> UnitOfWorkResult<()>;

    async fn release_transaction_async(
        &mut self,
        transaction: Self::Transaction,
    ) -> UnitOfWorkResult<()>;

    /// Close the physical connection.
    fn close(self) -> UnitOfWorkResult<()>;

    async fn close_async(self) -> UnitOfWorkResult<()>;
}

/// Run `operation` unless `cancel` has fired, racing it against the token.
///
/// Dropping the in-flight driver future is how cancellation is forwarded;
/// the driver decides what that means for the wire state.
pub async fn run_cancellable<F, T>(cancel: &CancellationToken, operation: F) -> UnitOfWorkResult<T>
where
    F: Future<Output = UnitOfWorkResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(UnitOfWorkError::Cancelled);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(UnitOfWorkError::Cancelled),
        result = operation => result,
    }
}
