use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::handler::{
    AsyncCommandHandler, AsyncQueryHandler, CommandHandler, QueryHandler, StreamQueryHandler,
};
use crate::{DbConnection, DbTransaction, IsolationLevel, PgDbConnection, UnitOfWorkError, UnitOfWorkResult};

/// Unit of Work over one open connection and at most one transaction.
///
/// Handlers dispatched through the unit of work receive the connection and
/// transaction that are current at dispatch time. A unit of work is meant for
/// one sequential caller; it is never shared between concurrent operations.
///
/// Call [`dispose`](Self::dispose) or [`dispose_async`](Self::dispose_async)
/// to release the transaction and connection gracefully. Dropping a unit of
/// work that still owns its resources releases the handles without waiting on
/// the server.
pub struct UnitOfWork<C: DbConnection = PgDbConnection> {
    id: Uuid,
    state: UnitOfWorkState<C>,
}

enum UnitOfWorkState<C: DbConnection> {
    Active {
        connection: C,
        transaction: Option<C::Transaction>,
    },
    Disposed,
}

impl<C: DbConnection> UnitOfWork<C> {
    /// Wrap an already open connection.
    pub fn new(connection: C) -> Self {
        let id = Uuid::new_v4();
        debug!(unit_of_work = %id, "Unit of work created");
        Self {
            id,
            state: UnitOfWorkState::Active {
                connection,
                transaction: None,
            },
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.state, UnitOfWorkState::Disposed)
    }

    pub fn connection(&self) -> UnitOfWorkResult<&C> {
        match &self.state {
            UnitOfWorkState::Active { connection, .. } => Ok(connection),
            UnitOfWorkState::Disposed => Err(UnitOfWorkError::Disposed),
        }
    }

    /// The current transaction handle, including one that already completed.
    pub fn transaction(&self) -> UnitOfWorkResult<Option<&C::Transaction>> {
        match &self.state {
            UnitOfWorkState::Active { transaction, .. } => Ok(transaction.as_ref()),
            UnitOfWorkState::Disposed => Err(UnitOfWorkError::Disposed),
        }
    }

    /// True when a transaction has been started and not yet completed.
    pub fn has_active_transaction(&self) -> bool {
        matches!(self.transaction(), Ok(Some(transaction)) if !transaction.is_completed())
    }

    /// Build a command bound to the current connection and transaction.
    pub fn create_command(&mut self, text: &str) -> UnitOfWorkResult<C::Command<'_>> {
        let (connection, transaction) = self.parts_mut()?;
        Ok(connection.create_command(text, transaction.as_ref()))
    }

    /// Start a transaction at `level`.
    ///
    /// A previous transaction handle is replaced. If it is still pending it is
    /// released (rolled back) first.
    pub fn begin(&mut self, level: IsolationLevel) -> UnitOfWorkResult<()> {
        let id = self.id;
        let (connection, transaction) = self.parts_mut()?;

        if let Some(previous) = transaction.take() {
            if !previous.is_completed() {
                warn!(unit_of_work = %id, "Replacing a pending transaction");
                connection.release_transaction(previous)?;
            }
        }

        let started = connection.begin_transaction(level)?;
        debug!(unit_of_work = %id, isolation_level = %level, "Transaction started");
        *transaction = Some(started);
        Ok(())
    }

    /// Start a transaction at `level` without blocking.
    ///
    /// If `cancel` fires before the transaction is established no transaction
    /// is set.
    pub async fn begin_async(
        &mut self,
        level: IsolationLevel,
        cancel: &CancellationToken,
    ) -> UnitOfWorkResult<()> {
        let id = self.id;
        let (connection, transaction) = self.parts_mut()?;
        if cancel.is_cancelled() {
            return Err(UnitOfWorkError::Cancelled);
        }

        if let Some(previous) = transaction.take() {
            if !previous.is_completed() {
                warn!(unit_of_work = %id, "Replacing a pending transaction");
                connection.release_transaction_async(previous).await?;
            }
        }

        let started = connection.begin_transaction_async(level, cancel).await?;
        debug!(unit_of_work = %id, isolation_level = %level, "Transaction started");
        *transaction = Some(started);
        Ok(())
    }

    pub fn commit(&mut self) -> UnitOfWorkResult<()> {
        let id = self.id;
        let (connection, transaction) = self.parts_mut()?;
        let transaction = pending(id, transaction, "commit")?;
        connection.commit(transaction)?;
        debug!(unit_of_work = %id, "Transaction committed");
        Ok(())
    }

    pub async fn commit_async(&mut self, cancel: &CancellationToken) -> UnitOfWorkResult<()> {
        let id = self.id;
        let (connection, transaction) = self.parts_mut()?;
        let transaction = pending(id, transaction, "commit")?;
        if cancel.is_cancelled() {
            return Err(UnitOfWorkError::Cancelled);
        }
        connection.commit_async(transaction, cancel).await?;
        debug!(unit_of_work = %id, "Transaction committed");
        Ok(())
    }

    pub fn rollback(&mut self) -> UnitOfWorkResult<()> {
        let id = self.id;
        let (connection, transaction) = self.parts_mut()?;
        let transaction = pending(id, transaction, "roll back")?;
        connection.rollback(transaction)?;
        debug!(unit_of_work = %id, "Transaction rolled back");
        Ok(())
    }

    pub async fn rollback_async(&mut self, cancel: &CancellationToken) -> UnitOfWorkResult<()> {
        let id = self.id;
        let (connection, transaction) = self.parts_mut()?;
        let transaction = pending(id, transaction, "roll back")?;
        if cancel.is_cancelled() {
            return Err(UnitOfWorkError::Cancelled);
        }
        connection.rollback_async(transaction, cancel).await?;
        debug!(unit_of_work = %id, "Transaction rolled back");
        Ok(())
    }

    /// Run a query handler. Queries run with or without a transaction.
    pub fn run_query_handler<H>(&mut self, handler: &H) -> Result<H::Output, H::Error>
    where
        H: QueryHandler<C>,
    {
        let (connection, transaction) = self.parts_mut()?;
        handler.handle(connection, transaction.as_ref())
    }

    pub async fn run_query_handler_async<H>(
        &mut self,
        handler: &H,
        cancel: &CancellationToken,
    ) -> Result<H::Output, H::Error>
    where
        H: AsyncQueryHandler<C>,
    {
        let (connection, transaction) = self.parts_mut()?;
        if cancel.is_cancelled() {
            return Err(UnitOfWorkError::Cancelled.into());
        }
        handler.handle(connection, transaction.as_ref(), cancel).await
    }

    /// Run a streaming query handler; rows are produced as the stream is polled.
    pub fn run_stream_query_handler<'a, H>(
        &'a mut self,
        handler: &'a H,
    ) -> Result<BoxStream<'a, Result<H::Item, H::Error>>, H::Error>
    where
        H: StreamQueryHandler<C>,
    {
        let (connection, transaction) = self.parts_mut()?;
        Ok(handler.handle(connection, transaction.as_ref()))
    }

    /// Run a command handler, enforcing its transaction requirement.
    pub fn run_command_handler<H>(&mut self, handler: &H) -> Result<H::Output, H::Error>
    where
        H: CommandHandler<C>,
    {
        let id = self.id;
        let (connection, transaction) = self.parts_mut()?;
        if handler.requires_transaction() {
            ensure_transaction::<C, H>(id, transaction)?;
        }
        handler.handle(connection, transaction.as_ref())
    }

    pub async fn run_command_handler_async<H>(
        &mut self,
        handler: &H,
        cancel: &CancellationToken,
    ) -> Result<H::Output, H::Error>
    where
        H: AsyncCommandHandler<C>,
    {
        let id = self.id;
        let (connection, transaction) = self.parts_mut()?;
        if handler.requires_transaction() {
            ensure_transaction::<C, H>(id, transaction)?;
        }
        if cancel.is_cancelled() {
            return Err(UnitOfWorkError::Cancelled.into());
        }
        handler.handle(connection, transaction.as_ref(), cancel).await
    }

    /// Release the transaction (if any) and then the connection.
    ///
    /// Only the first call releases anything. The connection is closed even
    /// when releasing the transaction fails; both failures are reported.
    pub fn dispose(&mut self) -> UnitOfWorkResult<()> {
        let Some((mut connection, transaction)) = self.take_resources() else {
            return Ok(());
        };

        let mut failures = Vec::new();
        if let Some(transaction) = transaction {
            if let Err(error) = connection.release_transaction(transaction) {
                warn!(unit_of_work = %self.id, %error, "Failed to release transaction");
                failures.push(error);
            }
        }
        if let Err(error) = connection.close() {
            warn!(unit_of_work = %self.id, %error, "Failed to close connection");
            failures.push(error);
        }

        debug!(unit_of_work = %self.id, "Unit of work disposed");
        release_outcome(failures)
    }

    /// Async counterpart of [`dispose`](Self::dispose).
    pub async fn dispose_async(&mut self) -> UnitOfWorkResult<()> {
        let Some((mut connection, transaction)) = self.take_resources() else {
            return Ok(());
        };

        let mut failures = Vec::new();
        if let Some(transaction) = transaction {
            if let Err(error) = connection.release_transaction_async(transaction).await {
                warn!(unit_of_work = %self.id, %error, "Failed to release transaction");
                failures.push(error);
            }
        }
        if let Err(error) = connection.close_async().await {
            warn!(unit_of_work = %self.id, %error, "Failed to close connection");
            failures.push(error);
        }

        debug!(unit_of_work = %self.id, "Unit of work disposed");
        release_outcome(failures)
    }

    /// One-shot transition from owning resources to disposed.
    fn take_resources(&mut self) -> Option<(C, Option<C::Transaction>)> {
        match std::mem::replace(&mut self.state, UnitOfWorkState::Disposed) {
            UnitOfWorkState::Active {
                connection,
                transaction,
            } => Some((connection, transaction)),
            UnitOfWorkState::Disposed => None,
        }
    }

    fn parts_mut(&mut self) -> UnitOfWorkResult<(&mut C, &mut Option<C::Transaction>)> {
        match &mut self.state {
            UnitOfWorkState::Active {
                connection,
                transaction,
            } => Ok((connection, transaction)),
            UnitOfWorkState::Disposed => Err(UnitOfWorkError::Disposed),
        }
    }
}

impl<C: DbConnection> Drop for UnitOfWork<C> {
    fn drop(&mut self) {
        if let UnitOfWorkState::Active { transaction, .. } = &self.state {
            debug!(
                unit_of_work = %self.id,
                pending_transaction = transaction.as_ref().is_some_and(|t| !t.is_completed()),
                "Unit of work dropped without dispose"
            );
        }
    }
}

impl<C: DbConnection> std::fmt::Debug for UnitOfWork<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .field("active_transaction", &self.has_active_transaction())
            .finish()
    }
}

fn pending<'t, T: DbTransaction>(
    id: Uuid,
    transaction: &'t mut Option<T>,
    operation: &'static str,
) -> UnitOfWorkResult<&'t mut T> {
    match transaction {
        Some(transaction) if !transaction.is_completed() => Ok(transaction),
        Some(_) => {
            warn!(unit_of_work = %id, operation, "Transaction already completed");
            Err(UnitOfWorkError::TransactionCompleted { operation })
        }
        None => {
            warn!(unit_of_work = %id, operation, "No transaction has been started");
            Err(UnitOfWorkError::NoActiveTransaction { operation })
        }
    }
}

fn ensure_transaction<C: DbConnection, H>(
    id: Uuid,
    transaction: &Option<C::Transaction>,
) -> UnitOfWorkResult<()> {
    if transaction.as_ref().is_some_and(|t| !t.is_completed()) {
        return Ok(());
    }
    let handler = std::any::type_name::<H>();
    warn!(unit_of_work = %id, handler, "Handler requires an active transaction");
    Err(UnitOfWorkError::TransactionRequired { handler })
}

fn release_outcome(mut failures: Vec<UnitOfWorkError>) -> UnitOfWorkResult<()> {
    match failures.len() {
        0 => Ok(()),
        1 => Err(failures.remove(0)),
        _ => Err(UnitOfWorkError::Release(failures)),
    }
}
