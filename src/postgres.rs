//! PostgreSQL driver for the unit of work.
//!
//! Transactions are driven with plain `BEGIN` / `COMMIT` / `ROLLBACK`
//! statements on the owned connection, so every command issued on the
//! connection while a transaction is pending runs inside it.

use async_trait::async_trait;
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Arguments, Connection, Encode, Executor, PgConnection, Postgres, Type};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::blocking::BlockingContext;
use crate::connection::run_cancellable;
use crate::{DbConnection, DbTransaction, IsolationLevel, UnitOfWorkError, UnitOfWorkResult};

/// Owned PostgreSQL connection plus the context used for its blocking API.
pub struct PgDbConnection {
    // Declared before `blocking` so the socket is dropped while its runtime
    // is still alive.
    session: PgSession,
    blocking: BlockingContext,
}

impl PgDbConnection {
    fn new(connection: PgConnection, blocking: BlockingContext) -> Self {
        Self {
            session: PgSession {
                connection,
                broken: false,
            },
            blocking,
        }
    }

    /// Raw sqlx connection, usable as an `Executor` by handlers.
    pub fn as_executor(&mut self) -> &mut PgConnection {
        &mut self.session.connection
    }
}

impl std::fmt::Debug for PgDbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDbConnection")
            .field("broken", &self.session.broken)
            .field("blocking", &self.blocking)
            .finish_non_exhaustive()
    }
}

/// The socket plus whether a driver call has found it unusable.
struct PgSession {
    connection: PgConnection,
    broken: bool,
}

impl PgSession {
    fn observe<T>(&mut self, result: Result<T, sqlx::Error>) -> UnitOfWorkResult<T> {
        if let Err(error) = &result {
            if breaks_connection(error) && !self.broken {
                warn!(%error, "Connection lost");
                self.broken = true;
            }
        }
        Ok(result?)
    }

    async fn run_raw(&mut self, statement: &str) -> UnitOfWorkResult<()> {
        let result = (&mut self.connection).execute(sqlx::raw_sql(statement)).await;
        self.observe(result).map(drop)
    }
}

/// Errors after which the connection cannot be used again.
fn breaks_connection(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => true,
        // SQLSTATE classes 08 (connection exception) and 57P (operator intervention)
        sqlx::Error::Database(error) => error
            .code()
            .is_some_and(|code| code.starts_with("08") || code.starts_with("57P")),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    Pending,
    Committed,
    RolledBack,
}

/// Handle to a transaction running on a [`PgDbConnection`].
#[derive(Debug)]
pub struct PgDbTransaction {
    id: Uuid,
    isolation_level: IsolationLevel,
    state: TransactionState,
}

impl PgDbTransaction {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_committed(&self) -> bool {
        self.state == TransactionState::Committed
    }

    pub fn is_rolled_back(&self) -> bool {
        self.state == TransactionState::RolledBack
    }
}

impl DbTransaction for PgDbTransaction {
    fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    fn is_completed(&self) -> bool {
        self.state != TransactionState::Pending
    }
}

/// SQL command bound to a connection and the transaction current when it
/// was created.
pub struct PgDbCommand<'c> {
    session: &'c mut PgSession,
    blocking: &'c BlockingContext,
    transaction: Option<&'c PgDbTransaction>,
    text: String,
    arguments: PgArguments,
    bind_error: Option<BoxDynError>,
}

impl<'c> PgDbCommand<'c> {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn transaction(&self) -> Option<&PgDbTransaction> {
        self.transaction
    }

    /// Bind the next positional parameter (`$1`, `$2`, ...).
    pub fn bind<T>(mut self, value: T) -> Self
    where
        T: 'c + Encode<'c, Postgres> + Type<Postgres> + Send,
    {
        if self.bind_error.is_none() {
            if let Err(error) = self.arguments.add(value) {
                self.bind_error = Some(error);
            }
        }
        self
    }

    /// Execute the command, returning the number of affected rows.
    pub async fn execute(self) -> UnitOfWorkResult<u64> {
        let (session, text, arguments) = self.into_parts()?;
        let result = sqlx::query_with(&text, arguments)
            .execute(&mut session.connection)
            .await;
        Ok(session.observe(result)?.rows_affected())
    }

    pub async fn fetch_all(self) -> UnitOfWorkResult<Vec<PgRow>> {
        let (session, text, arguments) = self.into_parts()?;
        let result = sqlx::query_with(&text, arguments)
            .fetch_all(&mut session.connection)
            .await;
        session.observe(result)
    }

    pub async fn fetch_optional(self) -> UnitOfWorkResult<Option<PgRow>> {
        let (session, text, arguments) = self.into_parts()?;
        let result = sqlx::query_with(&text, arguments)
            .fetch_optional(&mut session.connection)
            .await;
        session.observe(result)
    }

    pub async fn fetch_one(self) -> UnitOfWorkResult<PgRow> {
        let (session, text, arguments) = self.into_parts()?;
        let result = sqlx::query_with(&text, arguments)
            .fetch_one(&mut session.connection)
            .await;
        session.observe(result)
    }

    pub fn execute_blocking(self) -> UnitOfWorkResult<u64> {
        let blocking = self.blocking;
        blocking.block_on(self.execute())?
    }

    pub fn fetch_all_blocking(self) -> UnitOfWorkResult<Vec<PgRow>> {
        let blocking = self.blocking;
        blocking.block_on(self.fetch_all())?
    }

    pub fn fetch_optional_blocking(self) -> UnitOfWorkResult<Option<PgRow>> {
        let blocking = self.blocking;
        blocking.block_on(self.fetch_optional())?
    }

    pub fn fetch_one_blocking(self) -> UnitOfWorkResult<PgRow> {
        let blocking = self.blocking;
        blocking.block_on(self.fetch_one())?
    }

    fn into_parts(self) -> UnitOfWorkResult<(&'c mut PgSession, String, PgArguments)> {
        if let Some(error) = self.bind_error {
            return Err(sqlx::Error::Encode(error).into());
        }
        Ok((self.session, self.text, self.arguments))
    }
}

async fn begin_on(session: &mut PgSession, level: IsolationLevel) -> UnitOfWorkResult<PgDbTransaction> {
    let statement = format!("BEGIN ISOLATION LEVEL {}", level.as_sql());
    session.run_raw(&statement).await?;

    let transaction = PgDbTransaction {
        id: Uuid::new_v4(),
        isolation_level: level,
        state: TransactionState::Pending,
    };
    debug!(transaction = %transaction.id, isolation_level = %level, "BEGIN");
    Ok(transaction)
}

async fn finish_on(
    session: &mut PgSession,
    transaction: &mut PgDbTransaction,
    outcome: TransactionState,
) -> UnitOfWorkResult<()> {
    let (statement, operation) = match outcome {
        TransactionState::Committed => ("COMMIT", "commit"),
        _ => ("ROLLBACK", "roll back"),
    };
    if transaction.state != TransactionState::Pending {
        return Err(UnitOfWorkError::TransactionCompleted { operation });
    }

    session.run_raw(statement).await?;
    transaction.state = outcome;
    debug!(transaction = %transaction.id, "{statement}");
    Ok(())
}

async fn release_on(session: &mut PgSession, mut transaction: PgDbTransaction) -> UnitOfWorkResult<()> {
    if transaction.is_completed() {
        return Ok(());
    }
    finish_on(session, &mut transaction, TransactionState::RolledBack).await
}

/// Transaction statements are never raced against the token: once one has
/// been written to the socket the handle must reflect it, so the token is
/// only checked before sending.
fn check_cancelled(cancel: &CancellationToken) -> UnitOfWorkResult<()> {
    if cancel.is_cancelled() {
        return Err(UnitOfWorkError::Cancelled);
    }
    Ok(())
}

#[async_trait]
impl DbConnection for PgDbConnection {
    type Transaction = PgDbTransaction;
    type Command<'c> = PgDbCommand<'c>;

    fn open(connection_string: &str) -> UnitOfWorkResult<Self> {
        let blocking = BlockingContext::dedicated()?;
        let connection = blocking.block_on(PgConnection::connect(connection_string))??;
        debug!("Connection opened");
        Ok(Self::new(connection, blocking))
    }

    async fn open_async(
        connection_string: &str,
        cancel: &CancellationToken,
    ) -> UnitOfWorkResult<Self> {
        // Dropping the connect future on cancellation drops the half-open socket.
        let connection = run_cancellable(cancel, async {
            PgConnection::connect(connection_string)
                .await
                .map_err(UnitOfWorkError::from)
        })
        .await?;
        debug!("Connection opened");
        Ok(Self::new(connection, BlockingContext::current()?))
    }

    fn is_open(&self) -> bool {
        !self.session.broken
    }

    fn create_command<'c>(
        &'c mut self,
        text: &str,
        transaction: Option<&'c PgDbTransaction>,
    ) -> PgDbCommand<'c> {
        PgDbCommand {
            session: &mut self.session,
            blocking: &self.blocking,
            transaction,
            text: text.to_owned(),
            arguments: PgArguments::default(),
            bind_error: None,
        }
    }

    fn begin_transaction(&mut self, level: IsolationLevel) -> UnitOfWorkResult<PgDbTransaction> {
        let Self { session, blocking } = self;
        blocking.block_on(begin_on(session, level))?
    }

    async fn begin_transaction_async(
        &mut self,
        level: IsolationLevel,
        cancel: &CancellationToken,
    ) -> UnitOfWorkResult<PgDbTransaction> {
        check_cancelled(cancel)?;
        begin_on(&mut self.session, level).await
    }

    fn commit(&mut self, transaction: &mut PgDbTransaction) -> UnitOfWorkResult<()> {
        let Self { session, blocking } = self;
        blocking.block_on(finish_on(session, transaction, TransactionState::Committed))?
    }

    async fn commit_async(
        &mut self,
        transaction: &mut PgDbTransaction,
        cancel: &CancellationToken,
    ) -> UnitOfWorkResult<()> {
        check_cancelled(cancel)?;
        finish_on(&mut self.session, transaction, TransactionState::Committed).await
    }

    fn rollback(&mut self, transaction: &mut PgDbTransaction) -> UnitOfWorkResult<()> {
        let Self { session, blocking } = self;
        blocking.block_on(finish_on(session, transaction, TransactionState::RolledBack))?
    }

    async fn rollback_async(
        &mut self,
        transaction: &mut PgDbTransaction,
        cancel: &CancellationToken,
    ) -> UnitOfWorkResult<()> {
        check_cancelled(cancel)?;
        finish_on(&mut self.session, transaction, TransactionState::RolledBack).await
    }

    fn release_transaction(&mut self, transaction: PgDbTransaction) -> UnitOfWorkResult<()> {
        let Self { session, blocking } = self;
        blocking.block_on(release_on(session, transaction))?
    }

    async fn release_transaction_async(
        &mut self,
        transaction: PgDbTransaction,
    ) -> UnitOfWorkResult<()> {
        release_on(&mut self.session, transaction).await
    }

    fn close(self) -> UnitOfWorkResult<()> {
        let Self { session, blocking } = self;
        if session.broken {
            debug!("Dropping broken connection");
            drop(session);
            return Ok(());
        }
        blocking.block_on(session.connection.close())??;
        debug!("Connection closed");
        Ok(())
    }

    async fn close_async(self) -> UnitOfWorkResult<()> {
        if self.session.broken {
            debug!("Dropping broken connection");
            return Ok(());
        }
        self.session.connection.close().await?;
        debug!("Connection closed");
        Ok(())
    }
}
