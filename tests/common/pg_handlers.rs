use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sqlx::Row;
use uuid::Uuid;

use uow_dispatch::{
    AsyncCommandHandler, AsyncQueryHandler, CancellationToken, CommandHandler, DbConnection,
    PgDbConnection, PgDbTransaction, QueryHandler, StreamQueryHandler, UnitOfWorkError,
};

use super::entities::{Order, User};

const CREATE_USERS: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        username VARCHAR(255) NOT NULL,
        email VARCHAR(255) NOT NULL
    )
"#;

const CREATE_ORDERS: &str = r#"
    CREATE TABLE IF NOT EXISTS orders (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL REFERENCES users(id),
        product_name VARCHAR(255) NOT NULL,
        amount BIGINT NOT NULL
    )
"#;

const INSERT_USER: &str = "INSERT INTO users (id, username, email) VALUES ($1, $2, $3)";
const INSERT_ORDER: &str =
    "INSERT INTO orders (id, user_id, product_name, amount) VALUES ($1, $2, $3, $4)";

/// Creates the test schema. Runs outside a transaction.
pub struct CreateSchema;

#[async_trait]
impl AsyncCommandHandler<PgDbConnection> for CreateSchema {
    type Output = ();
    type Error = UnitOfWorkError;

    fn requires_transaction(&self) -> bool {
        false
    }

    async fn handle(
        &self,
        connection: &mut PgDbConnection,
        transaction: Option<&PgDbTransaction>,
        _cancel: &CancellationToken,
    ) -> Result<(), UnitOfWorkError> {
        connection.create_command(CREATE_USERS, transaction).execute().await?;
        connection.create_command(CREATE_ORDERS, transaction).execute().await?;
        Ok(())
    }
}

impl CommandHandler<PgDbConnection> for CreateSchema {
    type Output = ();
    type Error = UnitOfWorkError;

    fn requires_transaction(&self) -> bool {
        false
    }

    fn handle(
        &self,
        connection: &mut PgDbConnection,
        transaction: Option<&PgDbTransaction>,
    ) -> Result<(), UnitOfWorkError> {
        connection.create_command(CREATE_USERS, transaction).execute_blocking()?;
        connection.create_command(CREATE_ORDERS, transaction).execute_blocking()?;
        Ok(())
    }
}

/// Drops the test schema.
pub struct DropSchema;

#[async_trait]
impl AsyncCommandHandler<PgDbConnection> for DropSchema {
    type Output = ();
    type Error = UnitOfWorkError;

    fn requires_transaction(&self) -> bool {
        false
    }

    async fn handle(
        &self,
        connection: &mut PgDbConnection,
        transaction: Option<&PgDbTransaction>,
        _cancel: &CancellationToken,
    ) -> Result<(), UnitOfWorkError> {
        connection
            .create_command("DROP TABLE IF EXISTS orders CASCADE", transaction)
            .execute()
            .await?;
        connection
            .create_command("DROP TABLE IF EXISTS users CASCADE", transaction)
            .execute()
            .await?;
        Ok(())
    }
}

pub struct CreateUser(pub User);

#[async_trait]
impl AsyncCommandHandler<PgDbConnection> for CreateUser {
    type Output = u64;
    type Error = UnitOfWorkError;

    async fn handle(
        &self,
        connection: &mut PgDbConnection,
        transaction: Option<&PgDbTransaction>,
        _cancel: &CancellationToken,
    ) -> Result<u64, UnitOfWorkError> {
        connection
            .create_command(INSERT_USER, transaction)
            .bind(self.0.id)
            .bind(self.0.username.clone())
            .bind(self.0.email.clone())
            .execute()
            .await
    }
}

impl CommandHandler<PgDbConnection> for CreateUser {
    type Output = u64;
    type Error = UnitOfWorkError;

    fn handle(
        &self,
        connection: &mut PgDbConnection,
        transaction: Option<&PgDbTransaction>,
    ) -> Result<u64, UnitOfWorkError> {
        connection
            .create_command(INSERT_USER, transaction)
            .bind(self.0.id)
            .bind(self.0.username.clone())
            .bind(self.0.email.clone())
            .execute_blocking()
    }
}

pub struct CreateOrder(pub Order);

#[async_trait]
impl AsyncCommandHandler<PgDbConnection> for CreateOrder {
    type Output = u64;
    type Error = UnitOfWorkError;

    async fn handle(
        &self,
        connection: &mut PgDbConnection,
        transaction: Option<&PgDbTransaction>,
        _cancel: &CancellationToken,
    ) -> Result<u64, UnitOfWorkError> {
        connection
            .create_command(INSERT_ORDER, transaction)
            .bind(self.0.id)
            .bind(self.0.user_id)
            .bind(self.0.product_name.clone())
            .bind(self.0.amount)
            .execute()
            .await
    }
}

pub struct FindUserById(pub Uuid);

#[async_trait]
impl AsyncQueryHandler<PgDbConnection> for FindUserById {
    type Output = Option<User>;
    type Error = UnitOfWorkError;

    async fn handle(
        &self,
        connection: &mut PgDbConnection,
        transaction: Option<&PgDbTransaction>,
        _cancel: &CancellationToken,
    ) -> Result<Option<User>, UnitOfWorkError> {
        let row = connection
            .create_command("SELECT id, username, email FROM users WHERE id = $1", transaction)
            .bind(self.0)
            .fetch_optional()
            .await?;
        Ok(row.as_ref().map(User::from_row))
    }
}

impl QueryHandler<PgDbConnection> for FindUserById {
    type Output = Option<User>;
    type Error = UnitOfWorkError;

    fn handle(
        &self,
        connection: &mut PgDbConnection,
        transaction: Option<&PgDbTransaction>,
    ) -> Result<Option<User>, UnitOfWorkError> {
        let row = connection
            .create_command("SELECT id, username, email FROM users WHERE id = $1", transaction)
            .bind(self.0)
            .fetch_optional_blocking()?;
        Ok(row.as_ref().map(User::from_row))
    }
}

pub struct CountOrders;

#[async_trait]
impl AsyncQueryHandler<PgDbConnection> for CountOrders {
    type Output = i64;
    type Error = UnitOfWorkError;

    async fn handle(
        &self,
        connection: &mut PgDbConnection,
        transaction: Option<&PgDbTransaction>,
        _cancel: &CancellationToken,
    ) -> Result<i64, UnitOfWorkError> {
        let row = connection
            .create_command("SELECT COUNT(*) AS count FROM orders", transaction)
            .fetch_one()
            .await?;
        Ok(row.get("count"))
    }
}

/// Streams usernames in alphabetical order.
pub struct StreamUsernames;

impl StreamQueryHandler<PgDbConnection> for StreamUsernames {
    type Item = String;
    type Error = UnitOfWorkError;

    fn handle<'c>(
        &'c self,
        connection: &'c mut PgDbConnection,
        _transaction: Option<&'c PgDbTransaction>,
    ) -> BoxStream<'c, Result<String, UnitOfWorkError>> {
        sqlx::query("SELECT username FROM users ORDER BY username")
            .fetch(connection.as_executor())
            .map(|row| {
                row.map(|row| row.get::<String, _>("username"))
                    .map_err(UnitOfWorkError::from)
            })
            .boxed()
    }
}
