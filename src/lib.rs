//! Unit of Work over a single database connection
//!
//! A [`UnitOfWork`] owns one open connection and at most one transaction, and
//! dispatches command and query handlers against them. [`UnitOfWorkFactory`]
//! opens connections from a connection string. PostgreSQL is the bundled
//! driver; other drivers plug in through [`DbConnection`].

mod blocking;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod factory;
pub mod handler;
pub mod isolation;
pub mod postgres;
pub mod unit_of_work;

pub use blocking::BlockingContext;
pub use config::{ConfigError, ConsulHostConfig};
pub use connection::{run_cancellable, DbConnection, DbTransaction};
pub use discovery::{DiscoveryError, DiscoveryResult, ServiceEndpoint, ServiceSync};
pub use error::{UnitOfWorkError, UnitOfWorkResult};
pub use factory::UnitOfWorkFactory;
pub use handler::{
    AsyncCommandHandler, AsyncQueryHandler, CommandHandler, QueryHandler, StreamQueryHandler,
};
pub use isolation::IsolationLevel;
pub use postgres::{PgDbCommand, PgDbConnection, PgDbTransaction};
pub use unit_of_work::UnitOfWork;

pub use tokio_util::sync::CancellationToken;
