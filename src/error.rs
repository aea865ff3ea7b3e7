use crate::config::ConfigError;

/// Error type for unit of work operations.
///
/// Misuse errors (`NoActiveTransaction`, `TransactionCompleted`,
/// `TransactionRequired`, `Disposed`) are programmer errors and are never
/// retried. Driver failures are carried unchanged in `Database`.
#[derive(Debug, thiserror::Error)]
pub enum UnitOfWorkError {
    #[error("Cannot {operation}: no transaction has been started")]
    NoActiveTransaction { operation: &'static str },

    #[error("Cannot {operation}: the transaction has already completed")]
    TransactionCompleted { operation: &'static str },

    #[error("Handler `{handler}` requires an active transaction")]
    TransactionRequired { handler: &'static str },

    #[error("The unit of work has been disposed")]
    Disposed,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Blocking runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Failed to release unit of work resources: {0:?}")]
    Release(Vec<UnitOfWorkError>),
}

impl UnitOfWorkError {
    /// Returns true for errors caused by calling the unit of work incorrectly.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            UnitOfWorkError::NoActiveTransaction { .. }
                | UnitOfWorkError::TransactionCompleted { .. }
                | UnitOfWorkError::TransactionRequired { .. }
                | UnitOfWorkError::Disposed
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, UnitOfWorkError::Cancelled)
    }
}

/// Result type for unit of work operations
pub type UnitOfWorkResult<T> = Result<T, UnitOfWorkError>;
