use thiserror::Error;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Store unreachable: {0}")]
    Connectivity(String),

    #[error("Statement timed out: {0}")]
    StatementTimeout(String),

    #[error("Lock wait timed out: {0}")]
    LockTimeout(String),

    #[error("Duplicate key: {0}")]
    UniqueViolation(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Foreign key violation: {0}")]
    ForeignKey(String),

    #[error("Backup failed: {0}")]
    Backup(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl MigrationError {
    /// Only a lost store aborts a whole run; everything else is contained
    /// by the sub-batch or the id that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::StatementTimeout(_) | Self::LockTimeout(_))
    }

    /// Row-level integrity failures. These reject a single row, not a batch.
    pub fn is_row_rejection(&self) -> bool {
        matches!(self, Self::Constraint(_) | Self::ForeignKey(_))
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;

impl From<std::io::Error> for MigrationError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for MigrationError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Invariant(format!("store lock poisoned: {}", err))
    }
}
