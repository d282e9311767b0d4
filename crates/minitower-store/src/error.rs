//! Closed error taxonomy surfaced by the store.
//!
//! Handlers pattern-match these variants to choose an HTTP status; the
//! underlying database error never crosses the store boundary except wrapped
//! in [`StoreError::Db`].

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Nothing eligible to lease.
    #[error("no eligible run to lease")]
    NoWork,

    /// Lease token does not match an active attempt.
    #[error("lease token does not match an active attempt")]
    InvalidLease,

    /// Target attempt is in a state incompatible with the requested transition.
    #[error("attempt state incompatible with requested transition")]
    LeaseConflict,

    /// Attempt already reached a terminal state.
    #[error("attempt is no longer active")]
    AttemptNotActive,

    /// Runner already holds a non-terminal attempt.
    #[error("runner already holds an active attempt")]
    RunnerBusy,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Fold a unique-key violation into the spec's *conflict* kind; everything
/// else stays a database error.
pub(crate) fn conflict_on_unique(err: sqlx::Error, what: &str) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.kind() == sqlx::error::ErrorKind::UniqueViolation {
            return StoreError::Conflict(what.to_string());
        }
    }
    StoreError::Db(err)
}
