//! Error types for the loan engine

use thiserror::Error;

use crate::models::loan::LoanStatus;

/// Stable error codes handed to the request layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Failure = 1,
    DbFailure = 3,
    NoSuchMember = 4,
    NoSuchBook = 5,
    NoSuchLoan = 6,
    BookNotAvailable = 7,
    Duplicate = 8,
    MemberBlocked = 10,
    MaxLoansReached = 11,
    LoanAlreadyReturned = 12,
    LoanNotActive = 13,
    MaxRenewalsReached = 14,
    BadValue = 18,
    LockTimeout = 22,
    CacheFailure = 23,
}

/// Category of a failure, as seen by callers deciding what to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Member, book or loan absent
    NotFound,
    /// A business rule rejected the operation; state is unchanged
    PreconditionFailed,
    /// Lock timeout, deadlock or connection trouble. The caller may retry
    /// with a bound; the engine never retries on its own.
    Transient,
    Internal,
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Member {0} not found")]
    MemberNotFound(i32),

    #[error("Book {0} not found")]
    BookNotFound(i32),

    #[error("Loan {0} not found")]
    LoanNotFound(i32),

    #[error("Member {member_id} is blocked: {reason}")]
    MemberBlocked { member_id: i32, reason: String },

    #[error("Member {member_id} already holds {active} active loans (limit {limit})")]
    LoanLimitExceeded { member_id: i32, active: u32, limit: u32 },

    #[error("Book {0} has no available copies")]
    BookUnavailable(i32),

    #[error("Loan {0} was already returned")]
    LoanAlreadyReturned(i32),

    #[error("Loan {loan_id} is {status} and cannot be renewed")]
    LoanNotActive { loan_id: i32, status: LoanStatus },

    #[error("Loan {loan_id} reached the renewal limit ({renewals}/{limit})")]
    RenewalNotAllowed { loan_id: i32, renewals: u32, limit: u32 },

    #[error("A book with ISBN {0} already exists")]
    DuplicateIsbn(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Postgres SQLSTATEs worth a caller-side retry:
/// serialization_failure, deadlock_detected, lock_not_available, query_canceled.
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57014"];

fn is_transient_db_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| TRANSIENT_SQLSTATES.iter().any(|c| code == *c))
            .unwrap_or(false),
        _ => false,
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::MemberNotFound(_) | AppError::BookNotFound(_) | AppError::LoanNotFound(_) => {
                ErrorKind::NotFound
            }
            AppError::MemberBlocked { .. }
            | AppError::LoanLimitExceeded { .. }
            | AppError::BookUnavailable(_)
            | AppError::LoanAlreadyReturned(_)
            | AppError::LoanNotActive { .. }
            | AppError::RenewalNotAllowed { .. }
            | AppError::DuplicateIsbn(_)
            | AppError::Validation(_) => ErrorKind::PreconditionFailed,
            AppError::LockTimeout(_) | AppError::Cache(_) => ErrorKind::Transient,
            AppError::Database(e) if is_transient_db_error(e) => ErrorKind::Transient,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::MemberNotFound(_) => ErrorCode::NoSuchMember,
            AppError::BookNotFound(_) => ErrorCode::NoSuchBook,
            AppError::LoanNotFound(_) => ErrorCode::NoSuchLoan,
            AppError::MemberBlocked { .. } => ErrorCode::MemberBlocked,
            AppError::LoanLimitExceeded { .. } => ErrorCode::MaxLoansReached,
            AppError::BookUnavailable(_) => ErrorCode::BookNotAvailable,
            AppError::LoanAlreadyReturned(_) => ErrorCode::LoanAlreadyReturned,
            AppError::LoanNotActive { .. } => ErrorCode::LoanNotActive,
            AppError::RenewalNotAllowed { .. } => ErrorCode::MaxRenewalsReached,
            AppError::DuplicateIsbn(_) => ErrorCode::Duplicate,
            AppError::Validation(_) | AppError::Config(_) => ErrorCode::BadValue,
            AppError::Database(_) => ErrorCode::DbFailure,
            AppError::LockTimeout(_) => ErrorCode::LockTimeout,
            AppError::Cache(_) => ErrorCode::CacheFailure,
            AppError::Internal(_) => ErrorCode::Failure,
        }
    }

    /// Whether a bounded retry by the caller is reasonable
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Cache(e.to_string())
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;
