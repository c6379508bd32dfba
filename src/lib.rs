//! Library Loans
//!
//! Loan lifecycle engine for a digital library: checkout, return and renewal
//! against a transactional store with row-level locks, overdue status and
//! fines derived at read time, and prefix-based invalidation of a shared
//! availability cache.

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod report;
pub mod repository;
pub mod services;

pub use config::AppConfig;
pub use error::{AppError, AppResult, ErrorKind};
pub use services::Services;
