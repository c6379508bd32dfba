//! Data models for the loan engine

pub mod book;
pub mod loan;
pub mod member;
pub mod notification;

// Re-export commonly used types
pub use book::{Book, BookQuery, NewBook};
pub use loan::{Loan, LoanFilter, LoanQuery, LoanStatus, LoanView, NewLoan};
pub use member::{Member, MemberStatus, NewMember};
pub use notification::{NewNotification, Notification, NotificationChannel, NotificationKind, NotificationStatus};
