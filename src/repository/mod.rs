//! Store layer: catalog, membership and loan ledger
//!
//! The engine talks to storage through [`LibraryStore`] (lock-free reads) and
//! [`StoreTransaction`] (one atomic unit of work holding row locks). Dropping a
//! transaction without calling [`StoreTransaction::commit`] rolls it back, so a
//! cancelled request never leaves a half-applied mutation behind.

pub mod books;
pub mod loans;
pub mod members;
pub mod memory;
pub mod notifications;
pub mod transaction;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};

use crate::{
    error::AppResult,
    models::{
        book::{Book, BookQuery, NewBook},
        loan::{Loan, LoanFilter, NewLoan},
        member::{Member, NewMember},
        notification::{NewNotification, Notification},
    },
};

pub use memory::MemoryStore;
pub use transaction::PgTransaction;

/// Read-time totals over the loan ledger
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerTotals {
    pub active: i64,
    pub overdue: i64,
    pub returned: i64,
    pub collected_fines: rust_decimal::Decimal,
    /// Sum of whole days late across open overdue loans
    pub overdue_days: i64,
}

#[async_trait]
pub trait LibraryStore: Send + Sync {
    /// Open a transaction. Row locks taken through it are held until commit
    /// or drop.
    async fn begin(&self) -> AppResult<Box<dyn StoreTransaction>>;

    async fn get_book(&self, id: i32) -> AppResult<Option<Book>>;

    async fn search_books(&self, query: &BookQuery) -> AppResult<Vec<Book>>;

    async fn get_member(&self, id: i32) -> AppResult<Option<Member>>;

    async fn get_loan(&self, id: i32) -> AppResult<Option<Loan>>;

    /// Loans matching `filter`, ordered by expected return date then id
    async fn find_loans(&self, filter: &LoanFilter) -> AppResult<Vec<Loan>>;

    async fn ledger_totals(&self, now: DateTime<Utc>) -> AppResult<LedgerTotals>;

    /// Record a pending notification. `None` when the loan already has one
    /// of this kind on this channel, whatever its status.
    async fn claim_notification(&self, notification: &NewNotification) -> AppResult<Option<Notification>>;

    /// Persist the delivery outcome of a claimed notification
    async fn update_notification(&self, notification: &Notification) -> AppResult<()>;

    async fn notifications_for_loan(&self, loan_id: i32) -> AppResult<Vec<Notification>>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    /// Load a member and hold its row lock until the transaction ends
    async fn lock_member(&mut self, id: i32) -> AppResult<Option<Member>>;

    /// Unreturned loans of a member, as seen by this transaction
    async fn open_loans_for_member(&mut self, member_id: i32) -> AppResult<Vec<Loan>>;

    /// Load a book and hold its row lock until the transaction ends
    async fn lock_book(&mut self, id: i32) -> AppResult<Option<Book>>;

    async fn set_available_copies(&mut self, book_id: i32, available: i32) -> AppResult<()>;

    async fn insert_loan(&mut self, loan: &NewLoan) -> AppResult<Loan>;

    /// Load a loan and hold its row lock until the transaction ends
    async fn lock_loan(&mut self, id: i32) -> AppResult<Option<Loan>>;

    async fn update_loan(&mut self, loan: &Loan) -> AppResult<()>;

    /// Insert a book with every copy on the shelf. Fails with
    /// `DuplicateIsbn` if the ISBN is taken.
    async fn insert_book(&mut self, book: &NewBook) -> AppResult<Book>;

    async fn insert_member(&mut self, member: &NewMember, now: DateTime<Utc>) -> AppResult<Member>;

    async fn set_member_active(&mut self, id: i32, active: bool) -> AppResult<()>;

    async fn commit(self: Box<Self>) -> AppResult<()>;
}

/// Postgres-backed store holding the connection pool
#[derive(Clone)]
pub struct Repository {
    pub pool: Pool<Postgres>,
    pub books: books::BooksRepository,
    pub members: members::MembersRepository,
    pub loans: loans::LoansRepository,
    pub notifications: notifications::NotificationsRepository,
    lock_timeout_ms: u64,
}

impl Repository {
    /// Create a new repository with the given database pool
    pub fn new(pool: Pool<Postgres>, lock_timeout_ms: u64) -> Self {
        Self {
            books: books::BooksRepository::new(pool.clone()),
            members: members::MembersRepository::new(pool.clone()),
            loans: loans::LoansRepository::new(pool.clone()),
            notifications: notifications::NotificationsRepository::new(pool.clone()),
            pool,
            lock_timeout_ms,
        }
    }
}

#[async_trait]
impl LibraryStore for Repository {
    async fn begin(&self) -> AppResult<Box<dyn StoreTransaction>> {
        let tx = PgTransaction::begin(&self.pool, self.lock_timeout_ms).await?;
        Ok(Box::new(tx))
    }

    async fn get_book(&self, id: i32) -> AppResult<Option<Book>> {
        self.books.get_by_id(id).await
    }

    async fn search_books(&self, query: &BookQuery) -> AppResult<Vec<Book>> {
        self.books.search(query).await
    }

    async fn get_member(&self, id: i32) -> AppResult<Option<Member>> {
        self.members.get_by_id(id).await
    }

    async fn get_loan(&self, id: i32) -> AppResult<Option<Loan>> {
        self.loans.get_by_id(id).await
    }

    async fn find_loans(&self, filter: &LoanFilter) -> AppResult<Vec<Loan>> {
        self.loans.find(filter).await
    }

    async fn ledger_totals(&self, now: DateTime<Utc>) -> AppResult<LedgerTotals> {
        self.loans.totals(now).await
    }

    async fn claim_notification(&self, notification: &NewNotification) -> AppResult<Option<Notification>> {
        self.notifications.claim(notification).await
    }

    async fn update_notification(&self, notification: &Notification) -> AppResult<()> {
        self.notifications.update(notification).await
    }

    async fn notifications_for_loan(&self, loan_id: i32) -> AppResult<Vec<Notification>> {
        self.notifications.for_loan(loan_id).await
    }
}
