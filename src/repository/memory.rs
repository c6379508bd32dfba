//! In-process store with per-row locks
//!
//! Mirrors the Postgres store's transaction semantics: row locks are async
//! mutexes held by the transaction until it commits or is dropped, writes are
//! buffered in the transaction and published on commit, and an uncommitted
//! transaction leaves nothing behind. Used by tests and local runs.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use crate::{
    error::{AppError, AppResult},
    models::{
        book::{Book, BookQuery, NewBook},
        loan::{Loan, LoanFilter, NewLoan},
        member::{Member, NewMember},
        notification::{NewNotification, Notification, NotificationStatus},
    },
};

use super::{LedgerTotals, LibraryStore, StoreTransaction};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Book(i32),
    Member(i32),
    Loan(i32),
    /// Guards ISBN uniqueness across concurrent registrations
    Isbn,
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Book(id) => write!(f, "book {}", id),
            RowKey::Member(id) => write!(f, "member {}", id),
            RowKey::Loan(id) => write!(f, "loan {}", id),
            RowKey::Isbn => f.write_str("isbn index"),
        }
    }
}

#[derive(Default)]
struct Tables {
    books: BTreeMap<i32, Book>,
    members: BTreeMap<i32, Member>,
    loans: BTreeMap<i32, Loan>,
    notifications: BTreeMap<i32, Notification>,
    next_book_id: i32,
    next_member_id: i32,
    next_loan_id: i32,
    next_notification_id: i32,
}

#[derive(Clone, Copy)]
enum Sequence {
    Books,
    Members,
    Loans,
    Notifications,
}

type LockRegistry = Arc<Mutex<HashMap<RowKey, Arc<RowLock<()>>>>>;

#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    locks: LockRegistry,
    lock_timeout: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            lock_timeout,
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Like a database sequence, ids are not reused after a rollback
    fn next_id(&self, sequence: Sequence) -> i32 {
        let mut tables = self.tables();
        let counter = match sequence {
            Sequence::Books => &mut tables.next_book_id,
            Sequence::Members => &mut tables.next_member_id,
            Sequence::Loans => &mut tables.next_loan_id,
            Sequence::Notifications => &mut tables.next_notification_id,
        };
        *counter += 1;
        *counter
    }

    fn row_lock(&self, key: RowKey) -> Arc<RowLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key).or_default().clone()
    }

    /// Rows with a live lock entry: held, or waited on
    pub fn locked_rows(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Every book, for invariant checks
    pub fn books(&self) -> Vec<Book> {
        self.tables().books.values().cloned().collect()
    }

    /// Every loan, for invariant checks
    pub fn loans(&self) -> Vec<Loan> {
        self.tables().loans.values().cloned().collect()
    }

    /// Every notification, in claim order
    pub fn notifications(&self) -> Vec<Notification> {
        self.tables().notifications.values().cloned().collect()
    }
}

/// Row guards owned by one transaction. Releasing them also drops registry
/// entries nobody else holds or waits on, so the registry only tracks rows
/// currently in contention.
struct HeldLocks {
    registry: LockRegistry,
    guards: HashMap<RowKey, OwnedMutexGuard<()>>,
}

impl HeldLocks {
    fn new(registry: LockRegistry) -> Self {
        Self {
            registry,
            guards: HashMap::new(),
        }
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        if self.guards.is_empty() {
            return;
        }
        let keys: Vec<RowKey> = self.guards.keys().copied().collect();
        self.guards.clear();
        prune(&self.registry, keys);
    }
}

/// Forget rows whose lock only the registry still references. `row_lock`
/// clones under the same mutex, so a count of 1 cannot race a new waiter.
fn prune(registry: &LockRegistry, keys: impl IntoIterator<Item = RowKey>) {
    let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
    for key in keys {
        if registry.get(&key).is_some_and(|row| Arc::strong_count(row) == 1) {
            registry.remove(&key);
        }
    }
}

#[async_trait]
impl LibraryStore for MemoryStore {
    async fn begin(&self) -> AppResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction::new(self.clone())))
    }

    async fn get_book(&self, id: i32) -> AppResult<Option<Book>> {
        Ok(self.tables().books.get(&id).cloned())
    }

    async fn search_books(&self, query: &BookQuery) -> AppResult<Vec<Book>> {
        let tables = self.tables();
        Ok(tables
            .books
            .values()
            .filter(|b| query.matches(b))
            .skip(query.skip() as usize)
            .take(query.limit() as usize)
            .cloned()
            .collect())
    }

    async fn get_member(&self, id: i32) -> AppResult<Option<Member>> {
        Ok(self.tables().members.get(&id).cloned())
    }

    async fn get_loan(&self, id: i32) -> AppResult<Option<Loan>> {
        Ok(self.tables().loans.get(&id).cloned())
    }

    async fn find_loans(&self, filter: &LoanFilter) -> AppResult<Vec<Loan>> {
        let mut loans: Vec<Loan> = self
            .tables()
            .loans
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        loans.sort_by_key(|l| (l.expected_return_date, l.id));
        Ok(loans
            .into_iter()
            .skip(filter.skip.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn ledger_totals(&self, now: DateTime<Utc>) -> AppResult<LedgerTotals> {
        let tables = self.tables();
        let mut totals = LedgerTotals::default();
        for loan in tables.loans.values() {
            match loan.return_date {
                Some(_) => {
                    totals.returned += 1;
                    totals.collected_fines += loan.fine_amount.unwrap_or_default();
                }
                None if loan.expected_return_date < now => {
                    totals.overdue += 1;
                    totals.overdue_days += loan.days_late_at(now);
                }
                None => totals.active += 1,
            }
        }
        Ok(totals)
    }

    async fn claim_notification(&self, notification: &NewNotification) -> AppResult<Option<Notification>> {
        let id = self.next_id(Sequence::Notifications);
        let mut tables = self.tables();
        let taken = tables.notifications.values().any(|n| {
            n.loan_id == notification.loan_id && n.kind == notification.kind && n.channel == notification.channel
        });
        if taken {
            return Ok(None);
        }

        let claimed = Notification {
            id,
            member_id: notification.member_id,
            loan_id: notification.loan_id,
            kind: notification.kind,
            channel: notification.channel,
            status: NotificationStatus::Pending,
            subject: notification.subject.clone(),
            payload: notification.payload.clone(),
            error: None,
            created_at: notification.created_at,
            sent_at: None,
        };
        tables.notifications.insert(id, claimed.clone());
        Ok(Some(claimed))
    }

    async fn update_notification(&self, notification: &Notification) -> AppResult<()> {
        let mut tables = self.tables();
        let stored = tables
            .notifications
            .get_mut(&notification.id)
            .ok_or_else(|| AppError::Internal(format!("Notification {} vanished", notification.id)))?;
        stored.status = notification.status;
        stored.error = notification.error.clone();
        stored.sent_at = notification.sent_at;
        Ok(())
    }

    async fn notifications_for_loan(&self, loan_id: i32) -> AppResult<Vec<Notification>> {
        Ok(self
            .tables()
            .notifications
            .values()
            .filter(|n| n.loan_id == loan_id)
            .cloned()
            .collect())
    }
}

pub struct MemoryTransaction {
    store: MemoryStore,
    held: HeldLocks,
    books: HashMap<i32, Book>,
    members: HashMap<i32, Member>,
    loans: HashMap<i32, Loan>,
}

impl MemoryTransaction {
    fn new(store: MemoryStore) -> Self {
        Self {
            held: HeldLocks::new(store.locks.clone()),
            store,
            books: HashMap::new(),
            members: HashMap::new(),
            loans: HashMap::new(),
        }
    }

    /// Re-entrant within one transaction
    async fn lock(&mut self, key: RowKey) -> AppResult<()> {
        if self.held.guards.contains_key(&key) {
            return Ok(());
        }
        let row = self.store.row_lock(key);
        let acquired = tokio::time::timeout(self.store.lock_timeout, row.lock_owned()).await;
        let guard = match acquired {
            Ok(guard) => guard,
            Err(_) => {
                prune(&self.store.locks, [key]);
                return Err(AppError::LockTimeout(key.to_string()));
            }
        };
        self.held.guards.insert(key, guard);
        Ok(())
    }

    fn book(&self, id: i32) -> Option<Book> {
        self.books
            .get(&id)
            .cloned()
            .or_else(|| self.store.tables().books.get(&id).cloned())
    }

    fn member(&self, id: i32) -> Option<Member> {
        self.members
            .get(&id)
            .cloned()
            .or_else(|| self.store.tables().members.get(&id).cloned())
    }

    fn loan(&self, id: i32) -> Option<Loan> {
        self.loans
            .get(&id)
            .cloned()
            .or_else(|| self.store.tables().loans.get(&id).cloned())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn lock_member(&mut self, id: i32) -> AppResult<Option<Member>> {
        self.lock(RowKey::Member(id)).await?;
        Ok(self.member(id))
    }

    async fn open_loans_for_member(&mut self, member_id: i32) -> AppResult<Vec<Loan>> {
        let mut merged: BTreeMap<i32, Loan> = self
            .store
            .tables()
            .loans
            .values()
            .filter(|l| l.member_id == member_id)
            .map(|l| (l.id, l.clone()))
            .collect();
        for loan in self.loans.values().filter(|l| l.member_id == member_id) {
            merged.insert(loan.id, loan.clone());
        }
        Ok(merged.into_values().filter(Loan::is_open).collect())
    }

    async fn lock_book(&mut self, id: i32) -> AppResult<Option<Book>> {
        self.lock(RowKey::Book(id)).await?;
        Ok(self.book(id))
    }

    async fn set_available_copies(&mut self, book_id: i32, available: i32) -> AppResult<()> {
        let mut book = self.book(book_id).ok_or(AppError::BookNotFound(book_id))?;
        // same guard as the CHECK constraint on the books table
        if available < 0 || available > book.total_copies {
            return Err(AppError::Internal(format!(
                "available_copies {} out of range for book {} (total {})",
                available, book_id, book.total_copies
            )));
        }
        book.available_copies = available;
        self.books.insert(book_id, book);
        Ok(())
    }

    async fn insert_loan(&mut self, loan: &NewLoan) -> AppResult<Loan> {
        let id = self.store.next_id(Sequence::Loans);
        let loan = Loan {
            id,
            member_id: loan.member_id,
            book_id: loan.book_id,
            loan_date: loan.loan_date,
            expected_return_date: loan.expected_return_date,
            return_date: None,
            fine_amount: None,
            renewal_count: 0,
            last_renewed_at: None,
        };
        self.lock(RowKey::Loan(id)).await?;
        self.loans.insert(id, loan.clone());
        Ok(loan)
    }

    async fn lock_loan(&mut self, id: i32) -> AppResult<Option<Loan>> {
        self.lock(RowKey::Loan(id)).await?;
        Ok(self.loan(id))
    }

    async fn update_loan(&mut self, loan: &Loan) -> AppResult<()> {
        if self.loan(loan.id).is_none() {
            return Err(AppError::LoanNotFound(loan.id));
        }
        self.loans.insert(loan.id, loan.clone());
        Ok(())
    }

    async fn insert_book(&mut self, book: &NewBook) -> AppResult<Book> {
        self.lock(RowKey::Isbn).await?;
        let taken = self.books.values().any(|b| b.isbn == book.isbn)
            || self.store.tables().books.values().any(|b| b.isbn == book.isbn);
        if taken {
            return Err(AppError::DuplicateIsbn(book.isbn.clone()));
        }

        let id = self.store.next_id(Sequence::Books);
        let book = Book {
            id,
            title: book.title.clone(),
            author: book.author.clone(),
            isbn: book.isbn.clone(),
            total_copies: book.total_copies,
            available_copies: book.total_copies,
        };
        self.lock(RowKey::Book(id)).await?;
        self.books.insert(id, book.clone());
        Ok(book)
    }

    async fn insert_member(&mut self, member: &NewMember, now: DateTime<Utc>) -> AppResult<Member> {
        let id = self.store.next_id(Sequence::Members);
        let member = Member {
            id,
            name: member.name.clone(),
            email: member.email.clone(),
            is_active: true,
            created_at: now,
        };
        self.lock(RowKey::Member(id)).await?;
        self.members.insert(id, member.clone());
        Ok(member)
    }

    async fn set_member_active(&mut self, id: i32, active: bool) -> AppResult<()> {
        let mut member = self.member(id).ok_or(AppError::MemberNotFound(id))?;
        member.is_active = active;
        self.members.insert(id, member);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        let MemoryTransaction {
            store,
            held,
            books,
            members,
            loans,
        } = *self;

        let mut tables = store.tables();
        tables.books.extend(books);
        tables.members.extend(members);
        tables.loans.extend(loans);
        drop(tables);

        // publish before releasing row locks
        drop(held);
        Ok(())
    }
}
