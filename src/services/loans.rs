//! Loan lifecycle engine
//!
//! Decides whether a checkout may proceed, applies the borrowing policy,
//! closes and renews loans, and derives overdue status and fines at read
//! time. Owns no state: each mutating operation runs inside one store
//! transaction that row-locks what it touches, and cache invalidation only
//! happens after commit.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::{
    clock::Clock,
    config::LoanPolicy,
    error::{AppError, AppResult},
    models::loan::{fine_for, Loan, LoanFilter, LoanQuery, LoanStatus, LoanView, NewLoan},
    repository::LibraryStore,
};

use super::cache::{self, AvailabilityCache};

const DEFAULT_PAGE: i64 = 10;
/// Largest page any listing returns
pub const MAX_PAGE: i64 = 500;

#[derive(Clone)]
pub struct LoansService {
    store: Arc<dyn LibraryStore>,
    cache: Arc<dyn AvailabilityCache>,
    clock: Arc<dyn Clock>,
    policy: LoanPolicy,
}

impl LoansService {
    pub fn new(
        store: Arc<dyn LibraryStore>,
        cache: Arc<dyn AvailabilityCache>,
        clock: Arc<dyn Clock>,
        policy: LoanPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &LoanPolicy {
        &self.policy
    }

    /// `from` plus one loan period, or an error when that leaves the
    /// representable calendar
    fn due_after(&self, from: DateTime<Utc>) -> AppResult<DateTime<Utc>> {
        Duration::try_days(self.policy.loan_period_days)
            .and_then(|period| from.checked_add_signed(period))
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "Loan period of {} days from {} is out of range",
                    self.policy.loan_period_days, from
                ))
            })
    }

    /// Lend one copy of `book_id` to `member_id`.
    ///
    /// Lock order is member then book. Holding the member row serializes
    /// checkouts by the same member, so two parallel requests cannot both
    /// slip under the loan limit.
    pub async fn checkout(&self, member_id: i32, book_id: i32) -> AppResult<Loan> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let member = tx
            .lock_member(member_id)
            .await?
            .ok_or(AppError::MemberNotFound(member_id))?;

        if !member.is_active {
            tracing::debug!("Checkout refused: member {} is blocked", member_id);
            return Err(AppError::MemberBlocked {
                member_id,
                reason: "membership is blocked".to_string(),
            });
        }

        let open_loans = tx.open_loans_for_member(member_id).await?;
        let overdue = open_loans
            .iter()
            .filter(|l| l.status_at(now) == LoanStatus::Overdue)
            .count();
        if overdue > 0 {
            tracing::debug!("Checkout refused: member {} has {} overdue loans", member_id, overdue);
            return Err(AppError::MemberBlocked {
                member_id,
                reason: format!("{} overdue loan(s) outstanding", overdue),
            });
        }

        let active = open_loans.len() as u32;
        if active >= self.policy.max_active_loans {
            tracing::debug!("Checkout refused: member {} at loan limit", member_id);
            return Err(AppError::LoanLimitExceeded {
                member_id,
                active,
                limit: self.policy.max_active_loans,
            });
        }

        let book = tx
            .lock_book(book_id)
            .await?
            .ok_or(AppError::BookNotFound(book_id))?;

        let remaining = book.checked_out().ok_or(AppError::BookUnavailable(book_id))?;
        let due = self.due_after(now)?;

        tx.set_available_copies(book_id, remaining).await?;
        let loan = tx
            .insert_loan(&NewLoan {
                member_id,
                book_id,
                loan_date: now,
                expected_return_date: due,
            })
            .await?;

        tx.commit().await?;

        tracing::info!(
            "Loan {} created: member {} borrowed book {} ({} left), due {}",
            loan.id,
            member_id,
            book_id,
            remaining,
            loan.expected_return_date
        );

        cache::invalidate_book(self.cache.as_ref(), book_id).await;
        Ok(loan)
    }

    /// Close a loan, fix its fine and put the copy back on the shelf.
    ///
    /// Lock order is loan then book.
    pub async fn return_loan(&self, loan_id: i32) -> AppResult<Loan> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut loan = tx
            .lock_loan(loan_id)
            .await?
            .ok_or(AppError::LoanNotFound(loan_id))?;

        if loan.return_date.is_some() {
            tracing::debug!("Return refused: loan {} already returned", loan_id);
            return Err(AppError::LoanAlreadyReturned(loan_id));
        }

        let days_late = loan.days_late_at(now);
        let fine = fine_for(days_late, self.policy.daily_fine_rate);
        loan.return_date = Some(now);
        loan.fine_amount = Some(fine);

        let book = tx
            .lock_book(loan.book_id)
            .await?
            .ok_or(AppError::BookNotFound(loan.book_id))?;

        if book.available_copies >= book.total_copies {
            // stock and ledger disagree; refuse rather than overflow the shelf
            return Err(AppError::Internal(format!(
                "Book {} already has all {} copies on the shelf while loan {} is open",
                book.id, book.total_copies, loan_id
            )));
        }

        tx.update_loan(&loan).await?;
        tx.set_available_copies(book.id, book.checked_in()).await?;
        tx.commit().await?;

        tracing::info!(
            "Loan {} returned: book {} back on shelf, {} day(s) late, fine {}",
            loan_id,
            loan.book_id,
            days_late,
            fine
        );

        cache::invalidate_book(self.cache.as_ref(), loan.book_id).await;
        Ok(loan)
    }

    /// Push the due date of a strictly active loan out by one loan period.
    /// Stock is untouched, so nothing is invalidated.
    pub async fn renew(&self, loan_id: i32) -> AppResult<Loan> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut loan = tx
            .lock_loan(loan_id)
            .await?
            .ok_or(AppError::LoanNotFound(loan_id))?;

        let status = loan.status_at(now);
        if status != LoanStatus::Active {
            tracing::debug!("Renewal refused: loan {} is {}", loan_id, status);
            return Err(AppError::LoanNotActive { loan_id, status });
        }

        if let Some(limit) = self.policy.max_renewals {
            let renewals = loan.renewal_count.max(0) as u32;
            if renewals >= limit {
                tracing::debug!("Renewal refused: loan {} at renewal limit", loan_id);
                return Err(AppError::RenewalNotAllowed {
                    loan_id,
                    renewals,
                    limit,
                });
            }
        }

        let due = self.due_after(loan.expected_return_date)?;
        loan.extend_to(due, now);
        tx.update_loan(&loan).await?;
        tx.commit().await?;

        tracing::info!(
            "Loan {} renewed ({} renewals), now due {}",
            loan_id,
            loan.renewal_count,
            loan.expected_return_date
        );
        Ok(loan)
    }

    /// Status of a loan as of now
    pub fn compute_status(&self, loan: &Loan) -> LoanStatus {
        loan.status_at(self.clock.now())
    }

    /// Fine owed if the loan were returned now; the fixed fine once returned
    pub fn projected_fine(&self, loan: &Loan) -> rust_decimal::Decimal {
        self.view(loan.clone()).projected_fine
    }

    fn view(&self, loan: Loan) -> LoanView {
        LoanView::at(loan, self.clock.now(), self.policy.daily_fine_rate)
    }

    /// Get a loan with its read-time status and fine
    pub async fn get_loan(&self, loan_id: i32) -> AppResult<LoanView> {
        let loan = self
            .store
            .get_loan(loan_id)
            .await?
            .ok_or(AppError::LoanNotFound(loan_id))?;
        Ok(self.view(loan))
    }

    /// Unreturned loans past their due date, most overdue first. Reads take
    /// no locks.
    pub async fn list_overdue(&self, member_id: Option<i32>, skip: i64, limit: i64) -> AppResult<Vec<LoanView>> {
        self.list_loans(&LoanQuery {
            member_id,
            status: Some(LoanStatus::Overdue),
            skip: Some(skip),
            limit: Some(limit),
        })
        .await
    }

    /// List loans with an optional status filter evaluated against now
    pub async fn list_loans(&self, query: &LoanQuery) -> AppResult<Vec<LoanView>> {
        let now = self.clock.now();
        let mut filter = LoanFilter {
            member_id: query.member_id,
            skip: query.skip.unwrap_or(0).max(0),
            limit: query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE),
            ..LoanFilter::default()
        };

        match query.status {
            Some(LoanStatus::Overdue) => {
                filter.open = Some(true);
                filter.due_before = Some(now);
            }
            Some(LoanStatus::Active) => {
                filter.open = Some(true);
                filter.due_from = Some(now);
            }
            Some(LoanStatus::Returned) => filter.open = Some(false),
            None => {}
        }

        let loans = self.store.find_loans(&filter).await?;
        Ok(loans
            .into_iter()
            .map(|loan| LoanView::at(loan, now, self.policy.daily_fine_rate))
            .collect())
    }

    /// Open loans held by a member
    pub async fn member_loans(&self, member_id: i32) -> AppResult<Vec<LoanView>> {
        self.store
            .get_member(member_id)
            .await?
            .ok_or(AppError::MemberNotFound(member_id))?;

        let now = self.clock.now();
        let loans = self
            .store
            .find_loans(&LoanFilter {
                member_id: Some(member_id),
                open: Some(true),
                limit: MAX_PAGE,
                ..LoanFilter::default()
            })
            .await?;

        Ok(loans
            .into_iter()
            .map(|loan| LoanView::at(loan, now, self.policy.daily_fine_rate))
            .collect())
    }
}
