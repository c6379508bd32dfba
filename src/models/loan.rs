//! Loan model, lazily computed status and fine arithmetic

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Loan row as stored in the ledger. There is no persisted status column:
/// status is always derived from the dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Loan {
    pub id: i32,
    pub member_id: i32,
    pub book_id: i32,
    pub loan_date: DateTime<Utc>,
    pub expected_return_date: DateTime<Utc>,
    pub return_date: Option<DateTime<Utc>>,
    /// Fixed at return time; `None` while the loan is open
    pub fine_amount: Option<Decimal>,
    pub renewal_count: i32,
    pub last_renewed_at: Option<DateTime<Utc>>,
}

/// Values for a loan about to be inserted
#[derive(Debug, Clone)]
pub struct NewLoan {
    pub member_id: i32,
    pub book_id: i32,
    pub loan_date: DateTime<Utc>,
    pub expected_return_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanStatus {
    Active,
    Overdue,
    Returned,
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoanStatus::Active => "active",
            LoanStatus::Overdue => "overdue",
            LoanStatus::Returned => "returned",
        };
        f.write_str(s)
    }
}

/// Status rule: returned if a return date is set, overdue once `now` is past
/// the expected return date, active otherwise.
pub fn compute_status(
    now: DateTime<Utc>,
    expected_return_date: DateTime<Utc>,
    return_date: Option<DateTime<Utc>>,
) -> LoanStatus {
    if return_date.is_some() {
        LoanStatus::Returned
    } else if now > expected_return_date {
        LoanStatus::Overdue
    } else {
        LoanStatus::Active
    }
}

/// Whole days elapsed past the due date, never negative
pub fn days_late(expected_return_date: DateTime<Utc>, at: DateTime<Utc>) -> i64 {
    if at <= expected_return_date {
        return 0;
    }
    (at - expected_return_date).num_days().max(0)
}

pub fn fine_for(days_late: i64, daily_fine_rate: Decimal) -> Decimal {
    Decimal::from(days_late) * daily_fine_rate
}

impl Loan {
    pub fn status_at(&self, now: DateTime<Utc>) -> LoanStatus {
        compute_status(now, self.expected_return_date, self.return_date)
    }

    pub fn is_open(&self) -> bool {
        self.return_date.is_none()
    }

    /// Days late as of `now`, or as of the return date once returned
    pub fn days_late_at(&self, now: DateTime<Utc>) -> i64 {
        days_late(self.expected_return_date, self.return_date.unwrap_or(now))
    }

    /// Record a renewal made at `now` that moves the due date to `due`
    pub fn extend_to(&mut self, due: DateTime<Utc>, now: DateTime<Utc>) {
        self.expected_return_date = due;
        self.renewal_count += 1;
        self.last_renewed_at = Some(now);
    }
}

/// Loan decorated with read-time values. Never cached beyond one response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoanView {
    #[serde(flatten)]
    pub loan: Loan,
    pub status: LoanStatus,
    pub days_late: i64,
    /// Fine due if the loan were returned right now; the fixed fine once returned
    pub projected_fine: Decimal,
}

impl LoanView {
    pub fn at(loan: Loan, now: DateTime<Utc>, daily_fine_rate: Decimal) -> Self {
        let status = loan.status_at(now);
        let days_late = loan.days_late_at(now);
        let projected_fine = match loan.fine_amount {
            Some(fine) => fine,
            None => fine_for(days_late, daily_fine_rate),
        };
        Self {
            loan,
            status,
            days_late,
            projected_fine,
        }
    }
}

/// Loan listing filters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoanQuery {
    pub member_id: Option<i32>,
    pub status: Option<LoanStatus>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

/// Store-level loan selection. Status filtering is expressed through dates
/// so that stores never need a status column.
#[derive(Debug, Clone, Default)]
pub struct LoanFilter {
    pub member_id: Option<i32>,
    /// `Some(true)` selects unreturned loans, `Some(false)` returned ones
    pub open: Option<bool>,
    /// Only loans whose expected return date is strictly before this instant
    pub due_before: Option<DateTime<Utc>>,
    /// Only loans whose expected return date is at or after this instant
    pub due_from: Option<DateTime<Utc>>,
    pub skip: i64,
    pub limit: i64,
}

impl LoanFilter {
    pub fn matches(&self, loan: &Loan) -> bool {
        self.member_id.map_or(true, |id| loan.member_id == id)
            && self.open.map_or(true, |open| loan.is_open() == open)
            && self.due_before.map_or(true, |t| loan.expected_return_date < t)
            && self.due_from.map_or(true, |t| loan.expected_return_date >= t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
    }

    fn loan(expected: DateTime<Utc>, returned: Option<DateTime<Utc>>) -> Loan {
        Loan {
            id: 1,
            member_id: 1,
            book_id: 1,
            loan_date: expected - Duration::days(14),
            expected_return_date: expected,
            return_date: returned,
            fine_amount: None,
            renewal_count: 0,
            last_renewed_at: None,
        }
    }

    #[test]
    fn test_status_rule() {
        let due = at(15, 12);
        assert_eq!(compute_status(at(10, 0), due, None), LoanStatus::Active);
        assert_eq!(compute_status(due, due, None), LoanStatus::Active);
        assert_eq!(compute_status(at(16, 0), due, None), LoanStatus::Overdue);
        // a return date wins even when the due date is long past
        assert_eq!(compute_status(at(30, 0), due, Some(at(20, 0))), LoanStatus::Returned);
    }

    #[test]
    fn test_days_late_floors_partial_days() {
        let due = at(15, 12);
        assert_eq!(days_late(due, at(14, 0)), 0);
        assert_eq!(days_late(due, at(15, 23)), 0);
        assert_eq!(days_late(due, at(16, 12)), 1);
        assert_eq!(days_late(due, at(17, 13)), 2);
    }

    #[test]
    fn test_fine_is_exact() {
        let rate = Decimal::new(200, 2);
        assert_eq!(fine_for(2, rate), Decimal::new(400, 2));
        assert_eq!(fine_for(2, rate).to_string(), "4.00");
        assert_eq!(fine_for(0, rate), Decimal::ZERO);

        let rate = Decimal::new(10, 2);
        assert_eq!(fine_for(3, rate).to_string(), "0.30");
    }

    #[test]
    fn test_view_uses_fixed_fine_once_returned() {
        let rate = Decimal::new(200, 2);
        let mut returned = loan(at(10, 0), Some(at(12, 0)));
        returned.fine_amount = Some(Decimal::new(400, 2));

        let view = LoanView::at(returned, at(30, 0), rate);
        assert_eq!(view.status, LoanStatus::Returned);
        assert_eq!(view.days_late, 2);
        assert_eq!(view.projected_fine, Decimal::new(400, 2));

        let open = LoanView::at(loan(at(10, 0), None), at(13, 0), rate);
        assert_eq!(open.status, LoanStatus::Overdue);
        assert_eq!(open.projected_fine, Decimal::new(600, 2));
    }

    #[test]
    fn test_extend_to_moves_due_date() {
        let mut l = loan(at(15, 0), None);
        l.extend_to(at(29, 0), at(10, 0));
        assert_eq!(l.expected_return_date, at(29, 0));
        assert_eq!(l.renewal_count, 1);
        assert_eq!(l.last_renewed_at, Some(at(10, 0)));
    }

    #[test]
    fn test_filter_matches() {
        let now = at(20, 0);
        let overdue = LoanFilter {
            open: Some(true),
            due_before: Some(now),
            ..LoanFilter::default()
        };
        assert!(overdue.matches(&loan(at(15, 0), None)));
        assert!(!overdue.matches(&loan(at(25, 0), None)));
        assert!(!overdue.matches(&loan(at(15, 0), Some(at(16, 0)))));
    }
}
