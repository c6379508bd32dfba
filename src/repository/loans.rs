//! Loan ledger repository for database operations

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, Pool, Postgres, QueryBuilder, Row};

use crate::{
    error::{AppError, AppResult},
    models::loan::{Loan, LoanFilter, NewLoan},
};

use super::LedgerTotals;

const LOAN_COLUMNS: &str = "id, member_id, book_id, loan_date, expected_return_date, return_date, \
                            fine_amount, renewal_count, last_renewed_at";

#[derive(Clone)]
pub struct LoansRepository {
    pool: Pool<Postgres>,
}

impl LoansRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Get loan by ID
    pub async fn get_by_id(&self, id: i32) -> AppResult<Option<Loan>> {
        let loan = sqlx::query_as::<_, Loan>(&format!("SELECT {LOAN_COLUMNS} FROM loans WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(loan)
    }

    /// Find loans by member, open/returned state and due-date window
    pub async fn find(&self, filter: &LoanFilter) -> AppResult<Vec<Loan>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {LOAN_COLUMNS} FROM loans WHERE 1=1"));

        if let Some(member_id) = filter.member_id {
            builder.push(" AND member_id = ").push_bind(member_id);
        }
        match filter.open {
            Some(true) => {
                builder.push(" AND return_date IS NULL");
            }
            Some(false) => {
                builder.push(" AND return_date IS NOT NULL");
            }
            None => {}
        }
        if let Some(due_before) = filter.due_before {
            builder.push(" AND expected_return_date < ").push_bind(due_before);
        }
        if let Some(due_from) = filter.due_from {
            builder.push(" AND expected_return_date >= ").push_bind(due_from);
        }

        builder
            .push(" ORDER BY expected_return_date, id LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.skip);

        let loans = builder.build_query_as::<Loan>().fetch_all(&self.pool).await?;
        Ok(loans)
    }

    /// Counts and fine totals, evaluated against `now` with the same
    /// overdue rule the engine applies per loan
    pub async fn totals(&self, now: DateTime<Utc>) -> AppResult<LedgerTotals> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE return_date IS NULL AND expected_return_date >= $1) AS active,
                COUNT(*) FILTER (WHERE return_date IS NULL AND expected_return_date < $1) AS overdue,
                COUNT(*) FILTER (WHERE return_date IS NOT NULL) AS returned,
                COALESCE(SUM(fine_amount) FILTER (WHERE return_date IS NOT NULL), 0) AS collected_fines,
                COALESCE(SUM(FLOOR(EXTRACT(EPOCH FROM ($1 - expected_return_date)) / 86400))
                    FILTER (WHERE return_date IS NULL AND expected_return_date < $1), 0)::BIGINT AS overdue_days
            FROM loans
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerTotals {
            active: row.get("active"),
            overdue: row.get("overdue"),
            returned: row.get("returned"),
            collected_fines: row.get::<Decimal, _>("collected_fines"),
            overdue_days: row.get("overdue_days"),
        })
    }
}

pub(crate) async fn open_for_member(conn: &mut PgConnection, member_id: i32) -> AppResult<Vec<Loan>> {
    let loans = sqlx::query_as::<_, Loan>(&format!(
        "SELECT {LOAN_COLUMNS} FROM loans WHERE member_id = $1 AND return_date IS NULL ORDER BY loan_date, id"
    ))
    .bind(member_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(loans)
}

/// Load a loan with `FOR UPDATE` so two returns of it cannot interleave
pub(crate) async fn lock_by_id(conn: &mut PgConnection, id: i32) -> AppResult<Option<Loan>> {
    let loan = sqlx::query_as::<_, Loan>(&format!(
        "SELECT {LOAN_COLUMNS} FROM loans WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(loan)
}

pub(crate) async fn insert(conn: &mut PgConnection, loan: &NewLoan) -> AppResult<Loan> {
    let loan = sqlx::query_as::<_, Loan>(&format!(
        r#"
        INSERT INTO loans (member_id, book_id, loan_date, expected_return_date, renewal_count)
        VALUES ($1, $2, $3, $4, 0)
        RETURNING {LOAN_COLUMNS}
        "#
    ))
    .bind(loan.member_id)
    .bind(loan.book_id)
    .bind(loan.loan_date)
    .bind(loan.expected_return_date)
    .fetch_one(&mut *conn)
    .await?;
    Ok(loan)
}

pub(crate) async fn update(conn: &mut PgConnection, loan: &Loan) -> AppResult<()> {
    let rows = sqlx::query(
        r#"
        UPDATE loans
        SET expected_return_date = $2, return_date = $3, fine_amount = $4,
            renewal_count = $5, last_renewed_at = $6
        WHERE id = $1
        "#,
    )
    .bind(loan.id)
    .bind(loan.expected_return_date)
    .bind(loan.return_date)
    .bind(loan.fine_amount)
    .bind(loan.renewal_count)
    .bind(loan.last_renewed_at)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if rows == 0 {
        return Err(AppError::LoanNotFound(loan.id));
    }
    Ok(())
}
