//! Postgres transaction used by the loan engine

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Transaction};

use crate::{
    error::AppResult,
    models::{
        book::{Book, NewBook},
        loan::{Loan, NewLoan},
        member::{Member, NewMember},
    },
};

use super::{books, loans, members, StoreTransaction};

/// Wraps a sqlx transaction. sqlx issues ROLLBACK when it is dropped
/// uncommitted.
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgTransaction {
    pub async fn begin(pool: &Pool<Postgres>, lock_timeout_ms: u64) -> AppResult<Self> {
        let mut tx = pool.begin().await?;
        // SET does not accept bind parameters
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", lock_timeout_ms))
            .execute(&mut *tx)
            .await?;
        Ok(Self { tx })
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn lock_member(&mut self, id: i32) -> AppResult<Option<Member>> {
        members::lock_by_id(&mut self.tx, id).await
    }

    async fn open_loans_for_member(&mut self, member_id: i32) -> AppResult<Vec<Loan>> {
        loans::open_for_member(&mut self.tx, member_id).await
    }

    async fn lock_book(&mut self, id: i32) -> AppResult<Option<Book>> {
        books::lock_by_id(&mut self.tx, id).await
    }

    async fn set_available_copies(&mut self, book_id: i32, available: i32) -> AppResult<()> {
        books::set_available_copies(&mut self.tx, book_id, available).await
    }

    async fn insert_loan(&mut self, loan: &NewLoan) -> AppResult<Loan> {
        loans::insert(&mut self.tx, loan).await
    }

    async fn lock_loan(&mut self, id: i32) -> AppResult<Option<Loan>> {
        loans::lock_by_id(&mut self.tx, id).await
    }

    async fn update_loan(&mut self, loan: &Loan) -> AppResult<()> {
        loans::update(&mut self.tx, loan).await
    }

    async fn insert_book(&mut self, book: &NewBook) -> AppResult<Book> {
        books::insert(&mut self.tx, book).await
    }

    async fn insert_member(&mut self, member: &NewMember, now: DateTime<Utc>) -> AppResult<Member> {
        members::insert(&mut self.tx, member, now).await
    }

    async fn set_member_active(&mut self, id: i32, active: bool) -> AppResult<()> {
        members::set_active(&mut self.tx, id, active).await
    }

    async fn commit(self: Box<Self>) -> AppResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
