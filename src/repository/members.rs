//! Members repository for database operations

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Pool, Postgres};

use crate::{
    error::{AppError, AppResult},
    models::member::{Member, NewMember},
};

const MEMBER_COLUMNS: &str = "id, name, email, is_active, created_at";

#[derive(Clone)]
pub struct MembersRepository {
    pool: Pool<Postgres>,
}

impl MembersRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Get member by ID
    pub async fn get_by_id(&self, id: i32) -> AppResult<Option<Member>> {
        let member = sqlx::query_as::<_, Member>(&format!("SELECT {MEMBER_COLUMNS} FROM members WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(member)
    }
}

/// Load a member with `FOR UPDATE`; checkouts by the same member queue here
pub(crate) async fn lock_by_id(conn: &mut PgConnection, id: i32) -> AppResult<Option<Member>> {
    let member = sqlx::query_as::<_, Member>(&format!(
        "SELECT {MEMBER_COLUMNS} FROM members WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(member)
}

pub(crate) async fn insert(conn: &mut PgConnection, member: &NewMember, now: DateTime<Utc>) -> AppResult<Member> {
    let member = sqlx::query_as::<_, Member>(&format!(
        r#"
        INSERT INTO members (name, email, is_active, created_at)
        VALUES ($1, $2, TRUE, $3)
        RETURNING {MEMBER_COLUMNS}
        "#
    ))
    .bind(&member.name)
    .bind(&member.email)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(member)
}

pub(crate) async fn set_active(conn: &mut PgConnection, id: i32, active: bool) -> AppResult<()> {
    let rows = sqlx::query("UPDATE members SET is_active = $2 WHERE id = $1")
        .bind(id)
        .bind(active)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    if rows == 0 {
        return Err(AppError::MemberNotFound(id));
    }
    Ok(())
}
