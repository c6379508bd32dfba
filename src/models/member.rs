//! Member model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Active,
    Blocked,
}

/// Member row. Active-loan counts are not stored here; they are derived from
/// the loan ledger when a decision needs them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Member {
    pub id: i32,
    pub name: String,
    pub email: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Member {
    pub fn status(&self) -> MemberStatus {
        if self.is_active {
            MemberStatus::Active
        } else {
            MemberStatus::Blocked
        }
    }
}

/// Member registration request
#[derive(Debug, Clone, Deserialize)]
pub struct NewMember {
    pub name: String,
    pub email: String,
}
