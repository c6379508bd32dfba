//! Book (catalog) model

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Book row. `available_copies` is owned by the catalog store and only moves
/// inside a transaction that also writes the loan ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Book {
    pub id: i32,
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub total_copies: i32,
    pub available_copies: i32,
}

impl Book {
    pub fn is_available(&self) -> bool {
        self.available_copies > 0
    }

    /// Stock after lending one copy, if a copy is on the shelf
    pub fn checked_out(&self) -> Option<i32> {
        (self.available_copies > 0).then(|| self.available_copies - 1)
    }

    /// Stock after a copy comes back, capped at the total
    pub fn checked_in(&self) -> i32 {
        (self.available_copies + 1).min(self.total_copies)
    }
}

/// Book registration request
#[derive(Debug, Clone, Deserialize)]
pub struct NewBook {
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub total_copies: i32,
}

/// Catalog listing query
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookQuery {
    pub title: Option<String>,
    pub author: Option<String>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

impl BookQuery {
    pub fn skip(&self) -> i64 {
        self.skip.unwrap_or(0).max(0)
    }

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(10).clamp(1, 100)
    }

    pub fn matches(&self, book: &Book) -> bool {
        fn contains(haystack: &str, needle: &Option<String>) -> bool {
            needle
                .as_deref()
                .map_or(true, |n| haystack.to_lowercase().contains(&n.to_lowercase()))
        }
        contains(&book.title, &self.title) && contains(&book.author, &self.author)
    }
}
