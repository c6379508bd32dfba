//! Availability cache: cache-aside listings invalidated by key prefix

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;

use crate::error::AppResult;

/// Every catalog listing key starts with this prefix
pub const LISTING_PREFIX: &str = "books:list:";

/// Key for a cached listing page
pub fn listing_key(skip: i64, limit: i64, title: Option<&str>, author: Option<&str>) -> String {
    format!(
        "{}{}:{}:{}:{}",
        LISTING_PREFIX,
        skip,
        limit,
        title.unwrap_or_default(),
        author.unwrap_or_default()
    )
}

/// Key for a cached single book
pub fn detail_key(book_id: i32) -> String {
    format!("books:detail:{}", book_id)
}

/// Shared key-value cache. The loan engine only ever invalidates; readers
/// repopulate on miss.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AvailabilityCache: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;

    async fn delete(&self, key: &str) -> AppResult<()>;

    /// Delete every key starting with `prefix`, returning how many went
    async fn delete_prefix(&self, prefix: &str) -> AppResult<u64>;
}

/// Drop every cached view whose availability figure may include `book_id`.
///
/// Best-effort: failures are logged and swallowed, the committed mutation
/// stands. Listing keys are cleared wholesale by prefix because any page for
/// any filter may contain the book.
///
/// Invalidation does not fence readers. A listing read from the store before
/// the mutation committed can still be written back after this runs, and then
/// shows the old availability until its TTL expires. Readers narrow that
/// window by dropping fills from slow reads (see `CatalogService`), and
/// checkout never trusts a cached figure.
pub async fn invalidate_book(cache: &dyn AvailabilityCache, book_id: i32) {
    match cache.delete_prefix(LISTING_PREFIX).await {
        Ok(removed) => tracing::debug!("Invalidated {} listing keys after change to book {}", removed, book_id),
        Err(e) => tracing::warn!("Failed to invalidate listing cache for book {}: {}", book_id, e),
    }
    if let Err(e) = cache.delete(&detail_key(book_id)).await {
        tracing::warn!("Failed to invalidate detail cache for book {}: {}", book_id, e);
    }
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process cache with the same prefix semantics as the Redis one
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<BTreeMap<String, Entry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries()
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[async_trait]
impl AvailabilityCache for MemoryCache {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        self.entries().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.entries().remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> AppResult<u64> {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}
