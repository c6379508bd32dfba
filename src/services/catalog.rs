//! Catalog service: cache-aside listings and book registration

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    error::{AppError, AppResult},
    models::book::{Book, BookQuery, NewBook},
    repository::LibraryStore,
};

use super::cache::{self, AvailabilityCache};

/// A store read that took longer than this is not written back to the cache,
/// since a checkout may have committed and invalidated in the meantime
const MAX_FILL_LAG: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct CatalogService {
    store: Arc<dyn LibraryStore>,
    cache: Arc<dyn AvailabilityCache>,
    listing_ttl: Duration,
}

impl CatalogService {
    pub fn new(store: Arc<dyn LibraryStore>, cache: Arc<dyn AvailabilityCache>, listing_ttl: Duration) -> Self {
        Self {
            store,
            cache,
            listing_ttl,
        }
    }

    /// List books, served from cache when possible. Availability shown here
    /// may lag a concurrent checkout; checkout re-reads stock under lock.
    pub async fn list_books(&self, query: &BookQuery) -> AppResult<Vec<Book>> {
        let key = cache::listing_key(
            query.skip(),
            query.limit(),
            query.title.as_deref(),
            query.author.as_deref(),
        );

        if let Some(books) = self.cached::<Vec<Book>>(&key).await {
            return Ok(books);
        }

        let started = Instant::now();
        let books = self.store.search_books(query).await?;
        self.fill(&key, &books, started).await;
        Ok(books)
    }

    /// Get a book by ID
    pub async fn get_book(&self, book_id: i32) -> AppResult<Book> {
        let key = cache::detail_key(book_id);
        if let Some(book) = self.cached::<Book>(&key).await {
            return Ok(book);
        }

        let started = Instant::now();
        let book = self
            .store
            .get_book(book_id)
            .await?
            .ok_or(AppError::BookNotFound(book_id))?;
        self.fill(&key, &book, started).await;
        Ok(book)
    }

    /// Register a new title with all copies on the shelf
    pub async fn add_book(&self, book: NewBook) -> AppResult<Book> {
        if book.total_copies < 0 {
            return Err(AppError::Validation("total_copies must not be negative".to_string()));
        }
        if book.isbn.trim().is_empty() || book.title.trim().is_empty() {
            return Err(AppError::Validation("title and isbn are required".to_string()));
        }

        let mut tx = self.store.begin().await?;
        let created = tx.insert_book(&book).await?;
        tx.commit().await?;

        tracing::info!("Book {} registered: {} ({} copies)", created.id, created.title, created.total_copies);
        cache::invalidate_book(self.cache.as_ref(), created.id).await;
        Ok(created)
    }

    /// Cache read; a miss, an unreadable entry or a cache failure all fall
    /// through to the store
    async fn cached<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!("Discarding unreadable cache entry {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn fill<T: serde::Serialize>(&self, key: &str, value: &T, read_started: Instant) {
        let lag = read_started.elapsed();
        if lag > MAX_FILL_LAG {
            tracing::debug!("Not caching {}: store read took {:?}", key, lag);
            return;
        }
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Failed to serialize cache entry {}: {}", key, e);
                return;
            }
        };
        if let Err(e) = self.cache.set(key, &raw, self.listing_ttl).await {
            tracing::warn!("Cache write failed for {}: {}", key, e);
        }
    }
}
