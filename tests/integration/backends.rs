//! Runs against real services. Point DATABASE_URL at a scratch database:
//! migrations are applied and rows are left behind.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;

use library_loans::{
    clock::SystemClock,
    config::AppConfig,
    models::{BookQuery, NewBook, NewMember},
    repository::{LibraryStore, Repository},
    services::{
        cache::{self, AvailabilityCache},
        redis::RedisService,
        Services,
    },
    AppError,
};

fn env(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{} must be set for backend tests", name))
}

fn unique(tag: &str) -> String {
    format!("{}-{}", tag, Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

async fn repository() -> Repository {
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&env("DATABASE_URL"))
        .await
        .expect("Failed to connect to database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    Repository::new(pool, 5_000)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Run with: cargo test -- --ignored
async fn test_postgres_last_copy_race() {
    let store: Arc<dyn LibraryStore> = Arc::new(repository().await);
    let services = Services::new(
        store.clone(),
        Arc::new(cache::MemoryCache::new()),
        Arc::new(SystemClock),
        &AppConfig::default(),
    );

    let book = services
        .catalog
        .add_book(NewBook {
            title: "Grande Sertao: Veredas".to_string(),
            author: "Guimaraes Rosa".to_string(),
            isbn: unique("isbn"),
            total_copies: 1,
        })
        .await
        .expect("book registered");

    let mut handles = Vec::new();
    for i in 0..4 {
        let member = services
            .members
            .register(NewMember {
                name: format!("Racer {}", i),
                email: format!("{}@example.org", unique("racer")),
            })
            .await
            .expect("member registered");
        let loans = services.loans.clone();
        let book_id = book.id;
        handles.push(tokio::spawn(async move { loans.checkout(member.id, book_id).await }));
    }

    let mut granted = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(_) => granted += 1,
            Err(e) => assert!(matches!(e, AppError::BookUnavailable(_)), "unexpected error: {}", e),
        }
    }

    assert_eq!(granted, 1);
    let stored = store.get_book(book.id).await.unwrap().unwrap();
    assert_eq!(stored.available_copies, 0);
}

#[tokio::test]
#[ignore] // Run with: cargo test -- --ignored
async fn test_postgres_duplicate_isbn() {
    let services = Services::new(
        Arc::new(repository().await),
        Arc::new(cache::MemoryCache::new()),
        Arc::new(SystemClock),
        &AppConfig::default(),
    );

    let book = NewBook {
        title: "Sagarana".to_string(),
        author: "Guimaraes Rosa".to_string(),
        isbn: unique("isbn"),
        total_copies: 2,
    };
    services.catalog.add_book(book.clone()).await.expect("first insert");
    let err = services.catalog.add_book(book).await.unwrap_err();
    assert!(matches!(err, AppError::DuplicateIsbn(_)));
}

#[tokio::test]
#[ignore] // Run with: cargo test -- --ignored
async fn test_redis_prefix_invalidation() {
    let redis = RedisService::new(&env("REDIS_URL"))
        .await
        .expect("Failed to connect to Redis");

    let query = BookQuery {
        title: Some(unique("listing")),
        ..BookQuery::default()
    };
    let listing = cache::listing_key(query.skip(), query.limit(), query.title.as_deref(), None);
    let detail = cache::detail_key(424242);
    let unrelated = unique("other");

    let ttl = Duration::from_secs(30);
    redis.set(&listing, "[]", ttl).await.unwrap();
    redis.set(&detail, "{}", ttl).await.unwrap();
    redis.set(&unrelated, "x", ttl).await.unwrap();

    cache::invalidate_book(&redis, 424242).await;

    assert_eq!(redis.get(&listing).await.unwrap(), None);
    assert_eq!(redis.get(&detail).await.unwrap(), None);
    assert_eq!(redis.get(&unrelated).await.unwrap(), Some("x".to_string()));
    redis.delete(&unrelated).await.unwrap();
}
