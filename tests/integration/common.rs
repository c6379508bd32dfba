use std::{sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};

use library_loans::{
    clock::ManualClock,
    config::AppConfig,
    models::{Book, Member, NewBook, NewMember},
    repository::{LibraryStore, MemoryStore},
    services::{
        cache::{AvailabilityCache, MemoryCache},
        Services,
    },
};

pub struct Harness {
    pub services: Services,
    pub store: MemoryStore,
    pub cache: MemoryCache,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    pub fn with_config(config: AppConfig) -> Self {
        let store = MemoryStore::with_lock_timeout(Duration::from_secs(2));
        let cache = MemoryCache::new();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap());

        let services = Services::new(
            Arc::new(store.clone()) as Arc<dyn LibraryStore>,
            Arc::new(cache.clone()) as Arc<dyn AvailabilityCache>,
            Arc::new(clock.clone()),
            &config,
        );

        Self {
            services,
            store,
            cache,
            clock,
        }
    }

    pub async fn book(&self, title: &str, copies: i32) -> Book {
        self.services
            .catalog
            .add_book(NewBook {
                title: title.to_string(),
                author: "Clarice Lispector".to_string(),
                isbn: format!("978-{}", title.to_lowercase().replace(' ', "-")),
                total_copies: copies,
            })
            .await
            .expect("book registered")
    }

    pub async fn member(&self, name: &str) -> Member {
        self.services
            .members
            .register(NewMember {
                name: name.to_string(),
                email: format!("{}@example.org", name.to_lowercase()),
            })
            .await
            .expect("member registered")
    }

    pub async fn available(&self, book_id: i32) -> i32 {
        self.store
            .get_book(book_id)
            .await
            .expect("store read")
            .expect("book exists")
            .available_copies
    }
}
