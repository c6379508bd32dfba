//! Business logic services

pub mod cache;
pub mod catalog;
pub mod loans;
pub mod members;
pub mod notifications;
pub mod redis;
pub mod stats;

use std::{sync::Arc, time::Duration};

use crate::{clock::Clock, config::AppConfig, repository::LibraryStore};

use self::cache::AvailabilityCache;

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub catalog: catalog::CatalogService,
    pub members: members::MembersService,
    pub loans: loans::LoansService,
    pub stats: stats::StatsService,
    pub notifications: notifications::NotificationService,
}

impl Services {
    /// Create all services over the given store, cache and clock. Reminders
    /// go to the log until real notifiers are registered.
    pub fn new(
        store: Arc<dyn LibraryStore>,
        cache: Arc<dyn AvailabilityCache>,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
    ) -> Self {
        Self {
            catalog: catalog::CatalogService::new(
                store.clone(),
                cache.clone(),
                Duration::from_secs(config.redis.listing_ttl_seconds),
            ),
            members: members::MembersService::new(store.clone(), clock.clone()),
            loans: loans::LoansService::new(store.clone(), cache, clock.clone(), config.loans.clone()),
            stats: stats::StatsService::new(store.clone(), clock.clone(), &config.loans),
            notifications: notifications::NotificationService::with_tracing_notifiers(
                store,
                clock,
                config.notifications.clone(),
            ),
        }
    }
}
