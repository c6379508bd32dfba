//! Due-soon and overdue reminders
//!
//! Each pass walks the open loans in two windows, claims a notification row
//! per loan and channel, then hands it to the channel's [`Notifier`]. The
//! claim is what deduplicates: a loan that already has a row of that kind on
//! that channel is skipped, whether the earlier delivery worked or not.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::{
    clock::Clock,
    config::NotificationConfig,
    error::{AppError, AppResult},
    models::{
        loan::{Loan, LoanFilter},
        notification::{NewNotification, Notification, NotificationChannel, NotificationKind},
    },
    repository::LibraryStore,
};

const CANDIDATE_PAGE: i64 = 100;

/// Delivers one notification over one channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> NotificationChannel;

    async fn send(&self, notification: &Notification) -> AppResult<()>;
}

/// Writes the notification to the log instead of delivering it
#[derive(Debug, Clone, Copy)]
pub struct TracingNotifier {
    channel: NotificationChannel,
}

impl TracingNotifier {
    pub fn new(channel: NotificationChannel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl Notifier for TracingNotifier {
    fn channel(&self) -> NotificationChannel {
        self.channel
    }

    async fn send(&self, notification: &Notification) -> AppResult<()> {
        tracing::info!(
            "[{}] {} for member {} (loan {}): {}",
            self.channel,
            notification.subject,
            notification.member_id,
            notification.loan_id,
            notification.payload
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub due_soon_sent: usize,
    pub overdue_sent: usize,
    pub failed: usize,
}

impl DispatchSummary {
    pub fn total_sent(&self) -> usize {
        self.due_soon_sent + self.overdue_sent
    }
}

#[derive(Clone)]
pub struct NotificationService {
    store: Arc<dyn LibraryStore>,
    clock: Arc<dyn Clock>,
    notifiers: HashMap<NotificationChannel, Arc<dyn Notifier>>,
    config: NotificationConfig,
}

impl NotificationService {
    /// Channels listed in `config` without a matching notifier are skipped
    pub fn new(
        store: Arc<dyn LibraryStore>,
        clock: Arc<dyn Clock>,
        notifiers: Vec<Arc<dyn Notifier>>,
        config: NotificationConfig,
    ) -> Self {
        let notifiers: HashMap<_, _> = notifiers.into_iter().map(|n| (n.channel(), n)).collect();
        for channel in &config.channels {
            if !notifiers.contains_key(channel) {
                tracing::warn!("No notifier registered for channel {}", channel);
            }
        }

        Self {
            store,
            clock,
            notifiers,
            config,
        }
    }

    /// One [`TracingNotifier`] per configured channel
    pub fn with_tracing_notifiers(
        store: Arc<dyn LibraryStore>,
        clock: Arc<dyn Clock>,
        config: NotificationConfig,
    ) -> Self {
        let notifiers = config
            .channels
            .iter()
            .map(|&channel| Arc::new(TracingNotifier::new(channel)) as Arc<dyn Notifier>)
            .collect();
        Self::new(store, clock, notifiers, config)
    }

    fn channels(&self) -> Vec<(NotificationChannel, Arc<dyn Notifier>)> {
        let mut channels: Vec<_> = self
            .config
            .channels
            .iter()
            .filter_map(|c| self.notifiers.get(c).map(|n| (*c, n.clone())))
            .collect();
        channels.sort_by_key(|(c, _)| *c);
        channels.dedup_by_key(|(c, _)| *c);
        channels
    }

    /// Remind every loan that is due within the window or already overdue,
    /// once per kind and channel
    pub async fn dispatch_due(&self) -> AppResult<DispatchSummary> {
        let mut summary = DispatchSummary::default();
        if !self.config.enabled {
            return Ok(summary);
        }

        let now = self.clock.now();
        let window_end = Duration::try_days(self.config.due_soon_days)
            .and_then(|window| now.checked_add_signed(window))
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "Due-soon window of {} days is out of range",
                    self.config.due_soon_days
                ))
            })?;

        let due_soon = LoanFilter {
            open: Some(true),
            due_from: Some(now),
            due_before: Some(window_end),
            ..LoanFilter::default()
        };
        let overdue = LoanFilter {
            open: Some(true),
            due_before: Some(now),
            ..LoanFilter::default()
        };

        let (sent, failed) = self.dispatch_kind(NotificationKind::DueSoon, due_soon, now).await?;
        summary.due_soon_sent = sent;
        summary.failed += failed;

        let (sent, failed) = self.dispatch_kind(NotificationKind::Overdue, overdue, now).await?;
        summary.overdue_sent = sent;
        summary.failed += failed;

        Ok(summary)
    }

    async fn dispatch_kind(
        &self,
        kind: NotificationKind,
        mut filter: LoanFilter,
        now: DateTime<Utc>,
    ) -> AppResult<(usize, usize)> {
        let channels = self.channels();
        let max_loans = self.config.max_per_run as usize;
        let (mut sent, mut failed, mut loans_claimed) = (0, 0, 0);

        filter.limit = CANDIDATE_PAGE;
        'pages: loop {
            let page = self.store.find_loans(&filter).await?;

            for loan in &page {
                if loans_claimed >= max_loans {
                    break 'pages;
                }

                let mut claimed_any = false;
                for (channel, notifier) in &channels {
                    let draft = self.compose(kind, *channel, loan, now).await?;
                    let Some(mut notification) = self.store.claim_notification(&draft).await? else {
                        continue;
                    };
                    claimed_any = true;

                    match notifier.send(&notification).await {
                        Ok(()) => {
                            notification.settle_sent(self.clock.now());
                            sent += 1;
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Notification {} ({} over {}) failed for loan {}: {}",
                                notification.id,
                                kind,
                                channel,
                                loan.id,
                                e
                            );
                            notification.settle_failed(e.to_string());
                            failed += 1;
                        }
                    }
                    self.store.update_notification(&notification).await?;
                }

                if claimed_any {
                    loans_claimed += 1;
                }
            }

            if (page.len() as i64) < filter.limit {
                break;
            }
            filter.skip += filter.limit;
        }

        if loans_claimed > 0 {
            tracing::info!(
                "Dispatched {} reminders for {} loan(s): {} sent, {} failed",
                kind,
                loans_claimed,
                sent,
                failed
            );
        }
        Ok((sent, failed))
    }

    async fn compose(
        &self,
        kind: NotificationKind,
        channel: NotificationChannel,
        loan: &Loan,
        now: DateTime<Utc>,
    ) -> AppResult<NewNotification> {
        let member = self.store.get_member(loan.member_id).await?;
        let book = self.store.get_book(loan.book_id).await?;

        let (subject, mut payload) = match kind {
            NotificationKind::DueSoon => (
                "Loan due soon",
                json!({ "days_left": (loan.expected_return_date - now).num_days().max(0) }),
            ),
            NotificationKind::Overdue => (
                "Loan overdue",
                json!({ "days_overdue": loan.days_late_at(now) }),
            ),
        };
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("type".to_string(), json!(kind));
            fields.insert("member_id".to_string(), json!(loan.member_id));
            fields.insert("member_email".to_string(), json!(member.map(|m| m.email)));
            fields.insert("book_id".to_string(), json!(loan.book_id));
            fields.insert("book_title".to_string(), json!(book.map(|b| b.title)));
            fields.insert("expected_return_date".to_string(), json!(loan.expected_return_date));
        }

        Ok(NewNotification {
            member_id: loan.member_id,
            loan_id: loan.id,
            kind,
            channel,
            subject: subject.to_string(),
            payload,
            created_at: now,
        })
    }
}
