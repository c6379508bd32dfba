//! Periodic overdue report and reminders
//!
//! The report is read-only: it pages through overdue loans and logs each one
//! with its projected fine, then a summary line. Overdue status is never
//! persisted. The same tick dispatches due-soon and overdue reminders, which
//! only write notification rows.

use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::watch;

use crate::{
    error::AppResult,
    services::{
        loans::{LoansService, MAX_PAGE},
        notifications::NotificationService,
    },
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverdueSummary {
    pub loans: usize,
    pub members: usize,
    pub projected_fines: Decimal,
}

/// One pass over every overdue loan. Pages are capped at [`MAX_PAGE`]
/// whatever `page_size` asks for.
pub async fn run_once(loans: &LoansService, page_size: i64) -> AppResult<OverdueSummary> {
    let page_size = page_size.clamp(1, MAX_PAGE);
    let mut summary = OverdueSummary::default();
    let mut members = std::collections::HashSet::new();
    let mut skip = 0;

    loop {
        let page = loans.list_overdue(None, skip, page_size).await?;
        for view in &page {
            tracing::info!(
                "Overdue loan {}: member {} book {} due {} ({} day(s) late, projected fine {})",
                view.loan.id,
                view.loan.member_id,
                view.loan.book_id,
                view.loan.expected_return_date,
                view.days_late,
                view.projected_fine
            );
            members.insert(view.loan.member_id);
            summary.projected_fines += view.projected_fine;
        }
        summary.loans += page.len();

        if (page.len() as i64) < page_size {
            break;
        }
        skip += page_size;
    }

    summary.members = members.len();
    Ok(summary)
}

/// Run the report and dispatch reminders every `interval` until `shutdown`
/// flips to true
pub async fn run(
    loans: LoansService,
    notifications: NotificationService,
    interval: Duration,
    page_size: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("Overdue report started (every {}s)", interval.as_secs());
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_once(&loans, page_size).await {
                    Ok(summary) => tracing::info!(
                        "Overdue report: {} loan(s) across {} member(s), projected fines {}",
                        summary.loans,
                        summary.members,
                        summary.projected_fines
                    ),
                    Err(e) => tracing::error!("Overdue report failed: {}", e),
                }
                match notifications.dispatch_due().await {
                    Ok(sent) if sent.total_sent() + sent.failed > 0 => tracing::info!(
                        "Reminders: {} due soon, {} overdue sent, {} failed",
                        sent.due_soon_sent,
                        sent.overdue_sent,
                        sent.failed
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::error!("Reminder dispatch failed: {}", e),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("Overdue report stopped");
}
