//! Dashboard aggregates over the loan ledger, computed at read time

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::{clock::Clock, config::LoanPolicy, error::AppResult, repository::LibraryStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoanStats {
    pub active: i64,
    pub overdue: i64,
    pub returned: i64,
    /// Fines fixed on returned loans
    pub collected_fines: Decimal,
    /// Fines open overdue loans would owe if returned now
    pub projected_fines: Decimal,
}

#[derive(Clone)]
pub struct StatsService {
    store: Arc<dyn LibraryStore>,
    clock: Arc<dyn Clock>,
    daily_fine_rate: Decimal,
}

impl StatsService {
    pub fn new(store: Arc<dyn LibraryStore>, clock: Arc<dyn Clock>, policy: &LoanPolicy) -> Self {
        Self {
            store,
            clock,
            daily_fine_rate: policy.daily_fine_rate,
        }
    }

    pub async fn loan_stats(&self) -> AppResult<LoanStats> {
        let totals = self.store.ledger_totals(self.clock.now()).await?;
        Ok(LoanStats {
            active: totals.active,
            overdue: totals.overdue,
            returned: totals.returned,
            collected_fines: totals.collected_fines,
            projected_fines: Decimal::from(totals.overdue_days) * self.daily_fine_rate,
        })
    }
}
