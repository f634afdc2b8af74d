//! Spend governor: daily and monthly AI cost aggregation with budget
//! admission and coalesced alert emails.
//!
//! Spend is derived from the pipeline-run ledger (`ai_cost_estimate_usd`
//! summed over `started_at` windows); there is no separate spend table.
//! Each process instance sends at most one warning and one hard-stop
//! email per calendar month.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::db::Store;
use crate::monitoring::alerter::Alerter;

pub const MONTHLY_WARNING_USD: f64 = 120.0;
pub const MONTHLY_HARD_STOP_USD: f64 = 150.0;
pub const DAILY_WARNING_USD: f64 = 8.0;

/// Result of a monthly budget check.
#[derive(Debug, Clone)]
pub struct BudgetStatus {
    pub can_proceed: bool,
    pub monthly_spend: f64,
    pub warning: bool,
    pub hard_stop: bool,
    pub message: String,
}

/// Result of a daily budget check.
#[derive(Debug, Clone)]
pub struct DailyBudgetStatus {
    pub daily_spend: f64,
    pub warning: bool,
    pub message: String,
}

pub struct SpendTracker {
    store: Store,
    alerter: Option<Alerter>,
    monthly_warning: f64,
    monthly_cap: f64,
    daily_warning: f64,
    // `YYYY-MM` of the last month an alert was sent for, per instance.
    alerted_month: Mutex<Option<String>>,
}

impl SpendTracker {
    pub fn new(store: Store, alerter: Option<Alerter>) -> Self {
        Self::with_thresholds(
            store,
            alerter,
            MONTHLY_WARNING_USD,
            MONTHLY_HARD_STOP_USD,
            DAILY_WARNING_USD,
        )
    }

    /// Default thresholds with the configured monthly cap.
    pub fn with_monthly_cap(store: Store, alerter: Option<Alerter>, monthly_cap: f64) -> Self {
        Self::with_thresholds(
            store,
            alerter,
            MONTHLY_WARNING_USD.min(monthly_cap),
            monthly_cap,
            DAILY_WARNING_USD,
        )
    }

    pub fn with_thresholds(
        store: Store,
        alerter: Option<Alerter>,
        monthly_warning: f64,
        monthly_cap: f64,
        daily_warning: f64,
    ) -> Self {
        Self {
            store,
            alerter,
            monthly_warning,
            monthly_cap,
            daily_warning,
            alerted_month: Mutex::new(None),
        }
    }

    /// Sum of AI cost over runs started on `date` (UTC day). Store
    /// failures read as 0: spend queries never block a workflow on their
    /// own.
    pub fn daily_spend(&self, date: DateTime<Utc>) -> f64 {
        let day_start = date
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(date);
        match self
            .store
            .sum_ai_cost_between(day_start, day_start + Duration::days(1))
        {
            Ok(total) => total,
            Err(err) => {
                warn!(error = %err, "daily spend query failed, reading 0");
                0.0
            }
        }
    }

    /// Sum of AI cost over runs started in the given calendar month.
    pub fn monthly_spend(&self, year: i32, month: u32) -> f64 {
        let Some(start) = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single() else {
            warn!(year, month, "invalid month for spend query");
            return 0.0;
        };
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        let Some(end) = Utc
            .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
            .single()
        else {
            return 0.0;
        };
        match self.store.sum_ai_cost_between(start, end) {
            Ok(total) => total,
            Err(err) => {
                warn!(error = %err, "monthly spend query failed, reading 0");
                0.0
            }
        }
    }

    /// Check the month-to-date spend against the budget caps. Crossing a
    /// threshold sends at most one email per calendar month per process;
    /// send failures never block admission.
    pub async fn check_budget(&self) -> BudgetStatus {
        let now = Utc::now();
        let monthly = self.monthly_spend(now.year(), now.month());
        let hard_stop = monthly >= self.monthly_cap;
        let warning = monthly >= self.monthly_warning;
        let current_month = format!("{}-{:02}", now.year(), now.month());

        let message = if hard_stop {
            let msg = format!(
                "HARD STOP: monthly AI spend ${monthly:.2} exceeds cap ${:.2}, all AI operations halted",
                self.monthly_cap
            );
            warn!("{msg}");
            self.alert_once(&current_month, monthly).await;
            msg
        } else if warning {
            let msg = format!(
                "WARNING: monthly AI spend ${monthly:.2} approaching cap ${:.2}",
                self.monthly_cap
            );
            warn!("{msg}");
            self.alert_once(&current_month, monthly).await;
            msg
        } else {
            let msg = format!("monthly AI spend ${monthly:.2} / ${:.2}", self.monthly_cap);
            info!("{msg}");
            msg
        };

        BudgetStatus {
            can_proceed: monthly < self.monthly_cap,
            monthly_spend: monthly,
            warning,
            hard_stop,
            message,
        }
    }

    /// Check today's spend against the daily warning threshold.
    pub async fn check_daily_budget(&self) -> DailyBudgetStatus {
        let daily = self.daily_spend(Utc::now());
        let warning = daily >= self.daily_warning;
        let message = if warning {
            let msg = format!(
                "WARNING: daily AI spend ${daily:.2} exceeds threshold ${:.2}",
                self.daily_warning
            );
            warn!("{msg}");
            if let Some(alerter) = &self.alerter {
                alerter
                    .send_alert(
                        &format!("Daily AI spend warning: ${daily:.2}"),
                        &format!(
                            "Daily AI spend has reached ${daily:.2}, exceeding the \
                             ${:.2} warning threshold.\n\nReview pipeline runs to keep \
                             costs under control.",
                            self.daily_warning
                        ),
                        crate::monitoring::alerter::AlertLevel::Warning,
                    )
                    .await;
            }
            msg
        } else {
            format!("daily AI spend ${daily:.2} / ${:.2}", self.daily_warning)
        };
        DailyBudgetStatus {
            daily_spend: daily,
            warning,
            message,
        }
    }

    async fn alert_once(&self, current_month: &str, monthly: f64) {
        {
            let mut alerted = self.alerted_month.lock();
            if alerted.as_deref() == Some(current_month) {
                return;
            }
            *alerted = Some(current_month.to_string());
        }
        if let Some(alerter) = &self.alerter {
            alerter.send_budget_warning(monthly, self.monthly_cap).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunCounts, RunStatus, Workflow};
    use crate::monitoring::alerter::testing::RecordingTransport;
    use std::sync::Arc;

    fn seed_run(store: &Store, id: &str, started_at: DateTime<Utc>, cost: f64) {
        store
            .insert_pipeline_run(id, Workflow::TrendMonitor, started_at, &serde_json::json!({}))
            .unwrap();
        store
            .finish_pipeline_run(
                id,
                RunStatus::Completed,
                started_at,
                1,
                &RunCounts::default(),
                0,
                cost,
                None,
            )
            .unwrap();
    }

    fn tracker_with_transport(
        store: Store,
        monthly_warning: f64,
        monthly_cap: f64,
    ) -> (SpendTracker, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let alerter = Alerter::new(transport.clone(), "ops@example.com".to_string());
        (
            SpendTracker::with_thresholds(store, Some(alerter), monthly_warning, monthly_cap, 8.0),
            transport,
        )
    }

    #[tokio::test]
    async fn test_spend_windows() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        seed_run(&store, "today", now, 1.5);
        seed_run(&store, "last_month", now - Duration::days(40), 10.0);

        let tracker = SpendTracker::new(store, None);
        assert!((tracker.daily_spend(now) - 1.5).abs() < 1e-9);
        let monthly = tracker.monthly_spend(now.year(), now.month());
        assert!((monthly - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_budget_admission_under_cap() {
        let store = Store::open_in_memory().unwrap();
        seed_run(&store, "r", Utc::now(), 10.0);
        let (tracker, transport) = tracker_with_transport(store, 120.0, 150.0);

        let status = tracker.check_budget().await;
        assert!(status.can_proceed);
        assert!(!status.warning && !status.hard_stop);
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_hard_stop_blocks_and_alerts_once_per_month() {
        let store = Store::open_in_memory().unwrap();
        seed_run(&store, "r", Utc::now(), 155.0);
        let (tracker, transport) = tracker_with_transport(store, 120.0, 150.0);

        let first = tracker.check_budget().await;
        assert!(!first.can_proceed);
        assert!(first.hard_stop);
        assert_eq!(transport.sent.lock().len(), 1);

        // Same month: silent.
        let second = tracker.check_budget().await;
        assert!(!second.can_proceed);
        assert_eq!(transport.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_warning_zone_still_proceeds() {
        let store = Store::open_in_memory().unwrap();
        seed_run(&store, "r", Utc::now(), 125.0);
        let (tracker, transport) = tracker_with_transport(store, 120.0, 150.0);

        let status = tracker.check_budget().await;
        assert!(status.can_proceed);
        assert!(status.warning && !status.hard_stop);
        assert_eq!(transport.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_alert_send_failure_does_not_block_admission() {
        let store = Store::open_in_memory().unwrap();
        seed_run(&store, "r", Utc::now(), 125.0);
        let (tracker, transport) = tracker_with_transport(store, 120.0, 150.0);
        transport
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let status = tracker.check_budget().await;
        assert!(status.can_proceed);
        assert!(status.warning);
    }

    #[tokio::test]
    async fn test_daily_budget_warning() {
        let store = Store::open_in_memory().unwrap();
        seed_run(&store, "r", Utc::now(), 9.0);
        let (tracker, transport) = tracker_with_transport(store, 120.0, 150.0);

        let status = tracker.check_daily_budget().await;
        assert!(status.warning);
        assert!((status.daily_spend - 9.0).abs() < 1e-9);
        assert_eq!(transport.sent.lock().len(), 1);
    }
}
