//! Data-retention purges.
//!
//! Runs inside the daily analytics sync: customer data comes off
//! delivered orders after 90 days, error-log rows go after 90 days,
//! pipeline runs after 180 days, and price history older than a year is
//! exported to cold storage as CSV before deletion from the hot store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::clients::object_store::ObjectStore;
use crate::db::Store;
use crate::error::PipelineError;
use crate::models::PriceHistory;

pub const PII_RETENTION_DAYS: i64 = 90;
pub const ERROR_LOG_RETENTION_DAYS: i64 = 90;
pub const PIPELINE_RUNS_RETENTION_DAYS: i64 = 180;
pub const PRICE_HISTORY_RETENTION_DAYS: i64 = 365;

/// What one purge pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub orders_purged: usize,
    pub errors_deleted: usize,
    pub runs_deleted: usize,
    pub price_history_archived: usize,
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render price-history rows as CSV for the cold archive.
pub fn price_history_csv(rows: &[PriceHistory]) -> String {
    let mut out = String::from("id,sticker_id,old_price,new_price,pricing_tier,reason,created_at\n");
    for row in rows {
        out.push_str(&format!(
            "{},{},{:.2},{:.2},{},{},{}\n",
            row.id,
            csv_field(&row.sticker_id),
            row.old_price,
            row.new_price,
            row.pricing_tier.as_str(),
            csv_field(&row.reason),
            row.created_at.to_rfc3339(),
        ));
    }
    out
}

pub struct RetentionPurger {
    store: Store,
    cold_storage: Option<Arc<dyn ObjectStore>>,
}

impl RetentionPurger {
    pub fn new(store: Store, cold_storage: Option<Arc<dyn ObjectStore>>) -> Self {
        Self {
            store,
            cold_storage,
        }
    }

    /// Nullify customer data on orders delivered at least 90 days ago.
    pub fn purge_customer_data(&self, now: DateTime<Utc>) -> Result<usize, PipelineError> {
        let cutoff = now - Duration::days(PII_RETENTION_DAYS);
        let mut purged = 0;
        for order in self.store.delivered_orders_with_customer_data()? {
            let Some(delivered_at) = order.delivered_at else {
                continue;
            };
            if delivered_at < cutoff {
                self.store.clear_customer_data(&order.id)?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "cleared customer data on delivered orders");
        }
        Ok(purged)
    }

    pub fn purge_error_logs(&self, now: DateTime<Utc>) -> Result<usize, PipelineError> {
        self.store
            .delete_errors_before(now - Duration::days(ERROR_LOG_RETENTION_DAYS))
    }

    pub fn purge_pipeline_runs(&self, now: DateTime<Utc>) -> Result<usize, PipelineError> {
        self.store
            .delete_runs_before(now - Duration::days(PIPELINE_RUNS_RETENTION_DAYS))
    }

    /// Export price history older than a year to cold storage, then
    /// delete it from the hot store. Rows are kept when no cold storage
    /// is wired or the upload fails.
    pub async fn archive_price_history(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, PipelineError> {
        let cutoff = now - Duration::days(PRICE_HISTORY_RETENTION_DAYS);
        let rows = self.store.price_history_before(cutoff)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let Some(cold) = &self.cold_storage else {
            warn!(
                rows = rows.len(),
                "price history due for archive but no cold storage configured"
            );
            return Ok(0);
        };

        let key = format!("archives/price_history/{}.csv", now.format("%Y-%m-%d"));
        let csv = price_history_csv(&rows);
        if let Err(err) = cold.put(&key, csv.into_bytes(), "text/csv").await {
            warn!(error = %err, "price history archive upload failed, keeping hot rows");
            return Err(err);
        }

        let deleted = self.store.delete_price_history_before(cutoff)?;
        info!(
            archived = rows.len(),
            deleted,
            key = %key,
            "price history archived to cold storage"
        );
        Ok(deleted)
    }

    /// Run every purge. Individual failures are isolated: one failing
    /// purge never stops the others.
    pub async fn run_all(&self, now: DateTime<Utc>) -> PurgeReport {
        let mut report = PurgeReport::default();

        match self.purge_customer_data(now) {
            Ok(count) => report.orders_purged = count,
            Err(err) => warn!(error = %err, "customer-data purge failed"),
        }
        match self.purge_error_logs(now) {
            Ok(count) => report.errors_deleted = count,
            Err(err) => warn!(error = %err, "error-log purge failed"),
        }
        match self.purge_pipeline_runs(now) {
            Ok(count) => report.runs_deleted = count,
            Err(err) => warn!(error = %err, "pipeline-run purge failed"),
        }
        match self.archive_price_history(now).await {
            Ok(count) => report.price_history_archived = count,
            Err(err) => warn!(error = %err, "price-history archive failed"),
        }

        info!(?report, "retention purges complete");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CustomerData, NewOrder, NewSticker, NewTrend, OrderStatus, PricingTier, SizeClass,
        TrendStatus, Workflow,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MemoryObjects {
        stored: Mutex<Vec<(String, Vec<u8>)>>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ObjectStore for MemoryObjects {
        async fn put(
            &self,
            key: &str,
            bytes: Vec<u8>,
            _content_type: &str,
        ) -> Result<String, PipelineError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(PipelineError::api("object_store", "unavailable"));
            }
            self.stored.lock().push((key.to_string(), bytes));
            Ok(format!("https://cold.example/{key}"))
        }

        async fn get(&self, _key: &str) -> Result<Vec<u8>, PipelineError> {
            Err(PipelineError::api("object_store", "not implemented"))
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<String>, PipelineError> {
            Ok(self.stored.lock().iter().map(|(k, _)| k.clone()).collect())
        }

        async fn delete(&self, _key: &str) -> Result<(), PipelineError> {
            Ok(())
        }
    }

    fn seed_delivered_order(store: &Store, delivered_days_ago: i64) -> String {
        let id = store
            .insert_order(&NewOrder {
                sticker_id: None,
                receipt_id: uuid::Uuid::new_v4().to_string(),
                status: OrderStatus::Paid,
                quantity: 1,
                unit_price: 4.49,
                pricing_tier_at_sale: Some(PricingTier::Trending),
                customer_data: Some(CustomerData {
                    name: "Jamie Doe".to_string(),
                    address: "1 Main St".to_string(),
                    city: "Springfield".to_string(),
                    state: "IL".to_string(),
                    zip: "62701".to_string(),
                    country: "US".to_string(),
                }),
            })
            .unwrap();
        store
            .mark_order_delivered(&id, Utc::now() - Duration::days(delivered_days_ago))
            .unwrap();
        id
    }

    fn seed_price_history(store: &Store) -> String {
        let trend_id = store
            .insert_trend(&NewTrend {
                topic: "t".to_string(),
                normalized_topic: uuid::Uuid::new_v4().to_string(),
                sources: vec![],
                keywords: vec![],
                score_velocity: None,
                score_commercial: None,
                score_safety: None,
                score_uniqueness: None,
                score_overall: None,
                reasoning: String::new(),
                status: TrendStatus::Generated,
                source_data: serde_json::json!({}),
            })
            .unwrap();
        let sticker_id = store
            .insert_sticker(&NewSticker {
                trend_id,
                title: "s".to_string(),
                description: String::new(),
                image_url: String::new(),
                thumbnail_url: String::new(),
                original_url: String::new(),
                size: SizeClass::SingleSmall,
                price: 4.49,
                floor_price: 3.49,
                pricing_tier: PricingTier::Trending,
                fulfillment_provider: "self_usps".to_string(),
            })
            .unwrap();
        store
            .insert_price_history(&sticker_id, 5.49, 4.49, PricingTier::Trending, "trend_age")
            .unwrap();
        sticker_id
    }

    #[tokio::test]
    async fn test_customer_data_purged_after_ninety_days() {
        let store = Store::open_in_memory().unwrap();
        let old = seed_delivered_order(&store, 120);
        let recent = seed_delivered_order(&store, 30);
        let purger = RetentionPurger::new(store.clone(), None);

        let purged = purger.purge_customer_data(Utc::now()).unwrap();
        assert_eq!(purged, 1);

        let remaining = store.delivered_orders_with_customer_data().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, recent);
        let _ = old;
    }

    #[tokio::test]
    async fn test_error_and_run_retention() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_error(
                Workflow::TrendMonitor,
                "step",
                "api_error",
                "old",
                None,
                None,
                0,
                None,
            )
            .unwrap();
        store
            .insert_pipeline_run(
                "old-run",
                Workflow::TrendMonitor,
                Utc::now() - Duration::days(200),
                &serde_json::json!({}),
            )
            .unwrap();

        let purger = RetentionPurger::new(store.clone(), None);
        // Fresh error survives a purge at `now`.
        assert_eq!(purger.purge_error_logs(Utc::now()).unwrap(), 0);
        // But not a purge dated far in the future.
        assert_eq!(
            purger
                .purge_error_logs(Utc::now() + Duration::days(100))
                .unwrap(),
            1
        );
        assert_eq!(purger.purge_pipeline_runs(Utc::now()).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_price_history_archives_to_cold_storage_then_deletes() {
        let store = Store::open_in_memory().unwrap();
        let sticker_id = seed_price_history(&store);
        let objects = Arc::new(MemoryObjects::default());
        let purger = RetentionPurger::new(store.clone(), Some(objects.clone()));

        // Not old enough yet.
        assert_eq!(purger.archive_price_history(Utc::now()).await.unwrap(), 0);

        // A year later the row is exported and deleted.
        let later = Utc::now() + Duration::days(400);
        let archived = purger.archive_price_history(later).await.unwrap();
        assert_eq!(archived, 1);
        assert!(store.price_history_for(&sticker_id).unwrap().is_empty());

        let stored = objects.stored.lock();
        assert_eq!(stored.len(), 1);
        let csv = String::from_utf8(stored[0].1.clone()).unwrap();
        assert!(csv.starts_with("id,sticker_id,old_price"));
        assert!(csv.contains("trend_age"));
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_hot_rows() {
        let store = Store::open_in_memory().unwrap();
        let sticker_id = seed_price_history(&store);
        let objects = Arc::new(MemoryObjects::default());
        objects
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let purger = RetentionPurger::new(store.clone(), Some(objects));

        let later = Utc::now() + Duration::days(400);
        assert!(purger.archive_price_history(later).await.is_err());
        assert_eq!(store.price_history_for(&sticker_id).unwrap().len(), 1);
    }

    #[test]
    fn test_csv_escaping() {
        let rows = vec![PriceHistory {
            id: 1,
            sticker_id: "s-1".to_string(),
            old_price: 4.49,
            new_price: 3.49,
            pricing_tier: PricingTier::Cooling,
            reason: "tier_change:trending->cooling".to_string(),
            created_at: Utc::now(),
        }];
        let csv = price_history_csv(&rows);
        assert!(csv.contains("tier_change:trending->cooling"));
        assert_eq!(csv.lines().count(), 2);
    }
}
