//! Analytics sync scenario tests against an in-memory store with
//! scripted marketplace and fulfillment clients.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use crate::analytics::purge::RetentionPurger;
use crate::analytics::sync::AnalyticsSync;
use crate::clients::fulfillment::FulfillmentProvider;
use crate::clients::marketplace::{
    ListingDraft, ListingStats, Marketplace, Receipt, ReceiptLine,
};
use crate::db::Store;
use crate::error::PipelineError;
use crate::limiter::kv::MemoryKv;
use crate::limiter::RateLimiter;
use crate::models::{
    CustomerData, NewSticker, NewTrend, OrderStatus, PricingTier, RunStatus, SizeClass,
    TrendStatus,
};
use crate::monitoring::SpendTracker;

struct ScriptedMarketplace {
    receipts: Mutex<Vec<Receipt>>,
    views: i64,
}

#[async_trait]
impl Marketplace for ScriptedMarketplace {
    async fn create_listing(&self, _draft: &ListingDraft) -> Result<String, PipelineError> {
        Ok("listing-new".to_string())
    }

    async fn update_price(&self, _listing_id: &str, _price: f64) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn deactivate(&self, _listing_id: &str) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn list_receipts(&self) -> Result<Vec<Receipt>, PipelineError> {
        Ok(self.receipts.lock().clone())
    }

    async fn listing_stats(&self, _listing_id: &str) -> Result<ListingStats, PipelineError> {
        Ok(ListingStats { views: self.views })
    }
}

#[derive(Default)]
struct ScriptedFulfillment {
    submissions: Mutex<Vec<(String, i64)>>,
    fail: AtomicBool,
}

#[async_trait]
impl FulfillmentProvider for ScriptedFulfillment {
    async fn submit(
        &self,
        image_url: &str,
        _address: &CustomerData,
        _size: SizeClass,
        quantity: i64,
    ) -> Result<String, PipelineError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PipelineError::api("fulfillment", "printer offline"));
        }
        self.submissions
            .lock()
            .push((image_url.to_string(), quantity));
        Ok("job-1".to_string())
    }

    async fn status(&self, _job_id: &str) -> Result<String, PipelineError> {
        Ok("printed".to_string())
    }

    async fn tracking(&self, _job_id: &str) -> Result<Option<String>, PipelineError> {
        Ok(None)
    }
}

fn seed_listed_sticker(store: &Store, listing_id: &str, tier: PricingTier) -> String {
    let trend_id = store
        .insert_trend(&NewTrend {
            topic: format!("topic {listing_id}"),
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
            image_url: "https://cdn.example/s.png".to_string(),
            thumbnail_url: String::new(),
            original_url: String::new(),
            size: SizeClass::SingleSmall,
            price: 4.49,
            floor_price: 3.49,
            pricing_tier: tier,
            fulfillment_provider: "self_usps".to_string(),
        })
        .unwrap();
    store
        .set_sticker_listing(&sticker_id, listing_id, Utc::now() - Duration::days(2))
        .unwrap();
    sticker_id
}

fn buyer() -> CustomerData {
    CustomerData {
        name: "Jamie Doe".to_string(),
        address: "1 Main St".to_string(),
        city: "Springfield".to_string(),
        state: "IL".to_string(),
        zip: "62701".to_string(),
        country: "US".to_string(),
    }
}

fn receipt(receipt_id: &str, listing_id: &str, quantity: i64) -> Receipt {
    Receipt {
        receipt_id: receipt_id.to_string(),
        lines: vec![ReceiptLine {
            listing_id: listing_id.to_string(),
            quantity,
            unit_price: 4.49,
            title: "s".to_string(),
        }],
        buyer: Some(buyer()),
    }
}

struct Fixture {
    store: Store,
    marketplace: Arc<ScriptedMarketplace>,
    fulfillment: Arc<ScriptedFulfillment>,
    sync: AnalyticsSync,
}

fn fixture(receipts: Vec<Receipt>) -> Fixture {
    let store = Store::open_in_memory().unwrap();
    let marketplace = Arc::new(ScriptedMarketplace {
        receipts: Mutex::new(receipts),
        views: 7,
    });
    let fulfillment = Arc::new(ScriptedFulfillment::default());
    let limiter = Arc::new(RateLimiter::new(Arc::new(MemoryKv::new())));
    let sync = AnalyticsSync::new(
        store.clone(),
        marketplace.clone(),
        fulfillment.clone(),
        limiter,
        SpendTracker::new(store.clone(), None),
        RetentionPurger::new(store.clone(), None),
        None,
        300,
    );
    Fixture {
        store,
        marketplace,
        fulfillment,
        sync,
    }
}

#[tokio::test]
async fn test_receipts_become_orders_with_frozen_tier() {
    let fx = fixture(vec![]);
    let sticker_id = seed_listed_sticker(&fx.store, "L-1", PricingTier::Trending);
    *fx.marketplace.receipts.lock() = vec![receipt("r-1", "L-1", 2)];

    let outcome = fx.sync.run().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.orders_synced, 1);

    // The order froze the tier at sale time and fulfillment picked it up.
    assert_eq!(
        fx.store
            .count_orders_at_tier(&sticker_id, PricingTier::Trending)
            .unwrap(),
        1
    );
    assert_eq!(outcome.orders_fulfilled, 1);
    assert_eq!(fx.fulfillment.submissions.lock().len(), 1);

    // Sales bookkeeping on the sticker.
    let sticker = fx.store.sticker_by_id(&sticker_id).unwrap().unwrap();
    assert_eq!(sticker.sales_count, 2);
    assert!(sticker.last_sale_at.is_some());
    // View refresh came through the stats endpoint.
    assert_eq!(sticker.view_count, 7);
}

#[tokio::test]
async fn test_receipt_ingestion_is_idempotent() {
    let fx = fixture(vec![]);
    let sticker_id = seed_listed_sticker(&fx.store, "L-1", PricingTier::Trending);
    *fx.marketplace.receipts.lock() = vec![receipt("r-1", "L-1", 1)];

    let first = fx.sync.run().await.unwrap();
    assert_eq!(first.orders_synced, 1);

    // Same receipt appears again on the next pull.
    let second = fx.sync.run().await.unwrap();
    assert_eq!(second.orders_synced, 0);

    let sticker = fx.store.sticker_by_id(&sticker_id).unwrap().unwrap();
    assert_eq!(sticker.sales_count, 1);
}

#[tokio::test]
async fn test_unknown_listing_parks_order_for_manual_handling() {
    let fx = fixture(vec![receipt("r-9", "L-unknown", 1)]);

    let outcome = fx.sync.run().await.unwrap();
    assert_eq!(outcome.orders_synced, 1);
    assert_eq!(outcome.orders_fulfilled, 0);

    let pending = fx
        .store
        .orders_by_status(OrderStatus::PendingManual)
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].last_fulfillment_error.as_deref(),
        Some("no sticker attached")
    );
    assert_eq!(pending[0].fulfillment_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fulfillment_failure_goes_partial_and_parks_order() {
    let fx = fixture(vec![]);
    seed_listed_sticker(&fx.store, "L-1", PricingTier::Trending);
    *fx.marketplace.receipts.lock() = vec![receipt("r-1", "L-1", 1)];
    fx.fulfillment.fail.store(true, Ordering::SeqCst);

    let outcome = fx.sync.run().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Partial);
    assert_eq!(outcome.orders_fulfilled, 0);
    assert_eq!(outcome.errors, 1);

    let pending = fx
        .store
        .orders_by_status(OrderStatus::PendingManual)
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].last_fulfillment_error.is_some());
}

#[tokio::test]
async fn test_daily_metrics_refreshed_during_sync() {
    let fx = fixture(vec![]);
    seed_listed_sticker(&fx.store, "L-1", PricingTier::Trending);
    *fx.marketplace.receipts.lock() = vec![receipt("r-1", "L-1", 3)];

    fx.sync.run().await.unwrap();

    let today = Utc::now().format("%Y-%m-%d").to_string();
    let metrics = fx.store.daily_metrics(&today).unwrap().unwrap();
    assert_eq!(metrics.orders, 1);
    assert_eq!(metrics.units, 3);
}
