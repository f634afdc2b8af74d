//! Sticker archiver.
//!
//! Runs at the start of each pricing cycle, before any repricing, so
//! listing slots free up first. A sticker is archivable when it has a
//! listing, zero sales, zero views, and has been published for at least
//! the threshold number of days.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::clients::marketplace::Marketplace;
use crate::db::Store;
use crate::error::PipelineError;
use crate::limiter::RateLimiter;
use crate::models::{ModerationStatus, PricingTier, Sticker, Workflow};
use crate::monitoring::{ErrorLogger, ErrorReport};
use crate::resilience::{call_with_retry, CircuitBreakers, RetryPolicy};

pub const ARCHIVE_THRESHOLD_DAYS: i64 = 14;

/// True when the sticker qualifies for archival at `now`.
pub fn is_archivable(sticker: &Sticker, now: DateTime<Utc>, threshold_days: i64) -> bool {
    if sticker.listing_id.is_none() {
        return false;
    }
    if sticker.moderation_status == ModerationStatus::Archived
        || sticker.pricing_tier == PricingTier::Archived
    {
        return false;
    }
    if sticker.sales_count > 0 || sticker.view_count > 0 {
        return false;
    }
    match sticker.published_at {
        Some(published_at) => published_at <= now - Duration::days(threshold_days),
        None => false,
    }
}

pub struct StickerArchiver {
    store: Store,
    marketplace: Arc<dyn Marketplace>,
    limiter: Arc<RateLimiter>,
    error_logger: ErrorLogger,
    threshold_days: i64,
}

impl StickerArchiver {
    pub fn new(
        store: Store,
        marketplace: Arc<dyn Marketplace>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            error_logger: ErrorLogger::new(store.clone()),
            store,
            marketplace,
            limiter,
            threshold_days: ARCHIVE_THRESHOLD_DAYS,
        }
    }

    pub fn with_threshold_days(mut self, days: i64) -> Self {
        self.threshold_days = days;
        self
    }

    /// Archive one sticker: deactivate the listing, move both lifecycle
    /// fields to archived, and append the terminal PriceHistory row.
    pub async fn archive_sticker(
        &self,
        breakers: &CircuitBreakers,
        run_id: &str,
        sticker: &Sticker,
    ) -> Result<bool, PipelineError> {
        let Some(listing_id) = sticker.listing_id.as_deref() else {
            return Ok(false);
        };

        let policy = RetryPolicy::default();
        if let Err(err) = call_with_retry(breakers, "marketplace", &policy, || {
            self.marketplace.deactivate(listing_id)
        })
        .await
        {
            warn!(
                sticker_id = %sticker.id,
                listing_id,
                error = %err,
                "failed to deactivate listing"
            );
            self.error_logger.log(
                ErrorReport::from_error(Workflow::PricingEngine, "archive", &err)
                    .with_run(run_id)
                    .with_context(serde_json::json!({
                        "sticker_id": sticker.id,
                        "listing_id": listing_id,
                    })),
            );
            return Err(err);
        }
        self.limiter.increment(1).await.ok();

        self.store.archive_sticker(&sticker.id)?;
        self.store.insert_price_history(
            &sticker.id,
            sticker.price,
            0.0,
            PricingTier::Archived,
            "archived",
        )?;

        info!(sticker_id = %sticker.id, listing_id, "archived sticker");
        Ok(true)
    }

    /// Run the archiver over all published stickers. Returns
    /// (archived, api_calls, errors).
    pub async fn run(
        &self,
        breakers: &CircuitBreakers,
        run_id: &str,
    ) -> Result<(i64, i64, i64), PipelineError> {
        let now = Utc::now();
        let published = self.store.published_stickers()?;
        let archivable: Vec<_> = published
            .into_iter()
            .filter(|s| is_archivable(s, now, self.threshold_days))
            .collect();

        if archivable.is_empty() {
            info!("no stickers to archive");
            return Ok((0, 0, 0));
        }
        info!(
            candidates = archivable.len(),
            threshold_days = self.threshold_days,
            "archiving stale stickers"
        );

        let mut archived = 0;
        let mut api_calls = 0;
        let mut errors = 0;
        for sticker in &archivable {
            match self.archive_sticker(breakers, run_id, sticker).await {
                Ok(true) => {
                    archived += 1;
                    api_calls += 1;
                }
                Ok(false) => {}
                Err(_) => {
                    errors += 1;
                    api_calls += 1;
                }
            }
        }

        info!(archived, total = archivable.len(), "archiver pass complete");
        Ok((archived, api_calls, errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewSticker, NewTrend, SizeClass, TrendStatus};

    fn seed_sticker(store: &Store) -> String {
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
        store
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
                pricing_tier: PricingTier::Cooling,
                fulfillment_provider: "self_usps".to_string(),
            })
            .unwrap()
    }

    fn fetch(store: &Store, id: &str) -> Sticker {
        store.sticker_by_id(id).unwrap().unwrap()
    }

    #[test]
    fn test_archivable_requires_listing_zero_activity_and_age() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let id = seed_sticker(&store);

        // No listing yet.
        assert!(!is_archivable(&fetch(&store, &id), now, 14));

        store
            .set_sticker_listing(&id, "L1", now - Duration::days(20))
            .unwrap();
        assert!(is_archivable(&fetch(&store, &id), now, 14));

        // Too young.
        let young = seed_sticker(&store);
        store
            .set_sticker_listing(&young, "L2", now - Duration::days(5))
            .unwrap();
        assert!(!is_archivable(&fetch(&store, &young), now, 14));

        // Any views keep it alive.
        store.set_sticker_views(&id, 3).unwrap();
        assert!(!is_archivable(&fetch(&store, &id), now, 14));
        store.set_sticker_views(&id, 0).unwrap();

        // Any sales keep it alive.
        store.record_sticker_sale(&id, 1, now).unwrap();
        assert!(!is_archivable(&fetch(&store, &id), now, 14));
    }

    #[test]
    fn test_already_archived_not_rearchived() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let id = seed_sticker(&store);
        store
            .set_sticker_listing(&id, "L1", now - Duration::days(20))
            .unwrap();
        store.archive_sticker(&id).unwrap();
        assert!(!is_archivable(&fetch(&store, &id), now, 14));
    }
}
