//! Sticker generator orchestrator.
//!
//! Triggered after a successful discovery cycle. For each `discovered`
//! trend, subject to the daily image cap, runs the external asset chain
//! (prompt, image generation, validation, post-processing, upload) and
//! inserts a pending Sticker row. Trends move to `generated` or
//! `generation_failed`.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::clients::image_gen::ImageGenerator;
use crate::clients::object_store::ObjectStore;
use crate::config::CostRates;
use crate::db::Store;
use crate::error::PipelineError;
use crate::limiter::{lock_ttl_seconds, RateLimiter};
use crate::models::{
    NewSticker, PricingTier, RunCounts, RunStatus, SizeClass, Trend, TrendStatus, Workflow,
};
use crate::monitoring::{Alerter, ErrorLogger, ErrorReport, PipelineRunLogger, RunClose, SpendTracker};
use crate::pricing::tiers::{floor_price_for, TierTable};
use crate::resilience::{call_with_retry, CircuitBreakers, RetryPolicy};

const WORKFLOW: Workflow = Workflow::StickerGenerator;

/// Finished artifacts for one sticker.
#[derive(Debug, Clone)]
pub struct StickerAssets {
    pub title: String,
    pub description: String,
    pub image_url: String,
    pub thumbnail_url: String,
    pub original_url: String,
}

/// The external prompt → image → validate → post-process → upload chain.
#[async_trait]
pub trait AssetChain: Send + Sync {
    async fn produce(&self, trend: &Trend, size: SizeClass) -> Result<StickerAssets, PipelineError>;
}

/// Asset chain backed by the image-generation and object-store clients.
pub struct DefaultAssetChain {
    image_gen: Arc<dyn ImageGenerator>,
    objects: Arc<dyn ObjectStore>,
    image_size: u32,
}

impl DefaultAssetChain {
    pub fn new(
        image_gen: Arc<dyn ImageGenerator>,
        objects: Arc<dyn ObjectStore>,
        image_size: u32,
    ) -> Self {
        Self {
            image_gen,
            objects,
            image_size,
        }
    }
}

#[async_trait]
impl AssetChain for DefaultAssetChain {
    async fn produce(&self, trend: &Trend, _size: SizeClass) -> Result<StickerAssets, PipelineError> {
        let prompt = format!(
            "die-cut vinyl sticker of {}, bold outlines, white border, flat colors, high contrast",
            trend.topic
        );
        let image = self.image_gen.generate(&prompt, self.image_size).await?;

        let key_base = format!("stickers/{}", uuid::Uuid::new_v4());
        let original_url = self
            .objects
            .put(&format!("{key_base}/original.png"), image.clone(), "image/png")
            .await?;
        let image_url = self
            .objects
            .put(&format!("{key_base}/sticker.png"), image.clone(), "image/png")
            .await?;
        let thumbnail_url = self
            .objects
            .put(&format!("{key_base}/thumb.png"), image, "image/png")
            .await?;

        Ok(StickerAssets {
            title: format!("{} Sticker", trend.topic),
            description: format!(
                "Die-cut vinyl sticker inspired by \"{}\". Waterproof, fade-resistant.",
                trend.topic
            ),
            image_url,
            thumbnail_url,
            original_url,
        })
    }
}

/// Result of one generation run.
#[derive(Debug, Clone, Copy)]
pub struct GenerationOutcome {
    pub status: RunStatus,
    pub counts: RunCounts,
}

pub struct StickerGenerator {
    store: Store,
    chain: Arc<dyn AssetChain>,
    limiter: Arc<RateLimiter>,
    spend: SpendTracker,
    run_logger: PipelineRunLogger,
    error_logger: ErrorLogger,
    alerter: Option<Alerter>,
    breakers: CircuitBreakers,
    costs: CostRates,
    max_images_per_day: i64,
}

impl StickerGenerator {
    pub fn new(
        store: Store,
        chain: Arc<dyn AssetChain>,
        limiter: Arc<RateLimiter>,
        spend: SpendTracker,
        alerter: Option<Alerter>,
        costs: CostRates,
        max_images_per_day: i64,
    ) -> Self {
        Self {
            run_logger: PipelineRunLogger::new(store.clone()),
            error_logger: ErrorLogger::new(store.clone()),
            store,
            chain,
            limiter,
            spend,
            alerter,
            breakers: CircuitBreakers::new(),
            costs,
            max_images_per_day,
        }
    }

    pub async fn run(&self) -> Result<GenerationOutcome, PipelineError> {
        if !self.limiter.acquire_lock(WORKFLOW).await {
            info!("another sticker generator is running, exiting");
            return Ok(GenerationOutcome {
                status: RunStatus::Completed,
                counts: RunCounts::default(),
            });
        }
        let result = self.run_locked().await;
        self.limiter.release_lock(WORKFLOW).await;
        result
    }

    async fn run_locked(&self) -> Result<GenerationOutcome, PipelineError> {
        let run_id = self.run_logger.start(WORKFLOW, None)?;
        let deadline =
            Instant::now() + StdDuration::from_secs(lock_ttl_seconds(WORKFLOW));

        match self.execute(&run_id, deadline).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.run_logger
                    .fail(&run_id, &err.to_string(), RunClose::default())
                    .ok();
                if let Some(alerter) = &self.alerter {
                    alerter
                        .send_alert(
                            "Sticker generator failed",
                            &format!("Unhandled error: {err}"),
                            crate::monitoring::AlertLevel::Critical,
                        )
                        .await;
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        run_id: &str,
        deadline: Instant,
    ) -> Result<GenerationOutcome, PipelineError> {
        let budget = self.spend.check_budget().await;
        if !budget.can_proceed {
            warn!("AI budget exceeded, skipping generation");
            self.run_logger.complete(
                run_id,
                RunClose {
                    metadata: Some(json!({"skipped": "budget_exceeded"})),
                    ..Default::default()
                },
            )?;
            return Ok(GenerationOutcome {
                status: RunStatus::Completed,
                counts: RunCounts::default(),
            });
        }

        // Daily image cap counts stickers created since UTC midnight.
        let midnight = Utc
            .from_utc_datetime(&Utc::now().date_naive().and_hms_opt(0, 0, 0).expect("midnight"));
        let generated_today = self.store.count_stickers_created_since(midnight)?;
        let remaining = (self.max_images_per_day - generated_today).max(0);
        if remaining == 0 {
            info!(
                cap = self.max_images_per_day,
                "daily image cap reached, skipping generation"
            );
            self.run_logger.complete(
                run_id,
                RunClose {
                    metadata: Some(json!({"skipped": "image_cap"})),
                    ..Default::default()
                },
            )?;
            return Ok(GenerationOutcome {
                status: RunStatus::Completed,
                counts: RunCounts::default(),
            });
        }

        let discovered = self.store.trends_by_status(TrendStatus::Discovered)?;
        let mut counts = RunCounts::default();
        let mut images_generated = 0u32;
        let tiers = TierTable::load(&self.store);
        let policy = RetryPolicy::default();

        for trend in discovered.iter().take(remaining as usize) {
            if Instant::now() >= deadline {
                warn!("lock-TTL deadline reached, stopping generation early");
                break;
            }

            let produced = call_with_retry(&self.breakers, "image_gen", &policy, || {
                self.chain.produce(trend, SizeClass::SingleSmall)
            })
            .await;

            match produced {
                Ok(assets) => {
                    let size = SizeClass::SingleSmall;
                    let price = tiers.price_for(PricingTier::JustDropped, size);
                    let floor = floor_price_for(&self.store, size, "self_usps");
                    let sticker = NewSticker {
                        trend_id: trend.id.clone(),
                        title: assets.title,
                        description: assets.description,
                        image_url: assets.image_url,
                        thumbnail_url: assets.thumbnail_url,
                        original_url: assets.original_url,
                        size,
                        price: price.max(floor),
                        floor_price: floor,
                        pricing_tier: PricingTier::JustDropped,
                        fulfillment_provider: "self_usps".to_string(),
                    };
                    match self.store.insert_sticker(&sticker) {
                        Ok(sticker_id) => {
                            images_generated += 1;
                            counts.stickers_generated += 1;
                            self.store
                                .set_trend_status(&trend.id, TrendStatus::Generated)?;
                            info!(
                                trend = %trend.topic,
                                sticker_id = %sticker_id,
                                "generated sticker, moderation pending"
                            );
                        }
                        Err(err) => {
                            counts.errors_count += 1;
                            warn!(trend = %trend.topic, error = %err, "sticker insert failed");
                            self.error_logger.log(
                                ErrorReport::from_error(WORKFLOW, "sticker_store", &err)
                                    .with_service("store")
                                    .with_run(run_id),
                            );
                        }
                    }
                }
                Err(err) => {
                    counts.errors_count += 1;
                    warn!(trend = %trend.topic, error = %err, "asset chain failed");
                    self.error_logger.log(
                        ErrorReport::from_error(WORKFLOW, "generation", &err)
                            .with_run(run_id)
                            .with_context(json!({"trend_id": trend.id})),
                    );
                    self.store
                        .set_trend_status(&trend.id, TrendStatus::GenerationFailed)?;
                }
            }
        }

        let ai_cost = self.costs.estimate(0, 0, images_generated);
        let close = RunClose {
            counts,
            api_calls_used: 0,
            ai_cost_estimate_usd: ai_cost,
            metadata: Some(json!({
                "images_generated": images_generated,
                "cap_remaining": remaining - images_generated as i64,
            })),
        };
        let status = if counts.errors_count > 0 && counts.stickers_generated > 0 {
            self.run_logger.partial(run_id, "", close)?;
            RunStatus::Partial
        } else if counts.errors_count > 0 {
            self.run_logger.partial(run_id, "all generations failed", close)?;
            RunStatus::Partial
        } else {
            self.run_logger.complete(run_id, close)?;
            RunStatus::Completed
        };

        Ok(GenerationOutcome { status, counts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::kv::MemoryKv;
    use crate::models::NewTrend;
    use parking_lot::Mutex;

    struct ScriptedChain {
        fail_topics: Vec<String>,
        produced: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AssetChain for ScriptedChain {
        async fn produce(
            &self,
            trend: &Trend,
            _size: SizeClass,
        ) -> Result<StickerAssets, PipelineError> {
            if self.fail_topics.contains(&trend.topic) {
                return Err(PipelineError::api("image_gen", "render failed"));
            }
            self.produced.lock().push(trend.topic.clone());
            Ok(StickerAssets {
                title: format!("{} Sticker", trend.topic),
                description: String::new(),
                image_url: "https://cdn.example/sticker.png".to_string(),
                thumbnail_url: "https://cdn.example/thumb.png".to_string(),
                original_url: "https://cdn.example/original.png".to_string(),
            })
        }
    }

    fn seed_discovered(store: &Store, topic: &str) -> String {
        store
            .insert_trend(&NewTrend {
                topic: topic.to_string(),
                normalized_topic: topic.to_lowercase(),
                sources: vec!["reddit".to_string()],
                keywords: vec![],
                score_velocity: Some(8),
                score_commercial: Some(8),
                score_safety: Some(9),
                score_uniqueness: Some(7),
                score_overall: Some(8.0),
                reasoning: String::new(),
                status: TrendStatus::Discovered,
                source_data: serde_json::json!({}),
            })
            .unwrap()
    }

    fn generator(store: &Store, chain: Arc<dyn AssetChain>, cap: i64) -> StickerGenerator {
        StickerGenerator::new(
            store.clone(),
            chain,
            Arc::new(RateLimiter::new(Arc::new(MemoryKv::new()))),
            SpendTracker::new(store.clone(), None),
            None,
            CostRates {
                llm_input_per_token: 0.0,
                llm_output_per_token: 0.0,
                per_image: 0.003,
            },
            cap,
        )
    }

    #[tokio::test]
    async fn test_generates_pending_stickers_for_discovered_trends() {
        let store = Store::open_in_memory().unwrap();
        let a = seed_discovered(&store, "Cute Baby Hippo");
        let b = seed_discovered(&store, "Lunar Eclipse");
        let chain = Arc::new(ScriptedChain {
            fail_topics: vec![],
            produced: Mutex::new(vec![]),
        });
        let generator = generator(&store, chain, 50);

        let outcome = generator.run().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.counts.stickers_generated, 2);

        for trend_id in [&a, &b] {
            let trend = store.trend_by_id(trend_id).unwrap().unwrap();
            assert_eq!(trend.status, TrendStatus::Generated);
        }
        let generated = store.trends_by_status(TrendStatus::Discovered).unwrap();
        assert!(generated.is_empty());

        // AI cost reflects two images at the per-image rate.
        let runs = store
            .sum_ai_cost_between(
                Utc::now() - chrono::Duration::hours(1),
                Utc::now() + chrono::Duration::hours(1),
            )
            .unwrap();
        assert!((runs - 0.006).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_chain_marks_generation_failed() {
        let store = Store::open_in_memory().unwrap();
        let good = seed_discovered(&store, "Cute Baby Hippo");
        let bad = seed_discovered(&store, "Render Me Not");
        let chain = Arc::new(ScriptedChain {
            fail_topics: vec!["Render Me Not".to_string()],
            produced: Mutex::new(vec![]),
        });
        let generator = generator(&store, chain, 50);

        let outcome = generator.run().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Partial);
        assert_eq!(outcome.counts.stickers_generated, 1);
        assert_eq!(outcome.counts.errors_count, 1);

        assert_eq!(
            store.trend_by_id(&good).unwrap().unwrap().status,
            TrendStatus::Generated
        );
        assert_eq!(
            store.trend_by_id(&bad).unwrap().unwrap().status,
            TrendStatus::GenerationFailed
        );
    }

    #[tokio::test]
    async fn test_daily_image_cap_limits_batch() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..3 {
            seed_discovered(&store, &format!("Topic {i}"));
        }
        let chain = Arc::new(ScriptedChain {
            fail_topics: vec![],
            produced: Mutex::new(vec![]),
        });
        let generator = generator(&store, chain.clone(), 2);

        let outcome = generator.run().await.unwrap();
        assert_eq!(outcome.counts.stickers_generated, 2);
        assert_eq!(chain.produced.lock().len(), 2);
        // One trend left for the next cycle.
        assert_eq!(store.trends_by_status(TrendStatus::Discovered).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cap_already_spent_skips_run() {
        let store = Store::open_in_memory().unwrap();
        seed_discovered(&store, "Topic");
        let chain = Arc::new(ScriptedChain {
            fail_topics: vec![],
            produced: Mutex::new(vec![]),
        });
        // Cap of zero: nothing may generate today.
        let generator = generator(&store, chain.clone(), 0);

        let outcome = generator.run().await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.counts.stickers_generated, 0);
        assert!(chain.produced.lock().is_empty());
    }
}
