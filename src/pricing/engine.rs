//! Daily pricing engine.
//!
//! Runs the archiver first to free listing slots, then walks every
//! non-archived published sticker through the per-sticker decision:
//! age-based tier lookup, sales override, floor enforcement, price-point
//! rounding, marketplace update, and the PriceHistory append. Repricing
//! fans out over a bounded worker pool; a shared deadline derived from
//! the lock TTL cancels stragglers.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::clients::marketplace::Marketplace;
use crate::db::Store;
use crate::error::PipelineError;
use crate::limiter::{lock_ttl_seconds, Priority, RateLimiter};
use crate::models::{PricingTier, RunCounts, RunStatus, Sticker, Workflow};
use crate::monitoring::{Alerter, ErrorLogger, ErrorReport, PipelineRunLogger, RunClose};
use crate::pricing::archiver::StickerArchiver;
use crate::pricing::tiers::{floor_price_for, round_to_price_point, TierTable};
use crate::resilience::{call_with_retry, CircuitBreakers, RetryPolicy};

const WORKFLOW: Workflow = Workflow::PricingEngine;

/// Sales at the current tier that freeze the price.
pub const SALES_OVERRIDE_THRESHOLD: i64 = 10;

/// A sale within this window counts as recent.
pub const RECENT_SALES_WINDOW_DAYS: i64 = 14;

const REPRICE_CONCURRENCY: usize = 8;

/// Outcome of the per-sticker decision, before any I/O.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Already archived; not ours to touch.
    Skip,
    /// Stale with zero sales; the archiver owns this one.
    LeaveToArchiver,
    /// Sales override active: tier field advances, price stays, no
    /// PriceHistory row.
    TierOnly { new_tier: PricingTier },
    /// Price (and possibly tier) change.
    Reprice {
        new_tier: PricingTier,
        new_price: f64,
        reason: String,
    },
    NoChange,
}

/// The per-sticker pricing decision, applied in order. Pure: all store
/// reads happen before the call.
pub fn decide(
    sticker: &Sticker,
    trend_age_days: i64,
    sales_at_current_tier: i64,
    tiers: &TierTable,
    floor_price: f64,
    now: DateTime<Utc>,
) -> Decision {
    if sticker.moderation_status == crate::models::ModerationStatus::Archived
        || sticker.pricing_tier == PricingTier::Archived
    {
        return Decision::Skip;
    }

    let mut new_tier = tiers.tier_for_age(trend_age_days);

    if trend_age_days >= 30 {
        let has_recent_sales = sticker
            .last_sale_at
            .map(|at| at >= now - Duration::days(RECENT_SALES_WINDOW_DAYS))
            .unwrap_or(false);
        if !has_recent_sales {
            if sticker.sales_count == 0 {
                return Decision::LeaveToArchiver;
            }
            // Historical sales but none recent: hold at evergreen.
            new_tier = PricingTier::Evergreen;
        }
    }

    if sales_at_current_tier >= SALES_OVERRIDE_THRESHOLD {
        if new_tier != sticker.pricing_tier {
            return Decision::TierOnly { new_tier };
        }
        return Decision::NoChange;
    }

    let base = tiers.price_for(new_tier, sticker.size);
    let target = if base < floor_price { floor_price } else { base };
    let new_price = round_to_price_point(target);

    if (new_price - sticker.price).abs() < 0.01 && new_tier == sticker.pricing_tier {
        return Decision::NoChange;
    }

    let reason = if new_tier != sticker.pricing_tier {
        format!(
            "tier_change:{}->{}",
            sticker.pricing_tier.as_str(),
            new_tier.as_str()
        )
    } else {
        "trend_age".to_string()
    };
    Decision::Reprice {
        new_tier,
        new_price,
        reason,
    }
}

/// What one worker did with one sticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepriceResult {
    Updated,
    TierOnly,
    NoChange,
    DeadlineSkipped,
}

/// Shared state for the repricing workers.
struct RepriceContext {
    store: Store,
    marketplace: Arc<dyn Marketplace>,
    tiers: TierTable,
    breakers: Arc<CircuitBreakers>,
    error_logger: ErrorLogger,
    limiter: Arc<RateLimiter>,
    run_id: String,
    deadline: Instant,
    cancelled: AtomicBool,
    api_calls: AtomicI64,
}

impl RepriceContext {
    async fn process(&self, sticker: Sticker) -> Result<RepriceResult, PipelineError> {
        if self.cancelled.load(Ordering::SeqCst) || Instant::now() >= self.deadline {
            self.cancelled.store(true, Ordering::SeqCst);
            return Ok(RepriceResult::DeadlineSkipped);
        }

        let now = Utc::now();
        let trend_created = self
            .store
            .trend_by_id(&sticker.trend_id)?
            .map(|t| t.created_at)
            .unwrap_or(sticker.created_at);
        let trend_age_days = (now - trend_created).num_days().max(0);
        let sales_at_tier = self
            .store
            .count_orders_at_tier(&sticker.id, sticker.pricing_tier)?;
        let floor = floor_price_for(&self.store, sticker.size, &sticker.fulfillment_provider);

        match decide(&sticker, trend_age_days, sales_at_tier, &self.tiers, floor, now) {
            Decision::Skip | Decision::LeaveToArchiver | Decision::NoChange => {
                Ok(RepriceResult::NoChange)
            }
            Decision::TierOnly { new_tier } => {
                info!(
                    sticker_id = %sticker.id,
                    from = sticker.pricing_tier.as_str(),
                    to = new_tier.as_str(),
                    "sales override holds price, advancing tier only"
                );
                self.store.set_sticker_tier(&sticker.id, new_tier)?;
                Ok(RepriceResult::TierOnly)
            }
            Decision::Reprice {
                new_tier,
                new_price,
                reason,
            } => {
                if let Some(listing_id) = sticker.listing_id.as_deref() {
                    let policy = RetryPolicy::default();
                    let result = call_with_retry(&self.breakers, "marketplace", &policy, || {
                        self.marketplace.update_price(listing_id, new_price)
                    })
                    .await;
                    self.api_calls.fetch_add(1, Ordering::SeqCst);
                    self.limiter.increment(1).await.ok();
                    result?;
                }
                self.store
                    .update_sticker_pricing(&sticker.id, new_price, new_tier, floor)?;
                self.store.insert_price_history(
                    &sticker.id,
                    sticker.price,
                    new_price,
                    new_tier,
                    &reason,
                )?;
                info!(
                    sticker_id = %sticker.id,
                    old = sticker.price,
                    new = new_price,
                    reason = %reason,
                    "repriced sticker"
                );
                Ok(RepriceResult::Updated)
            }
        }
    }
}

/// Result of one engine run.
#[derive(Debug, Clone, Copy)]
pub struct PricingOutcome {
    pub status: RunStatus,
    pub counts: RunCounts,
}

pub struct PricingEngine {
    store: Store,
    marketplace: Arc<dyn Marketplace>,
    limiter: Arc<RateLimiter>,
    run_logger: PipelineRunLogger,
    error_logger: ErrorLogger,
    alerter: Option<Alerter>,
    breakers: Arc<CircuitBreakers>,
}

impl PricingEngine {
    pub fn new(
        store: Store,
        marketplace: Arc<dyn Marketplace>,
        limiter: Arc<RateLimiter>,
        alerter: Option<Alerter>,
    ) -> Self {
        Self {
            run_logger: PipelineRunLogger::new(store.clone()),
            error_logger: ErrorLogger::new(store.clone()),
            store,
            marketplace,
            limiter,
            alerter,
            breakers: Arc::new(CircuitBreakers::new()),
        }
    }

    /// Execute the daily cycle. The lock is always released on the way
    /// out.
    pub async fn run(&self) -> Result<PricingOutcome, PipelineError> {
        if !self.limiter.acquire_lock(WORKFLOW).await {
            info!("another pricing engine is running, exiting");
            return Ok(PricingOutcome {
                status: RunStatus::Completed,
                counts: RunCounts::default(),
            });
        }
        let result = self.run_locked().await;
        self.limiter.release_lock(WORKFLOW).await;
        result
    }

    async fn run_locked(&self) -> Result<PricingOutcome, PipelineError> {
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
                            "Pricing engine failed",
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
    ) -> Result<PricingOutcome, PipelineError> {
        let mut counts = RunCounts::default();

        // Price updates ride the P2 budget.
        if !self.limiter.can_proceed(Priority::PriceUpdates).await {
            warn!("daily API budget too high for price updates, skipping");
            self.run_logger.complete(
                run_id,
                RunClose {
                    metadata: Some(json!({"skipped": "rate_limit"})),
                    ..Default::default()
                },
            )?;
            return Ok(PricingOutcome {
                status: RunStatus::Completed,
                counts,
            });
        }

        // Archive first so listing slots free up before anything else.
        let archiver = StickerArchiver::new(
            self.store.clone(),
            self.marketplace.clone(),
            self.limiter.clone(),
        );
        let (archived, archive_calls, archive_errors) =
            archiver.run(&self.breakers, run_id).await?;
        counts.stickers_archived = archived;
        counts.errors_count += archive_errors;

        let stickers: Vec<Sticker> = self
            .store
            .published_stickers()?
            .into_iter()
            .filter(|s| {
                s.moderation_status != crate::models::ModerationStatus::Archived
                    && s.pricing_tier != PricingTier::Archived
            })
            .collect();
        info!(stickers = stickers.len(), "repricing published stickers");

        let context = Arc::new(RepriceContext {
            store: self.store.clone(),
            marketplace: self.marketplace.clone(),
            tiers: TierTable::load(&self.store),
            breakers: self.breakers.clone(),
            error_logger: self.error_logger.clone(),
            limiter: self.limiter.clone(),
            run_id: run_id.to_string(),
            deadline,
            cancelled: AtomicBool::new(false),
            api_calls: AtomicI64::new(0),
        });

        // Bounded worker pool; rows are disjoint so per-sticker writes
        // never race.
        let semaphore = Arc::new(Semaphore::new(REPRICE_CONCURRENCY));
        let mut tasks = JoinSet::new();
        for sticker in stickers {
            let context = context.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                let sticker_id = sticker.id.clone();
                (sticker_id, context.process(sticker).await)
            });
        }

        let mut deadline_skipped = 0i64;
        while let Some(joined) = tasks.join_next().await {
            let (sticker_id, result) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    counts.errors_count += 1;
                    warn!(error = %err, "reprice worker panicked");
                    continue;
                }
            };
            match result {
                Ok(RepriceResult::Updated) => counts.prices_updated += 1,
                Ok(RepriceResult::TierOnly | RepriceResult::NoChange) => {}
                Ok(RepriceResult::DeadlineSkipped) => deadline_skipped += 1,
                Err(err) => {
                    counts.errors_count += 1;
                    warn!(sticker_id = %sticker_id, error = %err, "reprice failed");
                    context.error_logger.log(
                        ErrorReport::from_error(WORKFLOW, "reprice", &err)
                            .with_run(&context.run_id)
                            .with_context(json!({"sticker_id": sticker_id})),
                    );
                }
            }
        }

        let api_calls = archive_calls + context.api_calls.load(Ordering::SeqCst);
        let metadata = if deadline_skipped > 0 {
            Some(json!({"deadline_skipped": deadline_skipped}))
        } else {
            None
        };
        let close = RunClose {
            counts,
            api_calls_used: api_calls,
            ai_cost_estimate_usd: 0.0,
            metadata,
        };

        let status = if deadline_skipped > 0 || counts.errors_count > 0 {
            self.run_logger.partial(run_id, "", close)?;
            RunStatus::Partial
        } else {
            self.run_logger.complete(run_id, close)?;
            RunStatus::Completed
        };

        info!(
            repriced = counts.prices_updated,
            archived = counts.stickers_archived,
            errors = counts.errors_count,
            "pricing engine cycle done"
        );
        Ok(PricingOutcome { status, counts })
    }
}
