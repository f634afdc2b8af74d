//! Daily analytics sync orchestrator.
//!
//! Pulls new marketplace receipts into Order rows (idempotent on the
//! receipt id), updates sticker sales and view counts, submits paid
//! orders to the fulfillment provider, refreshes the derived daily
//! metrics, runs the retention purges, and sends the daily summary
//! email unconditionally at the close.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::analytics::purge::RetentionPurger;
use crate::clients::fulfillment::FulfillmentProvider;
use crate::clients::marketplace::{Marketplace, Receipt};
use crate::db::Store;
use crate::error::{ErrorKind, PipelineError};
use crate::limiter::{lock_ttl_seconds, Priority, RateLimiter};
use crate::models::{
    NewOrder, Order, OrderStatus, RunCounts, RunStatus, Workflow,
};
use crate::monitoring::{
    Alerter, DailySummary, ErrorLogger, ErrorReport, PipelineRunLogger, RunClose, SpendTracker,
};
use crate::resilience::{call_with_retry, CircuitBreakers, RetryPolicy};

const WORKFLOW: Workflow = Workflow::AnalyticsSync;

/// Result of one sync run.
#[derive(Debug, Clone, Copy)]
pub struct SyncOutcome {
    pub status: RunStatus,
    pub orders_synced: i64,
    pub orders_fulfilled: i64,
    pub errors: i64,
}

pub struct AnalyticsSync {
    store: Store,
    marketplace: Arc<dyn Marketplace>,
    fulfillment: Arc<dyn FulfillmentProvider>,
    limiter: Arc<RateLimiter>,
    spend: SpendTracker,
    purger: RetentionPurger,
    run_logger: PipelineRunLogger,
    error_logger: ErrorLogger,
    alerter: Option<Alerter>,
    breakers: CircuitBreakers,
    max_active_listings: i64,
}

impl AnalyticsSync {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        marketplace: Arc<dyn Marketplace>,
        fulfillment: Arc<dyn FulfillmentProvider>,
        limiter: Arc<RateLimiter>,
        spend: SpendTracker,
        purger: RetentionPurger,
        alerter: Option<Alerter>,
        max_active_listings: i64,
    ) -> Self {
        Self {
            run_logger: PipelineRunLogger::new(store.clone()),
            error_logger: ErrorLogger::new(store.clone()),
            store,
            marketplace,
            fulfillment,
            limiter,
            spend,
            purger,
            alerter,
            breakers: CircuitBreakers::new(),
            max_active_listings,
        }
    }

    pub async fn run(&self) -> Result<SyncOutcome, PipelineError> {
        if !self.limiter.acquire_lock(WORKFLOW).await {
            info!("another analytics sync is running, exiting");
            return Ok(SyncOutcome {
                status: RunStatus::Completed,
                orders_synced: 0,
                orders_fulfilled: 0,
                errors: 0,
            });
        }
        let result = self.run_locked().await;
        self.limiter.release_lock(WORKFLOW).await;
        result
    }

    async fn run_locked(&self) -> Result<SyncOutcome, PipelineError> {
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
                            "Analytics sync failed",
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
    ) -> Result<SyncOutcome, PipelineError> {
        let mut counts = RunCounts::default();
        let mut orders_synced = 0i64;
        let mut orders_fulfilled = 0i64;
        let mut api_calls = 0i64;
        let policy = RetryPolicy::default();

        // Step 1: ingest new receipts. Order reads ride the P0 budget.
        if self.limiter.can_proceed(Priority::OrderReads).await {
            match call_with_retry(&self.breakers, "marketplace", &policy, || {
                self.marketplace.list_receipts()
            })
            .await
            {
                Ok(receipts) => {
                    api_calls += 1;
                    self.limiter.increment(1).await.ok();
                    info!(receipts = receipts.len(), "fetched marketplace receipts");
                    for receipt in receipts {
                        match self.ingest_receipt(&receipt) {
                            Ok(created) => orders_synced += created,
                            Err(err) => {
                                counts.errors_count += 1;
                                warn!(receipt_id = %receipt.receipt_id, error = %err, "receipt ingest failed");
                                self.error_logger.log(
                                    ErrorReport::from_error(WORKFLOW, "order_sync", &err)
                                        .with_run(run_id)
                                        .with_context(json!({"receipt_id": receipt.receipt_id})),
                                );
                            }
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::InvalidGrant => {
                    // A dead refresh token halts the whole workflow.
                    return Err(err);
                }
                Err(err) => {
                    counts.errors_count += 1;
                    warn!(error = %err, "receipt fetch failed");
                    self.error_logger
                        .log(ErrorReport::from_error(WORKFLOW, "order_fetch", &err).with_run(run_id));
                }
            }
        } else {
            info!("order reads denied by rate budget this run");
        }

        // Step 2: refresh listing view counts under the P3 budget.
        if self.limiter.can_proceed(Priority::Analytics).await && Instant::now() < deadline {
            api_calls += self.refresh_listing_stats().await;
        }

        // Step 3: submit paid orders for fulfillment.
        let paid = self.store.orders_by_status(OrderStatus::Paid)?;
        for order in paid {
            if Instant::now() >= deadline {
                warn!("lock-TTL deadline reached, deferring remaining fulfillment");
                break;
            }
            match self.fulfill_order(&order).await {
                Ok(true) => orders_fulfilled += 1,
                Ok(false) => {}
                Err(err) => {
                    counts.errors_count += 1;
                    warn!(order_id = %order.id, error = %err, "fulfillment failed");
                    self.error_logger.log(
                        ErrorReport::from_error(WORKFLOW, "fulfillment", &err)
                            .with_run(run_id)
                            .with_context(json!({"order_id": order.id})),
                    );
                }
            }
        }

        // Step 4: derived views.
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let metrics = self.store.refresh_daily_metrics(&today)?;

        // Step 5: retention purges.
        let purge = self.purger.run_all(Utc::now()).await;

        // Step 6: summary email, unconditional.
        if let Some(alerter) = &self.alerter {
            let now = Utc::now();
            use chrono::Datelike;
            let summary = DailySummary {
                pipeline_health: vec![
                    ("analytics_sync".to_string(), "running".to_string()),
                    ("orders_synced".to_string(), orders_synced.to_string()),
                    (
                        "consecutive_failures".to_string(),
                        self.error_logger
                            .consecutive_failures(WORKFLOW, 3)
                            .to_string(),
                    ),
                ],
                orders: metrics.orders,
                units: metrics.units,
                gross_revenue: metrics.gross_revenue,
                active_listings: self.store.count_active_listings()?,
                max_listings: self.max_active_listings,
                new_listings: metrics.new_listings,
                prices_updated: 0,
                stickers_archived: 0,
                api_calls,
                ai_spend_today: self.spend.daily_spend(now),
                ai_spend_mtd: self.spend.monthly_spend(now.year(), now.month()),
                alerts: vec![],
            };
            alerter.send_daily_summary(&summary).await;
        }

        let close = RunClose {
            counts,
            api_calls_used: api_calls,
            ai_cost_estimate_usd: 0.0,
            metadata: Some(json!({
                "orders_synced": orders_synced,
                "orders_fulfilled": orders_fulfilled,
                "purge": {
                    "orders_purged": purge.orders_purged,
                    "errors_deleted": purge.errors_deleted,
                    "runs_deleted": purge.runs_deleted,
                    "price_history_archived": purge.price_history_archived,
                },
            })),
        };
        let status = if counts.errors_count > 0 {
            self.run_logger.partial(run_id, "", close)?;
            RunStatus::Partial
        } else {
            self.run_logger.complete(run_id, close)?;
            RunStatus::Completed
        };

        info!(
            orders_synced,
            orders_fulfilled,
            errors = counts.errors_count,
            "analytics sync done"
        );
        Ok(SyncOutcome {
            status,
            orders_synced,
            orders_fulfilled,
            errors: counts.errors_count,
        })
    }

    /// Create Order rows for one receipt. Receipts already ingested (by
    /// receipt id) are skipped, making re-runs idempotent.
    fn ingest_receipt(&self, receipt: &Receipt) -> Result<i64, PipelineError> {
        if self.store.orders_exist_for_receipt(&receipt.receipt_id)? {
            return Ok(0);
        }

        let mut created = 0;
        for line in &receipt.lines {
            let sticker = self.store.sticker_by_listing_id(&line.listing_id)?;
            let (sticker_id, tier_at_sale) = match &sticker {
                Some(s) => (Some(s.id.clone()), Some(s.pricing_tier)),
                None => {
                    warn!(listing_id = %line.listing_id, "receipt line for unknown listing");
                    (None, None)
                }
            };

            self.store.insert_order(&NewOrder {
                sticker_id: sticker_id.clone(),
                receipt_id: receipt.receipt_id.clone(),
                status: OrderStatus::Paid,
                quantity: line.quantity,
                unit_price: line.unit_price,
                pricing_tier_at_sale: tier_at_sale,
                customer_data: receipt.buyer.clone(),
            })?;
            created += 1;

            if let Some(sticker_id) = sticker_id {
                self.store
                    .record_sticker_sale(&sticker_id, line.quantity, Utc::now())?;
            }
        }
        Ok(created)
    }

    /// Pull view counts for every listed sticker. Per-listing failures
    /// are logged and skipped.
    async fn refresh_listing_stats(&self) -> i64 {
        let stickers = match self.store.published_stickers() {
            Ok(stickers) => stickers,
            Err(err) => {
                warn!(error = %err, "could not load stickers for stats refresh");
                return 0;
            }
        };
        let policy = RetryPolicy::default().with_max_attempts(1);
        let mut api_calls = 0;
        for sticker in stickers {
            let Some(listing_id) = sticker.listing_id.as_deref() else {
                continue;
            };
            match call_with_retry(&self.breakers, "marketplace", &policy, || {
                self.marketplace.listing_stats(listing_id)
            })
            .await
            {
                Ok(stats) => {
                    api_calls += 1;
                    self.limiter.increment(1).await.ok();
                    if let Err(err) = self.store.set_sticker_views(&sticker.id, stats.views) {
                        warn!(sticker_id = %sticker.id, error = %err, "view count update failed");
                    }
                }
                Err(err) => {
                    api_calls += 1;
                    warn!(listing_id, error = %err, "listing stats fetch failed");
                }
            }
        }
        api_calls
    }

    /// Submit one paid order. Returns true when it moved to
    /// `sent_to_print`; orders without shippable data park in
    /// `pending_manual`.
    async fn fulfill_order(&self, order: &Order) -> Result<bool, PipelineError> {
        let Some(sticker_id) = order.sticker_id.as_deref() else {
            self.store.update_order_fulfillment(
                &order.id,
                OrderStatus::PendingManual,
                Some("no sticker attached"),
            )?;
            return Ok(false);
        };
        let Some(address) = order.customer_data.as_ref() else {
            self.store.update_order_fulfillment(
                &order.id,
                OrderStatus::PendingManual,
                Some("no shipping address"),
            )?;
            return Ok(false);
        };
        let Some(sticker) = self.store.sticker_by_id(sticker_id)? else {
            self.store.update_order_fulfillment(
                &order.id,
                OrderStatus::PendingManual,
                Some("sticker row missing"),
            )?;
            return Ok(false);
        };

        let policy = RetryPolicy::default();
        match call_with_retry(&self.breakers, "fulfillment", &policy, || {
            self.fulfillment
                .submit(&sticker.image_url, address, sticker.size, order.quantity)
        })
        .await
        {
            Ok(job_id) => {
                self.store
                    .update_order_fulfillment(&order.id, OrderStatus::SentToPrint, None)?;
                info!(order_id = %order.id, job_id = %job_id, "order sent to print");
                Ok(true)
            }
            Err(err) => {
                self.store.update_order_fulfillment(
                    &order.id,
                    OrderStatus::PendingManual,
                    Some(&err.to_string()),
                )?;
                Err(err)
            }
        }
    }
}
