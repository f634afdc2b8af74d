//! Trend monitor orchestrator.
//!
//! One cycle: acquire the workflow lock, check the AI budget, fetch
//! candidates from every source (partial failure tolerated), dedup,
//! reconcile with the store, blocklist-filter, score a bounded batch,
//! and insert the survivors. Emits a boolean "new trends" signal for the
//! downstream generation job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{info, warn};

use crate::config::CostRates;
use crate::db::Store;
use crate::error::PipelineError;
use crate::limiter::{lock_ttl_seconds, RateLimiter};
use crate::models::{NewTrend, RunCounts, RunStatus, TrendStatus, Workflow};
use crate::monitoring::{Alerter, ErrorLogger, ErrorReport, PipelineRunLogger, RunClose, SpendTracker};
use crate::resilience::{call_with_retry, CircuitBreakers, RetryPolicy};
use crate::trends::blocklist;
use crate::trends::dedup::{deduplicate, reconcile_with_store};
use crate::trends::scorer::TrendScorer;
use crate::trends::sources::{TrendCandidate, TrendSource};

const WORKFLOW: Workflow = Workflow::TrendMonitor;

/// Result of one monitoring cycle.
#[derive(Debug, Clone, Copy)]
pub struct MonitorOutcome {
    /// True when at least one trend landed in `discovered`.
    pub new_trends: bool,
    pub status: RunStatus,
}

pub struct TrendMonitor {
    store: Store,
    sources: Vec<Arc<dyn TrendSource>>,
    scorer: TrendScorer,
    limiter: Arc<RateLimiter>,
    run_logger: PipelineRunLogger,
    error_logger: ErrorLogger,
    spend: SpendTracker,
    alerter: Option<Alerter>,
    breakers: CircuitBreakers,
    costs: CostRates,
    max_per_cycle: usize,
    max_scored_per_run: usize,
}

impl TrendMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        sources: Vec<Arc<dyn TrendSource>>,
        scorer: TrendScorer,
        limiter: Arc<RateLimiter>,
        spend: SpendTracker,
        alerter: Option<Alerter>,
        costs: CostRates,
        max_per_cycle: usize,
    ) -> Self {
        Self {
            run_logger: PipelineRunLogger::new(store.clone()),
            error_logger: ErrorLogger::new(store.clone()),
            store,
            sources,
            scorer,
            limiter,
            spend,
            alerter,
            breakers: CircuitBreakers::new(),
            costs,
            max_per_cycle,
            max_scored_per_run: 30,
        }
    }

    /// Execute one cycle. The lock is always released on the way out.
    pub async fn run(&self) -> Result<MonitorOutcome, PipelineError> {
        if !self.limiter.acquire_lock(WORKFLOW).await {
            info!("another trend monitor is running, exiting");
            return Ok(MonitorOutcome {
                new_trends: false,
                status: RunStatus::Completed,
            });
        }
        let result = self.run_locked().await;
        self.limiter.release_lock(WORKFLOW).await;
        result
    }

    async fn run_locked(&self) -> Result<MonitorOutcome, PipelineError> {
        let run_id = self.run_logger.start(WORKFLOW, None)?;
        let deadline =
            Instant::now() + Duration::from_secs(lock_ttl_seconds(WORKFLOW));

        match self.execute(&run_id, deadline).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.run_logger
                    .fail(&run_id, &err.to_string(), RunClose::default())
                    .ok();
                if let Some(alerter) = &self.alerter {
                    alerter
                        .send_alert(
                            "Trend monitor failed",
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
    ) -> Result<MonitorOutcome, PipelineError> {
        // AI budget gate before the first billed call.
        let budget = self.spend.check_budget().await;
        if !budget.can_proceed {
            warn!("AI budget exceeded, skipping cycle");
            self.run_logger.complete(
                run_id,
                RunClose {
                    metadata: Some(json!({"skipped": "budget_exceeded"})),
                    ..Default::default()
                },
            )?;
            return Ok(MonitorOutcome {
                new_trends: false,
                status: RunStatus::Completed,
            });
        }

        let mut counts = RunCounts::default();

        // Fetch from every source; partial failure is fine, total failure
        // is not.
        let mut candidates: Vec<TrendCandidate> = Vec::new();
        let mut source_failures = 0usize;
        let policy = RetryPolicy::default();
        for source in &self.sources {
            match call_with_retry(&self.breakers, source.name(), &policy, || source.fetch()).await
            {
                Ok(batch) => {
                    info!(source = source.name(), candidates = batch.len(), "source returned");
                    candidates.extend(batch);
                }
                Err(err) => {
                    source_failures += 1;
                    counts.errors_count += 1;
                    warn!(source = source.name(), error = %err, "trend source failed");
                    self.error_logger.log(
                        ErrorReport::from_error(WORKFLOW, "trend_fetch", &err).with_run(run_id),
                    );
                }
            }
        }

        if !self.sources.is_empty() && source_failures == self.sources.len() {
            if let Some(alerter) = &self.alerter {
                alerter
                    .send_alert(
                        "All trend sources unreachable",
                        "Every trend source failed this cycle.",
                        crate::monitoring::AlertLevel::Critical,
                    )
                    .await;
            }
            self.run_logger.fail(
                run_id,
                "all trend sources unreachable",
                RunClose {
                    counts,
                    ..Default::default()
                },
            )?;
            return Ok(MonitorOutcome {
                new_trends: false,
                status: RunStatus::Failed,
            });
        }

        counts.trends_found = candidates.len() as i64;
        if candidates.is_empty() {
            info!("no trend candidates from any source");
            self.run_logger.complete(
                run_id,
                RunClose {
                    counts,
                    ..Default::default()
                },
            )?;
            return Ok(MonitorOutcome {
                new_trends: false,
                status: RunStatus::Completed,
            });
        }

        // Dedup, reconcile, pre-filter.
        let canonical = deduplicate(candidates);
        let truly_new = reconcile_with_store(&self.store, canonical)?;
        let clean: Vec<_> = truly_new
            .into_iter()
            .filter(|candidate| match blocklist::check(&candidate.topic) {
                Some((term, kind)) => {
                    info!(
                        topic = %candidate.topic,
                        term,
                        list = kind.as_str(),
                        "candidate blocked before scoring"
                    );
                    false
                }
                None => true,
            })
            .collect();

        if clean.is_empty() {
            info!("no new candidates after dedup and blocklists");
            self.run_logger.complete(
                run_id,
                RunClose {
                    counts,
                    ..Default::default()
                },
            )?;
            return Ok(MonitorOutcome {
                new_trends: false,
                status: RunStatus::Completed,
            });
        }

        if Instant::now() >= deadline {
            warn!("lock-TTL deadline reached before scoring, closing partial");
            self.run_logger.partial(
                run_id,
                "",
                RunClose {
                    counts,
                    metadata: Some(json!({"skipped": "deadline"})),
                    ..Default::default()
                },
            )?;
            return Ok(MonitorOutcome {
                new_trends: false,
                status: RunStatus::Partial,
            });
        }

        // Score a bounded batch. The scorer carries the single retry
        // layer for this call site.
        let batch: Vec<_> = clean
            .into_iter()
            .take(self.max_scored_per_run)
            .collect();
        let batch_len = batch.len();
        let (qualified, usage) = match self.scorer.score_and_filter(batch).await {
            Ok(result) => result,
            Err(err) => {
                counts.errors_count += 1;
                self.error_logger
                    .log(ErrorReport::from_error(WORKFLOW, "scoring", &err).with_run(run_id));
                (Vec::new(), Default::default())
            }
        };
        let ai_cost = self
            .costs
            .estimate(usage.input_tokens, usage.output_tokens, 0);

        // Insert survivors: the best go live, the rest queue up.
        let mut discovered = 0usize;
        let mut queued = 0usize;
        for (rank, scored) in qualified.into_iter().enumerate() {
            let status = if rank < self.max_per_cycle {
                TrendStatus::Discovered
            } else {
                TrendStatus::Queued
            };
            let trend = NewTrend {
                topic: scored.candidate.topic,
                normalized_topic: scored.candidate.normalized_topic,
                sources: scored.candidate.sources,
                keywords: scored.candidate.keywords,
                score_velocity: Some(scored.velocity),
                score_commercial: Some(scored.commercial),
                score_safety: Some(scored.safety),
                score_uniqueness: Some(scored.uniqueness),
                score_overall: Some(scored.overall),
                reasoning: scored.reasoning,
                status,
                source_data: scored.candidate.source_data,
            };
            match self.store.insert_trend(&trend) {
                Ok(_) => {
                    if status == TrendStatus::Discovered {
                        discovered += 1;
                    } else {
                        queued += 1;
                    }
                }
                Err(err) => {
                    counts.errors_count += 1;
                    warn!(topic = %trend.topic, error = %err, "failed to store trend");
                    self.error_logger.log(
                        ErrorReport::from_error(WORKFLOW, "trend_store", &err)
                            .with_service("store")
                            .with_run(run_id),
                    );
                }
            }
        }

        info!(discovered, queued, "stored trends this cycle");

        let close = RunClose {
            counts,
            api_calls_used: 0,
            ai_cost_estimate_usd: ai_cost,
            metadata: Some(json!({
                "trends_scored": batch_len,
                "discovered": discovered,
                "queued": queued,
            })),
        };
        let status = if counts.errors_count > 0 {
            self.run_logger.partial(run_id, "", close)?;
            RunStatus::Partial
        } else {
            self.run_logger.complete(run_id, close)?;
            RunStatus::Completed
        };

        Ok(MonitorOutcome {
            new_trends: discovered > 0,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::llm::{BatchScoreResponse, LlmClient, Moderation, TopicScore};
    use crate::limiter::kv::MemoryKv;
    use async_trait::async_trait;

    struct StaticSource {
        name: &'static str,
        candidates: Vec<TrendCandidate>,
        fail: bool,
    }

    #[async_trait]
    impl TrendSource for StaticSource {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch(&self) -> Result<Vec<TrendCandidate>, PipelineError> {
            if self.fail {
                Err(PipelineError::api(self.name, "source down"))
            } else {
                Ok(self.candidates.clone())
            }
        }
    }

    struct FixedLlm {
        overall: f64,
    }

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn batch_score(
            &self,
            topics: &[String],
        ) -> Result<BatchScoreResponse, PipelineError> {
            Ok(BatchScoreResponse {
                scores: (0..topics.len())
                    .map(|index| TopicScore {
                        index,
                        velocity: 8,
                        commercial: 8,
                        safety: 9,
                        uniqueness: 7,
                        overall: self.overall,
                        reasoning: "fits".to_string(),
                    })
                    .collect(),
                input_tokens: 200,
                output_tokens: 100,
            })
        }

        async fn moderate(&self, _text: &str) -> Result<Moderation, PipelineError> {
            Ok(Moderation {
                max_score: 0.0,
                categories: vec![],
            })
        }
    }

    fn candidate(topic: &str, keywords: &[&str], source: &str) -> TrendCandidate {
        TrendCandidate {
            topic: topic.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            source: source.to_string(),
            score_hint: 1.0,
            source_data: serde_json::json!({}),
        }
    }

    fn monitor(
        store: &Store,
        sources: Vec<Arc<dyn TrendSource>>,
        overall: f64,
    ) -> TrendMonitor {
        let limiter = Arc::new(RateLimiter::new(Arc::new(MemoryKv::new())));
        TrendMonitor::new(
            store.clone(),
            sources,
            TrendScorer::new(Arc::new(FixedLlm { overall })),
            limiter,
            SpendTracker::new(store.clone(), None),
            None,
            CostRates {
                llm_input_per_token: 0.0,
                llm_output_per_token: 0.0,
                per_image: 0.0,
            },
            2,
        )
    }

    #[tokio::test]
    async fn test_cycle_stores_top_trends_and_queues_rest() {
        let store = Store::open_in_memory().unwrap();
        let source: Arc<dyn TrendSource> = Arc::new(StaticSource {
            name: "reddit",
            candidates: vec![
                candidate("Cute Baby Hippo", &["baby", "hippo"], "reddit"),
                candidate("Lunar Eclipse", &["lunar", "eclipse"], "reddit"),
                candidate("Sourdough Cats", &["sourdough", "cats"], "reddit"),
            ],
            fail: false,
        });
        let monitor = monitor(&store, vec![source], 8.0);

        let outcome = monitor.run().await.unwrap();
        assert!(outcome.new_trends);
        assert_eq!(outcome.status, RunStatus::Completed);

        let discovered = store.trends_by_status(TrendStatus::Discovered).unwrap();
        let queued = store.trends_by_status(TrendStatus::Queued).unwrap();
        assert_eq!(discovered.len(), 2); // max_per_cycle
        assert_eq!(queued.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_sources_failing_fails_the_run() {
        let store = Store::open_in_memory().unwrap();
        let source: Arc<dyn TrendSource> = Arc::new(StaticSource {
            name: "reddit",
            candidates: vec![],
            fail: true,
        });
        let monitor = monitor(&store, vec![source], 8.0);

        let outcome = monitor.run().await.unwrap();
        assert!(!outcome.new_trends);
        assert_eq!(outcome.status, RunStatus::Failed);

        // The failure hit the error ledger.
        let errors = store.recent_errors(Workflow::TrendMonitor, 10).unwrap();
        assert!(!errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_when_one_source_fails() {
        let store = Store::open_in_memory().unwrap();
        let good: Arc<dyn TrendSource> = Arc::new(StaticSource {
            name: "reddit",
            candidates: vec![candidate("Cute Baby Hippo", &["baby", "hippo"], "reddit")],
            fail: false,
        });
        let bad: Arc<dyn TrendSource> = Arc::new(StaticSource {
            name: "search",
            candidates: vec![],
            fail: true,
        });
        let monitor = monitor(&store, vec![good, bad], 8.0);

        let outcome = monitor.run().await.unwrap();
        assert!(outcome.new_trends);
        assert_eq!(outcome.status, RunStatus::Partial);
    }

    #[tokio::test]
    async fn test_below_threshold_stores_nothing() {
        let store = Store::open_in_memory().unwrap();
        let source: Arc<dyn TrendSource> = Arc::new(StaticSource {
            name: "reddit",
            candidates: vec![candidate("Mild Topic", &["mild"], "reddit")],
            fail: false,
        });
        let monitor = monitor(&store, vec![source], 5.0);

        let outcome = monitor.run().await.unwrap();
        assert!(!outcome.new_trends);
        assert!(store
            .trends_by_status(TrendStatus::Discovered)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_blocklisted_topics_never_reach_the_scorer() {
        let store = Store::open_in_memory().unwrap();
        let source: Arc<dyn TrendSource> = Arc::new(StaticSource {
            name: "reddit",
            candidates: vec![candidate("Pikachu fan art", &["pikachu", "art"], "reddit")],
            fail: false,
        });
        let monitor = monitor(&store, vec![source], 9.0);

        let outcome = monitor.run().await.unwrap();
        assert!(!outcome.new_trends);
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(store
            .trends_by_status(TrendStatus::Discovered)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_lock_contention_bails_cleanly() {
        let store = Store::open_in_memory().unwrap();
        let kv = Arc::new(MemoryKv::new());
        let other = RateLimiter::new(kv.clone());
        assert!(other.acquire_lock(Workflow::TrendMonitor).await);

        let source: Arc<dyn TrendSource> = Arc::new(StaticSource {
            name: "reddit",
            candidates: vec![candidate("Cute Baby Hippo", &["baby"], "reddit")],
            fail: false,
        });
        let limiter = Arc::new(RateLimiter::new(kv));
        let monitor = TrendMonitor::new(
            store.clone(),
            vec![source],
            TrendScorer::new(Arc::new(FixedLlm { overall: 9.0 })),
            limiter,
            SpendTracker::new(store.clone(), None),
            None,
            CostRates {
                llm_input_per_token: 0.0,
                llm_output_per_token: 0.0,
                per_image: 0.0,
            },
            2,
        );

        let outcome = monitor.run().await.unwrap();
        assert!(!outcome.new_trends);
        // No ledger row was opened for the skipped cycle.
        assert!(store
            .trends_by_status(TrendStatus::Discovered)
            .unwrap()
            .is_empty());
    }
}
