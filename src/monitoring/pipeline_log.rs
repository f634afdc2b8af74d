//! Pipeline-run ledger.
//!
//! Every workflow execution gets a `pipeline_runs` row at start and a
//! terminal update (`completed`, `failed`, or `partial`) at close.
//! Durations come from a monotonic clock captured at `start`, not from
//! wall-clock subtraction. The start-time map is per-instance; a crash
//! between start and close leaves the row in `started` for operators to
//! reconcile.

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::Store;
use crate::error::PipelineError;
use crate::models::{RunCounts, RunStatus, Workflow};

/// Writer for the `pipeline_runs` table.
pub struct PipelineRunLogger {
    store: Store,
    start_times: Mutex<HashMap<String, Instant>>,
}

/// Terminal metrics for a run.
#[derive(Debug, Clone, Default)]
pub struct RunClose {
    pub counts: RunCounts,
    pub api_calls_used: i64,
    pub ai_cost_estimate_usd: f64,
    pub metadata: Option<Value>,
}

impl PipelineRunLogger {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            start_times: Mutex::new(HashMap::new()),
        }
    }

    /// Create a `started` row and remember its monotonic start time.
    pub fn start(
        &self,
        workflow: Workflow,
        metadata: Option<Value>,
    ) -> Result<String, PipelineError> {
        let run_id = Uuid::new_v4().to_string();
        let metadata = metadata.unwrap_or_else(|| Value::Object(Default::default()));
        self.store
            .insert_pipeline_run(&run_id, workflow, Utc::now(), &metadata)?;
        self.start_times
            .lock()
            .insert(run_id.clone(), Instant::now());
        info!(%workflow, run_id = %run_id, "pipeline run started");
        Ok(run_id)
    }

    pub fn complete(&self, run_id: &str, close: RunClose) -> Result<(), PipelineError> {
        let duration = self.take_duration(run_id);
        self.store.finish_pipeline_run(
            run_id,
            RunStatus::Completed,
            Utc::now(),
            duration,
            &close.counts,
            close.api_calls_used,
            close.ai_cost_estimate_usd,
            close.metadata.as_ref(),
        )?;
        info!(
            run_id,
            duration_seconds = duration,
            api_calls = close.api_calls_used,
            ai_cost = close.ai_cost_estimate_usd,
            "pipeline run completed"
        );
        Ok(())
    }

    pub fn fail(
        &self,
        run_id: &str,
        error_message: &str,
        mut close: RunClose,
    ) -> Result<(), PipelineError> {
        let duration = self.take_duration(run_id);
        close.metadata = Some(merge_error(close.metadata.take(), error_message));
        self.store.finish_pipeline_run(
            run_id,
            RunStatus::Failed,
            Utc::now(),
            duration,
            &close.counts,
            close.api_calls_used,
            close.ai_cost_estimate_usd,
            close.metadata.as_ref(),
        )?;
        error!(
            run_id,
            duration_seconds = duration,
            error = error_message,
            "pipeline run failed"
        );
        Ok(())
    }

    pub fn partial(
        &self,
        run_id: &str,
        error_message: &str,
        mut close: RunClose,
    ) -> Result<(), PipelineError> {
        let duration = self.take_duration(run_id);
        if !error_message.is_empty() {
            close.metadata = Some(merge_error(close.metadata.take(), error_message));
        }
        self.store.finish_pipeline_run(
            run_id,
            RunStatus::Partial,
            Utc::now(),
            duration,
            &close.counts,
            close.api_calls_used,
            close.ai_cost_estimate_usd,
            close.metadata.as_ref(),
        )?;
        warn!(
            run_id,
            duration_seconds = duration,
            error = error_message,
            "pipeline run partial"
        );
        Ok(())
    }

    fn take_duration(&self, run_id: &str) -> i64 {
        match self.start_times.lock().remove(run_id) {
            Some(start) => start.elapsed().as_secs() as i64,
            None => {
                warn!(run_id, "no recorded start time for run, reporting 0s");
                0
            }
        }
    }
}

fn merge_error(metadata: Option<Value>, error_message: &str) -> Value {
    let mut map = match metadata {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("metadata".to_string(), other);
            map
        }
        None => serde_json::Map::new(),
    };
    map.insert("error".to_string(), Value::String(error_message.to_string()));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_then_complete_sets_terminal_fields() {
        let store = Store::open_in_memory().unwrap();
        let logger = PipelineRunLogger::new(store.clone());

        let run_id = logger.start(Workflow::TrendMonitor, None).unwrap();
        let open = store.pipeline_run_by_id(&run_id).unwrap().unwrap();
        assert_eq!(open.status, RunStatus::Started);
        assert!(open.ended_at.is_none() && open.duration_seconds.is_none());

        logger
            .complete(
                &run_id,
                RunClose {
                    counts: RunCounts {
                        trends_found: 12,
                        ..Default::default()
                    },
                    api_calls_used: 3,
                    ai_cost_estimate_usd: 0.02,
                    metadata: None,
                },
            )
            .unwrap();

        let closed = store.pipeline_run_by_id(&run_id).unwrap().unwrap();
        assert_eq!(closed.status, RunStatus::Completed);
        assert!(closed.ended_at.is_some());
        assert!(closed.duration_seconds.unwrap() >= 0);
        assert_eq!(closed.counts.trends_found, 12);
    }

    #[test]
    fn test_fail_records_error_metadata() {
        let store = Store::open_in_memory().unwrap();
        let logger = PipelineRunLogger::new(store.clone());

        let run_id = logger.start(Workflow::PricingEngine, None).unwrap();
        logger
            .fail(&run_id, "all sources unreachable", RunClose::default())
            .unwrap();

        let row = store.pipeline_run_by_id(&run_id).unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Failed);
        assert_eq!(row.metadata["error"], "all sources unreachable");
    }

    #[test]
    fn test_partial_preserves_existing_metadata() {
        let store = Store::open_in_memory().unwrap();
        let logger = PipelineRunLogger::new(store.clone());

        let run_id = logger.start(Workflow::AnalyticsSync, None).unwrap();
        logger
            .partial(
                &run_id,
                "2 orders failed",
                RunClose {
                    counts: RunCounts {
                        errors_count: 2,
                        ..Default::default()
                    },
                    metadata: Some(json!({"orders_synced": 7})),
                    ..Default::default()
                },
            )
            .unwrap();

        let row = store.pipeline_run_by_id(&run_id).unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Partial);
        assert_eq!(row.metadata["orders_synced"], 7);
        assert_eq!(row.metadata["error"], "2 orders failed");
        assert_eq!(row.counts.errors_count, 2);
    }

    #[test]
    fn test_close_without_start_reports_zero_duration() {
        let store = Store::open_in_memory().unwrap();
        let logger = PipelineRunLogger::new(store.clone());

        // Simulate a second instance closing a row it never started.
        store
            .insert_pipeline_run("orphan", Workflow::TrendMonitor, Utc::now(), &json!({}))
            .unwrap();
        logger.complete("orphan", RunClose::default()).unwrap();

        let row = store.pipeline_run_by_id("orphan").unwrap().unwrap();
        assert_eq!(row.duration_seconds, Some(0));
    }
}
