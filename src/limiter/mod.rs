//! Rate-limit governor: daily API budget with priority admission, plus
//! the per-workflow single-leader locks.
//!
//! The daily counter lives in the coordination store under
//! `api_calls:{YYYY-MM-DD}` (UTC) with a 48-hour TTL. Admission is
//! advisory: between `can_proceed` and the eventual `increment` another
//! process may spend the remaining budget, and the atomic increment is
//! authoritative.

pub mod kv;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::limiter::kv::KvStore;
use crate::models::Workflow;

/// Admission priority for a class of outbound marketplace calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// P0: order reads.
    OrderReads = 0,
    /// P1: new listings.
    NewListings = 1,
    /// P2: price updates.
    PriceUpdates = 2,
    /// P3: analytics.
    Analytics = 3,
}

/// Usage zones over the daily budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageLevel {
    Normal,
    Warning,
    Critical,
    HardStop,
}

impl UsageLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageLevel::Normal => "normal",
            UsageLevel::Warning => "warning",
            UsageLevel::Critical => "critical",
            UsageLevel::HardStop => "hard_stop",
        }
    }
}

// Threshold boundaries (daily call counts); strict `>` comparisons, so a
// value sitting exactly on a boundary stays in the lower zone.
pub const THRESHOLD_NORMAL: i64 = 7_000;
pub const THRESHOLD_WARNING: i64 = 8_500;
pub const THRESHOLD_CRITICAL: i64 = 9_500;

const COUNTER_TTL_SECONDS: u64 = 48 * 3600;
const DEFAULT_LOCK_TTL_SECONDS: u64 = 30 * 60;

/// Per-workflow lock TTLs in seconds.
pub fn lock_ttl_seconds(workflow: Workflow) -> u64 {
    match workflow {
        Workflow::TrendMonitor => 25 * 60,
        Workflow::StickerGenerator | Workflow::PricingEngine | Workflow::AnalyticsSync => {
            DEFAULT_LOCK_TTL_SECONDS
        }
    }
}

/// Governor over the shared daily API budget and the workflow locks.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    // Owner tokens for locks this instance currently holds.
    held: Mutex<HashMap<Workflow, String>>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            held: Mutex::new(HashMap::new()),
        }
    }

    fn daily_key(date: DateTime<Utc>) -> String {
        format!("api_calls:{}", date.format("%Y-%m-%d"))
    }

    /// Atomically add `count` calls to today's counter. The 48 h TTL is
    /// attached on the first increment of the day.
    pub async fn increment(&self, count: i64) -> Result<i64, PipelineError> {
        let key = Self::daily_key(Utc::now());
        let total = self.kv.incr_by(&key, count).await?;
        let ttl = self.kv.ttl(&key).await?;
        if ttl < 0 {
            self.kv.expire(&key, COUNTER_TTL_SECONDS).await?;
        }
        Ok(total)
    }

    /// Today's call count; 0 when the counter is absent or the store is
    /// unreachable (reads are best-effort).
    pub async fn daily_usage(&self) -> i64 {
        let key = Self::daily_key(Utc::now());
        match self.kv.get(&key).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(0),
            Ok(None) => 0,
            Err(err) => {
                warn!(error = %err, "failed to read daily usage, assuming 0");
                0
            }
        }
    }

    /// Pure admission logic, testable without a store.
    pub fn check_threshold(usage: i64, priority: Priority) -> bool {
        if usage > THRESHOLD_CRITICAL {
            // Hard stop: block everything
            warn!(usage, priority = priority as i64, "daily API hard stop");
            return false;
        }
        if usage > THRESHOLD_WARNING {
            // Critical zone: only P0 and P1
            let allowed = priority <= Priority::NewListings;
            if !allowed {
                warn!(usage, priority = priority as i64, "daily API critical zone");
            }
            return allowed;
        }
        if usage > THRESHOLD_NORMAL {
            // Warning zone: skip P3
            let allowed = priority <= Priority::PriceUpdates;
            if !allowed {
                info!(usage, priority = priority as i64, "daily API warning zone");
            }
            return allowed;
        }
        true
    }

    /// Whether an operation at `priority` should proceed right now.
    /// Fails closed when the store cannot be read.
    pub async fn can_proceed(&self, priority: Priority) -> bool {
        let key = Self::daily_key(Utc::now());
        let usage = match self.kv.get(&key).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(0),
            Ok(None) => 0,
            Err(err) => {
                warn!(error = %err, "admission check against unreachable store, blocking");
                return false;
            }
        };
        Self::check_threshold(usage, priority)
    }

    pub fn usage_level_for(usage: i64) -> UsageLevel {
        if usage > THRESHOLD_CRITICAL {
            UsageLevel::HardStop
        } else if usage > THRESHOLD_WARNING {
            UsageLevel::Critical
        } else if usage > THRESHOLD_NORMAL {
            UsageLevel::Warning
        } else {
            UsageLevel::Normal
        }
    }

    pub async fn usage_level(&self) -> UsageLevel {
        Self::usage_level_for(self.daily_usage().await)
    }

    /// Try to become the single leader for `workflow`. A random owner
    /// token is stored as the lock value so release can be owner-checked.
    pub async fn acquire_lock(&self, workflow: Workflow) -> bool {
        self.acquire_lock_with_ttl(workflow, lock_ttl_seconds(workflow))
            .await
    }

    pub async fn acquire_lock_with_ttl(&self, workflow: Workflow, ttl_seconds: u64) -> bool {
        let key = format!("lock:{workflow}");
        let token = Uuid::new_v4().to_string();
        match self.kv.set_nx_ex(&key, &token, ttl_seconds).await {
            Ok(true) => {
                info!(%workflow, ttl_seconds, "acquired workflow lock");
                self.held.lock().insert(workflow, token);
                true
            }
            Ok(false) => {
                info!(%workflow, "lock already held");
                false
            }
            Err(err) => {
                warn!(%workflow, error = %err, "lock acquire failed");
                false
            }
        }
    }

    /// Release the lock if this instance still owns it. Never deletes
    /// another holder's lock, even when ours has expired underneath us.
    pub async fn release_lock(&self, workflow: Workflow) -> bool {
        let Some(token) = self.held.lock().remove(&workflow) else {
            warn!(%workflow, "release without a held lock token");
            return false;
        };
        let key = format!("lock:{workflow}");
        match self.kv.del_if_equals(&key, &token).await {
            Ok(true) => {
                info!(%workflow, "released workflow lock");
                true
            }
            Ok(false) => {
                warn!(%workflow, "lock no longer owned by this instance, leaving it");
                false
            }
            Err(err) => {
                warn!(%workflow, error = %err, "lock release failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::kv::{MemoryKv, UnreachableKv};
    use super::*;

    fn limiter() -> (Arc<MemoryKv>, RateLimiter) {
        let kv = Arc::new(MemoryKv::new());
        (kv.clone(), RateLimiter::new(kv))
    }

    async fn seed_usage(limiter: &RateLimiter, usage: i64) {
        limiter.increment(usage).await.unwrap();
    }

    #[tokio::test]
    async fn test_increment_sets_ttl_on_first_touch() {
        let (kv, limiter) = limiter();
        limiter.increment(1).await.unwrap();
        let key = RateLimiter::daily_key(Utc::now());
        let ttl = kv.ttl(&key).await.unwrap();
        assert!(ttl > 0 && ttl <= 48 * 3600);

        // Second increment leaves the existing TTL alone.
        limiter.increment(1).await.unwrap();
        assert_eq!(limiter.daily_usage().await, 2);
    }

    #[tokio::test]
    async fn test_admission_at_exact_thresholds() {
        let (_, limiter) = limiter();

        seed_usage(&limiter, 7_000).await;
        assert!(limiter.can_proceed(Priority::Analytics).await);

        seed_usage(&limiter, 1).await; // 7001
        assert!(!limiter.can_proceed(Priority::Analytics).await);
        assert!(limiter.can_proceed(Priority::PriceUpdates).await);

        seed_usage(&limiter, 1_500).await; // 8501
        assert!(!limiter.can_proceed(Priority::PriceUpdates).await);
        assert!(limiter.can_proceed(Priority::NewListings).await);

        seed_usage(&limiter, 999).await; // 9500
        assert!(limiter.can_proceed(Priority::NewListings).await);

        seed_usage(&limiter, 1).await; // 9501
        assert!(!limiter.can_proceed(Priority::NewListings).await);
        assert!(!limiter.can_proceed(Priority::OrderReads).await);
    }

    #[test]
    fn test_usage_levels() {
        assert_eq!(RateLimiter::usage_level_for(0), UsageLevel::Normal);
        assert_eq!(RateLimiter::usage_level_for(7_000), UsageLevel::Normal);
        assert_eq!(RateLimiter::usage_level_for(7_001), UsageLevel::Warning);
        assert_eq!(RateLimiter::usage_level_for(8_500), UsageLevel::Warning);
        assert_eq!(RateLimiter::usage_level_for(8_501), UsageLevel::Critical);
        assert_eq!(RateLimiter::usage_level_for(9_500), UsageLevel::Critical);
        assert_eq!(RateLimiter::usage_level_for(9_501), UsageLevel::HardStop);
    }

    #[tokio::test]
    async fn test_admission_fails_closed_when_store_unreachable() {
        let limiter = RateLimiter::new(Arc::new(UnreachableKv));
        assert!(!limiter.can_proceed(Priority::OrderReads).await);
        // Usage reads stay best-effort.
        assert_eq!(limiter.daily_usage().await, 0);
        // Increment surfaces the store failure.
        assert!(limiter.increment(1).await.is_err());
        // Lock paths degrade to false.
        assert!(!limiter.acquire_lock(Workflow::PricingEngine).await);
        assert!(!limiter.release_lock(Workflow::PricingEngine).await);
    }

    #[tokio::test]
    async fn test_lock_acquire_release_cycle() {
        let (_, limiter) = limiter();
        assert!(limiter.acquire_lock(Workflow::PricingEngine).await);
        assert!(!limiter.acquire_lock(Workflow::PricingEngine).await);
        assert!(limiter.release_lock(Workflow::PricingEngine).await);
        assert!(limiter.acquire_lock(Workflow::PricingEngine).await);
    }

    #[tokio::test]
    async fn test_release_is_owner_checked_across_processes() {
        let kv = Arc::new(MemoryKv::new());
        let process_a = RateLimiter::new(kv.clone());
        let process_b = RateLimiter::new(kv.clone());

        assert!(process_a.acquire_lock(Workflow::PricingEngine).await);

        // B never acquired, so its release must not delete A's lock.
        assert!(!process_b.release_lock(Workflow::PricingEngine).await);
        assert!(kv.get("lock:pricing_engine").await.unwrap().is_some());

        // Even if B had held the lock earlier, a fresh token mismatch
        // leaves A's key intact.
        assert!(!process_b.acquire_lock(Workflow::PricingEngine).await);

        assert!(process_a.release_lock(Workflow::PricingEngine).await);
        assert!(kv.get("lock:pricing_engine").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_release_does_not_touch_new_holder() {
        let kv = Arc::new(MemoryKv::new());
        let process_a = RateLimiter::new(kv.clone());
        let process_b = RateLimiter::new(kv.clone());

        assert!(
            process_a
                .acquire_lock_with_ttl(Workflow::TrendMonitor, 10)
                .await
        );
        tokio::time::advance(std::time::Duration::from_secs(11)).await;

        // A's lock expired; B takes over.
        assert!(process_b.acquire_lock(Workflow::TrendMonitor).await);

        // A's late release must not delete B's lock.
        assert!(!process_a.release_lock(Workflow::TrendMonitor).await);
        assert!(kv.get("lock:trend_monitor").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lock_ttls_per_workflow() {
        assert_eq!(lock_ttl_seconds(Workflow::TrendMonitor), 25 * 60);
        assert_eq!(lock_ttl_seconds(Workflow::PricingEngine), 30 * 60);
        assert_eq!(lock_ttl_seconds(Workflow::AnalyticsSync), 30 * 60);
        assert_eq!(lock_ttl_seconds(Workflow::StickerGenerator), 30 * 60);
    }
}
