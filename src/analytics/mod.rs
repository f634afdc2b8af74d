//! Analytics: order ingestion, derived metrics, retention purges.

pub mod purge;
pub mod sync;

#[cfg(test)]
mod sync_tests;

pub use purge::{PurgeReport, RetentionPurger};
pub use sync::{AnalyticsSync, SyncOutcome};
