//! Observability: run ledger, error ledger, spend governor, alerts.

pub mod alerter;
pub mod error_log;
pub mod pipeline_log;
pub mod spend;

pub use alerter::{AlertLevel, Alerter, DailySummary, EmailTransport};
pub use error_log::{sanitize_context, sanitize_string, ErrorLogger, ErrorReport};
pub use pipeline_log::{PipelineRunLogger, RunClose};
pub use spend::{BudgetStatus, SpendTracker};
