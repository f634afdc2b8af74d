//! Typed rows for the relational store.
//!
//! Every table from the schema has a tagged record type here; lifecycle
//! fields are closed enums rather than free-form strings so that invalid
//! states cannot be constructed by callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// The four scheduled workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Workflow {
    TrendMonitor,
    StickerGenerator,
    PricingEngine,
    AnalyticsSync,
}

impl Workflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Workflow::TrendMonitor => "trend_monitor",
            Workflow::StickerGenerator => "sticker_generator",
            Workflow::PricingEngine => "pricing_engine",
            Workflow::AnalyticsSync => "analytics_sync",
        }
    }
}

impl std::fmt::Display for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trend lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendStatus {
    Discovered,
    Queued,
    Generated,
    GenerationFailed,
}

impl TrendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendStatus::Discovered => "discovered",
            TrendStatus::Queued => "queued",
            TrendStatus::Generated => "generated",
            TrendStatus::GenerationFailed => "generation_failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        match raw {
            "discovered" => Ok(TrendStatus::Discovered),
            "queued" => Ok(TrendStatus::Queued),
            "generated" => Ok(TrendStatus::Generated),
            "generation_failed" => Ok(TrendStatus::GenerationFailed),
            other => Err(PipelineError::Validation(format!(
                "unknown trend status '{other}'"
            ))),
        }
    }
}

/// A canonical trend row. `normalized_topic` is unique across the table.
#[derive(Debug, Clone)]
pub struct Trend {
    pub id: String,
    pub topic: String,
    pub normalized_topic: String,
    pub sources: Vec<String>,
    pub keywords: Vec<String>,
    pub score_velocity: Option<i32>,
    pub score_commercial: Option<i32>,
    pub score_safety: Option<i32>,
    pub score_uniqueness: Option<i32>,
    pub score_overall: Option<f64>,
    pub reasoning: String,
    pub status: TrendStatus,
    pub source_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a new trend.
#[derive(Debug, Clone)]
pub struct NewTrend {
    pub topic: String,
    pub normalized_topic: String,
    pub sources: Vec<String>,
    pub keywords: Vec<String>,
    pub score_velocity: Option<i32>,
    pub score_commercial: Option<i32>,
    pub score_safety: Option<i32>,
    pub score_uniqueness: Option<i32>,
    pub score_overall: Option<f64>,
    pub reasoning: String,
    pub status: TrendStatus,
    pub source_data: serde_json::Value,
}

/// Physical sticker size classes offered on the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    SingleSmall,
    SingleLarge,
}

impl SizeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizeClass::SingleSmall => "single_small",
            SizeClass::SingleLarge => "single_large",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        match raw {
            "single_small" => Ok(SizeClass::SingleSmall),
            "single_large" => Ok(SizeClass::SingleLarge),
            other => Err(PipelineError::Validation(format!(
                "unknown size class '{other}'"
            ))),
        }
    }
}

/// Position along the trend-freshness timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PricingTier {
    JustDropped,
    Trending,
    Cooling,
    Evergreen,
    Archived,
}

impl PricingTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingTier::JustDropped => "just_dropped",
            PricingTier::Trending => "trending",
            PricingTier::Cooling => "cooling",
            PricingTier::Evergreen => "evergreen",
            PricingTier::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        match raw {
            "just_dropped" => Ok(PricingTier::JustDropped),
            "trending" => Ok(PricingTier::Trending),
            "cooling" => Ok(PricingTier::Cooling),
            "evergreen" => Ok(PricingTier::Evergreen),
            "archived" => Ok(PricingTier::Archived),
            other => Err(PipelineError::Validation(format!(
                "unknown pricing tier '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationStatus {
    Pending,
    Approved,
    Flagged,
    Rejected,
    Archived,
}

impl ModerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationStatus::Pending => "pending",
            ModerationStatus::Approved => "approved",
            ModerationStatus::Flagged => "flagged",
            ModerationStatus::Rejected => "rejected",
            ModerationStatus::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        match raw {
            "pending" => Ok(ModerationStatus::Pending),
            "approved" => Ok(ModerationStatus::Approved),
            "flagged" => Ok(ModerationStatus::Flagged),
            "rejected" => Ok(ModerationStatus::Rejected),
            "archived" => Ok(ModerationStatus::Archived),
            other => Err(PipelineError::Validation(format!(
                "unknown moderation status '{other}'"
            ))),
        }
    }
}

/// A sticker product. Invariants enforced by the pricing engine:
/// `price >= floor_price`, prices end in .49/.99, and an archived
/// moderation status implies the archived pricing tier.
#[derive(Debug, Clone)]
pub struct Sticker {
    pub id: String,
    pub trend_id: String,
    pub title: String,
    pub description: String,
    pub image_url: String,
    pub thumbnail_url: String,
    pub original_url: String,
    pub size: SizeClass,
    pub price: f64,
    pub floor_price: f64,
    pub pricing_tier: PricingTier,
    pub moderation_status: ModerationStatus,
    pub listing_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub sales_count: i64,
    pub view_count: i64,
    pub last_sale_at: Option<DateTime<Utc>>,
    pub fulfillment_provider: String,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a freshly generated sticker.
#[derive(Debug, Clone)]
pub struct NewSticker {
    pub trend_id: String,
    pub title: String,
    pub description: String,
    pub image_url: String,
    pub thumbnail_url: String,
    pub original_url: String,
    pub size: SizeClass,
    pub price: f64,
    pub floor_price: f64,
    pub pricing_tier: PricingTier,
    pub fulfillment_provider: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Paid,
    SentToPrint,
    PrintConfirmed,
    Shipped,
    Delivered,
    PendingManual,
    Printed,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Paid => "paid",
            OrderStatus::SentToPrint => "sent_to_print",
            OrderStatus::PrintConfirmed => "print_confirmed",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::PendingManual => "pending_manual",
            OrderStatus::Printed => "printed",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        match raw {
            "paid" => Ok(OrderStatus::Paid),
            "sent_to_print" => Ok(OrderStatus::SentToPrint),
            "print_confirmed" => Ok(OrderStatus::PrintConfirmed),
            "shipped" => Ok(OrderStatus::Shipped),
            "delivered" => Ok(OrderStatus::Delivered),
            "pending_manual" => Ok(OrderStatus::PendingManual),
            "printed" => Ok(OrderStatus::Printed),
            "refunded" => Ok(OrderStatus::Refunded),
            other => Err(PipelineError::Validation(format!(
                "unknown order status '{other}'"
            ))),
        }
    }
}

/// Shipping details captured at sale time, purged 90 days after delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerData {
    pub name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub country: String,
}

/// An order. `pricing_tier_at_sale` is frozen at creation and feeds the
/// sales-override rule; it never mutates afterwards.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub sticker_id: Option<String>,
    pub receipt_id: String,
    pub status: OrderStatus,
    pub quantity: i64,
    pub unit_price: f64,
    pub pricing_tier_at_sale: Option<PricingTier>,
    pub customer_data: Option<CustomerData>,
    pub created_at: DateTime<Utc>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub fulfillment_attempts: i64,
    pub last_fulfillment_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub sticker_id: Option<String>,
    pub receipt_id: String,
    pub status: OrderStatus,
    pub quantity: i64,
    pub unit_price: f64,
    pub pricing_tier_at_sale: Option<PricingTier>,
    pub customer_data: Option<CustomerData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Started,
    Completed,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        match raw {
            "started" => Ok(RunStatus::Started),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "partial" => Ok(RunStatus::Partial),
            other => Err(PipelineError::Validation(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

/// Per-run progress counters recorded on the pipeline-run ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub trends_found: i64,
    pub stickers_generated: i64,
    pub prices_updated: i64,
    pub stickers_archived: i64,
    pub errors_count: i64,
}

/// One workflow execution. `ended_at` and `duration_seconds` are set iff
/// the run has left the `started` status.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub id: String,
    pub workflow: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub counts: RunCounts,
    pub api_calls_used: i64,
    pub ai_cost_estimate_usd: Option<f64>,
    pub metadata: serde_json::Value,
}

/// A redacted error-ledger row.
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub id: String,
    pub workflow: String,
    pub step: String,
    pub error_kind: String,
    pub message: String,
    pub service: Option<String>,
    pub pipeline_run_id: Option<String>,
    pub retry_count: i64,
    pub resolved: bool,
    pub context: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Append-only price change record.
#[derive(Debug, Clone)]
pub struct PriceHistory {
    pub id: i64,
    pub sticker_id: String,
    pub old_price: f64,
    pub new_price: f64,
    pub pricing_tier: PricingTier,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Cost row from the `shipping_rates` table, keyed by
/// `(product_type, fulfillment_provider)`.
#[derive(Debug, Clone)]
pub struct ShippingRate {
    pub product_type: SizeClass,
    pub fulfillment_provider: String,
    pub shipping_cost: f64,
    pub packaging_cost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trips() {
        for status in [
            TrendStatus::Discovered,
            TrendStatus::Queued,
            TrendStatus::Generated,
            TrendStatus::GenerationFailed,
        ] {
            assert_eq!(TrendStatus::parse(status.as_str()).unwrap(), status);
        }
        for tier in [
            PricingTier::JustDropped,
            PricingTier::Trending,
            PricingTier::Cooling,
            PricingTier::Evergreen,
            PricingTier::Archived,
        ] {
            assert_eq!(PricingTier::parse(tier.as_str()).unwrap(), tier);
        }
        for status in [
            OrderStatus::Paid,
            OrderStatus::SentToPrint,
            OrderStatus::PrintConfirmed,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::PendingManual,
            OrderStatus::Printed,
            OrderStatus::Refunded,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_variants_rejected() {
        assert!(TrendStatus::parse("published").is_err());
        assert!(PricingTier::parse("premium").is_err());
        assert!(SizeClass::parse("sheet").is_err());
        assert!(RunStatus::parse("aborted").is_err());
    }
}
