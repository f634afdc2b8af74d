//! Pricing: tier tables, the archiver, and the daily engine.

pub mod archiver;
pub mod engine;
pub mod tiers;


pub use archiver::{is_archivable, StickerArchiver, ARCHIVE_THRESHOLD_DAYS};
pub use engine::{decide, Decision, PricingEngine, PricingOutcome, SALES_OVERRIDE_THRESHOLD};
pub use tiers::{
    calculate_floor_price, floor_price_for, round_to_price_point, TierSpec, TierTable,
};
