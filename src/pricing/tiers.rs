//! Pricing tiers, price-point rounding, and floor prices.
//!
//! Tier boundaries are a closed table scanned in order; each row covers
//! ages `[min_days, max_days)` with an open-ended final row. The table
//! can be overridden from the `pricing_tiers` store table, with the
//! compiled-in defaults as fallback.

use tracing::warn;

use crate::db::Store;
use crate::models::{PricingTier, SizeClass};

/// Marketplace transaction + payment processing fee rate.
pub const DEFAULT_FEE_RATE: f64 = 0.10;
/// Minimum margin target.
pub const DEFAULT_MIN_MARGIN: f64 = 0.20;

const DEFAULT_PRINT_COST_SMALL: f64 = 1.50;
const DEFAULT_PRINT_COST_LARGE: f64 = 2.00;

// Fallback costs when the shipping-rates lookup comes up empty
// (self-fulfilled first-class mail).
const FALLBACK_SHIPPING_COST: f64 = 0.78;
const FALLBACK_PACKAGING_SMALL: f64 = 0.15;
const FALLBACK_PACKAGING_LARGE: f64 = 0.20;

/// One row of the tier boundary table. `max_days` is exclusive; None
/// means open-ended.
#[derive(Debug, Clone)]
pub struct TierSpec {
    pub tier: PricingTier,
    pub min_days: i64,
    pub max_days: Option<i64>,
    pub price_small: f64,
    pub price_large: f64,
}

/// The tier table, in scan order.
#[derive(Debug, Clone)]
pub struct TierTable {
    specs: Vec<TierSpec>,
}

impl TierTable {
    /// Compiled-in defaults: just_dropped through day 3, trending through
    /// day 13, cooling through day 29, evergreen beyond.
    pub fn default_table() -> Self {
        Self {
            specs: vec![
                TierSpec {
                    tier: PricingTier::JustDropped,
                    min_days: 0,
                    max_days: Some(4),
                    price_small: 5.49,
                    price_large: 6.49,
                },
                TierSpec {
                    tier: PricingTier::Trending,
                    min_days: 4,
                    max_days: Some(14),
                    price_small: 4.49,
                    price_large: 5.49,
                },
                TierSpec {
                    tier: PricingTier::Cooling,
                    min_days: 14,
                    max_days: Some(30),
                    price_small: 3.49,
                    price_large: 4.49,
                },
                TierSpec {
                    tier: PricingTier::Evergreen,
                    min_days: 30,
                    max_days: None,
                    price_small: 3.49,
                    price_large: 4.49,
                },
            ],
        }
    }

    /// Load from the store's `pricing_tiers` table, falling back to the
    /// defaults when the table is unseeded or unreadable.
    pub fn load(store: &Store) -> Self {
        match store.pricing_tier_rows() {
            Ok(rows) if !rows.is_empty() => Self {
                specs: rows
                    .into_iter()
                    .map(|row| TierSpec {
                        tier: row.tier,
                        min_days: row.min_trend_age_days,
                        max_days: row.max_trend_age_days,
                        price_small: row.price_single_small,
                        price_large: row.price_single_large,
                    })
                    .collect(),
            },
            Ok(_) => Self::default_table(),
            Err(err) => {
                warn!(error = %err, "pricing tier load failed, using defaults");
                Self::default_table()
            }
        }
    }

    /// Tier for a trend aged `age_days`, first matching row wins.
    pub fn tier_for_age(&self, age_days: i64) -> PricingTier {
        for spec in &self.specs {
            let in_range = match spec.max_days {
                Some(max) => age_days >= spec.min_days && age_days < max,
                None => age_days >= spec.min_days,
            };
            if in_range {
                return spec.tier;
            }
        }
        warn!(age_days, "no tier matched, defaulting to evergreen");
        PricingTier::Evergreen
    }

    /// Listed base price for a tier and size class.
    pub fn price_for(&self, tier: PricingTier, size: SizeClass) -> f64 {
        for spec in &self.specs {
            if spec.tier == tier {
                return match size {
                    SizeClass::SingleSmall => spec.price_small,
                    SizeClass::SingleLarge => spec.price_large,
                };
            }
        }
        warn!(tier = tier.as_str(), "tier missing from table, using cooling fallback");
        match size {
            SizeClass::SingleSmall => 3.49,
            SizeClass::SingleLarge => 4.49,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self::default_table()
    }
}

/// Round a price up to the nearest psychological price point: the
/// smallest of `⌊p⌋+0.49`, `⌊p⌋+0.99`, `⌊p⌋+1.49` that is >= p.
/// Non-positive input returns 0.49.
pub fn round_to_price_point(price: f64) -> f64 {
    if price <= 0.0 {
        return 0.49;
    }
    let base = price.floor();
    for candidate in [base + 0.49, base + 0.99, base + 1.49] {
        // Epsilon guards against 3.49 landing a hair above base + 0.49.
        if candidate + 1e-9 >= price {
            return (candidate * 100.0).round() / 100.0;
        }
    }
    (base * 100.0).round() / 100.0 + 1.49
}

/// Minimum profitable price before rounding:
/// `(print + shipping + packaging) / (1 - fee_rate) / (1 - min_margin)`.
pub fn calculate_floor_price(
    print_cost: f64,
    shipping_cost: f64,
    packaging_cost: f64,
    fee_rate: f64,
    min_margin: f64,
) -> f64 {
    let (fee_rate, min_margin) = if fee_rate >= 1.0 || min_margin >= 1.0 {
        warn!(fee_rate, min_margin, "invalid fee/margin, using defaults");
        (DEFAULT_FEE_RATE, DEFAULT_MIN_MARGIN)
    } else {
        (fee_rate, min_margin)
    };
    let total_cost = print_cost + shipping_cost + packaging_cost;
    let floor = total_cost / (1.0 - fee_rate) / (1.0 - min_margin);
    (floor * 100.0).round() / 100.0
}

/// Floor price for a product, reading costs from the shipping-rates
/// table and applying the self-fulfilled fallbacks on a missing row.
/// The result is rounded to a legal price point.
pub fn floor_price_for(
    store: &Store,
    size: SizeClass,
    fulfillment_provider: &str,
) -> f64 {
    let print_cost = match size {
        SizeClass::SingleSmall => DEFAULT_PRINT_COST_SMALL,
        SizeClass::SingleLarge => DEFAULT_PRINT_COST_LARGE,
    };

    let (shipping_cost, packaging_cost) = match store.shipping_rate(size, fulfillment_provider) {
        Ok(Some(rate)) => (rate.shipping_cost, rate.packaging_cost),
        Ok(None) | Err(_) => {
            let packaging = match size {
                SizeClass::SingleSmall => FALLBACK_PACKAGING_SMALL,
                SizeClass::SingleLarge => FALLBACK_PACKAGING_LARGE,
            };
            (FALLBACK_SHIPPING_COST, packaging)
        }
    };

    let raw = calculate_floor_price(
        print_cost,
        shipping_cost,
        packaging_cost,
        DEFAULT_FEE_RATE,
        DEFAULT_MIN_MARGIN,
    );
    round_to_price_point(raw)
}
