//! Environment-driven configuration.
//!
//! All settings come from environment variables (a `.env` file is honored
//! in development). Missing required variables produce a [`ConfigError`]
//! naming the variable; malformed numeric values fall back to the default
//! with a warning instead of aborting a scheduled run.

use std::collections::HashMap;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable '{0}' is not set")]
    Missing(&'static str),
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn optional(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn optional_u32(name: &str, default: u32) -> u32 {
    match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, default, "non-integer env value, using default");
            default
        }),
    }
}

fn optional_f64(name: &str, default: f64) -> f64 {
    match std::env::var(name) {
        Err(_) => default,
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, default, "non-numeric env value, using default");
            default
        }),
    }
}

/// LLM provider settings (scoring, prompts, moderation).
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub scoring_model: String,
}

/// Image generation provider settings.
#[derive(Debug, Clone)]
pub struct ImageGenConfig {
    pub api_token: String,
    pub model_id: String,
    pub image_size: u32,
}

/// Relational store location.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: String,
}

/// Coordination store (REST key-value service) credentials.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    pub url: String,
    pub token: String,
}

/// Object store (artifact bucket) credentials.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub public_url: String,
}

/// Marketplace API credentials.
#[derive(Debug, Clone)]
pub struct MarketplaceConfig {
    pub base_url: String,
    pub api_key: String,
    pub shop_id: String,
}

/// Trend source credentials.
#[derive(Debug, Clone)]
pub struct SourcesConfig {
    pub reddit_client_id: String,
    pub reddit_client_secret: String,
    pub reddit_user_agent: String,
}

#[derive(Debug, Clone)]
pub struct FulfillmentConfig {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub api_key: String,
    pub alert_email: String,
}

/// Operational caps shared by the workflows.
#[derive(Debug, Clone)]
pub struct CapsConfig {
    pub max_trends_per_cycle: u32,
    pub max_images_per_day: u32,
    pub max_active_listings: u32,
    pub ai_monthly_budget_cap_usd: f64,
}

/// Per-unit AI cost rates used by the cost estimator.
#[derive(Debug, Clone, Copy)]
pub struct CostRates {
    pub llm_input_per_token: f64,
    pub llm_output_per_token: f64,
    pub per_image: f64,
}

impl CostRates {
    /// Estimated spend in USD for a mix of token and image usage.
    pub fn estimate(&self, input_tokens: u64, output_tokens: u64, images: u32) -> f64 {
        let cost = input_tokens as f64 * self.llm_input_per_token
            + output_tokens as f64 * self.llm_output_per_token
            + images as f64 * self.per_image;
        (cost * 10_000.0).round() / 10_000.0
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub image_gen: ImageGenConfig,
    pub store: StoreConfig,
    pub coordination: CoordinationConfig,
    pub object_store: ObjectStoreConfig,
    pub marketplace: MarketplaceConfig,
    pub sources: SourcesConfig,
    pub fulfillment: FulfillmentConfig,
    pub notification: NotificationConfig,
    pub caps: CapsConfig,
    pub costs: CostRates,
}

/// Load configuration from the environment.
///
/// With `require_all = false` missing secrets become empty strings, which
/// is what tests and partially-wired tools want.
pub fn load_config(require_all: bool) -> Result<AppConfig, ConfigError> {
    let get = |name: &'static str| -> Result<String, ConfigError> {
        if require_all {
            require(name)
        } else {
            Ok(optional(name, ""))
        }
    };

    Ok(AppConfig {
        llm: LlmConfig {
            api_key: get("LLM_API_KEY")?,
            base_url: optional("LLM_BASE_URL", "https://api.openai.com/v1"),
            scoring_model: optional("LLM_SCORING_MODEL", "gpt-4o-mini"),
        },
        image_gen: ImageGenConfig {
            api_token: get("REPLICATE_API_TOKEN")?,
            model_id: optional("REPLICATE_MODEL_ID", "black-forest-labs/flux-schnell"),
            image_size: optional_u32("REPLICATE_IMAGE_SIZE", 1024),
        },
        store: StoreConfig {
            path: optional("STORE_PATH", "trendmark.db"),
        },
        coordination: CoordinationConfig {
            url: get("COORDINATION_REDIS_URL")?,
            token: get("COORDINATION_REDIS_TOKEN")?,
        },
        object_store: ObjectStoreConfig {
            endpoint: get("OBJECT_STORE_ENDPOINT")?,
            bucket: get("OBJECT_STORE_BUCKET")?,
            access_key: get("OBJECT_STORE_ACCESS_KEY")?,
            secret_key: get("OBJECT_STORE_SECRET_KEY")?,
            public_url: optional("OBJECT_STORE_PUBLIC_URL", ""),
        },
        marketplace: MarketplaceConfig {
            base_url: optional(
                "MARKETPLACE_API_BASE",
                "https://openapi.etsy.com/v3/application",
            ),
            api_key: get("MARKETPLACE_API_KEY")?,
            shop_id: get("MARKETPLACE_SHOP_ID")?,
        },
        sources: SourcesConfig {
            reddit_client_id: get("REDDIT_CLIENT_ID")?,
            reddit_client_secret: get("REDDIT_CLIENT_SECRET")?,
            reddit_user_agent: optional("REDDIT_USER_AGENT", "trendmark/1.0"),
        },
        fulfillment: FulfillmentConfig {
            base_url: optional(
                "FULFILLMENT_API_BASE",
                "https://api.stickermule.com/api/v4",
            ),
            api_key: get("FULFILLMENT_API_KEY")?,
        },
        notification: NotificationConfig {
            api_key: get("EMAIL_API_KEY")?,
            alert_email: get("ALERT_EMAIL")?,
        },
        caps: CapsConfig {
            max_trends_per_cycle: optional_u32("MAX_TRENDS_PER_CYCLE", 5),
            max_images_per_day: optional_u32("MAX_IMAGES_PER_DAY", 50),
            max_active_listings: optional_u32("MAX_ACTIVE_LISTINGS", 300),
            ai_monthly_budget_cap_usd: optional_f64("AI_MONTHLY_BUDGET_CAP_USD", 150.0),
        },
        costs: CostRates {
            llm_input_per_token: optional_f64("LLM_INPUT_COST_PER_TOKEN", 0.0),
            llm_output_per_token: optional_f64("LLM_OUTPUT_COST_PER_TOKEN", 0.0),
            per_image: optional_f64("REPLICATE_COST_PER_IMAGE", 0.003),
        },
    })
}

/// Scheduler output file support: append `key=value` lines to the file
/// named by `SCHEDULER_OUTPUT`, if set. Used by `trend_monitor` to signal
/// the downstream generation job.
pub fn write_scheduler_output(pairs: &HashMap<&str, String>) -> std::io::Result<()> {
    use std::io::Write;

    let Ok(path) = std::env::var("SCHEDULER_OUTPUT") else {
        return Ok(());
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    for (key, value) in pairs {
        writeln!(file, "{key}={value}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_estimate_uses_rates() {
        let rates = CostRates {
            llm_input_per_token: 0.15 / 1_000_000.0,
            llm_output_per_token: 0.60 / 1_000_000.0,
            per_image: 0.003,
        };
        let cost = rates.estimate(1_000_000, 1_000_000, 10);
        assert!((cost - (0.15 + 0.60 + 0.03)).abs() < 1e-9);
    }

    #[test]
    fn test_cost_estimate_zero_rates() {
        let rates = CostRates {
            llm_input_per_token: 0.0,
            llm_output_per_token: 0.0,
            per_image: 0.0,
        };
        assert_eq!(rates.estimate(5000, 5000, 5), 0.0);
    }

    #[test]
    fn test_partial_config_loads_without_secrets() {
        let cfg = load_config(false).expect("partial load");
        assert_eq!(cfg.caps.max_trends_per_cycle, 5);
        assert_eq!(cfg.caps.max_images_per_day, 50);
        assert_eq!(cfg.caps.max_active_listings, 300);
        assert!(cfg.marketplace.api_key.is_empty());
    }
}
