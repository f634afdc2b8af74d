//! Analytics sync entry point.
//!
//! Scheduled daily. Pulls orders, triggers fulfillment, refreshes the
//! derived views, runs retention purges, and sends the daily summary.
//! Exit code 0 on completed/partial, nonzero on failed.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use trendmark_backend::analytics::{AnalyticsSync, RetentionPurger};
use trendmark_backend::clients::fulfillment::HttpFulfillmentClient;
use trendmark_backend::clients::marketplace::MarketplaceClient;
use trendmark_backend::clients::object_store::HttpObjectStore;
use trendmark_backend::config::load_config;
use trendmark_backend::db::Store;
use trendmark_backend::limiter::kv::RestKv;
use trendmark_backend::limiter::RateLimiter;
use trendmark_backend::monitoring::alerter::RestEmailTransport;
use trendmark_backend::monitoring::{Alerter, SpendTracker};

#[derive(Parser, Debug)]
#[command(name = "analytics_sync")]
#[command(about = "Sync orders, run retention purges, send the daily summary")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    info!("starting daily analytics sync");
    let cfg = load_config(true)?;

    let store = Store::open(&cfg.store.path)?;
    let kv = Arc::new(RestKv::new(
        cfg.coordination.url.clone(),
        cfg.coordination.token.clone(),
    )?);
    let limiter = Arc::new(RateLimiter::new(kv));

    let transport = Arc::new(RestEmailTransport::new(
        cfg.notification.api_key.clone(),
        "pipeline@trendmark.shop".to_string(),
    )?);
    let alerter = Alerter::new(transport, cfg.notification.alert_email.clone());
    let spend = SpendTracker::with_monthly_cap(
        store.clone(),
        Some(alerter.clone()),
        cfg.caps.ai_monthly_budget_cap_usd,
    );

    let marketplace = Arc::new(MarketplaceClient::new(
        cfg.marketplace.base_url.clone(),
        cfg.marketplace.api_key.clone(),
        cfg.marketplace.shop_id.clone(),
    )?);
    let fulfillment = Arc::new(HttpFulfillmentClient::new(
        cfg.fulfillment.base_url.clone(),
        cfg.fulfillment.api_key.clone(),
    )?);
    let cold_storage = Arc::new(HttpObjectStore::new(
        cfg.object_store.endpoint.clone(),
        cfg.object_store.bucket.clone(),
        cfg.object_store.access_key.clone(),
        cfg.object_store.public_url.clone(),
    )?);
    let purger = RetentionPurger::new(store.clone(), Some(cold_storage));

    let sync = AnalyticsSync::new(
        store,
        marketplace,
        fulfillment,
        limiter,
        spend,
        purger,
        Some(alerter),
        cfg.caps.max_active_listings as i64,
    );

    match sync.run().await {
        Ok(outcome) => {
            info!(
                orders_synced = outcome.orders_synced,
                orders_fulfilled = outcome.orders_fulfilled,
                errors = outcome.errors,
                "analytics sync finished"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "analytics sync failed");
            std::process::exit(1);
        }
    }
}
