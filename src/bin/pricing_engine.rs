//! Pricing engine entry point.
//!
//! Scheduled daily. Runs the archiver, then the per-sticker repricing
//! pass. Exit code 0 on completed/partial, nonzero on failed.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use trendmark_backend::clients::marketplace::MarketplaceClient;
use trendmark_backend::config::load_config;
use trendmark_backend::db::Store;
use trendmark_backend::limiter::kv::RestKv;
use trendmark_backend::limiter::RateLimiter;
use trendmark_backend::monitoring::alerter::RestEmailTransport;
use trendmark_backend::monitoring::Alerter;
use trendmark_backend::pricing::PricingEngine;

#[derive(Parser, Debug)]
#[command(name = "pricing_engine")]
#[command(about = "Reprice and archive sticker listings by trend age")]
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

    info!("starting daily pricing engine");
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

    let marketplace = Arc::new(MarketplaceClient::new(
        cfg.marketplace.base_url.clone(),
        cfg.marketplace.api_key.clone(),
        cfg.marketplace.shop_id.clone(),
    )?);

    let engine = PricingEngine::new(store, marketplace, limiter, Some(alerter));

    match engine.run().await {
        Ok(outcome) => {
            info!(
                repriced = outcome.counts.prices_updated,
                archived = outcome.counts.stickers_archived,
                errors = outcome.counts.errors_count,
                "pricing engine finished"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "pricing engine failed");
            std::process::exit(1);
        }
    }
}
