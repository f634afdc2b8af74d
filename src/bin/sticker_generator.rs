//! Sticker generator entry point.
//!
//! Triggered by the scheduler after a discovery cycle reports new
//! trends. Exit code 0 on completed/partial, nonzero on failed.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use trendmark_backend::clients::image_gen::HttpImageGenerator;
use trendmark_backend::clients::object_store::HttpObjectStore;
use trendmark_backend::config::load_config;
use trendmark_backend::db::Store;
use trendmark_backend::limiter::kv::RestKv;
use trendmark_backend::limiter::RateLimiter;
use trendmark_backend::monitoring::alerter::RestEmailTransport;
use trendmark_backend::monitoring::{Alerter, SpendTracker};
use trendmark_backend::stickers::{DefaultAssetChain, StickerGenerator};

#[derive(Parser, Debug)]
#[command(name = "sticker_generator")]
#[command(about = "Generate sticker artwork for discovered trends")]
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

    info!("starting sticker generator");
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

    let image_gen = Arc::new(HttpImageGenerator::new(
        cfg.image_gen.api_token.clone(),
        cfg.image_gen.model_id.clone(),
    )?);
    let objects = Arc::new(HttpObjectStore::new(
        cfg.object_store.endpoint.clone(),
        cfg.object_store.bucket.clone(),
        cfg.object_store.access_key.clone(),
        cfg.object_store.public_url.clone(),
    )?);
    let chain = Arc::new(DefaultAssetChain::new(
        image_gen,
        objects,
        cfg.image_gen.image_size,
    ));

    let generator = StickerGenerator::new(
        store,
        chain,
        limiter,
        spend,
        Some(alerter),
        cfg.costs,
        cfg.caps.max_images_per_day as i64,
    );

    match generator.run().await {
        Ok(outcome) => {
            info!(
                generated = outcome.counts.stickers_generated,
                errors = outcome.counts.errors_count,
                "sticker generator finished"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "sticker generator failed");
            std::process::exit(1);
        }
    }
}
