//! Trend monitor entry point.
//!
//! Scheduled every ~2 hours. Exit code 0 on completed/partial, nonzero
//! on failed. Writes `new_trends=<true|false>` to the scheduler output
//! file when one is provided, so the generation job can be gated on it.

use std::collections::HashMap;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use trendmark_backend::clients::llm::HttpLlmClient;
use trendmark_backend::config::load_config;
use trendmark_backend::db::Store;
use trendmark_backend::limiter::kv::RestKv;
use trendmark_backend::limiter::RateLimiter;
use trendmark_backend::models::RunStatus;
use trendmark_backend::monitoring::alerter::RestEmailTransport;
use trendmark_backend::monitoring::{Alerter, SpendTracker};
use trendmark_backend::trends::{
    MonitorOutcome, RedditSource, SearchTrendsSource, TrendMonitor, TrendScorer, TrendSource,
};

#[derive(Parser, Debug)]
#[command(name = "trend_monitor")]
#[command(about = "Discover and score trending sticker topics")]
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

    info!("starting trend monitor");
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

    let llm = Arc::new(HttpLlmClient::new(
        cfg.llm.base_url.clone(),
        cfg.llm.api_key.clone(),
        cfg.llm.scoring_model.clone(),
    )?);
    let sources: Vec<Arc<dyn TrendSource>> = vec![
        Arc::new(RedditSource::new(&cfg.sources.reddit_user_agent)?),
        Arc::new(SearchTrendsSource::new()?),
    ];

    let monitor = TrendMonitor::new(
        store,
        sources,
        TrendScorer::new(llm),
        limiter,
        spend,
        Some(alerter),
        cfg.costs,
        cfg.caps.max_trends_per_cycle as usize,
    );

    match monitor.run().await {
        Ok(MonitorOutcome { new_trends, status }) => {
            let mut outputs = HashMap::new();
            outputs.insert("new_trends", new_trends.to_string());
            if let Err(err) = trendmark_backend::config::write_scheduler_output(&outputs) {
                error!(error = %err, "could not write scheduler output");
            }
            if new_trends {
                info!("new trends discovered, generation job should run");
            } else {
                info!("no qualifying trends this cycle");
            }
            if status == RunStatus::Failed {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "trend monitor failed");
            let mut outputs = HashMap::new();
            outputs.insert("new_trends", "false".to_string());
            trendmark_backend::config::write_scheduler_output(&outputs).ok();
            std::process::exit(1);
        }
    }
}
