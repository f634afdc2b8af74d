//! Relational store for trends, stickers, orders, and the ledgers.
//!
//! SQLite with WAL mode behind a single shared connection. Each row has a
//! single logical owner: orchestrators write pipeline_runs and error_log,
//! the pricing engine writes price_history and sticker price fields, the
//! deduplicator creates trends. Filters are built only from the typed
//! column enums below, never from caller-supplied strings.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{
    CustomerData, ErrorEntry, ModerationStatus, NewOrder, NewSticker, NewTrend, Order,
    OrderStatus, PipelineRun, PriceHistory, PricingTier, RunCounts, RunStatus, ShippingRate,
    SizeClass, Sticker, Trend, TrendStatus, Workflow,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS trends (
    id TEXT PRIMARY KEY,
    topic TEXT NOT NULL,
    normalized_topic TEXT NOT NULL UNIQUE,
    sources TEXT NOT NULL,
    keywords TEXT NOT NULL,
    score_velocity INTEGER,
    score_commercial INTEGER,
    score_safety INTEGER,
    score_uniqueness INTEGER,
    score_overall REAL,
    reasoning TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    source_data TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trends_status
    ON trends(status, created_at DESC);

CREATE TABLE IF NOT EXISTS stickers (
    id TEXT PRIMARY KEY,
    trend_id TEXT NOT NULL REFERENCES trends(id),
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    image_url TEXT NOT NULL DEFAULT '',
    thumbnail_url TEXT NOT NULL DEFAULT '',
    original_url TEXT NOT NULL DEFAULT '',
    size TEXT NOT NULL,
    price REAL NOT NULL,
    floor_price REAL NOT NULL DEFAULT 0,
    pricing_tier TEXT NOT NULL,
    moderation_status TEXT NOT NULL,
    listing_id TEXT,
    published_at TEXT,
    sales_count INTEGER NOT NULL DEFAULT 0,
    view_count INTEGER NOT NULL DEFAULT 0,
    last_sale_at TEXT,
    fulfillment_provider TEXT NOT NULL DEFAULT 'self_usps',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_stickers_listing ON stickers(listing_id);
CREATE INDEX IF NOT EXISTS idx_stickers_tier
    ON stickers(pricing_tier, moderation_status);

CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    sticker_id TEXT REFERENCES stickers(id),
    receipt_id TEXT NOT NULL,
    status TEXT NOT NULL,
    quantity INTEGER NOT NULL DEFAULT 1,
    unit_price REAL NOT NULL DEFAULT 0,
    pricing_tier_at_sale TEXT,
    customer_data TEXT,
    created_at TEXT NOT NULL,
    shipped_at TEXT,
    delivered_at TEXT,
    fulfillment_attempts INTEGER NOT NULL DEFAULT 0,
    last_fulfillment_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_orders_receipt ON orders(receipt_id);
CREATE INDEX IF NOT EXISTS idx_orders_sticker_tier
    ON orders(sticker_id, pricing_tier_at_sale);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);

CREATE TABLE IF NOT EXISTS pipeline_runs (
    id TEXT PRIMARY KEY,
    workflow TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    duration_seconds INTEGER,
    trends_found INTEGER NOT NULL DEFAULT 0,
    stickers_generated INTEGER NOT NULL DEFAULT 0,
    prices_updated INTEGER NOT NULL DEFAULT 0,
    stickers_archived INTEGER NOT NULL DEFAULT 0,
    errors_count INTEGER NOT NULL DEFAULT 0,
    api_calls_used INTEGER NOT NULL DEFAULT 0,
    ai_cost_estimate_usd REAL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_runs_started ON pipeline_runs(started_at);
CREATE INDEX IF NOT EXISTS idx_runs_workflow
    ON pipeline_runs(workflow, started_at DESC);

CREATE TABLE IF NOT EXISTS error_log (
    id TEXT PRIMARY KEY,
    workflow TEXT NOT NULL,
    step TEXT NOT NULL,
    error_kind TEXT NOT NULL,
    message TEXT NOT NULL,
    service TEXT,
    pipeline_run_id TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    resolved INTEGER NOT NULL DEFAULT 0,
    context TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_errors_workflow
    ON error_log(workflow, created_at DESC);

CREATE TABLE IF NOT EXISTS price_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sticker_id TEXT NOT NULL,
    old_price REAL NOT NULL,
    new_price REAL NOT NULL,
    pricing_tier TEXT NOT NULL,
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_price_history_created
    ON price_history(created_at);
CREATE INDEX IF NOT EXISTS idx_price_history_sticker
    ON price_history(sticker_id, created_at DESC);

CREATE TABLE IF NOT EXISTS pricing_tiers (
    tier TEXT PRIMARY KEY,
    position INTEGER NOT NULL,
    min_trend_age_days INTEGER NOT NULL,
    max_trend_age_days INTEGER,
    price_single_small REAL NOT NULL,
    price_single_large REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS shipping_rates (
    product_type TEXT NOT NULL,
    fulfillment_provider TEXT NOT NULL,
    shipping_cost REAL NOT NULL,
    packaging_cost REAL NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (product_type, fulfillment_provider)
);

CREATE TABLE IF NOT EXISTS daily_metrics (
    day TEXT PRIMARY KEY,
    orders INTEGER NOT NULL DEFAULT 0,
    units INTEGER NOT NULL DEFAULT 0,
    gross_revenue REAL NOT NULL DEFAULT 0,
    new_listings INTEGER NOT NULL DEFAULT 0,
    refreshed_at TEXT NOT NULL
);
"#;

/// Fixed-width UTC timestamp so lexicographic ordering matches time order.
fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_from_sql(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| conversion_error(PipelineError::Validation(format!("timestamp: {err}"))))
}

fn opt_ts_from_sql(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(ts_from_sql).transpose()
}

fn conversion_error(err: PipelineError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn json_list(raw: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|err| conversion_error(PipelineError::Validation(format!("json list: {err}"))))
}

fn json_value(raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|err| conversion_error(PipelineError::Validation(format!("json value: {err}"))))
}

/// Typed filter for error-ledger queries. The closed enum is the column
/// whitelist: filters cannot name arbitrary columns.
#[derive(Debug, Clone)]
pub enum ErrorFilter {
    Workflow(Workflow),
    Service(String),
    Resolved(bool),
}

impl ErrorFilter {
    fn clause(&self) -> (&'static str, rusqlite::types::Value) {
        match self {
            ErrorFilter::Workflow(w) => ("workflow = ?", w.as_str().to_string().into()),
            ErrorFilter::Service(s) => ("service = ?", s.clone().into()),
            ErrorFilter::Resolved(r) => ("resolved = ?", (*r as i64).into()),
        }
    }
}

/// Row from the `pricing_tiers` configuration table, in scan order.
#[derive(Debug, Clone)]
pub struct TierRow {
    pub tier: PricingTier,
    pub min_trend_age_days: i64,
    pub max_trend_age_days: Option<i64>,
    pub price_single_small: f64,
    pub price_single_large: f64,
}

/// Aggregates recomputed daily by the analytics sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyMetrics {
    pub orders: i64,
    pub units: i64,
    pub gross_revenue: f64,
    pub new_listings: i64,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self, PipelineError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .map_err(|err| PipelineError::Storage(format!("open {db_path}: {err}")))?;
        conn.execute_batch(SCHEMA_SQL)?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!(path = db_path, "store initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, PipelineError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Trends
    // ------------------------------------------------------------------

    /// Insert a canonical trend. The UNIQUE constraint on
    /// `normalized_topic` is the backstop for the dedup invariant.
    pub fn insert_trend(&self, trend: &NewTrend) -> Result<String, PipelineError> {
        let id = Uuid::new_v4().to_string();
        let now = ts_to_sql(Utc::now());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trends (id, topic, normalized_topic, sources, keywords,
                score_velocity, score_commercial, score_safety, score_uniqueness,
                score_overall, reasoning, status, source_data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
            params![
                id,
                trend.topic,
                trend.normalized_topic,
                serde_json::to_string(&trend.sources)?,
                serde_json::to_string(&trend.keywords)?,
                trend.score_velocity,
                trend.score_commercial,
                trend.score_safety,
                trend.score_uniqueness,
                trend.score_overall,
                trend.reasoning,
                trend.status.as_str(),
                serde_json::to_string(&trend.source_data)?,
                now,
            ],
        )?;
        Ok(id)
    }

    pub fn trend_by_normalized_topic(
        &self,
        normalized: &str,
    ) -> Result<Option<Trend>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE normalized_topic = ?1",
            Self::TREND_SELECT
        ))?;
        Ok(stmt
            .query_row(params![normalized], Self::row_to_trend)
            .optional()?)
    }

    pub fn trend_by_id(&self, id: &str) -> Result<Option<Trend>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", Self::TREND_SELECT))?;
        Ok(stmt.query_row(params![id], Self::row_to_trend).optional()?)
    }

    pub fn trends_by_status(&self, status: TrendStatus) -> Result<Vec<Trend>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE status = ?1 ORDER BY created_at ASC",
            Self::TREND_SELECT
        ))?;
        let rows = stmt.query_map(params![status.as_str()], Self::row_to_trend)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn update_trend_sources(
        &self,
        id: &str,
        sources: &[String],
    ) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trends SET sources = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(sources)?,
                ts_to_sql(Utc::now()),
                id
            ],
        )?;
        Ok(())
    }

    pub fn set_trend_status(&self, id: &str, status: TrendStatus) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trends SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), ts_to_sql(Utc::now()), id],
        )?;
        Ok(())
    }

    /// Test fixture: rewrite a trend's creation time to simulate age.
    #[cfg(test)]
    pub fn set_trend_created_at(
        &self,
        id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trends SET created_at = ?1 WHERE id = ?2",
            params![ts_to_sql(created_at), id],
        )?;
        Ok(())
    }

    const TREND_SELECT: &'static str = "SELECT id, topic, normalized_topic, sources, keywords,
        score_velocity, score_commercial, score_safety, score_uniqueness, score_overall,
        reasoning, status, source_data, created_at, updated_at FROM trends";

    fn row_to_trend(row: &Row<'_>) -> rusqlite::Result<Trend> {
        let sources: String = row.get(3)?;
        let keywords: String = row.get(4)?;
        let status: String = row.get(11)?;
        let source_data: String = row.get(12)?;
        let created_at: String = row.get(13)?;
        let updated_at: String = row.get(14)?;
        Ok(Trend {
            id: row.get(0)?,
            topic: row.get(1)?,
            normalized_topic: row.get(2)?,
            sources: json_list(&sources)?,
            keywords: json_list(&keywords)?,
            score_velocity: row.get(5)?,
            score_commercial: row.get(6)?,
            score_safety: row.get(7)?,
            score_uniqueness: row.get(8)?,
            score_overall: row.get(9)?,
            reasoning: row.get(10)?,
            status: TrendStatus::parse(&status).map_err(conversion_error)?,
            source_data: json_value(&source_data)?,
            created_at: ts_from_sql(&created_at)?,
            updated_at: ts_from_sql(&updated_at)?,
        })
    }

    // ------------------------------------------------------------------
    // Stickers
    // ------------------------------------------------------------------

    pub fn insert_sticker(&self, sticker: &NewSticker) -> Result<String, PipelineError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO stickers (id, trend_id, title, description, image_url,
                thumbnail_url, original_url, size, price, floor_price, pricing_tier,
                moderation_status, fulfillment_provider, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                id,
                sticker.trend_id,
                sticker.title,
                sticker.description,
                sticker.image_url,
                sticker.thumbnail_url,
                sticker.original_url,
                sticker.size.as_str(),
                sticker.price,
                sticker.floor_price,
                sticker.pricing_tier.as_str(),
                ModerationStatus::Pending.as_str(),
                sticker.fulfillment_provider,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(id)
    }

    pub fn sticker_by_id(&self, id: &str) -> Result<Option<Sticker>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!("{} WHERE id = ?1", Self::STICKER_SELECT))?;
        Ok(stmt.query_row(params![id], Self::row_to_sticker).optional()?)
    }

    pub fn sticker_by_listing_id(
        &self,
        listing_id: &str,
    ) -> Result<Option<Sticker>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached(&format!("{} WHERE listing_id = ?1", Self::STICKER_SELECT))?;
        Ok(stmt
            .query_row(params![listing_id], Self::row_to_sticker)
            .optional()?)
    }

    /// All stickers with a marketplace listing, oldest first.
    pub fn published_stickers(&self) -> Result<Vec<Sticker>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE listing_id IS NOT NULL ORDER BY created_at ASC",
            Self::STICKER_SELECT
        ))?;
        let rows = stmt.query_map([], Self::row_to_sticker)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Listings counting toward the active-listings cap.
    pub fn count_active_listings(&self) -> Result<i64, PipelineError> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM stickers
             WHERE listing_id IS NOT NULL AND moderation_status != 'archived'",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn update_sticker_pricing(
        &self,
        id: &str,
        price: f64,
        tier: PricingTier,
        floor_price: f64,
    ) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE stickers SET price = ?1, pricing_tier = ?2, floor_price = ?3 WHERE id = ?4",
            params![price, tier.as_str(), floor_price, id],
        )?;
        Ok(())
    }

    pub fn set_sticker_tier(&self, id: &str, tier: PricingTier) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE stickers SET pricing_tier = ?1 WHERE id = ?2",
            params![tier.as_str(), id],
        )?;
        Ok(())
    }

    /// Terminal archival: both lifecycle fields move together.
    pub fn archive_sticker(&self, id: &str) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE stickers SET moderation_status = 'archived', pricing_tier = 'archived'
             WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn set_sticker_listing(
        &self,
        id: &str,
        listing_id: &str,
        published_at: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE stickers SET listing_id = ?1, published_at = ?2 WHERE id = ?3",
            params![listing_id, ts_to_sql(published_at), id],
        )?;
        Ok(())
    }

    pub fn set_sticker_views(&self, id: &str, views: i64) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE stickers SET view_count = ?1 WHERE id = ?2",
            params![views, id],
        )?;
        Ok(())
    }

    pub fn record_sticker_sale(
        &self,
        id: &str,
        quantity: i64,
        at: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE stickers SET sales_count = sales_count + ?1, last_sale_at = ?2 WHERE id = ?3",
            params![quantity, ts_to_sql(at), id],
        )?;
        Ok(())
    }

    /// Images generated today count against the daily cap.
    pub fn count_stickers_created_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<i64, PipelineError> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM stickers WHERE created_at >= ?1",
            params![ts_to_sql(cutoff)],
            |row| row.get(0),
        )?)
    }

    const STICKER_SELECT: &'static str = "SELECT id, trend_id, title, description, image_url,
        thumbnail_url, original_url, size, price, floor_price, pricing_tier, moderation_status,
        listing_id, published_at, sales_count, view_count, last_sale_at, fulfillment_provider,
        created_at FROM stickers";

    fn row_to_sticker(row: &Row<'_>) -> rusqlite::Result<Sticker> {
        let size: String = row.get(7)?;
        let tier: String = row.get(10)?;
        let moderation: String = row.get(11)?;
        let published_at: Option<String> = row.get(13)?;
        let last_sale_at: Option<String> = row.get(16)?;
        let created_at: String = row.get(18)?;
        Ok(Sticker {
            id: row.get(0)?,
            trend_id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            image_url: row.get(4)?,
            thumbnail_url: row.get(5)?,
            original_url: row.get(6)?,
            size: SizeClass::parse(&size).map_err(conversion_error)?,
            price: row.get(8)?,
            floor_price: row.get(9)?,
            pricing_tier: PricingTier::parse(&tier).map_err(conversion_error)?,
            moderation_status: ModerationStatus::parse(&moderation).map_err(conversion_error)?,
            listing_id: row.get(12)?,
            published_at: opt_ts_from_sql(published_at)?,
            sales_count: row.get(14)?,
            view_count: row.get(15)?,
            last_sale_at: opt_ts_from_sql(last_sale_at)?,
            fulfillment_provider: row.get(17)?,
            created_at: ts_from_sql(&created_at)?,
        })
    }

    // ------------------------------------------------------------------
    // Orders
    // ------------------------------------------------------------------

    pub fn insert_order(&self, order: &NewOrder) -> Result<String, PipelineError> {
        let id = Uuid::new_v4().to_string();
        let customer = order
            .customer_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orders (id, sticker_id, receipt_id, status, quantity, unit_price,
                pricing_tier_at_sale, customer_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                order.sticker_id,
                order.receipt_id,
                order.status.as_str(),
                order.quantity,
                order.unit_price,
                order.pricing_tier_at_sale.map(|t| t.as_str()),
                customer,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(id)
    }

    /// Receipt-level idempotency check for order ingestion.
    pub fn orders_exist_for_receipt(&self, receipt_id: &str) -> Result<bool, PipelineError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE receipt_id = ?1",
            params![receipt_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn orders_by_status(&self, status: OrderStatus) -> Result<Vec<Order>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE status = ?1 ORDER BY created_at ASC",
            Self::ORDER_SELECT
        ))?;
        let rows = stmt.query_map(params![status.as_str()], Self::row_to_order)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Sales-override input: orders for this sticker whose frozen
    /// tier-at-sale equals `tier`.
    pub fn count_orders_at_tier(
        &self,
        sticker_id: &str,
        tier: PricingTier,
    ) -> Result<i64, PipelineError> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE sticker_id = ?1 AND pricing_tier_at_sale = ?2",
            params![sticker_id, tier.as_str()],
            |row| row.get(0),
        )?)
    }

    pub fn update_order_fulfillment(
        &self,
        id: &str,
        status: OrderStatus,
        error: Option<&str>,
    ) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET status = ?1,
                fulfillment_attempts = fulfillment_attempts + 1,
                last_fulfillment_error = ?2
             WHERE id = ?3",
            params![status.as_str(), error, id],
        )?;
        Ok(())
    }

    pub fn mark_order_delivered(
        &self,
        id: &str,
        delivered_at: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET status = 'delivered', delivered_at = ?1 WHERE id = ?2",
            params![ts_to_sql(delivered_at), id],
        )?;
        Ok(())
    }

    /// Delivered orders still carrying customer data, for the PII purge.
    pub fn delivered_orders_with_customer_data(&self) -> Result<Vec<Order>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE status = 'delivered' AND customer_data IS NOT NULL",
            Self::ORDER_SELECT
        ))?;
        let rows = stmt.query_map([], Self::row_to_order)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn clear_customer_data(&self, id: &str) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET customer_data = NULL WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    const ORDER_SELECT: &'static str = "SELECT id, sticker_id, receipt_id, status, quantity,
        unit_price, pricing_tier_at_sale, customer_data, created_at, shipped_at, delivered_at,
        fulfillment_attempts, last_fulfillment_error FROM orders";

    fn row_to_order(row: &Row<'_>) -> rusqlite::Result<Order> {
        let status: String = row.get(3)?;
        let tier: Option<String> = row.get(6)?;
        let customer: Option<String> = row.get(7)?;
        let created_at: String = row.get(8)?;
        let shipped_at: Option<String> = row.get(9)?;
        let delivered_at: Option<String> = row.get(10)?;
        let customer_data = customer
            .as_deref()
            .map(|raw| {
                serde_json::from_str::<CustomerData>(raw).map_err(|err| {
                    conversion_error(PipelineError::Validation(format!("customer_data: {err}")))
                })
            })
            .transpose()?;
        Ok(Order {
            id: row.get(0)?,
            sticker_id: row.get(1)?,
            receipt_id: row.get(2)?,
            status: OrderStatus::parse(&status).map_err(conversion_error)?,
            quantity: row.get(4)?,
            unit_price: row.get(5)?,
            pricing_tier_at_sale: tier
                .as_deref()
                .map(|t| PricingTier::parse(t).map_err(conversion_error))
                .transpose()?,
            customer_data,
            created_at: ts_from_sql(&created_at)?,
            shipped_at: opt_ts_from_sql(shipped_at)?,
            delivered_at: opt_ts_from_sql(delivered_at)?,
            fulfillment_attempts: row.get(11)?,
            last_fulfillment_error: row.get(12)?,
        })
    }

    // ------------------------------------------------------------------
    // Pipeline runs
    // ------------------------------------------------------------------

    pub fn insert_pipeline_run(
        &self,
        id: &str,
        workflow: Workflow,
        started_at: DateTime<Utc>,
        metadata: &serde_json::Value,
    ) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pipeline_runs (id, workflow, status, started_at, metadata)
             VALUES (?1, ?2, 'started', ?3, ?4)",
            params![
                id,
                workflow.as_str(),
                ts_to_sql(started_at),
                serde_json::to_string(metadata)?,
            ],
        )?;
        Ok(())
    }

    /// Move a run to a terminal status. `ended_at` and `duration_seconds`
    /// are always written together here, which keeps the ledger invariant
    /// (`status != started` implies both are set).
    #[allow(clippy::too_many_arguments)]
    pub fn finish_pipeline_run(
        &self,
        id: &str,
        status: RunStatus,
        ended_at: DateTime<Utc>,
        duration_seconds: i64,
        counts: &RunCounts,
        api_calls_used: i64,
        ai_cost_estimate_usd: f64,
        metadata: Option<&serde_json::Value>,
    ) -> Result<(), PipelineError> {
        let metadata = metadata.map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE pipeline_runs SET status = ?1, ended_at = ?2, duration_seconds = ?3,
                trends_found = ?4, stickers_generated = ?5, prices_updated = ?6,
                stickers_archived = ?7, errors_count = ?8, api_calls_used = ?9,
                ai_cost_estimate_usd = ?10,
                metadata = COALESCE(?11, metadata)
             WHERE id = ?12",
            params![
                status.as_str(),
                ts_to_sql(ended_at),
                duration_seconds,
                counts.trends_found,
                counts.stickers_generated,
                counts.prices_updated,
                counts.stickers_archived,
                counts.errors_count,
                api_calls_used,
                ai_cost_estimate_usd,
                metadata,
                id,
            ],
        )?;
        Ok(())
    }

    pub fn pipeline_run_by_id(&self, id: &str) -> Result<Option<PipelineRun>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, workflow, status, started_at, ended_at, duration_seconds,
                trends_found, stickers_generated, prices_updated, stickers_archived,
                errors_count, api_calls_used, ai_cost_estimate_usd, metadata
             FROM pipeline_runs WHERE id = ?1",
        )?;
        Ok(stmt.query_row(params![id], Self::row_to_run).optional()?)
    }

    fn row_to_run(row: &Row<'_>) -> rusqlite::Result<PipelineRun> {
        let status: String = row.get(2)?;
        let started_at: String = row.get(3)?;
        let ended_at: Option<String> = row.get(4)?;
        let metadata: String = row.get(13)?;
        Ok(PipelineRun {
            id: row.get(0)?,
            workflow: row.get(1)?,
            status: RunStatus::parse(&status).map_err(conversion_error)?,
            started_at: ts_from_sql(&started_at)?,
            ended_at: opt_ts_from_sql(ended_at)?,
            duration_seconds: row.get(5)?,
            counts: RunCounts {
                trends_found: row.get(6)?,
                stickers_generated: row.get(7)?,
                prices_updated: row.get(8)?,
                stickers_archived: row.get(9)?,
                errors_count: row.get(10)?,
            },
            api_calls_used: row.get(11)?,
            ai_cost_estimate_usd: row.get(12)?,
            metadata: json_value(&metadata)?,
        })
    }

    /// Sum of `ai_cost_estimate_usd` over runs started in `[from, to)`,
    /// with NULL costs counted as zero.
    pub fn sum_ai_cost_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<f64, PipelineError> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COALESCE(SUM(COALESCE(ai_cost_estimate_usd, 0)), 0)
             FROM pipeline_runs WHERE started_at >= ?1 AND started_at < ?2",
            params![ts_to_sql(from), ts_to_sql(to)],
            |row| row.get(0),
        )?)
    }

    pub fn delete_runs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, PipelineError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM pipeline_runs WHERE started_at < ?1",
            params![ts_to_sql(cutoff)],
        )?;
        debug!(deleted, "pruned pipeline_runs");
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Error ledger
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn insert_error(
        &self,
        workflow: Workflow,
        step: &str,
        error_kind: &str,
        message: &str,
        service: Option<&str>,
        pipeline_run_id: Option<&str>,
        retry_count: i64,
        context: Option<&serde_json::Value>,
    ) -> Result<String, PipelineError> {
        let id = Uuid::new_v4().to_string();
        let context = context.map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO error_log (id, workflow, step, error_kind, message, service,
                pipeline_run_id, retry_count, resolved, context, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10)",
            params![
                id,
                workflow.as_str(),
                step,
                error_kind,
                message,
                service,
                pipeline_run_id,
                retry_count,
                context,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(id)
    }

    pub fn resolve_error(&self, id: &str) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE error_log SET resolved = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Newest-first errors for one workflow.
    pub fn recent_errors(
        &self,
        workflow: Workflow,
        limit: usize,
    ) -> Result<Vec<ErrorEntry>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE workflow = ?1 ORDER BY created_at DESC LIMIT ?2",
            Self::ERROR_SELECT
        ))?;
        let rows = stmt.query_map(params![workflow.as_str(), limit as i64], Self::row_to_error)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Generic error query gated by the typed filter whitelist.
    pub fn errors_filtered(
        &self,
        filters: &[ErrorFilter],
        limit: usize,
    ) -> Result<Vec<ErrorEntry>, PipelineError> {
        let mut sql = Self::ERROR_SELECT.to_string();
        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(filters.len() + 1);
        for (i, filter) in filters.iter().enumerate() {
            let (clause, value) = filter.clause();
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            sql.push_str(clause);
            values.push(value);
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");
        values.push((limit as i64).into());

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), Self::row_to_error)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_errors_before(&self, cutoff: DateTime<Utc>) -> Result<usize, PipelineError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM error_log WHERE created_at < ?1",
            params![ts_to_sql(cutoff)],
        )?;
        debug!(deleted, "pruned error_log");
        Ok(deleted)
    }

    const ERROR_SELECT: &'static str = "SELECT id, workflow, step, error_kind, message, service,
        pipeline_run_id, retry_count, resolved, context, created_at FROM error_log";

    fn row_to_error(row: &Row<'_>) -> rusqlite::Result<ErrorEntry> {
        let resolved: i64 = row.get(8)?;
        let context: Option<String> = row.get(9)?;
        let created_at: String = row.get(10)?;
        Ok(ErrorEntry {
            id: row.get(0)?,
            workflow: row.get(1)?,
            step: row.get(2)?,
            error_kind: row.get(3)?,
            message: row.get(4)?,
            service: row.get(5)?,
            pipeline_run_id: row.get(6)?,
            retry_count: row.get(7)?,
            resolved: resolved != 0,
            context: context.as_deref().map(json_value).transpose()?,
            created_at: ts_from_sql(&created_at)?,
        })
    }

    // ------------------------------------------------------------------
    // Price history
    // ------------------------------------------------------------------

    pub fn insert_price_history(
        &self,
        sticker_id: &str,
        old_price: f64,
        new_price: f64,
        tier: PricingTier,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO price_history (sticker_id, old_price, new_price, pricing_tier,
                reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sticker_id,
                old_price,
                new_price,
                tier.as_str(),
                reason,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn price_history_for(
        &self,
        sticker_id: &str,
    ) -> Result<Vec<PriceHistory>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE sticker_id = ?1 ORDER BY created_at DESC",
            Self::PRICE_HISTORY_SELECT
        ))?;
        let rows = stmt.query_map(params![sticker_id], Self::row_to_price_history)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn price_history_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PriceHistory>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE created_at < ?1 ORDER BY created_at ASC",
            Self::PRICE_HISTORY_SELECT
        ))?;
        let rows = stmt.query_map(params![ts_to_sql(cutoff)], Self::row_to_price_history)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_price_history_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, PipelineError> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM price_history WHERE created_at < ?1",
            params![ts_to_sql(cutoff)],
        )?)
    }

    const PRICE_HISTORY_SELECT: &'static str = "SELECT id, sticker_id, old_price, new_price,
        pricing_tier, reason, created_at FROM price_history";

    fn row_to_price_history(row: &Row<'_>) -> rusqlite::Result<PriceHistory> {
        let tier: String = row.get(4)?;
        let created_at: String = row.get(6)?;
        Ok(PriceHistory {
            id: row.get(0)?,
            sticker_id: row.get(1)?,
            old_price: row.get(2)?,
            new_price: row.get(3)?,
            pricing_tier: PricingTier::parse(&tier).map_err(conversion_error)?,
            reason: row.get(5)?,
            created_at: ts_from_sql(&created_at)?,
        })
    }

    // ------------------------------------------------------------------
    // Pricing configuration
    // ------------------------------------------------------------------

    /// Tier boundary table in scan order; empty when unseeded (callers
    /// fall back to the compiled-in defaults).
    pub fn pricing_tier_rows(&self) -> Result<Vec<TierRow>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT tier, min_trend_age_days, max_trend_age_days,
                price_single_small, price_single_large
             FROM pricing_tiers ORDER BY position ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let tier: String = row.get(0)?;
            Ok(TierRow {
                tier: PricingTier::parse(&tier).map_err(conversion_error)?,
                min_trend_age_days: row.get(1)?,
                max_trend_age_days: row.get(2)?,
                price_single_small: row.get(3)?,
                price_single_large: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn upsert_pricing_tier(&self, position: i64, row: &TierRow) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pricing_tiers (tier, position, min_trend_age_days, max_trend_age_days,
                price_single_small, price_single_large)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(tier) DO UPDATE SET position = ?2, min_trend_age_days = ?3,
                max_trend_age_days = ?4, price_single_small = ?5, price_single_large = ?6",
            params![
                row.tier.as_str(),
                position,
                row.min_trend_age_days,
                row.max_trend_age_days,
                row.price_single_small,
                row.price_single_large,
            ],
        )?;
        Ok(())
    }

    pub fn shipping_rate(
        &self,
        product_type: SizeClass,
        fulfillment_provider: &str,
    ) -> Result<Option<ShippingRate>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT product_type, fulfillment_provider, shipping_cost, packaging_cost
             FROM shipping_rates
             WHERE product_type = ?1 AND fulfillment_provider = ?2 AND is_active = 1",
        )?;
        Ok(stmt
            .query_row(params![product_type.as_str(), fulfillment_provider], |row| {
                let product: String = row.get(0)?;
                Ok(ShippingRate {
                    product_type: SizeClass::parse(&product).map_err(conversion_error)?,
                    fulfillment_provider: row.get(1)?,
                    shipping_cost: row.get(2)?,
                    packaging_cost: row.get(3)?,
                })
            })
            .optional()?)
    }

    pub fn upsert_shipping_rate(&self, rate: &ShippingRate) -> Result<(), PipelineError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO shipping_rates (product_type, fulfillment_provider, shipping_cost,
                packaging_cost, is_active)
             VALUES (?1, ?2, ?3, ?4, 1)
             ON CONFLICT(product_type, fulfillment_provider)
             DO UPDATE SET shipping_cost = ?3, packaging_cost = ?4, is_active = 1",
            params![
                rate.product_type.as_str(),
                rate.fulfillment_provider,
                rate.shipping_cost,
                rate.packaging_cost,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Derived views
    // ------------------------------------------------------------------

    /// Recompute the aggregate row for one UTC day from orders and
    /// stickers. The analytics sync calls this once per run.
    pub fn refresh_daily_metrics(&self, day: &str) -> Result<DailyMetrics, PipelineError> {
        let conn = self.conn.lock();
        let (orders, units, gross_revenue): (i64, i64, f64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(quantity), 0),
                COALESCE(SUM(quantity * unit_price), 0)
             FROM orders WHERE substr(created_at, 1, 10) = ?1 AND status != 'refunded'",
            params![day],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let new_listings: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stickers WHERE substr(published_at, 1, 10) = ?1",
            params![day],
            |row| row.get(0),
        )?;
        let metrics = DailyMetrics {
            orders,
            units,
            gross_revenue,
            new_listings,
        };
        conn.execute(
            "INSERT INTO daily_metrics (day, orders, units, gross_revenue, new_listings,
                refreshed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(day) DO UPDATE SET orders = ?2, units = ?3, gross_revenue = ?4,
                new_listings = ?5, refreshed_at = ?6",
            params![
                day,
                metrics.orders,
                metrics.units,
                metrics.gross_revenue,
                metrics.new_listings,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(metrics)
    }

    pub fn daily_metrics(&self, day: &str) -> Result<Option<DailyMetrics>, PipelineError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT orders, units, gross_revenue, new_listings
                 FROM daily_metrics WHERE day = ?1",
                params![day],
                |row| {
                    Ok(DailyMetrics {
                        orders: row.get(0)?,
                        units: row.get(1)?,
                        gross_revenue: row.get(2)?,
                        new_listings: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }
}
