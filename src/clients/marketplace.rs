//! Marketplace API client.
//!
//! Narrow surface: create/reprice/deactivate listings and read receipts.
//! Every call is wrapped by the resilience layer at the call site and
//! counted against the daily API budget by the orchestrators.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{http_error, PipelineError};
use crate::models::CustomerData;

/// A new listing to publish.
#[derive(Debug, Clone)]
pub struct ListingDraft {
    pub title: String,
    pub description: String,
    pub price: f64,
    pub image_url: String,
    pub tags: Vec<String>,
}

/// One purchased line inside a receipt.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiptLine {
    pub listing_id: String,
    pub quantity: i64,
    pub unit_price: f64,
    #[serde(default)]
    pub title: String,
}

/// A marketplace receipt (one checkout, possibly several lines).
#[derive(Debug, Clone, Deserialize)]
pub struct Receipt {
    pub receipt_id: String,
    pub lines: Vec<ReceiptLine>,
    #[serde(default)]
    pub buyer: Option<CustomerData>,
}

/// Per-listing stats used by the analytics sync.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingStats {
    pub views: i64,
}

#[async_trait]
pub trait Marketplace: Send + Sync {
    async fn create_listing(&self, draft: &ListingDraft) -> Result<String, PipelineError>;
    async fn update_price(&self, listing_id: &str, price: f64) -> Result<(), PipelineError>;
    async fn deactivate(&self, listing_id: &str) -> Result<(), PipelineError>;
    async fn list_receipts(&self) -> Result<Vec<Receipt>, PipelineError>;
    async fn listing_stats(&self, listing_id: &str) -> Result<ListingStats, PipelineError>;
}

pub struct MarketplaceClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    shop_id: String,
}

impl MarketplaceClient {
    pub fn new(base_url: String, api_key: String, shop_id: String) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| PipelineError::api("marketplace", err))?;
        Ok(Self {
            client,
            base_url,
            api_key,
            shop_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, PipelineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            reqwest::StatusCode::TOO_MANY_REQUESTS => PipelineError::RateLimit {
                service: "marketplace".to_string(),
                message: body,
            },
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                PipelineError::Auth {
                    service: "marketplace".to_string(),
                    message: body,
                }
            }
            _ => PipelineError::api("marketplace", format!("{status}: {body}")),
        })
    }
}

#[async_trait]
impl Marketplace for MarketplaceClient {
    async fn create_listing(&self, draft: &ListingDraft) -> Result<String, PipelineError> {
        #[derive(Deserialize)]
        struct Created {
            listing_id: String,
        }

        let url = self.url(&format!("/shops/{}/listings", self.shop_id));
        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .json(&json!({
                "title": draft.title,
                "description": draft.description,
                "price": draft.price,
                "image_url": draft.image_url,
                "tags": draft.tags,
            }))
            .send()
            .await
            .map_err(|err| http_error("marketplace", err))?;
        let created: Created = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|err| http_error("marketplace", err))?;
        Ok(created.listing_id)
    }

    async fn update_price(&self, listing_id: &str, price: f64) -> Result<(), PipelineError> {
        let url = self.url(&format!("/listings/{listing_id}/price"));
        let response = self
            .client
            .put(url)
            .header("x-api-key", &self.api_key)
            .json(&json!({ "price": price }))
            .send()
            .await
            .map_err(|err| http_error("marketplace", err))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn deactivate(&self, listing_id: &str) -> Result<(), PipelineError> {
        let url = self.url(&format!("/listings/{listing_id}/deactivate"));
        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|err| http_error("marketplace", err))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn list_receipts(&self) -> Result<Vec<Receipt>, PipelineError> {
        #[derive(Deserialize)]
        struct Receipts {
            results: Vec<Receipt>,
        }

        let url = self.url(&format!("/shops/{}/receipts", self.shop_id));
        let response = self
            .client
            .get(url)
            .query(&[("was_paid", "true"), ("limit", "100")])
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|err| http_error("marketplace", err))?;
        let receipts: Receipts = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|err| http_error("marketplace", err))?;
        Ok(receipts.results)
    }

    async fn listing_stats(&self, listing_id: &str) -> Result<ListingStats, PipelineError> {
        let url = self.url(&format!("/listings/{listing_id}"));
        let response = self
            .client
            .get(url)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|err| http_error("marketplace", err))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|err| http_error("marketplace", err))
    }
}
