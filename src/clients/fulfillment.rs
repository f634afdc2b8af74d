//! Fulfillment provider client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{http_error, PipelineError};
use crate::models::{CustomerData, SizeClass};

#[async_trait]
pub trait FulfillmentProvider: Send + Sync {
    /// Submit a print-and-ship job; returns the provider's job id.
    async fn submit(
        &self,
        image_url: &str,
        address: &CustomerData,
        size: SizeClass,
        quantity: i64,
    ) -> Result<String, PipelineError>;

    async fn status(&self, job_id: &str) -> Result<String, PipelineError>;

    async fn tracking(&self, job_id: &str) -> Result<Option<String>, PipelineError>;
}

pub struct HttpFulfillmentClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpFulfillmentClient {
    pub fn new(base_url: String, api_key: String) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| PipelineError::api("fulfillment", err))?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }
}

#[derive(Deserialize)]
struct Job {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    tracking_number: Option<String>,
}

#[async_trait]
impl FulfillmentProvider for HttpFulfillmentClient {
    async fn submit(
        &self,
        image_url: &str,
        address: &CustomerData,
        size: SizeClass,
        quantity: i64,
    ) -> Result<String, PipelineError> {
        let response = self
            .client
            .post(format!("{}/orders", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "image_url": image_url,
                "size": size.as_str(),
                "quantity": quantity,
                "ship_to": address,
            }))
            .send()
            .await
            .map_err(|err| http_error("fulfillment", err))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::api(
                "fulfillment",
                format!("submit {status}: {body}"),
            ));
        }
        let job: Job = response
            .json()
            .await
            .map_err(|err| http_error("fulfillment", err))?;
        Ok(job.id)
    }

    async fn status(&self, job_id: &str) -> Result<String, PipelineError> {
        let response = self
            .client
            .get(format!("{}/orders/{job_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| http_error("fulfillment", err))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(PipelineError::api("fulfillment", format!("status {status}")));
        }
        let job: Job = response
            .json()
            .await
            .map_err(|err| http_error("fulfillment", err))?;
        Ok(job.status)
    }

    async fn tracking(&self, job_id: &str) -> Result<Option<String>, PipelineError> {
        let response = self
            .client
            .get(format!("{}/orders/{job_id}/tracking", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| http_error("fulfillment", err))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(PipelineError::api(
                "fulfillment",
                format!("tracking {status}"),
            ));
        }
        let job: Job = response
            .json()
            .await
            .map_err(|err| http_error("fulfillment", err))?;
        Ok(job.tracking_number)
    }
}
