//! Image generation provider client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{http_error, PipelineError};

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// Generate a square image for `prompt` at `size` pixels.
    async fn generate(&self, prompt: &str, size: u32) -> Result<Vec<u8>, PipelineError>;
}

pub struct HttpImageGenerator {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    model_id: String,
}

impl HttpImageGenerator {
    pub fn new(api_token: String, model_id: String) -> Result<Self, PipelineError> {
        // Generation can queue; allow a longer deadline than plain reads.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| PipelineError::api("image_gen", err))?;
        Ok(Self {
            client,
            base_url: "https://api.replicate.com/v1".to_string(),
            api_token,
            model_id,
        })
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(&self, prompt: &str, size: u32) -> Result<Vec<u8>, PipelineError> {
        #[derive(Deserialize)]
        struct Prediction {
            #[serde(default)]
            output: Vec<String>,
            status: String,
        }

        let response = self
            .client
            .post(format!("{}/predictions", self.base_url))
            .bearer_auth(&self.api_token)
            .header("Prefer", "wait")
            .json(&json!({
                "model": self.model_id,
                "input": {
                    "prompt": prompt,
                    "width": size,
                    "height": size,
                },
            }))
            .send()
            .await
            .map_err(|err| http_error("image_gen", err))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::api("image_gen", format!("{status}: {body}")));
        }

        let prediction: Prediction = response
            .json()
            .await
            .map_err(|err| http_error("image_gen", err))?;
        if prediction.status != "succeeded" {
            return Err(PipelineError::api(
                "image_gen",
                format!("prediction status {}", prediction.status),
            ));
        }
        let image_url = prediction
            .output
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Validation("prediction without output".to_string()))?;

        let image = self
            .client
            .get(&image_url)
            .send()
            .await
            .map_err(|err| http_error("image_gen", err))?
            .bytes()
            .await
            .map_err(|err| http_error("image_gen", err))?;
        Ok(image.to_vec())
    }
}
