//! Object store client for sticker artifacts and cold archives.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{http_error, PipelineError};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload bytes and return the public URL.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, PipelineError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, PipelineError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, PipelineError>;

    async fn delete(&self, key: &str) -> Result<(), PipelineError>;
}

/// Bucket reached over its pre-authorized HTTP gateway.
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    access_key: String,
    public_url: String,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: String,
        bucket: String,
        access_key: String,
        public_url: String,
    ) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| PipelineError::api("object_store", err))?;
        Ok(Self {
            client,
            endpoint,
            bucket,
            access_key,
            public_url,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, PipelineError> {
        let response = self
            .client
            .put(self.object_url(key))
            .bearer_auth(&self.access_key)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|err| http_error("object_store", err))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(PipelineError::api("object_store", format!("put {status}")));
        }
        Ok(if self.public_url.is_empty() {
            self.object_url(key)
        } else {
            format!("{}/{}", self.public_url, key)
        })
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, PipelineError> {
        let response = self
            .client
            .get(self.object_url(key))
            .bearer_auth(&self.access_key)
            .send()
            .await
            .map_err(|err| http_error("object_store", err))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(PipelineError::api("object_store", format!("get {status}")));
        }
        Ok(response
            .bytes()
            .await
            .map_err(|err| http_error("object_store", err))?
            .to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, PipelineError> {
        #[derive(serde::Deserialize)]
        struct Listing {
            keys: Vec<String>,
        }

        let response = self
            .client
            .get(format!("{}/{}", self.endpoint, self.bucket))
            .query(&[("prefix", prefix)])
            .bearer_auth(&self.access_key)
            .send()
            .await
            .map_err(|err| http_error("object_store", err))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(PipelineError::api("object_store", format!("list {status}")));
        }
        let listing: Listing = response
            .json()
            .await
            .map_err(|err| http_error("object_store", err))?;
        Ok(listing.keys)
    }

    async fn delete(&self, key: &str) -> Result<(), PipelineError> {
        let response = self
            .client
            .delete(self.object_url(key))
            .bearer_auth(&self.access_key)
            .send()
            .await
            .map_err(|err| http_error("object_store", err))?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(PipelineError::api(
                "object_store",
                format!("delete {status}"),
            ));
        }
        Ok(())
    }
}
