//! Outbound API clients.
//!
//! Each external service gets a narrow trait and one thin HTTP
//! implementation. Orchestrators hold `Arc<dyn …>` handles and wrap
//! every call with the resilience layer; nothing in here retries on its
//! own.

pub mod fulfillment;
pub mod image_gen;
pub mod llm;
pub mod marketplace;
pub mod object_store;

pub use fulfillment::{FulfillmentProvider, HttpFulfillmentClient};
pub use image_gen::{HttpImageGenerator, ImageGenerator};
pub use llm::{BatchScoreResponse, HttpLlmClient, LlmClient, Moderation, TopicScore};
pub use marketplace::{
    ListingDraft, ListingStats, Marketplace, MarketplaceClient, Receipt, ReceiptLine,
};
pub use object_store::{HttpObjectStore, ObjectStore};
