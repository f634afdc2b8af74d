//! Sticker generation workflow.

pub mod generator;

pub use generator::{AssetChain, DefaultAssetChain, GenerationOutcome, StickerGenerator};
