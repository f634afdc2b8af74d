//! Trendmark backend: autonomous sticker-shop pipeline.
//!
//! Four scheduled workflows (trend monitor, sticker generator, pricing
//! engine, analytics sync) cooperate through a relational store and an
//! ephemeral coordination store, governed by a daily API budget, AI
//! spend caps, per-workflow leader locks, and per-service circuit
//! breakers.

pub mod analytics;
pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod limiter;
pub mod models;
pub mod monitoring;
pub mod pricing;
pub mod resilience;
pub mod stickers;
pub mod trends;
