// ===============================
// src/lib.rs
// ===============================
pub mod book;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod feed;
pub mod health;
pub mod metrics;
pub mod positions;
pub mod recorder;
pub mod relay;
pub mod retry;
pub mod sma;
pub mod store;
pub mod strategy;
