//! mcpgate shared types and utilities
//!
//! This crate contains types, errors, and utilities shared across the mcpgate
//! gateway: the SQLite pool, the embedded TTL key-value cache, the fixed-window
//! rate limiter, and the row/domain types used by the API and market crates.

pub mod db;
pub mod error;
pub mod kv;
pub mod rate_limit;
pub mod types;

pub use db::*;
pub use error::*;
pub use kv::Kv;
pub use rate_limit::{RateLimitConfig, RateLimitDecision};
pub use types::*;
