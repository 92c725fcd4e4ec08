//! Common infrastructure shared by the qkme crates
//!
//! This crate provides:
//! - `env_logger` bootstrap with secure handling of identifiers
//! - Retry policies with exponential backoff and jitter

#![forbid(unsafe_code)]

pub mod logging;
pub mod retry;

pub use logging::LoggingTransformer;
pub use retry::{retry_with_policy, RetryPolicy, Retryable};
