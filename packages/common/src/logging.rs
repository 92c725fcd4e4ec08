//! Structured logging infrastructure
//!
//! Provides env_logger-based logging with secure handling of identifiers
//! and proper integration with the standard log crate. Key material must
//! never reach these helpers; SAE identifiers are hashed before logging.

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::sync::Once;
use std::time::Duration;

static INIT_LOGGER: Once = Once::new();

/// Logging infrastructure using `env_logger`
pub struct LoggingTransformer;

impl LoggingTransformer {
    /// Initialize logging system (should be called once at application startup)
    ///
    /// Configure logging levels via `RUST_LOG` environment variable:
    /// - `RUST_LOG=info` - Enable info and above (recommended for production)
    /// - `RUST_LOG=qkme=debug,qkme_store=info` - Module-specific levels
    pub fn init() {
        INIT_LOGGER.call_once(|| {
            env_logger::Builder::from_default_env()
                .format_timestamp_micros()
                .init();

            info!("Structured logging initialized");
        });
    }

    /// Initialize logging for test environments
    ///
    /// Use this in test modules to avoid initialization conflicts
    pub fn init_test() {
        let _ = env_logger::Builder::from_default_env()
            .is_test(true)
            .try_init();
    }

    /// Log server startup events
    pub fn log_server_startup(protocol: &str, addr: &str) {
        info!("{protocol} server listening on {addr}");
    }

    /// Log secret store operations
    ///
    /// Store paths are not secret, but the outcome is logged at a level
    /// matching its severity.
    pub fn log_store_operation(operation: &str, path: &str, success: bool) {
        if success {
            debug!("Store operation succeeded: {operation} ({path})");
        } else {
            warn!("Store operation failed: {operation} ({path})");
        }
    }

    /// Log a key issuance without exposing key bytes or raw SAE identifiers
    pub fn log_key_issue(key_count: usize, key_bytes: usize, master_sae: &str, slave_sae: &str) {
        info!(
            "Issued {key_count} key(s) of {key_bytes} bytes (master_hash: {}, slave_hash: {})",
            Self::secure_hash(master_sae),
            Self::secure_hash(slave_sae)
        );
    }

    /// Log a key retrieval without exposing key bytes or raw SAE identifiers
    pub fn log_key_retrieval(key_count: usize, master_sae: &str, slave_sae: &str) {
        info!(
            "Retrieved {key_count} key(s) by id (master_hash: {}, slave_hash: {})",
            Self::secure_hash(master_sae),
            Self::secure_hash(slave_sae)
        );
    }

    /// Log authorization failures securely
    ///
    /// Requester identifiers are hashed for privacy while maintaining traceability
    pub fn log_auth_failure(event: &str, requester: &str) {
        warn!(
            "Authorization failed: {event} (requester_hash: {})",
            Self::secure_hash(requester)
        );
    }

    /// Log performance metrics and timing information
    pub fn log_performance_metric(operation: &str, duration_ms: u64, success: bool) {
        if success {
            debug!("Performance: {operation} completed in {duration_ms}ms");
        } else {
            warn!("Performance: {operation} failed after {duration_ms}ms");
        }
    }

    /// Log network operations with connection details
    pub fn log_network_operation(operation: &str, remote_addr: &str, timeout: Option<Duration>) {
        match timeout {
            Some(timeout) => debug!("Network: {operation} to {remote_addr} (timeout: {timeout:?})"),
            None => debug!("Network: {operation} to {remote_addr}"),
        }
    }

    /// Render bytes for logs, honoring the operator's show-secrets switch
    pub fn redact(bytes: &[u8], show_secrets: bool) -> String {
        if show_secrets {
            format!("{bytes:02x?}")
        } else {
            format!("<{} bytes redacted>", bytes.len())
        }
    }

    /// Cryptographically secure identifier hashing for logging
    ///
    /// Returns `#` followed by the first 12 hex characters of the SHA-256 digest.
    pub fn secure_hash(value: &str) -> String {
        let hash = Sha256::digest(value.as_bytes());
        let hex_hash = format!("{hash:x}");
        format!("#{}", &hex_hash[..12])
    }
}
