//! Node configuration
//!
//! Layered with `figment`, lowest to highest precedence:
//! 1. Compiled defaults
//! 2. TOML config file
//! 3. Environment variables (`QKME_` prefix, `__` separates nesting,
//!    e.g. `QKME_STORE__ADDRESS` -> `store.address`)
//!
//! The loaded [`KmeConfig`] is passed explicitly to every component.

use crate::error::{KmeError, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use log::debug;
use once_cell::sync::Lazy;
use qkme_common::RetryPolicy;
use qkme_store::VaultKvConfig;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "QKME_";

static ENTITY_ID: Lazy<Result<Regex>> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9.\-_]*[A-Za-z0-9])?$")
        .map_err(|e| KmeError::Configuration(format!("invalid entity id pattern: {e}")))
});

/// Minimum length of a SAE or KME identifier
pub const MIN_ENTITY_ID_LEN: usize = 3;
/// Maximum length of a SAE or KME identifier
pub const MAX_ENTITY_ID_LEN: usize = 32;

/// Check a SAE or KME identifier: 3 to 32 characters, hostname-like
pub fn validate_entity_id(kind: &str, id: &str) -> Result<()> {
    let pattern = ENTITY_ID
        .as_ref()
        .map_err(|e| KmeError::Configuration(e.to_string()))?;
    if !(MIN_ENTITY_ID_LEN..=MAX_ENTITY_ID_LEN).contains(&id.len()) || !pattern.is_match(id) {
        return Err(KmeError::InvalidRequest(format!(
            "{kind} '{id}' must be {MIN_ENTITY_ID_LEN}-{MAX_ENTITY_ID_LEN} hostname characters"
        )));
    }
    Ok(())
}

/// Complete node configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KmeConfig {
    /// Identifier of this KME
    #[serde(default = "default_local_kme_id")]
    pub local_kme_id: String,
    /// Identifier of the peer KME
    #[serde(default = "default_remote_kme_id")]
    pub remote_kme_id: String,
    /// Channel direction this node issues keys from
    #[serde(default = "default_issue_channel")]
    pub issue_channel: String,
    /// Log key bytes in debug output (never enable in production)
    #[serde(default)]
    pub show_secrets: bool,
    /// Secret store connection and layout
    #[serde(default)]
    pub store: StoreSettings,
    /// Epoch integrity checking
    #[serde(default)]
    pub digest: DigestSettings,
    /// Claim/release tuning
    #[serde(default)]
    pub allocator: AllocatorSettings,
    /// Request limits
    #[serde(default)]
    pub keys: KeyLimits,
    /// Peer KME for ledger replication; standalone when absent
    #[serde(default)]
    pub peer: Option<PeerSettings>,
    /// Peer-facing HTTP listener
    #[serde(default)]
    pub server: ServerSettings,
}

/// Which secret store backend to use
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// KV v2 secrets engine over HTTPS
    Vault,
    /// In-process map, for development only
    Memory,
}

/// Secret store connection and path layout
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Backend selection
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// Base address of the store
    #[serde(default = "default_store_address")]
    pub address: String,
    /// KV mount holding all key material
    #[serde(default = "default_mount")]
    pub mount: String,
    /// Key distribution endpoint identifier, the first path segment
    #[serde(default = "default_qkde_id")]
    pub qkde_id: String,
    /// Folder holding ledger entries
    #[serde(default = "default_ledger_id")]
    pub ledger_id: String,
    /// Static token; certificate login is used when absent
    #[serde(default, skip_serializing, deserialize_with = "deserialize_optional_secret")]
    pub token: Option<SecretString>,
    /// Certificate auth mount
    #[serde(default = "default_cert_auth_mount")]
    pub cert_auth_mount: String,
    /// Trusted CA bundle
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    /// Client private key
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Connectivity backoff
    #[serde(default)]
    pub retry: RetrySettings,
}

/// Exponential backoff for connectivity failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts
    #[serde(default = "default_conn_attempts")]
    pub max_attempts: u32,
    /// First delay in milliseconds, doubled per attempt
    #[serde(default = "default_backoff_factor_ms")]
    pub backoff_factor_ms: u64,
    /// Delay cap in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

/// Epoch integrity checking
#[derive(Clone, Serialize, Deserialize)]
pub struct DigestSettings {
    /// HMAC key shared with the producer
    #[serde(default = "empty_secret", skip_serializing, deserialize_with = "deserialize_secret")]
    pub key: SecretString,
    /// Verify digests when epochs are read
    #[serde(default = "default_true")]
    pub compare: bool,
    /// Include the locally cached digest in the comparison
    #[serde(default = "default_true")]
    pub compare_to_cache: bool,
    /// Directory of cached digests; kept in memory when absent
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl std::fmt::Debug for DigestSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestSettings")
            .field("key", &"<redacted>")
            .field("compare", &self.compare)
            .field("compare_to_cache", &self.compare_to_cache)
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

/// Claim/release tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocatorSettings {
    /// Attempts for a read-modify-CAS cycle before giving up
    #[serde(default = "default_cas_attempts")]
    pub cas_max_attempts: u32,
    /// Attempts while the needed epochs are reserved by others
    #[serde(default = "default_reserve_attempts")]
    pub max_reserve_attempts: u32,
    /// Fixed sleep between those attempts, in milliseconds
    #[serde(default = "default_reserve_sleep_ms")]
    pub reserve_sleep_ms: u64,
    /// Lease length of a reservation in seconds
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

/// Request limits
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyLimits {
    /// Size reported by `status` and used when callers omit a size
    #[serde(default = "default_key_size_bits")]
    pub default_key_size_bits: u32,
    /// Smallest key a caller may request
    #[serde(default = "default_min_key_size_bits")]
    pub min_key_size_bits: u32,
    /// Largest key a caller may request
    #[serde(default = "default_max_key_size_bits")]
    pub max_key_size_bits: u32,
    /// Most keys per request
    #[serde(default = "default_max_keys_per_request")]
    pub max_keys_per_request: u32,
}

/// Peer KME endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerSettings {
    /// Base URL of the peer, e.g. `https://kme2:8443`
    pub url: String,
    /// Trusted CA bundle for the peer's certificate
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate presented to the peer
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    /// Client private key
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    /// Bound on one replication round trip, in milliseconds
    #[serde(default = "default_peer_timeout_ms")]
    pub timeout_ms: u64,
    /// Backoff while the peer is unreachable
    #[serde(default = "default_peer_retry")]
    pub retry: RetrySettings,
}

/// Peer-facing HTTP listener
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Concurrent replication requests before answering 503
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Request body limit in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    /// Certificates for mutually authenticated HTTPS
    #[serde(default)]
    pub tls: Option<ServerTlsSettings>,
    /// Serve plain HTTP and trust the sender id in the path (development only)
    #[serde(default)]
    pub allow_plaintext: bool,
}

/// Listener certificates
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerTlsSettings {
    /// PEM certificate chain presented to the peer
    pub cert_path: PathBuf,
    /// PEM private key of that certificate
    pub key_path: PathBuf,
    /// PEM bundle of CAs that issue peer client certificates
    pub client_ca_path: PathBuf,
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

fn deserialize_optional_secret<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(|token| token.map(SecretString::from))
}

fn default_local_kme_id() -> String {
    "kme1".to_string()
}

fn default_remote_kme_id() -> String {
    "kme2".to_string()
}

fn default_issue_channel() -> String {
    "masterslave".to_string()
}

fn default_backend() -> StoreBackend {
    StoreBackend::Vault
}

fn default_store_address() -> String {
    "https://127.0.0.1:8200".to_string()
}

fn default_mount() -> String {
    "QKEYS".to_string()
}

fn default_qkde_id() -> String {
    "QKDE0001".to_string()
}

fn default_ledger_id() -> String {
    "LEDGER".to_string()
}

fn default_cert_auth_mount() -> String {
    "cert".to_string()
}

fn default_store_timeout_ms() -> u64 {
    10_000
}

fn default_conn_attempts() -> u32 {
    10
}

fn default_backoff_factor_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    64_000
}

fn default_true() -> bool {
    true
}

fn default_cas_attempts() -> u32 {
    64
}

fn default_reserve_attempts() -> u32 {
    10
}

fn default_reserve_sleep_ms() -> u64 {
    50
}

fn default_lease_ttl_secs() -> u64 {
    300
}

fn default_key_size_bits() -> u32 {
    32
}

fn default_min_key_size_bits() -> u32 {
    8
}

fn default_max_key_size_bits() -> u32 {
    80_000
}

fn default_max_keys_per_request() -> u32 {
    100
}

fn default_peer_timeout_ms() -> u64 {
    5_000
}

fn default_peer_retry() -> RetrySettings {
    RetrySettings {
        max_attempts: 3,
        backoff_factor_ms: 200,
        backoff_max_ms: 2_000,
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_max_concurrent_requests() -> usize {
    16
}

fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for KmeConfig {
    fn default() -> Self {
        Self {
            local_kme_id: default_local_kme_id(),
            remote_kme_id: default_remote_kme_id(),
            issue_channel: default_issue_channel(),
            show_secrets: false,
            store: StoreSettings::default(),
            digest: DigestSettings::default(),
            allocator: AllocatorSettings::default(),
            keys: KeyLimits::default(),
            peer: None,
            server: ServerSettings::default(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            address: default_store_address(),
            mount: default_mount(),
            qkde_id: default_qkde_id(),
            ledger_id: default_ledger_id(),
            token: None,
            cert_auth_mount: default_cert_auth_mount(),
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            request_timeout_ms: default_store_timeout_ms(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_conn_attempts(),
            backoff_factor_ms: default_backoff_factor_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for DigestSettings {
    fn default() -> Self {
        Self {
            key: empty_secret(),
            compare: true,
            compare_to_cache: true,
            cache_dir: None,
        }
    }
}

impl Default for AllocatorSettings {
    fn default() -> Self {
        Self {
            cas_max_attempts: default_cas_attempts(),
            max_reserve_attempts: default_reserve_attempts(),
            reserve_sleep_ms: default_reserve_sleep_ms(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

impl Default for KeyLimits {
    fn default() -> Self {
        Self {
            default_key_size_bits: default_key_size_bits(),
            min_key_size_bits: default_min_key_size_bits(),
            max_key_size_bits: default_max_key_size_bits(),
            max_keys_per_request: default_max_keys_per_request(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_concurrent_requests: default_max_concurrent_requests(),
            body_limit_bytes: default_body_limit(),
            tls: None,
            allow_plaintext: false,
        }
    }
}

impl RetrySettings {
    /// Backoff policy for these settings
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_attempts,
            Duration::from_millis(self.backoff_factor_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

impl AllocatorSettings {
    /// Sleep between attempts while epochs are reserved by others
    pub fn reserve_sleep(&self) -> Duration {
        Duration::from_millis(self.reserve_sleep_ms)
    }

    /// Lease length of a reservation
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

impl KeyLimits {
    /// Smallest key in bytes
    pub fn min_key_bytes(&self) -> u64 {
        u64::from(self.min_key_size_bits / 8)
    }

    /// Largest key in bytes
    pub fn max_key_bytes(&self) -> u64 {
        u64::from(self.max_key_size_bits / 8)
    }

    /// Default key size in bytes
    pub fn default_key_bytes(&self) -> u64 {
        u64::from(self.default_key_size_bits / 8)
    }
}

impl StoreSettings {
    /// Client settings for [`qkme_store::VaultKvStore`]
    pub fn vault_kv_config(&self) -> VaultKvConfig {
        VaultKvConfig {
            address: self.address.clone(),
            mount: self.mount.clone(),
            token: self.token.clone(),
            cert_auth_mount: self.cert_auth_mount.clone(),
            ca_cert_path: self.ca_cert_path.clone(),
            client_cert_path: self.client_cert_path.clone(),
            client_key_path: self.client_key_path.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            retry: self.retry.policy(),
        }
    }
}

impl PeerSettings {
    /// Replication endpoint on the peer for ledgers sent by `local_kme_id`
    pub fn ledger_url(&self, local_kme_id: &str) -> String {
        format!(
            "{}/api/v1/ledger/{}/key_ids",
            self.url.trim_end_matches('/'),
            local_kme_id
        )
    }

    /// Bound on one replication round trip
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl KmeConfig {
    /// Load defaults, then the TOML file (when given), then `QKME_*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(KmeConfig::default()));
        if let Some(path) = path {
            debug!("Loading configuration from {}", path.display());
            figment = figment.merge(Toml::file(path));
        }
        let config: KmeConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| KmeError::Configuration(format!("config extraction failed: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the node cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(KmeError::Configuration(msg));

        validate_entity_id("local KME id", &self.local_kme_id)
            .map_err(|e| KmeError::Configuration(e.to_string()))?;
        validate_entity_id("remote KME id", &self.remote_kme_id)
            .map_err(|e| KmeError::Configuration(e.to_string()))?;

        for (name, value) in [
            ("issue_channel", &self.issue_channel),
            ("store.qkde_id", &self.store.qkde_id),
            ("store.ledger_id", &self.store.ledger_id),
        ] {
            if value.is_empty() || value.contains('/') {
                return invalid(format!("{name} must be a non-empty path segment"));
            }
        }

        let keys = &self.keys;
        for (name, bits) in [
            ("default_key_size_bits", keys.default_key_size_bits),
            ("min_key_size_bits", keys.min_key_size_bits),
            ("max_key_size_bits", keys.max_key_size_bits),
        ] {
            if bits == 0 || bits % 8 != 0 {
                return invalid(format!("keys.{name} must be a positive multiple of 8"));
            }
        }
        if keys.min_key_size_bits > keys.default_key_size_bits
            || keys.default_key_size_bits > keys.max_key_size_bits
        {
            return invalid("keys: require min <= default <= max key size".to_string());
        }
        if keys.max_keys_per_request == 0 {
            return invalid("keys.max_keys_per_request must be at least 1".to_string());
        }

        if self.digest.compare && self.digest.key.expose_secret().is_empty() {
            return invalid("digest.key is required when digest.compare is enabled".to_string());
        }
        if self.allocator.cas_max_attempts == 0 || self.allocator.max_reserve_attempts == 0 {
            return invalid("allocator attempt budgets must be at least 1".to_string());
        }
        if self.allocator.lease_ttl_secs == 0 {
            return invalid("allocator.lease_ttl_secs must be at least 1".to_string());
        }
        if self.server.max_concurrent_requests == 0 {
            return invalid("server.max_concurrent_requests must be at least 1".to_string());
        }
        Ok(())
    }
}
