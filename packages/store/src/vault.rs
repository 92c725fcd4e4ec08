//! Client for a KV version 2 secrets engine
//!
//! Documents live under one mount. Reads and writes go through
//! `/v1/{mount}/data/{path}` (writes carry `options.cas`), while versions,
//! deletion and listing go through `/v1/{mount}/metadata/{path}`. The client
//! authenticates with a static token or by TLS certificate login, and retries
//! connectivity failures with exponential backoff.

use crate::error::{StoreError, StoreResult};
use crate::request::StoreRequest;
use crate::traits::{Fields, SecretStore, Versioned, ABSENT_VERSION};
use log::{debug, info, warn};
use qkme_common::{retry_with_policy, LoggingTransformer, RetryPolicy};
use reqwest::{Certificate, Client, Identity, Method, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const TOKEN_HEADER: &str = "X-Vault-Token";
const CAS_MISMATCH: &str = "check-and-set parameter did not match";

/// Connection settings for [`VaultKvStore`]
#[derive(Debug)]
pub struct VaultKvConfig {
    /// Base address, e.g. `https://127.0.0.1:8200`
    pub address: String,
    /// KV v2 mount name
    pub mount: String,
    /// Static token; when absent, certificate login is used
    pub token: Option<SecretString>,
    /// Certificate auth mount used for login
    pub cert_auth_mount: String,
    /// PEM bundle of trusted server CAs
    pub ca_cert_path: Option<PathBuf>,
    /// PEM client certificate
    pub client_cert_path: Option<PathBuf>,
    /// PEM client private key
    pub client_key_path: Option<PathBuf>,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Backoff for connectivity failures
    pub retry: RetryPolicy,
}

impl Default for VaultKvConfig {
    fn default() -> Self {
        Self {
            address: "https://127.0.0.1:8200".to_string(),
            mount: "QKEYS".to_string(),
            token: None,
            cert_auth_mount: "cert".to_string(),
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Deserialize)]
struct ReadResponse {
    data: ReadData,
}

#[derive(Deserialize)]
struct ReadData {
    #[serde(default)]
    data: Option<Fields>,
    metadata: WriteMetadata,
}

#[derive(Deserialize)]
struct WriteResponse {
    data: WriteMetadata,
}

#[derive(Deserialize)]
struct WriteMetadata {
    version: u64,
}

#[derive(Deserialize)]
struct MetadataResponse {
    data: MetadataData,
}

#[derive(Deserialize)]
struct MetadataData {
    current_version: u64,
}

#[derive(Deserialize)]
struct ListResponse {
    data: ListData,
}

#[derive(Deserialize)]
struct ListData {
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
}

struct VaultInner {
    client: Client,
    config: VaultKvConfig,
    static_token: bool,
    token: RwLock<Option<SecretString>>,
}

/// [`SecretStore`] backed by a KV v2 secrets engine
#[derive(Clone)]
pub struct VaultKvStore {
    inner: Arc<VaultInner>,
}

impl std::fmt::Debug for VaultKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKvStore")
            .field("address", &self.inner.config.address)
            .field("mount", &self.inner.config.mount)
            .finish()
    }
}

impl VaultKvStore {
    /// Build the client, wait until the server is initialized and unsealed,
    /// and authenticate.
    pub async fn connect(mut config: VaultKvConfig) -> StoreResult<Self> {
        let client = build_client(&config).await?;
        let token = config.token.take();
        let store = Self {
            inner: Arc::new(VaultInner {
                client,
                static_token: token.is_some(),
                token: RwLock::new(token),
                config,
            }),
        };

        let inner = &store.inner;
        retry_with_policy(&inner.config.retry, || inner.health()).await?;
        if !inner.static_token {
            retry_with_policy(&inner.config.retry, || inner.login()).await?;
        }

        info!(
            "Connected to KV store at {} (mount: {})",
            inner.config.address, inner.config.mount
        );
        Ok(store)
    }

    fn spawn<T, F, Fut>(&self, operation: F) -> StoreRequest<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<VaultInner>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = StoreResult<T>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        StoreRequest::spawn(operation(inner))
    }
}

async fn build_client(config: &VaultKvConfig) -> StoreResult<Client> {
    let mut builder = Client::builder()
        .use_rustls_tls()
        .timeout(config.request_timeout);

    if let Some(ca_path) = &config.ca_cert_path {
        let pem = tokio::fs::read(ca_path).await?;
        let ca = Certificate::from_pem(&pem)
            .map_err(|e| StoreError::Configuration(format!("invalid CA certificate: {e}")))?;
        builder = builder.add_root_certificate(ca);
    }

    match (&config.client_cert_path, &config.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let mut pem = tokio::fs::read(cert_path).await?;
            pem.push(b'\n');
            pem.extend(tokio::fs::read(key_path).await?);
            let identity = Identity::from_pem(&pem)
                .map_err(|e| StoreError::Configuration(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(StoreError::Configuration(
                "client certificate and key must be configured together".to_string(),
            ))
        }
    }

    builder
        .build()
        .map_err(|e| StoreError::Configuration(format!("failed to build HTTP client: {e}")))
}

fn transport_error(operation: &str, err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout(format!("{operation}: {err}"))
    } else if err.is_connect() || err.is_request() {
        StoreError::Connection(format!("{operation}: {err}"))
    } else {
        StoreError::backend(operation, 0, err.to_string())
    }
}

async fn unexpected(operation: &str, response: Response) -> StoreError {
    let status = response.status().as_u16();
    let details = response.text().await.unwrap_or_default();
    match status {
        401 | 403 => StoreError::Unauthorized(format!("{operation}: {details}")),
        503 => StoreError::Unavailable(format!("{operation}: {details}")),
        _ => StoreError::backend(operation, status, details),
    }
}

impl VaultInner {
    fn data_url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}/data/{}",
            self.config.address.trim_end_matches('/'),
            self.config.mount,
            path
        )
    }

    fn metadata_url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}/metadata/{}",
            self.config.address.trim_end_matches('/'),
            self.config.mount,
            path
        )
    }

    async fn health(&self) -> StoreResult<()> {
        let url = format!("{}/v1/sys/health", self.config.address.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error("health", e))?;

        match response.status().as_u16() {
            200 | 429 | 472 | 473 => Ok(()),
            501 => Err(StoreError::Unavailable("store is not initialized".to_string())),
            503 => Err(StoreError::Unavailable("store is sealed".to_string())),
            _ => Err(unexpected("health", response).await),
        }
    }

    async fn login(&self) -> StoreResult<()> {
        let url = format!(
            "{}/v1/auth/{}/login",
            self.config.address.trim_end_matches('/'),
            self.config.cert_auth_mount
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| transport_error("login", e))?;

        if !response.status().is_success() {
            return Err(unexpected("login", response).await);
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| StoreError::backend("login", 200, e.to_string()))?;
        *self.token.write().await = Some(SecretString::from(login.auth.client_token));
        debug!("Authenticated with certificate login");
        Ok(())
    }

    /// Send an authenticated request, logging in again once on `403`
    async fn send(
        &self,
        operation: &str,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> StoreResult<Response> {
        let mut relogged = false;
        loop {
            let mut request = self.client.request(method.clone(), url);
            if let Some(token) = self.token.read().await.as_ref() {
                request = request.header(TOKEN_HEADER, token.expose_secret());
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| transport_error(operation, e))?;

            let can_relogin = !self.static_token && !relogged;
            if response.status() == StatusCode::FORBIDDEN && can_relogin {
                warn!("Store token rejected during {operation}; logging in again");
                self.login().await?;
                relogged = true;
                continue;
            }
            return Ok(response);
        }
    }

    async fn get_once(&self, path: &str) -> StoreResult<Option<Versioned>> {
        let response = self
            .send("get", Method::GET, &self.data_url(path), None)
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let read: ReadResponse = response
                    .json()
                    .await
                    .map_err(|e| StoreError::backend("get", 200, e.to_string()))?;
                Ok(read.data.data.map(|fields| Versioned {
                    fields,
                    version: read.data.metadata.version,
                }))
            }
            _ => Err(unexpected("get", response).await),
        }
    }

    async fn put_once(&self, path: &str, fields: &Fields, expected: u64) -> StoreResult<u64> {
        let body = json!({ "options": { "cas": expected }, "data": fields });
        let response = self
            .send("put", Method::POST, &self.data_url(path), Some(&body))
            .await?;

        let status = response.status();
        if status.is_success() {
            let written: WriteResponse = response
                .json()
                .await
                .map_err(|e| StoreError::backend("put", status.as_u16(), e.to_string()))?;
            return Ok(written.data.version);
        }

        let details = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && details.contains(CAS_MISMATCH) {
            return Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected,
            });
        }
        Err(match status.as_u16() {
            401 | 403 => StoreError::Unauthorized(format!("put: {details}")),
            503 => StoreError::Unavailable(format!("put: {details}")),
            code => StoreError::backend("put", code, details),
        })
    }

    /// CAS write with backoff. A timed-out attempt may still have been
    /// applied, so a conflict on a later attempt is checked against the
    /// stored document before it is reported.
    async fn put_retrying(&self, path: &str, fields: &Fields, expected: u64) -> StoreResult<u64> {
        let maybe_applied = &AtomicBool::new(false);
        retry_with_policy(&self.config.retry, || async move {
            match self.put_once(path, fields, expected).await {
                Err(StoreError::VersionConflict { .. }) if maybe_applied.load(Ordering::Acquire) => {
                    self.confirm_put(path, fields, expected).await
                }
                Err(err) => {
                    if matches!(err, StoreError::Timeout(_) | StoreError::Connection(_)) {
                        maybe_applied.store(true, Ordering::Release);
                    }
                    Err(err)
                }
                written => written,
            }
        })
        .await
    }

    /// Accept a conflicting write as our own when the document sits exactly
    /// one version past `expected` with the fields we sent
    async fn confirm_put(&self, path: &str, fields: &Fields, expected: u64) -> StoreResult<u64> {
        match self.get_once(path).await? {
            Some(doc) if doc.version == expected + 1 && doc.fields == *fields => {
                debug!("Earlier put of {path} was applied at version {}", doc.version);
                Ok(doc.version)
            }
            _ => Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected,
            }),
        }
    }

    async fn read_version_once(&self, path: &str) -> StoreResult<u64> {
        let response = self
            .send("read_version", Method::GET, &self.metadata_url(path), None)
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(ABSENT_VERSION),
            status if status.is_success() => {
                let metadata: MetadataResponse = response
                    .json()
                    .await
                    .map_err(|e| StoreError::backend("read_version", 200, e.to_string()))?;
                Ok(metadata.data.current_version)
            }
            _ => Err(unexpected("read_version", response).await),
        }
    }

    async fn delete_once(&self, path: &str) -> StoreResult<()> {
        let response = self
            .send("delete", Method::DELETE, &self.metadata_url(path), None)
            .await?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(unexpected("delete", response).await)
        }
    }

    async fn list_once(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let method = Method::from_bytes(b"LIST")
            .map_err(|e| StoreError::internal(format!("invalid LIST method: {e}")))?;
        let url = self.metadata_url(prefix.trim_end_matches('/'));
        let response = self.send("list", method, &url, None).await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => {
                let listed: ListResponse = response
                    .json()
                    .await
                    .map_err(|e| StoreError::backend("list", 200, e.to_string()))?;
                Ok(listed.data.keys)
            }
            _ => Err(unexpected("list", response).await),
        }
    }
}

impl SecretStore for VaultKvStore {
    fn name(&self) -> &str {
        "vault-kv2"
    }

    fn get(&self, path: &str) -> StoreRequest<Option<Versioned>> {
        let path = path.to_string();
        self.spawn(move |inner| async move {
            let result = retry_with_policy(&inner.config.retry, || inner.get_once(&path)).await;
            LoggingTransformer::log_store_operation("get", &path, result.is_ok());
            result
        })
    }

    fn put(&self, path: &str, fields: Fields, expected_version: u64) -> StoreRequest<u64> {
        let path = path.to_string();
        self.spawn(move |inner| async move {
            let result = inner.put_retrying(&path, &fields, expected_version).await;
            let logged_ok = matches!(&result, Ok(_) | Err(StoreError::VersionConflict { .. }));
            LoggingTransformer::log_store_operation("put", &path, logged_ok);
            result
        })
    }

    fn read_version(&self, path: &str) -> StoreRequest<u64> {
        let path = path.to_string();
        self.spawn(move |inner| async move {
            retry_with_policy(&inner.config.retry, || inner.read_version_once(&path)).await
        })
    }

    fn delete_all_versions(&self, path: &str) -> StoreRequest<()> {
        let path = path.to_string();
        self.spawn(move |inner| async move {
            let result = retry_with_policy(&inner.config.retry, || inner.delete_once(&path)).await;
            LoggingTransformer::log_store_operation("delete", &path, result.is_ok());
            result
        })
    }

    fn list(&self, prefix: &str) -> StoreRequest<Vec<String>> {
        let prefix = prefix.to_string();
        self.spawn(move |inner| async move {
            retry_with_policy(&inner.config.retry, || inner.list_once(&prefix)).await
        })
    }
}
