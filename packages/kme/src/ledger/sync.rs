//! Best-effort replication of new ledger entries to the peer KME

use super::{KeyIdList, LedgerBatch, LedgerEntry};
use crate::config::PeerSettings;
use crate::error::{KmeError, Result};
use crate::types::KeyId;
use log::{debug, info, warn};
use pin_project::pin_project;
use qkme_common::{retry_with_policy, LoggingTransformer, RetryPolicy};
use reqwest::{Certificate, Client, Identity, StatusCode};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

/// Awaitable handle for one replication round trip
#[pin_project]
#[derive(Debug)]
pub struct PeerRequest<T> {
    #[pin]
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> PeerRequest<T> {
    /// Wrap the receiving half of a result channel
    pub fn new(receiver: oneshot::Receiver<Result<T>>) -> Self {
        Self { receiver }
    }

    /// Run `future` on the current runtime and resolve with its output
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(future.await);
        });
        Self::new(rx)
    }
}

impl<T> Future for PeerRequest<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().receiver.poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(KmeError::internal(
                "Peer request channel closed unexpectedly",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Transport to the peer KME
pub trait LedgerPeer: Send + Sync + 'static {
    /// Peer description for logs
    fn describe(&self) -> String;

    /// Send entries; resolves to the key ids the peer echoed back
    fn push(&self, batch: LedgerBatch) -> PeerRequest<Vec<KeyId>>;
}

/// Peer reached over mutually authenticated HTTPS
#[derive(Debug, Clone)]
pub struct HttpLedgerPeer {
    client: Client,
    url: String,
    retry: RetryPolicy,
    timeout: Duration,
}

impl HttpLedgerPeer {
    /// Peer for ledgers sent by `local_kme_id`
    pub async fn connect(settings: &PeerSettings, local_kme_id: &str) -> Result<Self> {
        let mut builder = Client::builder()
            .use_rustls_tls()
            .timeout(settings.timeout());

        if let Some(ca_path) = &settings.ca_cert_path {
            let pem = read_pem(ca_path).await?;
            let ca = Certificate::from_pem(&pem)
                .map_err(|e| KmeError::Configuration(format!("invalid peer CA certificate: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }

        match (&settings.client_cert_path, &settings.client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let mut pem = read_pem(cert_path).await?;
                pem.push(b'\n');
                pem.extend(read_pem(key_path).await?);
                let identity = Identity::from_pem(&pem)
                    .map_err(|e| KmeError::Configuration(format!("invalid peer identity: {e}")))?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(KmeError::Configuration(
                    "peer client certificate and key must be configured together".to_string(),
                ))
            }
        }

        let client = builder
            .build()
            .map_err(|e| KmeError::Configuration(format!("failed to build peer client: {e}")))?;

        Ok(Self {
            client,
            url: settings.ledger_url(local_kme_id),
            retry: settings.retry.policy(),
            timeout: settings.timeout(),
        })
    }

    async fn push_once(client: &Client, url: &str, batch: &LedgerBatch) -> Result<Vec<KeyId>> {
        let response = client.put(url).json(batch).send().await.map_err(|e| {
            if e.is_timeout() {
                KmeError::PeerTimeout(e.to_string())
            } else if e.is_connect() {
                KmeError::PeerUnreachable(e.to_string())
            } else {
                KmeError::PeerRejected {
                    status: 0,
                    details: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        match status {
            StatusCode::CREATED | StatusCode::OK => {
                let echoed: KeyIdList = response
                    .json()
                    .await
                    .map_err(|e| KmeError::PeerRejected {
                        status: status.as_u16(),
                        details: format!("unreadable key id echo: {e}"),
                    })?;
                Ok(echoed.into_ids())
            }
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::TOO_MANY_REQUESTS => {
                Err(KmeError::PeerBusy(format!("peer answered {status}")))
            }
            StatusCode::GATEWAY_TIMEOUT => Err(KmeError::PeerTimeout(format!("peer answered {status}"))),
            _ => Err(KmeError::PeerRejected {
                status: status.as_u16(),
                details: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

async fn read_pem(path: &std::path::Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| KmeError::Configuration(format!("cannot read {}: {e}", path.display())))
}

impl LedgerPeer for HttpLedgerPeer {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn push(&self, batch: LedgerBatch) -> PeerRequest<Vec<KeyId>> {
        let client = self.client.clone();
        let url = self.url.clone();
        let retry = self.retry.clone();
        let timeout = self.timeout;
        PeerRequest::spawn(async move {
            LoggingTransformer::log_network_operation("ledger push", &url, Some(timeout));
            retry_with_policy(&retry, || Self::push_once(&client, &url, &batch)).await
        })
    }
}

/// Sends committed ledger entries to the peer and checks the echo
#[derive(Clone, Default)]
pub struct LedgerSync {
    peer: Option<Arc<dyn LedgerPeer>>,
}

impl LedgerSync {
    /// Replicate to `peer`
    pub fn new(peer: Arc<dyn LedgerPeer>) -> Self {
        Self { peer: Some(peer) }
    }

    /// No peer: replication is skipped
    pub fn standalone() -> Self {
        Self { peer: None }
    }

    /// True when a peer is configured
    pub fn is_enabled(&self) -> bool {
        self.peer.is_some()
    }

    /// Send `entries` to the peer.
    ///
    /// A peer timeout surfaces as [`KmeError::PeerTimeout`] and overload as
    /// [`KmeError::PeerBusy`]. An echo that differs from the sent key ids is
    /// logged as a consistency warning only.
    pub async fn sync(&self, entries: &[LedgerEntry]) -> Result<()> {
        let Some(peer) = &self.peer else {
            debug!("No peer configured; skipping replication of {} entries", entries.len());
            return Ok(());
        };
        if entries.is_empty() {
            return Ok(());
        }

        let sent: BTreeSet<KeyId> = entries.iter().map(|e| e.key_id.clone()).collect();
        let batch = LedgerBatch {
            ledgers: entries.to_vec(),
        };

        let echoed: BTreeSet<KeyId> = peer.push(batch).await?.into_iter().collect();
        if echoed != sent {
            let missing: Vec<_> = sent.difference(&echoed).map(KeyId::to_string).collect();
            let extra: Vec<_> = echoed.difference(&sent).map(KeyId::to_string).collect();
            warn!(
                "Peer {} echoed a different key id set (missing: [{}], unexpected: [{}])",
                peer.describe(),
                missing.join(", "),
                extra.join(", ")
            );
        } else {
            info!("Replicated {} ledger entries to {}", sent.len(), peer.describe());
        }
        Ok(())
    }
}
