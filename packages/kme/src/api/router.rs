//! Router construction and the serve loop

use super::handlers::handle_ledger_push;
use super::state::ApiState;
use super::tls::{certificate_identity, load_server_config, PeerIdentity};
use crate::config::{ServerSettings, ServerTlsSettings};
use crate::error::{KmeError, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::put;
use axum::{Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use log::{debug, error, info, warn};
use qkme_common::LoggingTransformer;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Replication route, `:kme_id` being the sending KME
pub const LEDGER_ROUTE: &str = "/api/v1/ledger/:kme_id/key_ids";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Router with the replication route and request limits applied
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route(LEDGER_ROUTE, put(handle_ledger_push))
        .layer(DefaultBodyLimit::max(state.body_limit))
        .with_state(state)
}

/// Bind the listen address in `settings`
pub async fn bind(settings: &ServerSettings) -> Result<TcpListener> {
    let addr = &settings.listen_addr;
    TcpListener::bind(addr)
        .await
        .map_err(|e| KmeError::Configuration(format!("cannot bind {addr}: {e}")))
}

/// Serve `router` on `listener` until `shutdown` resolves
///
/// Peers must authenticate with a client certificate unless `settings`
/// explicitly allows plain HTTP.
pub async fn serve<F>(
    listener: TcpListener,
    settings: &ServerSettings,
    router: Router,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| settings.listen_addr.clone());

    match (&settings.tls, settings.allow_plaintext) {
        (Some(tls), _) => serve_tls(listener, &addr, tls, router, shutdown).await,
        (None, true) => {
            warn!("Peer listener on {addr} runs without TLS; sender ids are not authenticated");
            LoggingTransformer::log_server_startup("HTTP", &addr);
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
                .map_err(|err| {
                    error!("HTTP server terminated unexpectedly addr={addr} error={err}");
                    KmeError::internal(err.to_string())
                })?;
            info!("HTTP server on {addr} stopped");
            Ok(())
        }
        (None, false) => Err(KmeError::Configuration(
            "server.tls is required unless server.allow_plaintext is set".to_string(),
        )),
    }
}

async fn serve_tls<F>(
    listener: TcpListener,
    addr: &str,
    tls: &ServerTlsSettings,
    router: Router,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let acceptor = TlsAcceptor::from(load_server_config(tls).await?);
    LoggingTransformer::log_server_startup("HTTPS", addr);

    tokio::pin!(shutdown);
    loop {
        let (tcp, remote) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("Accept failed on {addr}: {err}");
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            let stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    LoggingTransformer::log_auth_failure("tls_handshake", &remote.to_string());
                    debug!("TLS handshake with {remote} failed: {err}");
                    return;
                }
                Err(_) => {
                    debug!("TLS handshake with {remote} timed out");
                    return;
                }
            };

            let identity = match stream.get_ref().1.peer_certificates().and_then(|c| c.first()) {
                Some(cert) => certificate_identity(cert),
                None => Err(KmeError::Unauthorized("no client certificate".to_string())),
            };
            let identity = match identity {
                Ok(id) => id,
                Err(err) => {
                    LoggingTransformer::log_auth_failure("peer_identity", &remote.to_string());
                    debug!("Dropping connection from {remote}: {err}");
                    return;
                }
            };
            debug!("Peer connection from {remote} authenticated as {identity}");

            let service = TowerToHyperService::new(router.layer(Extension(PeerIdentity(identity))));
            let builder = auto::Builder::new(TokioExecutor::new());
            if let Err(err) = builder.serve_connection(TokioIo::new(stream), service).await {
                debug!("Connection from {remote} closed with error: {err}");
            }
        });
    }

    info!("HTTPS server on {addr} stopped");
    Ok(())
}
