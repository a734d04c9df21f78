//! Accept loops for the primary mock listeners (plain and TLS).

use super::handler;
use super::AppState;
use crate::listener;
use crate::matching::MtlsIdentity;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error};

/// Serve the primary listener until shutdown. Each connection runs on its
/// own task; the loop itself never blocks on a handler.
pub async fn serve_plain(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let read_timeout = std::time::Duration::from_secs(state.options.read_timeout_secs.max(1));
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                handler::handle(req, Arc::clone(&state), addr, None)
                            });
                            if let Err(e) = http1::Builder::new()
                                .header_read_timeout(read_timeout)
                                .serve_connection(io, service)
                                .with_upgrades()
                                .await
                            {
                                debug!("connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => error!("accept error: {e}"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Serve the HTTPS listener. The TLS handshake runs on the connection task;
/// client certificate identity (mTLS) is captured after the handshake and
/// made visible to matchers and templates.
pub async fn serve_tls(
    listener: TcpListener,
    state: Arc<AppState>,
    acceptor: TlsAcceptor,
    mut shutdown: broadcast::Receiver<()>,
) {
    let read_timeout = std::time::Duration::from_secs(state.options.read_timeout_secs.max(1));
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(s) => s,
                                Err(e) => {
                                    debug!("TLS handshake failed from {addr}: {e}");
                                    return;
                                }
                            };
                            let identity: Option<MtlsIdentity> = {
                                let (_, conn) = tls_stream.get_ref();
                                conn.peer_certificates()
                                    .and_then(|certs| certs.first())
                                    .and_then(|cert| listener::identity_from_cert(cert.as_ref()))
                            };
                            let io = TokioIo::new(tls_stream);
                            let service = service_fn(move |req| {
                                handler::handle(req, Arc::clone(&state), addr, identity.clone())
                            });
                            if let Err(e) = http1::Builder::new()
                                .header_read_timeout(read_timeout)
                                .serve_connection(io, service)
                                .with_upgrades()
                                .await
                            {
                                debug!("TLS connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => error!("accept error: {e}"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
