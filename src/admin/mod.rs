//! Admin REST API: the mutable surface over the same stores the protocol
//! listeners read. Runs on its own port, optionally behind a bearer token.

mod handlers;
mod router;
mod types;

pub use types::{problem, problem_with_errors, ErrorKind};

use crate::engine::{AppState, Engine};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Serve the admin API until shutdown.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<Engine>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let limiter = Arc::new(RateLimiter::new(engine.state.options.rate_limit));
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let engine = Arc::clone(&engine);
                        let limiter = Arc::clone(&limiter);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                router::route(req, Arc::clone(&engine), Arc::clone(&limiter))
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!("admin connection error from {addr}: {e}");
                            }
                        });
                    }
                    Err(e) => error!("admin accept error: {e}"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Set up the admin API key per the auth config: explicit key, previously
/// persisted key, or a fresh one written to a user-only file.
pub fn ensure_api_key(state: &AppState, auth: &crate::config::AuthConfig) -> anyhow::Result<()> {
    if !auth.enabled {
        return Ok(());
    }
    if !auth.api_key.is_empty() {
        *state.admin_key.write() = auth.api_key.clone();
        return Ok(());
    }

    let path = api_key_path();
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let existing = existing.trim().to_string();
        if !existing.is_empty() {
            *state.admin_key.write() = existing;
            return Ok(());
        }
    }

    let key = format!("mockd_{}", uuid::Uuid::new_v4().simple());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, &key)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    info!("generated admin API key at {}", path.display());
    *state.admin_key.write() = key;
    Ok(())
}

fn api_key_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("mockd").join("api.key")
}

/// Fixed-window limiter for the admin surface; 0 disables.
pub(crate) struct RateLimiter {
    per_second: u32,
    window: Mutex<(Instant, u32)>,
}

impl RateLimiter {
    fn new(per_second: u32) -> Self {
        Self {
            per_second,
            window: Mutex::new((Instant::now(), 0)),
        }
    }

    pub(crate) fn allow(&self) -> bool {
        if self.per_second == 0 {
            return true;
        }
        let mut window = self.window.lock();
        let now = Instant::now();
        if now.duration_since(window.0).as_secs() >= 1 {
            *window = (now, 0);
        }
        if window.1 >= self.per_second {
            return false;
        }
        window.1 += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_zero_always_allows() {
        let limiter = RateLimiter::new(0);
        for _ in 0..1000 {
            assert!(limiter.allow());
        }
    }

    #[test]
    fn rate_limiter_caps_per_window() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }
}
