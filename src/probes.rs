//! Health and readiness probe endpoints
//!
//! `/healthz` answers as soon as the process is up. `/readyz` stays 503 until
//! the manager has acquired leadership and started its leader-gated work, so
//! a standby replica is never routed traffic.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::manager::Runnable;
use crate::{Error, Result};

/// Build the probe router over the manager's ready flag
pub fn router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(ready)
}

async fn readyz(State(ready): State<Arc<AtomicBool>>) -> (StatusCode, &'static str) {
    if ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Serve probes until the shutdown token fires
pub async fn serve(
    addr: SocketAddr,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = router(ready);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Probes(format!("failed to bind {addr}: {e}")))?;
    info!(addr = %addr, "Probe server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::Probes(e.to_string()))
}

/// The probe server as a manager runnable; probes must answer on standby
/// replicas too, so it does not wait for leadership
pub fn runnable(addr: SocketAddr, ready: Arc<AtomicBool>, shutdown: CancellationToken) -> Runnable {
    Runnable::new("probes", serve(addr, ready, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_answers_regardless_of_readiness() {
        let app = router(Arc::new(AtomicBool::new(false)));
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_follows_the_managers_ready_flag() {
        let ready = Arc::new(AtomicBool::new(false));
        let app = router(ready.clone());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        ready.store(true, Ordering::SeqCst);
        let response = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }
}
