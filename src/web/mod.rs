//! HTTP surface: health probes and metrics exposition.
//!
//! Both master and agent serve `/health`, `/readiness`, and `/metrics`.
//! The listener is bound during startup so a bad port is a fatal
//! configuration error; serving itself runs until the shutdown token
//! fires, then finishes open requests gracefully.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::metrics::Metrics;

/// Extra wait before shutdown when running under Kubernetes, giving
/// ingress controllers time to stop routing to this pod.
const K8S_SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Binds the listener. Failing to bind is a startup error.
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).await
}

/// Serves until `token` is cancelled, then drains with a grace period.
pub async fn serve(listener: TcpListener, metrics: Arc<Metrics>, token: CancellationToken) {
    let app = Router::new()
        .route("/health", get(health))
        .route("/readiness", get(health))
        .route("/metrics", get(export_metrics))
        .with_state(metrics);

    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "http server started");
    }

    let shutdown = async move {
        token.cancelled().await;
        if std::env::var_os("KUBERNETES_SERVICE_HOST").is_some() {
            debug!("waiting for ingress to drain before http shutdown");
            tokio::time::sleep(K8S_SHUTDOWN_GRACE).await;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "http server error");
    }

    debug!("http server stopped");
}

async fn health() -> &'static str {
    "ok"
}

async fn export_metrics(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.export()
}
