#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Minimal HTTP endpoint exposing the Prometheus registry.

use crate::monitoring::metrics::Metrics;
use axum::{extract::State, routing::get, Router};
use prometheus::Encoder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> String {
    let families = metrics.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = prometheus::TextEncoder::new().encode(&families, &mut buf) {
        warn!(err = %e, "metrics encode failed");
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

/// Serve `GET /metrics` until cancelled.
pub fn spawn(
    listen_addr: String,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(metrics);

        let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!(addr = %listen_addr, err = %e, "metrics listener bind failed");
                return;
            }
        };
        info!(addr = %listen_addr, "metrics endpoint up");

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            warn!(err = %e, "metrics server stopped with error");
        }
    })
}
