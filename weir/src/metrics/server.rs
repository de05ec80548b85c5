//! HTTP server exposing the Prometheus registry at `/metrics`.

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics::{error::MetricsError, opts::MetricsOptions, registry};

/// Handler for the `/metrics` endpoint.
///
/// Returns Prometheus text format metrics for all registered collectors.
async fn metrics_handler() -> impl IntoResponse {
    match tokio::task::spawn_blocking(|| {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = registry::REGISTRY.gather();
        encoder.encode_to_string(&metric_families)
    })
    .await
    {
        Ok(Ok(body)) => (StatusCode::OK, body),
        Ok(Err(e)) => {
            tracing::error!(
                event.name = "metrics.encode_failed",
                error.message = %e,
                "failed to encode metrics"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {e}"),
            )
        }
        Err(e) => {
            tracing::error!(
                event.name = "metrics.gather_failed",
                error.message = %e,
                "metrics gather task failed"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to gather metrics: {e}"),
            )
        }
    }
}

/// Run the metrics server until the process exits.
pub async fn start_metrics_server(options: MetricsOptions) -> Result<(), MetricsError> {
    let address = format!("{}:{}", options.listen_address, options.port);
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| MetricsError::bind_address(address.clone(), e))?;

    info!(
        event.name = "metrics.server_started",
        server.address = %address,
        "metrics server listening"
    );

    let router = Router::new()
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http());

    axum::serve(listener, router).await?;
    Ok(())
}
