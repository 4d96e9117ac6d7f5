use std::future::ready;
use std::net::SocketAddr;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use tracing::error;

use crate::health::HealthRegistry;
use crate::metrics_consts::{BATCH_SIZE, DELIVERY_DURATION};

pub fn router(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

pub async fn index() -> &'static str {
    "sink-worker"
}

/// Adds the prometheus endpoint to a router, should be called last.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router.route(
        "/metrics",
        get(move || ready(recorder_handle.render())),
    ))
}

fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ];
    const RECORDS: &[f64] = &[
        1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DELIVERY_DURATION.to_owned()), SECONDS)?
        .set_buckets_for_metric(Matcher::Full(BATCH_SIZE.to_owned()), RECORDS)?
        .install_recorder()
}

/// Binds a `TcpListener` on the provided address and serves `router` on it.
/// Binds `bind` and serves `router` from a background task. Returns once the
/// listener is bound, so the endpoints answer before anything else starts.
pub async fn serve(router: Router, bind: &str) -> Result<SocketAddr, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "failed to serve health and metrics endpoints");
        }
    });

    Ok(addr)
}
