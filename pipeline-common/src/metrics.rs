use axum::{routing::get, Router};
use health::HealthRegistry;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
/// Intended for the Router returned by `setup_metrics_router`, possibly with more routes added.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Router exposing Prometheus metrics and the liveness probe.
pub fn setup_metrics_router(liveness: HealthRegistry) -> Router {
    let recorder_handle = setup_metrics_recorder();

    Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .route(
            "/_liveness",
            get(move || std::future::ready(liveness.get_status())),
        )
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .expect("bucket list is not empty")
        .install_recorder()
        .expect("failed to install the prometheus recorder")
}
