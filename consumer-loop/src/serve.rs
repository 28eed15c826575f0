use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::{from_fn_with_state, Next},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::future::ready;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Answers whether the service should currently receive traffic.
pub type Readiness = Arc<dyn Fn() -> bool + Send + Sync>;

pub async fn index() -> &'static str {
    "consumer loop"
}

pub fn readiness_status(is_ready: bool) -> (StatusCode, &'static str) {
    if is_ready {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not consuming")
    }
}

/// `/`, `/_liveness` and a `/_readiness` route backed by `readiness`. Every
/// route is tracked by the HTTP metrics middleware under `service`.
pub fn status_router(service: &str, readiness: Readiness) -> Router {
    Router::new()
        .route("/", get(index))
        .route(
            "/_readiness",
            get(move || ready(readiness_status(readiness()))),
        )
        .route("/_liveness", get(|| ready("ok")))
        .layer(from_fn_with_state(Arc::<str>::from(service), track_metrics))
}

/// Status routes plus `/metrics`, backed by a freshly installed Prometheus recorder.
pub fn router(service: &str, readiness: Readiness) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(status_router(service, readiness).route(
        "/metrics",
        get(move || ready(recorder_handle.render())),
    ))
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // covers request latencies in seconds as well as poll batch sizes
    const BUCKETS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

/// Counts status requests and their latency, labelled with the service name.
pub async fn track_metrics(
    State(service): State<Arc<str>>,
    req: Request<Body>,
    next: Next,
) -> impl IntoResponse {
    let start = Instant::now();

    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("service", service.to_string()),
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
