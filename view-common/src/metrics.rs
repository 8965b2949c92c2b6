use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Serve `router` on `bind` until the process exits.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the global Prometheus recorder. Panics if called twice, so only binaries call it.
pub fn setup_metrics_recorder() -> PrometheusHandle {
    // Store round trips sit at the low end, full sync cycles at the high end.
    const BUCKETS_SECONDS: &[f64] = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    let handle = PrometheusBuilder::new()
        .set_buckets(BUCKETS_SECONDS)
        .expect("histogram buckets must not be empty")
        .install_recorder()
        .expect("failed to install metrics recorder");

    describe_metrics();

    handle
}

fn describe_metrics() {
    metrics::describe_counter!("view_jobs_total", "View jobs dequeued");
    metrics::describe_counter!(
        "view_jobs_counted",
        "Views from a fingerprint not seen within the dedup window"
    );
    metrics::describe_counter!(
        "view_jobs_not_counted",
        "Views deduplicated within the dedup window"
    );
    metrics::describe_counter!("view_jobs_retried", "View jobs re-scheduled after a store error");
    metrics::describe_counter!("view_jobs_failed", "View jobs that ran out of attempts");
    metrics::describe_counter!("view_jobs_malformed", "View jobs with an unparseable payload");
    metrics::describe_counter!(
        "view_jobs_database_error",
        "Queue operations that failed against Postgres"
    );
    metrics::describe_gauge!(
        "view_worker_saturation_percent",
        "Share of job permits in use"
    );
    metrics::describe_histogram!("view_dequeue_batch_size", "Jobs per dequeued batch");
    metrics::describe_counter!("view_sync_cycles_total", "Sync cycles started");
    metrics::describe_counter!(
        "view_sync_cycle_timeouts",
        "Sync cycles abandoned after the cycle timeout"
    );
    metrics::describe_counter!(
        "view_sync_entities_flushed",
        "Entities whose pending views reached durable storage"
    );
    metrics::describe_counter!(
        "view_sync_views_flushed",
        "Views added to durable storage"
    );
    metrics::describe_counter!(
        "view_sync_entity_errors",
        "Entities left dirty by a failed flush"
    );
    metrics::describe_histogram!(
        "view_sync_duration_seconds",
        metrics::Unit::Seconds,
        "Duration of a sync cycle"
    );
}

/// Middleware recording count and latency of HTTP requests per route and status.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
