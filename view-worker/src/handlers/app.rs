use std::future::ready;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::{routing, Router};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use view_common::keys;
use view_common::metrics::track_metrics;
use view_common::store::DedupStore;

/// Operational endpoints of the worker process.
pub fn app(
    liveness: HealthRegistry,
    pool: PgPool,
    store: Arc<dyn DedupStore>,
    metrics: Option<PrometheusHandle>,
) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route(
            "/_readiness",
            routing::get(move || readiness(pool.clone(), store.clone())),
        )
        .route("/_liveness", routing::get(move || ready(liveness.get_status())))
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => ready(recorder_handle.render()),
                None => ready("no metrics recorder installed".to_owned()),
            }),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub async fn index() -> &'static str {
    "view worker"
}

/// Ready when both the queue database and the dedup store answer.
pub async fn readiness(
    pool: PgPool,
    store: Arc<dyn DedupStore>,
) -> Result<&'static str, (StatusCode, String)> {
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("database unavailable: {e}"),
            )
        })?;

    store
        .exists(&keys::dirty_set_key(view_common::event::EntityType::Series))
        .await
        .map_err(|e| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("dedup store unavailable: {e}"),
            )
        })?;

    Ok("ready")
}

#[cfg(test)]
mod tests {
    use view_common::store::MemoryDedupStore;

    use super::*;

    #[tokio::test]
    async fn test_index() {
        assert_eq!(index().await, "view worker");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_readiness(db: PgPool) {
        let store = MemoryDedupStore::new();

        assert_eq!(
            readiness(db.clone(), Arc::new(store.clone())).await,
            Ok("ready")
        );

        store.set_unavailable(true);
        let (status, _) = readiness(db, Arc::new(store))
            .await
            .expect_err("unavailable store should not be ready");
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
