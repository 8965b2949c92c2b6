use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Health reporting for the long-running loops of a view pipeline process.
///
/// The worker process runs an ingestion loop and a sync loop; it can only be
/// trusted to count views if both keep reporting. Each loop registers itself
/// as a component with a deadline and must report healthy more often than
/// that deadline:
///   - no component registered yet: unhealthy
///   - any component unhealthy, starting or stalled: unhealthy
///   - every component reported healthy within its deadline: healthy
///
/// Liveness and readiness should each get their own registry.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True when every registered component is healthy.
    pub healthy: bool,
    /// Current status of each registered component, for display.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        let status = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, body).into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, before the first report.
    Starting,
    /// Reported healthy, must report again before this instant.
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy.
    Unhealthy,
    /// The `HealthyUntil` deadline passed without a new report.
    Stalled,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: time::Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy until now + deadline.
    pub async fn report_healthy(&self) {
        let until = time::OffsetDateTime::now_utc() + self.deadline;
        self.report_status(ComponentStatus::HealthyUntil(until))
            .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!(component = %self.component, "failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match components.write() {
                    Ok(mut map) => {
                        _ = map.insert(message.component, message.status);
                    }
                    // Probes will fail and the process will be restarted.
                    Err(_) => warn!("poisoned HealthRegistry lock"),
                }
            }
        });

        registry
    }

    /// Register a component. The handle must be moved into the component so it
    /// can report more often than `deadline`.
    pub async fn register(&self, component: &str, deadline: std::time::Duration) -> HealthHandle {
        let deadline = time::Duration::try_from(deadline).unwrap_or(time::Duration::MAX);
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Overall process status. Usable directly as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = match self.components.read() {
            Ok(components) => components,
            Err(_) => {
                warn!("poisoned HealthRegistry lock");
                return HealthStatus::default();
            }
        };

        let now = time::OffsetDateTime::now_utc();
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => status.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            result.components.insert(name.clone(), status);
        }

        if result.healthy {
            debug!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, result.components);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn assert_eventually<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn ingestion_and_sync_must_both_report() {
        let registry = HealthRegistry::new("liveness");
        let ingestion = registry.register("ingestion", Duration::from_secs(30)).await;
        let sync = registry.register("sync", Duration::from_secs(30)).await;
        assert_eventually(|| registry.get_status().components.len() == 2).await;
        assert_eq!(
            registry.get_status().components.get("sync"),
            Some(&ComponentStatus::Starting)
        );

        ingestion.report_healthy().await;
        assert_eventually(|| {
            registry.get_status().components.get("ingestion") != Some(&ComponentStatus::Starting)
        })
        .await;
        assert!(!registry.get_status().healthy);

        sync.report_healthy().await;
        assert_eventually(|| registry.get_status().healthy).await;

        sync.report_status(ComponentStatus::Unhealthy).await;
        assert_eventually(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("sync", Duration::from_secs(30)).await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                time::OffsetDateTime::now_utc() - time::Duration::seconds(1),
            ))
            .await;
        assert_eventually(|| {
            registry.get_status().components.get("sync") == Some(&ComponentStatus::Stalled)
        })
        .await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
