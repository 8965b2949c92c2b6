//! # Sync
//!
//! Moves pending views from the dedup store into durable counts.
//!
//! Each dirty entity is flushed on its own: its pending counter is read and cleared in
//! one step, the delta is added to the durable count, and only then is the entity
//! removed from the dirty set. A failure with one entity leaves it dirty for the next
//! cycle and never stops the others.
//!
//! A flush is never cancelled half way. A cycle with a time limit stops picking up
//! entities once the limit is reached, and the write in flight at that moment is
//! bounded by the same limit and re-credited when it does not finish.
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};
use view_common::counts::{CountStore, CountStoreError};
use view_common::event::EntityType;
use view_common::keys;
use view_common::store::DedupStore;

use crate::error::SyncError;

/// Number of entities per type whose pending views were applied in one cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    pub series_synced: usize,
    pub chapters_synced: usize,
    /// Entities left dirty because flushing them failed.
    pub entity_errors: usize,
    /// The cycle ran out of time. Entities it did not reach stay dirty.
    pub timed_out: bool,
}

impl SyncSummary {
    fn record_synced(&mut self, entity_type: EntityType) {
        match entity_type {
            EntityType::Series => self.series_synced += 1,
            EntityType::Chapter => self.chapters_synced += 1,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flush {
    /// Nothing was pending.
    Empty,
    Applied(i64),
    /// The durable row is gone, so the delta was discarded.
    Dropped(i64),
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

#[derive(Clone)]
pub struct SyncJob {
    store: Arc<dyn DedupStore>,
    counts: Arc<dyn CountStore>,
}

impl SyncJob {
    pub fn new(store: Arc<dyn DedupStore>, counts: Arc<dyn CountStore>) -> Self {
        Self { store, counts }
    }

    /// Run one sync cycle over every entity type.
    pub async fn sync(&self) -> SyncSummary {
        self.run(None).await
    }

    /// Run one sync cycle that stops starting new flushes once `limit` has elapsed.
    pub async fn sync_within(&self, limit: Duration) -> SyncSummary {
        self.run(Instant::now().checked_add(limit)).await
    }

    async fn run(&self, deadline: Option<Instant>) -> SyncSummary {
        let start = Instant::now();
        let mut summary = SyncSummary::default();

        for entity_type in EntityType::ALL {
            self.sync_type(entity_type, deadline, &mut summary).await;
            if summary.timed_out {
                break;
            }
        }

        metrics::histogram!("view_sync_duration_seconds").record(start.elapsed().as_secs_f64());
        info!(
            series_synced = summary.series_synced,
            chapters_synced = summary.chapters_synced,
            entity_errors = summary.entity_errors,
            timed_out = summary.timed_out,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "sync cycle finished"
        );

        summary
    }

    async fn sync_type(
        &self,
        entity_type: EntityType,
        deadline: Option<Instant>,
        summary: &mut SyncSummary,
    ) {
        let dirty_key = keys::dirty_set_key(entity_type);
        let labels = [("entity_type", entity_type.as_str().to_owned())];

        let dirty = match self.store.set_members(&dirty_key).await {
            Ok(dirty) => dirty,
            Err(error) => {
                error!(%entity_type, %error, "failed to read dirty set, skipping this cycle");
                metrics::counter!("view_sync_entity_errors", &labels).increment(1);
                summary.entity_errors += 1;
                return;
            }
        };

        for entity_id in dirty {
            if expired(deadline) {
                summary.timed_out = true;
                return;
            }

            match self
                .flush_entity(entity_type, &entity_id, &dirty_key, deadline)
                .await
            {
                Ok(Flush::Applied(delta)) => {
                    summary.record_synced(entity_type);
                    metrics::counter!("view_sync_entities_flushed", &labels).increment(1);
                    metrics::counter!("view_sync_views_flushed", &labels).increment(delta as u64);
                }
                Ok(Flush::Dropped(delta)) => {
                    warn!(
                        %entity_type,
                        entity_id = %entity_id,
                        delta,
                        "entity no longer exists, dropped its pending views"
                    );
                }
                Ok(Flush::Empty) => {}
                Err(error) => {
                    if matches!(error, SyncError::Count(CountStoreError::Timeout)) {
                        summary.timed_out = true;
                    }
                    summary.entity_errors += 1;
                    metrics::counter!("view_sync_entity_errors", &labels).increment(1);
                    error!(
                        %entity_type,
                        entity_id = %entity_id,
                        %error,
                        "failed to flush pending views, entity stays dirty"
                    );
                }
            }
        }
    }

    async fn flush_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        dirty_key: &str,
        deadline: Option<Instant>,
    ) -> Result<Flush, SyncError> {
        let pending_key = keys::pending_counter_key(entity_type, entity_id);

        let delta = self.store.get_and_delete(&pending_key).await?;

        let flush = if delta > 0 {
            let write = self.counts.add_views(entity_type, entity_id, delta);
            let written = match deadline {
                Some(deadline) => timeout_at(deadline, write)
                    .await
                    .unwrap_or(Err(CountStoreError::Timeout)),
                None => write.await,
            };

            match written {
                Ok(()) => Flush::Applied(delta),
                Err(CountStoreError::EntityNotFound { .. }) => Flush::Dropped(delta),
                Err(count_error) => {
                    // Put the delta back so the next cycle applies it.
                    if let Err(recredit_error) =
                        self.store.increment_by(&pending_key, delta).await
                    {
                        error!(
                            %entity_type,
                            entity_id,
                            delta,
                            error = %recredit_error,
                            "failed to restore pending views after a failed flush, views were lost"
                        );
                    }
                    return Err(SyncError::Count(count_error));
                }
            }
        } else {
            if delta < 0 {
                warn!(%entity_type, entity_id, delta, "discarding negative pending counter");
            }
            Flush::Empty
        };

        self.store.remove_from_set(dirty_key, entity_id).await?;

        // A view ingested after the read-and-clear may have re-marked the entity
        // just before the removal above.
        if self.store.exists(&pending_key).await? {
            self.store.add_to_set(dirty_key, entity_id, None).await?;
        }

        Ok(flush)
    }
}
