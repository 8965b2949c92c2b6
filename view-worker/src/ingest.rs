//! Deduplicate a single view and, when it is novel, record it as pending.
use std::sync::Arc;

use tracing::{debug, warn};
use view_common::config::DedupWindow;
use view_common::event::ViewEvent;
use view_common::keys;
use view_common::store::{DedupStore, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewOutcome {
    /// First view by this fingerprint within the window. One pending view was added.
    Counted,
    /// The fingerprint already viewed the entity within the window.
    NotCounted,
}

#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn DedupStore>,
    dedup_window: DedupWindow,
}

impl Ingestor {
    pub fn new(store: Arc<dyn DedupStore>, dedup_window: DedupWindow) -> Self {
        Self {
            store,
            dedup_window,
        }
    }

    /// Ingest one view event.
    ///
    /// The add to the recent-viewer set is the membership check, so concurrent
    /// ingestions of the same fingerprint see exactly one novel add. The pending
    /// counter is incremented only after that, and the entity is marked dirty only
    /// after the increment.
    ///
    /// A duplicate re-marks the entity dirty while anything is pending for it. An
    /// earlier delivery of the same event may have incremented the counter and then
    /// failed before the dirty mark, and a rolled back dequeue does not even bump the
    /// job's attempt, so this cannot be limited to retries.
    pub async fn ingest(&self, event: &ViewEvent) -> StoreResult<ViewOutcome> {
        let recent_key = keys::recent_viewers_key(event.entity_type, &event.entity_id);
        let pending_key = keys::pending_counter_key(event.entity_type, &event.entity_id);
        let dirty_key = keys::dirty_set_key(event.entity_type);

        let novel = self
            .store
            .add_to_set(
                &recent_key,
                &event.fingerprint,
                Some(self.dedup_window.as_duration()),
            )
            .await?;

        if !novel {
            if self.store.exists(&pending_key).await? {
                self.store
                    .add_to_set(&dirty_key, &event.entity_id, None)
                    .await?;
            }
            debug!(
                entity_type = %event.entity_type,
                entity_id = %event.entity_id,
                "view already counted within dedup window"
            );
            return Ok(ViewOutcome::NotCounted);
        }

        if let Err(error) = self.store.increment_by(&pending_key, 1).await {
            // Forget the fingerprint so the retried event is counted instead of deduplicated.
            if let Err(remove_error) = self
                .store
                .remove_from_set(&recent_key, &event.fingerprint)
                .await
            {
                warn!(
                    entity_type = %event.entity_type,
                    entity_id = %event.entity_id,
                    error = %remove_error,
                    "failed to forget fingerprint after increment failure, view may be undercounted"
                );
            }
            return Err(error);
        }

        self.store
            .add_to_set(&dirty_key, &event.entity_id, None)
            .await?;

        debug!(
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            "view counted"
        );
        Ok(ViewOutcome::Counted)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;
    use view_common::event::EntityType;
    use view_common::store::MemoryDedupStore;

    use super::*;

    fn ingestor(store: &MemoryDedupStore, window: Duration) -> Ingestor {
        Ingestor::new(Arc::new(store.clone()), DedupWindow(window))
    }

    #[tokio::test]
    async fn test_repeat_views_count_once() {
        let store = MemoryDedupStore::new();
        let ingestor = ingestor(&store, Duration::from_secs(60));
        let event = ViewEvent::new(EntityType::Chapter, "ch-1", "user:42");

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(ingestor.ingest(&event).await.unwrap());
        }

        assert_eq!(
            outcomes,
            vec![
                ViewOutcome::Counted,
                ViewOutcome::NotCounted,
                ViewOutcome::NotCounted
            ]
        );
        assert_eq!(store.peek_counter("views:pending:chapter:ch-1"), 1);
        assert_eq!(
            store.set_members("views:dirty:chapters").await.unwrap(),
            vec!["ch-1"]
        );
    }

    #[tokio::test]
    async fn test_distinct_viewers_each_count() {
        let store = MemoryDedupStore::new();
        let ingestor = ingestor(&store, Duration::from_secs(60));

        for fingerprint in ["user:1", "anon:10.0.0.1:abc123"] {
            let event = ViewEvent::new(EntityType::Series, "s-9", fingerprint);
            assert_eq!(
                ingestor.ingest(&event).await.unwrap(),
                ViewOutcome::Counted
            );
        }

        assert_eq!(store.peek_counter("views:pending:series:s-9"), 2);
    }

    #[tokio::test]
    async fn test_expired_window_counts_again() {
        let store = MemoryDedupStore::new();
        let ingestor = ingestor(&store, Duration::ZERO);
        let event = ViewEvent::new(EntityType::Chapter, "ch-1", "user:42");

        assert_eq!(
            ingestor.ingest(&event).await.unwrap(),
            ViewOutcome::Counted
        );
        assert_eq!(
            ingestor.ingest(&event).await.unwrap(),
            ViewOutcome::Counted
        );
        assert_eq!(store.peek_counter("views:pending:chapter:ch-1"), 2);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_count_once() {
        let store = MemoryDedupStore::new();
        let ingestor = ingestor(&store, Duration::from_secs(60));
        let event = ViewEvent::new(EntityType::Series, "s-1", "user:7");

        let outcomes = join_all((0..16).map(|_| ingestor.ingest(&event))).await;
        let counted = outcomes
            .into_iter()
            .filter(|outcome| matches!(outcome, Ok(ViewOutcome::Counted)))
            .count();

        assert_eq!(counted, 1);
        assert_eq!(store.peek_counter("views:pending:series:s-1"), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_is_an_error() {
        let store = MemoryDedupStore::new();
        let ingestor = ingestor(&store, Duration::from_secs(60));
        store.set_unavailable(true);

        let event = ViewEvent::new(EntityType::Series, "s-1", "user:7");
        assert!(ingestor.ingest(&event).await.is_err());

        store.set_unavailable(false);
        assert_eq!(
            ingestor.ingest(&event).await.unwrap(),
            ViewOutcome::Counted
        );
    }

    #[tokio::test]
    async fn test_duplicate_restores_dirty_mark() {
        let store = MemoryDedupStore::new();
        let ingestor = ingestor(&store, Duration::from_secs(60));
        let event = ViewEvent::new(EntityType::Chapter, "ch-2", "user:3");

        ingestor.ingest(&event).await.unwrap();
        // As if the first delivery had crashed right before marking the entity dirty,
        // with its dequeue rolled back so the event comes back on its first attempt.
        store
            .remove_from_set("views:dirty:chapters", "ch-2")
            .await
            .unwrap();

        assert_eq!(
            ingestor.ingest(&event).await.unwrap(),
            ViewOutcome::NotCounted
        );
        assert_eq!(
            store.set_members("views:dirty:chapters").await.unwrap(),
            vec!["ch-2"]
        );
        assert_eq!(store.peek_counter("views:pending:chapter:ch-2"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_without_pending_views_stays_clean() {
        let store = MemoryDedupStore::new();
        let ingestor = ingestor(&store, Duration::from_secs(60));
        let event = ViewEvent::new(EntityType::Series, "s-4", "user:8");

        ingestor.ingest(&event).await.unwrap();
        store.get_and_delete("views:pending:series:s-4").await.unwrap();
        store
            .remove_from_set("views:dirty:series", "s-4")
            .await
            .unwrap();

        assert_eq!(
            ingestor.ingest(&event).await.unwrap(),
            ViewOutcome::NotCounted
        );
        assert!(store
            .set_members("views:dirty:series")
            .await
            .unwrap()
            .is_empty());
    }
}
