use std::future::Future;
use std::sync::Arc;
use std::time;

use futures::future::join_all;
use health::HealthHandle;
use serde_json::Value;
use tokio::sync;
use tracing::{error, warn};

use view_common::event::ViewEvent;
use view_common::pgqueue::{
    Job, PgQueue, PgQueueJob, PgTransactionBatch, PgTransactionJob, RetryError, RetryInvalidError,
};
use view_common::retry::RetryPolicy;

use crate::error::{IngestError, WorkerError};
use crate::ingest::{Ingestor, ViewOutcome};

/// A `PgQueueJob` carrying a raw view event payload.
trait ViewJob: PgQueueJob + Send {
    fn job(&self) -> &Job<Value>;

    fn attempt(&self) -> i32 {
        self.job().attempt
    }

    fn queue(&self) -> String {
        self.job().queue.to_owned()
    }
}

impl ViewJob for PgTransactionJob<'_, Value> {
    fn job(&self) -> &Job<Value> {
        &self.job
    }
}

/// How a dequeued job was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Ingested(ViewOutcome),
    Retried,
    Failed,
    Malformed,
}

/// Polls the view event queue and ingests every event it dequeues.
pub struct IngestionWorker<'p> {
    /// Identifies this worker in the `attempted_by` column of jobs.
    name: String,
    queue: &'p PgQueue,
    dequeue_batch_size: u32,
    poll_interval: time::Duration,
    max_concurrent_jobs: usize,
    retry_policy: RetryPolicy,
    ingestor: Ingestor,
    liveness: HealthHandle,
}

impl<'p> IngestionWorker<'p> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: &'p PgQueue,
        dequeue_batch_size: u32,
        poll_interval: time::Duration,
        max_concurrent_jobs: usize,
        retry_policy: RetryPolicy,
        ingestor: Ingestor,
        liveness: HealthHandle,
    ) -> Self {
        let max_concurrent_jobs = max_concurrent_jobs.max(1);
        // Every job of a batch holds a permit, so a batch never exceeds the pool.
        let dequeue_batch_size =
            dequeue_batch_size.clamp(1, u32::try_from(max_concurrent_jobs).unwrap_or(u32::MAX));

        Self {
            name: name.to_owned(),
            queue,
            dequeue_batch_size,
            poll_interval,
            max_concurrent_jobs,
            retry_policy,
            ingestor,
            liveness,
        }
    }

    /// Wait until at least one job becomes available in our queue.
    async fn wait_for_jobs_tx<'a>(&self) -> PgTransactionBatch<'a, Value> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            match self
                .queue
                .dequeue_tx(&self.name, self.dequeue_batch_size)
                .await
            {
                Ok(Some(batch)) => return batch,
                Ok(None) => continue,
                Err(error) => {
                    metrics::counter!("view_jobs_database_error").increment(1);
                    error!("error while trying to dequeue_tx job: {}", error);
                    continue;
                }
            }
        }
    }

    /// Process batches until `shutdown` resolves, then wait for the batches in flight.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) {
        let semaphore = Arc::new(sync::Semaphore::new(self.max_concurrent_jobs));
        let report_semaphore_utilization = || {
            metrics::gauge!("view_worker_saturation_percent").set(
                1f64 - semaphore.available_permits() as f64 / self.max_concurrent_jobs as f64,
            );
        };
        let dequeue_batch_size_histogram = metrics::histogram!("view_dequeue_batch_size");
        tokio::pin!(shutdown);

        loop {
            report_semaphore_utilization();

            let batch = tokio::select! {
                _ = &mut shutdown => break,
                batch = self.wait_for_jobs_tx() => batch,
            };
            dequeue_batch_size_histogram.record(batch.jobs.len() as f64);

            // Get enough permits for the jobs before spawning a task.
            let Ok(permits) = semaphore
                .clone()
                .acquire_many_owned(batch.jobs.len() as u32)
                .await
            else {
                error!("job semaphore closed, stopping worker");
                break;
            };

            let ingestor = self.ingestor.clone();
            let retry_policy = self.retry_policy.clone();

            tokio::spawn(async move {
                // Released when the batch is committed.
                let _permits = permits;
                process_batch(batch, ingestor, retry_policy).await;
            });
        }

        // Every permit back means every spawned batch has finished.
        if semaphore
            .acquire_many(self.max_concurrent_jobs as u32)
            .await
            .is_err()
        {
            warn!("job semaphore closed while draining in-flight batches");
        }
        report_semaphore_utilization();
    }
}

async fn process_batch(
    mut batch: PgTransactionBatch<'_, Value>,
    ingestor: Ingestor,
    retry_policy: RetryPolicy,
) -> Vec<Result<JobOutcome, WorkerError>> {
    let futures: Vec<_> = std::mem::take(&mut batch.jobs)
        .into_iter()
        .map(|job| process_view_job(job, &ingestor, &retry_policy))
        .collect();

    let results = join_all(futures).await;

    for result in &results {
        if let Err(error) = result {
            error!("error processing view job: {}", error);
        }
    }

    if let Err(error) = batch.commit().await {
        metrics::counter!("view_jobs_database_error").increment(1);
        error!("error committing transactional batch: {}", error);
    }

    results
}

/// Resolve one job: completed when ingested, failed when malformed or out of attempts,
/// re-scheduled with backoff when the dedup store failed and attempts remain.
async fn process_view_job<W: ViewJob>(
    view_job: W,
    ingestor: &Ingestor,
    retry_policy: &RetryPolicy,
) -> Result<JobOutcome, WorkerError> {
    let labels = [("queue", view_job.queue())];
    metrics::counter!("view_jobs_total", &labels).increment(1);

    let parsed = ViewEvent::from_payload(&view_job.job().parameters.0);
    let result = match parsed {
        Ok(event) => ingestor
            .ingest(&event)
            .await
            .map_err(IngestError::from),
        Err(error) => Err(IngestError::from(error)),
    };

    let error = match result {
        Ok(outcome) => {
            view_job.complete().await.inspect_err(|_| {
                metrics::counter!("view_jobs_database_error", &labels).increment(1)
            })?;

            match outcome {
                ViewOutcome::Counted => {
                    metrics::counter!("view_jobs_counted", &labels).increment(1)
                }
                ViewOutcome::NotCounted => {
                    metrics::counter!("view_jobs_not_counted", &labels).increment(1)
                }
            }
            return Ok(JobOutcome::Ingested(outcome));
        }
        Err(error) => error,
    };

    if !error.is_retryable() {
        warn!(job_id = view_job.job().id, %error, "discarding view job that can never succeed");
        view_job.fail(error.to_job_error()).await.inspect_err(|_| {
            metrics::counter!("view_jobs_database_error", &labels).increment(1)
        })?;

        return match error {
            IngestError::Parse(_) => {
                metrics::counter!("view_jobs_malformed", &labels).increment(1);
                Ok(JobOutcome::Malformed)
            }
            IngestError::Store(_) => {
                metrics::counter!("view_jobs_failed", &labels).increment(1);
                Ok(JobOutcome::Failed)
            }
        };
    }

    let retry_interval = retry_policy.retry_interval(view_job.attempt() as u32);
    let current_queue = view_job.queue();
    let retry_queue = retry_policy.retry_queue(&current_queue);

    match view_job
        .retry(error.to_job_error(), retry_interval, retry_queue)
        .await
    {
        Ok(_) => {
            metrics::counter!("view_jobs_retried", &labels).increment(1);
            Ok(JobOutcome::Retried)
        }
        Err(RetryError::RetryInvalidError(RetryInvalidError { job: view_job, .. })) => {
            error!(job_id = view_job.job().id, %error, "view job ran out of attempts");
            view_job.fail(error.to_job_error()).await.inspect_err(|_| {
                metrics::counter!("view_jobs_database_error", &labels).increment(1)
            })?;

            metrics::counter!("view_jobs_failed", &labels).increment(1);
            Ok(JobOutcome::Failed)
        }
        Err(RetryError::DatabaseError(job_error)) => {
            metrics::counter!("view_jobs_database_error", &labels).increment(1);
            Err(WorkerError::from(job_error))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use health::HealthRegistry;
    use serde_json::json;
    use sqlx::PgPool;
    use view_common::config::DedupWindow;
    use view_common::event::EntityType;
    use view_common::pgqueue::{JobStatus, NewJob};
    use view_common::producer::ViewEventProducer;
    use view_common::store::MemoryDedupStore;

    use super::*;

    fn worker_id() -> String {
        std::process::id().to_string()
    }

    fn ingestor(store: &MemoryDedupStore) -> Ingestor {
        Ingestor::new(Arc::new(store.clone()), DedupWindow(Duration::from_secs(60)))
    }

    async fn dequeue_one<'a>(
        queue: &PgQueue,
    ) -> (PgTransactionBatch<'a, Value>, PgTransactionJob<'a, Value>) {
        let mut batch: PgTransactionBatch<'a, Value> = queue
            .dequeue_tx(&worker_id(), 1)
            .await
            .expect("failed to dequeue jobs")
            .expect("didn't find a job to dequeue");
        let job = batch.jobs.pop().unwrap();
        (batch, job)
    }

    async fn job_states(db: &PgPool, queue: &str) -> Vec<(JobStatus, i32)> {
        sqlx::query_as("SELECT status, attempt FROM job_queue WHERE queue = $1 ORDER BY id")
            .bind(queue)
            .fetch_all(db)
            .await
            .expect("failed to read jobs")
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_wait_for_job(db: PgPool) {
        let queue = PgQueue::new_from_pool("test_wait_for_job", db);
        let producer = ViewEventProducer::new(queue.clone(), 1);
        producer
            .send(&ViewEvent::new(EntityType::Chapter, "ch-1", "user:42"))
            .await
            .expect("failed to enqueue job");

        let registry = HealthRegistry::new("liveness");
        let liveness = registry.register("worker", Duration::from_secs(30)).await;
        let worker = IngestionWorker::new(
            &worker_id(),
            &queue,
            1,
            Duration::from_millis(100),
            10,
            RetryPolicy::default(),
            ingestor(&MemoryDedupStore::new()),
            liveness,
        );

        let mut batch = worker.wait_for_jobs_tx().await;
        let consumed_job = batch.jobs.pop().unwrap();

        assert_eq!(consumed_job.job.attempt, 1);
        assert_eq!(consumed_job.job.attempted_by, vec![worker_id()]);
        assert_eq!(consumed_job.job.parameters.0["id"], "ch-1");

        consumed_job
            .complete()
            .await
            .expect("job not successfully completed");
        batch.commit().await.expect("failed to commit batch");

        assert!(registry.get_status().healthy);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_repeat_views_complete_and_count_once(db: PgPool) {
        let queue_name = "test_repeat_views_complete_and_count_once";
        let queue = PgQueue::new_from_pool(queue_name, db.clone());
        let producer = ViewEventProducer::new(queue.clone(), 3);
        for _ in 0..3 {
            producer
                .send(&ViewEvent::new(EntityType::Chapter, "ch-1", "user:42"))
                .await
                .expect("failed to enqueue job");
        }
        let store = MemoryDedupStore::new();

        let batch: PgTransactionBatch<'_, Value> = queue
            .dequeue_tx(&worker_id(), 10)
            .await
            .expect("failed to dequeue jobs")
            .expect("didn't find jobs to dequeue");
        let results = process_batch(batch, ingestor(&store), RetryPolicy::default()).await;

        let mut outcomes: Vec<JobOutcome> = results.into_iter().map(Result::unwrap).collect();
        outcomes.sort_by_key(|outcome| *outcome != JobOutcome::Ingested(ViewOutcome::Counted));
        assert_eq!(
            outcomes,
            vec![
                JobOutcome::Ingested(ViewOutcome::Counted),
                JobOutcome::Ingested(ViewOutcome::NotCounted),
                JobOutcome::Ingested(ViewOutcome::NotCounted),
            ]
        );
        assert_eq!(store.peek_counter("views:pending:chapter:ch-1"), 1);
        assert_eq!(
            job_states(&db, queue_name).await,
            vec![(JobStatus::Completed, 1); 3]
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_malformed_event_is_failed_without_retry(db: PgPool) {
        let queue_name = "test_malformed_event_is_failed_without_retry";
        let queue = PgQueue::new_from_pool(queue_name, db.clone());
        queue
            .enqueue(NewJob::new(5, json!({"type": "episode", "id": "e-1"})))
            .await
            .expect("failed to enqueue job");

        let (batch, job) = dequeue_one(&queue).await;
        let outcome = process_view_job(
            job,
            &ingestor(&MemoryDedupStore::new()),
            &RetryPolicy::default(),
        )
        .await
        .expect("failed to process job");
        batch.commit().await.expect("failed to commit batch");

        assert_eq!(outcome, JobOutcome::Malformed);
        assert_eq!(
            job_states(&db, queue_name).await,
            vec![(JobStatus::Failed, 1)]
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_store_failure_is_retried_then_failed(db: PgPool) {
        let queue_name = "test_store_failure_is_retried_then_failed";
        let queue = PgQueue::new_from_pool(queue_name, db.clone());
        ViewEventProducer::new(queue.clone(), 2)
            .send(&ViewEvent::new(EntityType::Series, "s-1", "user:1"))
            .await
            .expect("failed to enqueue job");

        let store = MemoryDedupStore::new();
        store.set_unavailable(true);
        let retry_policy = RetryPolicy::build(1, Duration::ZERO).provide();

        let (batch, job) = dequeue_one(&queue).await;
        let outcome = process_view_job(job, &ingestor(&store), &retry_policy)
            .await
            .expect("failed to process job");
        batch.commit().await.expect("failed to commit batch");
        assert_eq!(outcome, JobOutcome::Retried);
        assert_eq!(
            job_states(&db, queue_name).await,
            vec![(JobStatus::Available, 1)]
        );

        let (batch, job) = dequeue_one(&queue).await;
        let outcome = process_view_job(job, &ingestor(&store), &retry_policy)
            .await
            .expect("failed to process job");
        batch.commit().await.expect("failed to commit batch");
        assert_eq!(outcome, JobOutcome::Failed);
        assert_eq!(
            job_states(&db, queue_name).await,
            vec![(JobStatus::Failed, 2)]
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_retried_event_is_counted_after_recovery(db: PgPool) {
        let queue_name = "test_retried_event_is_counted_after_recovery";
        let queue = PgQueue::new_from_pool(queue_name, db.clone());
        ViewEventProducer::new(queue.clone(), 3)
            .send(&ViewEvent::new(EntityType::Series, "s-1", "user:1"))
            .await
            .expect("failed to enqueue job");

        let store = MemoryDedupStore::new();
        let retry_policy = RetryPolicy::build(1, Duration::ZERO).provide();

        store.set_unavailable(true);
        let (batch, job) = dequeue_one(&queue).await;
        process_view_job(job, &ingestor(&store), &retry_policy)
            .await
            .expect("failed to process job");
        batch.commit().await.expect("failed to commit batch");

        store.set_unavailable(false);
        let (batch, job) = dequeue_one(&queue).await;
        let outcome = process_view_job(job, &ingestor(&store), &retry_policy)
            .await
            .expect("failed to process job");
        batch.commit().await.expect("failed to commit batch");

        assert_eq!(outcome, JobOutcome::Ingested(ViewOutcome::Counted));
        assert_eq!(store.peek_counter("views:pending:series:s-1"), 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_run_until_drains_queue_and_stops(db: PgPool) {
        let queue_name = "test_run_until_drains_queue_and_stops";
        let queue = PgQueue::new_from_pool(queue_name, db.clone());
        let producer = ViewEventProducer::new(queue.clone(), 1);
        for viewer in 0..25 {
            producer
                .send(&ViewEvent::new(
                    EntityType::Series,
                    "s-9",
                    &format!("user:{viewer}"),
                ))
                .await
                .expect("failed to enqueue job");
        }

        let store = MemoryDedupStore::new();
        let registry = HealthRegistry::new("liveness");
        let worker = IngestionWorker::new(
            &worker_id(),
            &queue,
            10,
            Duration::from_millis(10),
            4,
            RetryPolicy::default(),
            ingestor(&store),
            registry.register("worker", Duration::from_secs(30)).await,
        );

        let counted = store.clone();
        worker
            .run_until(async move {
                while counted.peek_counter("views:pending:series:s-9") < 25 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;

        assert_eq!(store.peek_counter("views:pending:series:s-9"), 25);
        assert!(job_states(&db, queue_name)
            .await
            .iter()
            .all(|(status, _)| *status == JobStatus::Completed));
    }
}
