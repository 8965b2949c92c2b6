//! # PgQueue
//!
//! The event queue carrying view events from request handlers to ingestion workers.
//! Jobs live in the `job_queue` table; several named queues may share it.
//!
//! Delivery is at-least-once: a dequeued batch holds its rows locked inside one
//! transaction, and other consumers skip those rows until the batch commits or
//! rolls back.
use std::str::FromStr;
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from the database underneath a `PgQueue`, with the command that caused them.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction was already closed")]
    TransactionAlreadyClosedError,
}

/// Returned when a job has no attempts left. Hands the job back so the caller can fail it.
#[derive(Error, Debug)]
#[error("job cannot be retried: {error}")]
pub struct RetryInvalidError<T> {
    pub job: T,
    pub error: String,
}

#[derive(Error, Debug)]
pub enum RetryError<T> {
    #[error(transparent)]
    DatabaseError(#[from] DatabaseError),
    #[error(transparent)]
    RetryInvalidError(#[from] RetryInvalidError<T>),
}

pub type PgQueueResult<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "job_status")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be picked up, possibly scheduled in the future after a retry.
    Available,
    Completed,
    /// Out of attempts, or never processable in the first place.
    Failed,
}

/// A row of `job_queue` as seen by the consumer that locked it.
#[derive(sqlx::FromRow, Debug)]
pub struct Job<J> {
    pub id: i64,
    /// 1-based number of the attempt in progress.
    pub attempt: i32,
    pub attempted_at: DateTime<Utc>,
    /// Every consumer that has attempted this job, oldest first.
    pub attempted_by: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub max_attempts: i32,
    pub parameters: Json<J>,
    pub queue: String,
    pub status: JobStatus,
}

impl<J> Job<J> {
    pub fn is_gte_max_attempts(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A job to be inserted with `PgQueue::enqueue`.
#[derive(Debug)]
pub struct NewJob<J> {
    pub max_attempts: i32,
    pub parameters: Json<J>,
}

impl<J> NewJob<J> {
    pub fn new(max_attempts: i32, parameters: J) -> Self {
        Self {
            max_attempts,
            parameters: Json(parameters),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct CompletedJob {
    pub id: i64,
    pub queue: String,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RetriedJob {
    pub id: i64,
    pub queue: String,
    pub retry_queue: String,
    pub retry_interval: time::Duration,
}

#[derive(Debug)]
pub struct FailedJob<E> {
    pub id: i64,
    pub error: Json<E>,
    pub queue: String,
}

/// Final transitions of a dequeued job. Each consumes the job, so a job is resolved exactly once.
#[async_trait]
pub trait PgQueueJob {
    async fn complete(self) -> Result<CompletedJob, DatabaseError>;

    async fn fail<E: Serialize + Sync + Send>(
        self,
        error: E,
    ) -> Result<FailedJob<E>, DatabaseError>;

    /// Make the job available again in `queue` after `retry_interval`.
    /// Fails with `RetryInvalidError` when the job has used all its attempts.
    async fn retry<E: Serialize + Sync + Send>(
        self,
        error: E,
        retry_interval: time::Duration,
        queue: &str,
    ) -> Result<RetriedJob, RetryError<Box<Self>>>;
}

type SharedTransaction<'c> = Arc<Mutex<Option<Transaction<'c, Postgres>>>>;

/// A job whose row stays locked by the transaction it was dequeued in.
#[derive(Debug)]
pub struct PgTransactionJob<'c, J> {
    pub job: Job<J>,
    /// Shared with every other job of the same batch.
    shared_txn: SharedTransaction<'c>,
}

/// Jobs dequeued together. Their updates become visible when the batch is committed.
pub struct PgTransactionBatch<'c, J> {
    pub jobs: Vec<PgTransactionJob<'c, J>>,
    shared_txn: SharedTransaction<'c>,
}

impl<J> PgTransactionBatch<'_, J> {
    pub async fn commit(self) -> PgQueueResult<()> {
        let mut txn_guard = self.shared_txn.lock().await;

        let Some(txn) = txn_guard.take() else {
            return Err(DatabaseError::TransactionAlreadyClosedError);
        };

        txn.commit()
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "COMMIT".to_owned(),
                error,
            })
    }
}

async fn execute_in<'c>(
    shared_txn: &SharedTransaction<'c>,
    command: &str,
    query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
) -> PgQueueResult<()> {
    let mut txn_guard = shared_txn.lock().await;

    let txn = txn_guard
        .as_deref_mut()
        .ok_or(DatabaseError::TransactionAlreadyClosedError)?;

    query
        .execute(txn)
        .await
        .map_err(|error| DatabaseError::QueryError {
            command: command.to_owned(),
            error,
        })?;

    Ok(())
}

#[async_trait]
impl<'c, J: Send> PgQueueJob for PgTransactionJob<'c, J> {
    async fn complete(self) -> Result<CompletedJob, DatabaseError> {
        let query = sqlx::query(
            r#"
UPDATE
    job_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'completed'::job_status
WHERE
    queue = $1
    AND id = $2
            "#,
        )
        .bind(&self.job.queue)
        .bind(self.job.id);

        execute_in(&self.shared_txn, "UPDATE", query).await?;

        Ok(CompletedJob {
            id: self.job.id,
            queue: self.job.queue,
        })
    }

    async fn fail<E: Serialize + Sync + Send>(
        self,
        error: E,
    ) -> Result<FailedJob<E>, DatabaseError> {
        let error = Json(error);
        let query = sqlx::query(
            r#"
UPDATE
    job_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'failed'::job_status,
    errors = array_append(errors, $3)
WHERE
    queue = $1
    AND id = $2
            "#,
        )
        .bind(&self.job.queue)
        .bind(self.job.id)
        .bind(&error);

        execute_in(&self.shared_txn, "UPDATE", query).await?;

        Ok(FailedJob {
            id: self.job.id,
            error,
            queue: self.job.queue,
        })
    }

    async fn retry<E: Serialize + Sync + Send>(
        self,
        error: E,
        retry_interval: time::Duration,
        queue: &str,
    ) -> Result<RetriedJob, RetryError<Box<Self>>> {
        if self.job.is_gte_max_attempts() {
            return Err(RetryError::from(RetryInvalidError {
                job: Box::new(self),
                error: "maximum attempts reached".to_owned(),
            }));
        }

        let error = Json(error);
        let query = sqlx::query(
            r#"
UPDATE
    job_queue
SET
    last_attempt_finished_at = NOW(),
    status = 'available'::job_status,
    scheduled_at = NOW() + $3,
    errors = array_append(errors, $4),
    queue = $5
WHERE
    queue = $1
    AND id = $2
            "#,
        )
        .bind(&self.job.queue)
        .bind(self.job.id)
        .bind(retry_interval)
        .bind(&error)
        .bind(queue);

        execute_in(&self.shared_txn, "UPDATE", query).await?;

        Ok(RetriedJob {
            id: self.job.id,
            queue: self.job.queue,
            retry_queue: queue.to_owned(),
            retry_interval,
        })
    }
}

/// A named queue in the `job_queue` table.
#[derive(Clone)]
pub struct PgQueue {
    name: String,
    pool: PgPool,
}

impl PgQueue {
    /// Create a queue with its own lazily connecting pool.
    ///
    /// # Arguments
    ///
    /// * `queue_name`: Name of the queue, stored in the `queue` column of every job.
    /// * `url`: A Postgres connection string.
    /// * `max_connections`: Size of the pool.
    /// * `app_name`: Reported to Postgres as `application_name`.
    pub fn new(
        queue_name: &str,
        url: &str,
        max_connections: u32,
        app_name: &'static str,
    ) -> PgQueueResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| DatabaseError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self {
            name: queue_name.to_owned(),
            pool,
        })
    }

    pub fn new_from_pool(queue_name: &str, pool: PgPool) -> Self {
        Self {
            name: queue_name.to_owned(),
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock up to `limit` available jobs and start their next attempt.
    ///
    /// Returns `None` when nothing is available. Otherwise every job of the batch must be
    /// completed, failed or retried before the batch is committed; dropping the batch
    /// rolls it back and the jobs become available again.
    pub async fn dequeue_tx<'a, J>(
        &self,
        attempted_by: &str,
        limit: u32,
    ) -> PgQueueResult<Option<PgTransactionBatch<'a, J>>>
    where
        J: DeserializeOwned + Send + Unpin + 'static,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| DatabaseError::ConnectionError { error })?;

        let query = r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        job_queue
    WHERE
        status = 'available'
        AND scheduled_at <= NOW()
        AND queue = $1
    ORDER BY
        attempt,
        scheduled_at
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
UPDATE
    job_queue
SET
    attempted_at = NOW(),
    attempt = attempt + 1,
    attempted_by = array_append(attempted_by, $3::text)
FROM
    available_in_queue
WHERE
    job_queue.id = available_in_queue.id
RETURNING
    job_queue.*
        "#;

        let jobs: Vec<Job<J>> = match sqlx::query_as(query)
            .bind(&self.name)
            .bind(i64::from(limit))
            .bind(attempted_by)
            .fetch_all(&mut *tx)
            .await
        {
            Ok(jobs) => jobs,
            Err(sqlx::Error::RowNotFound) => return Ok(None),
            Err(error) => {
                return Err(DatabaseError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })
            }
        };

        if jobs.is_empty() {
            return Ok(None);
        }

        let shared_txn = Arc::new(Mutex::new(Some(tx)));
        let jobs = jobs
            .into_iter()
            .map(|job| PgTransactionJob {
                job,
                shared_txn: shared_txn.clone(),
            })
            .collect();

        Ok(Some(PgTransactionBatch { jobs, shared_txn }))
    }

    /// Insert a job, available immediately.
    pub async fn enqueue<J: Serialize + Sync>(&self, job: NewJob<J>) -> PgQueueResult<()> {
        sqlx::query(
            r#"
INSERT INTO job_queue
    (attempt, created_at, scheduled_at, max_attempts, parameters, queue, status)
VALUES
    (0, NOW(), NOW(), $1, $2, $3, 'available'::job_status)
            "#,
        )
        .bind(job.max_attempts)
        .bind(&job.parameters)
        .bind(&self.name)
        .execute(&self.pool)
        .await
        .map_err(|error| DatabaseError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(())
    }
}
