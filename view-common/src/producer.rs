use tracing::debug;

use crate::event::{ViewEvent, ViewJobParameters};
use crate::pgqueue::{NewJob, PgQueue, PgQueueResult};

/// One-way handle request handlers use to report a view. Sending only
/// guarantees the event is durably queued; counting happens later in a worker.
#[derive(Clone)]
pub struct ViewEventProducer {
    queue: PgQueue,
    max_attempts: i32,
}

impl ViewEventProducer {
    pub fn new(queue: PgQueue, max_attempts: i32) -> Self {
        Self {
            queue,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn send(&self, event: &ViewEvent) -> PgQueueResult<()> {
        let job: NewJob<ViewJobParameters> = NewJob::new(self.max_attempts, event.to_parameters());
        self.queue.enqueue(job).await?;

        debug!(
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            queue = self.queue.name(),
            "view event enqueued"
        );
        Ok(())
    }
}
