use std::future::Future;
use std::time;

use health::HealthHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::sync::{SyncJob, SyncSummary};

/// Runs `SyncJob::sync` on a fixed interval, one cycle at a time, and once more on shutdown.
pub struct SyncScheduler {
    job: SyncJob,
    interval: time::Duration,
    cycle_timeout: time::Duration,
    shutdown_timeout: time::Duration,
    liveness: HealthHandle,
}

impl SyncScheduler {
    pub fn new(
        job: SyncJob,
        interval: time::Duration,
        cycle_timeout: time::Duration,
        shutdown_timeout: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            job,
            interval,
            cycle_timeout,
            shutdown_timeout,
            liveness,
        }
    }

    /// Run cycles until `shutdown` resolves. A cycle in progress is finished, or stopped
    /// at its time limit, before returning. The first cycle starts immediately, picking
    /// up anything left pending by a previous process.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.liveness.report_healthy().await;
                    self.run_cycle(self.cycle_timeout).await;
                }
            }
        }
    }

    /// Flush everything still pending before the process exits, bounded by the shutdown timeout.
    pub async fn final_sync(&self) -> SyncSummary {
        info!("running final sync before shutdown");
        self.run_cycle(self.shutdown_timeout).await
    }

    async fn run_cycle(&self, limit: time::Duration) -> SyncSummary {
        metrics::counter!("view_sync_cycles_total").increment(1);

        let summary = self.job.sync_within(limit).await;
        if summary.timed_out {
            metrics::counter!("view_sync_cycle_timeouts").increment(1);
            error!(
                timeout_ms = limit.as_millis() as u64,
                "sync cycle timed out, remaining entities stay dirty"
            );
        }
        summary
    }
}
