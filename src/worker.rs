use std::future::Future;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::{self, AggregateInput};
use crate::models::{RefreshTask, ResultRecord, Snapshot, TrustStatus};
use crate::queue::{self, DrainReport, FailureDisposition};
use crate::store::{RefreshQueue, SnapshotStore, SourceRecords};

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("scholar {0} has no cohort assignment")]
    MissingCohort(Uuid),
    #[error("refresh of cohort {cohort} produced no snapshot for scholar {scholar_id}")]
    NotInCohort { scholar_id: Uuid, cohort: String },
}

/// Recomputes and commits every member of a cohort, using the whole cohort as
/// the peer group.
pub async fn refresh_cohort(
    source: &dyn SourceRecords,
    snapshots: &dyn SnapshotStore,
    cohort: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<Snapshot>> {
    let started = Instant::now();
    let records = source
        .cohort_records(cohort)
        .await
        .with_context(|| format!("failed to load records for cohort {cohort}"))?;

    let cohort_results: Vec<ResultRecord> = records
        .members
        .iter()
        .flat_map(|member| member.results.iter().cloned())
        .collect();

    let mut committed = Vec::with_capacity(records.members.len());
    for member in &records.members {
        let metrics = aggregate::build_metrics(AggregateInput {
            scholar_results: &member.results,
            cohort_results: &cohort_results,
            attendance: &member.attendance,
            assignment_total: records.assignment_total,
        });
        let snapshot = snapshots
            .commit(member.scholar_id, &metrics, now)
            .await
            .with_context(|| format!("failed to commit snapshot for {}", member.scholar_id))?;
        committed.push(snapshot);
    }

    debug!(
        cohort,
        members = committed.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "cohort snapshots refreshed"
    );
    Ok(committed)
}

pub async fn refresh_scholar(
    source: &dyn SourceRecords,
    snapshots: &dyn SnapshotStore,
    scholar_id: Uuid,
    now: DateTime<Utc>,
) -> anyhow::Result<Snapshot> {
    let cohort = source
        .cohort_of(scholar_id)
        .await?
        .ok_or(RefreshError::MissingCohort(scholar_id))?;

    let committed = refresh_cohort(source, snapshots, &cohort, now).await?;
    committed
        .into_iter()
        .find(|snapshot| snapshot.scholar_id == scholar_id)
        .ok_or_else(|| RefreshError::NotInCohort { scholar_id, cohort }.into())
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub poll_interval: StdDuration,
    pub claim_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            poll_interval: StdDuration::from_secs(5),
            claim_timeout: Duration::seconds(queue::CLAIM_TIMEOUT_SECONDS),
        }
    }
}

/// Drains the refresh queue. Any number of workers may share one queue; the
/// conditional claim keeps them from processing the same task twice.
#[derive(Clone)]
pub struct RefreshWorker {
    source: Arc<dyn SourceRecords>,
    snapshots: Arc<dyn SnapshotStore>,
    queue: Arc<dyn RefreshQueue>,
    settings: WorkerSettings,
}

impl RefreshWorker {
    pub fn new(
        source: Arc<dyn SourceRecords>,
        snapshots: Arc<dyn SnapshotStore>,
        queue: Arc<dyn RefreshQueue>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            source,
            snapshots,
            queue,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub async fn drain(&self, limit: usize) -> anyhow::Result<DrainReport> {
        self.drain_at(limit, Utc::now()).await
    }

    pub async fn drain_at(&self, limit: usize, now: DateTime<Utc>) -> anyhow::Result<DrainReport> {
        let started = Instant::now();
        let mut report = DrainReport {
            reclaimed: self
                .queue
                .reclaim_orphans(queue::claim_cutoff(now, self.settings.claim_timeout), now)
                .await?,
            ..DrainReport::default()
        };
        if report.reclaimed > 0 {
            warn!(reclaimed = report.reclaimed, "reclaimed orphaned refresh tasks");
        }

        let due = self.queue.due(limit, now).await?;
        let depth = self.queue.depth().await?;
        debug!(
            queue_depth = depth,
            due = due.len(),
            "draining refresh queue"
        );

        for task in due {
            match self.queue.claim(task.id, now).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(task_id = %task.id, "task claimed by another worker");
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    error!(task_id = %task.id, error = ?err, "failed to claim refresh task");
                    report.error_count += 1;
                    continue;
                }
            }

            match refresh_scholar(self.source.as_ref(), self.snapshots.as_ref(), task.scholar_id, now)
                .await
            {
                Ok(snapshot) => match self.queue.complete(task.id, task.attempts + 1).await {
                    Ok(true) => {
                        report.processed += 1;
                        debug!(
                            scholar_id = %task.scholar_id,
                            version = snapshot.version,
                            "snapshot refreshed"
                        );
                    }
                    Ok(false) => {
                        report.skipped += 1;
                        info!(
                            scholar_id = %task.scholar_id,
                            version = snapshot.version,
                            "task was reset while processing, result superseded"
                        );
                    }
                    Err(err) => {
                        report.error_count += 1;
                        error!(
                            task_id = %task.id,
                            error = ?err,
                            "failed to mark refresh task done"
                        );
                    }
                },
                Err(err) => {
                    report.error_count += 1;
                    self.record_task_failure(&task, &format!("{err:#}"), now)
                        .await;
                }
            }
        }

        info!(
            processed = report.processed,
            errors = report.error_count,
            skipped = report.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "refresh queue drained"
        );
        Ok(report)
    }

    // Bookkeeping errors stay on this task; the rest of the batch still runs.
    async fn record_task_failure(&self, task: &RefreshTask, message: &str, now: DateTime<Utc>) {
        let disposition = queue::failure_disposition(task.attempts, now);
        let (scheduled_at, trust) = match disposition {
            FailureDisposition::Retry { scheduled_at, .. } => {
                (Some(scheduled_at), TrustStatus::Pending)
            }
            FailureDisposition::Exhausted { .. } => (None, TrustStatus::Failed),
        };
        error!(
            scholar_id = %task.scholar_id,
            attempts = disposition.attempts(),
            status = %disposition.status(),
            error = %message,
            "snapshot refresh failed"
        );

        if let Err(err) = self
            .queue
            .record_failure(
                task.id,
                disposition.attempts(),
                disposition.status(),
                message,
                scheduled_at,
            )
            .await
        {
            error!(task_id = %task.id, error = ?err, "failed to record refresh failure");
        }
        if let Err(err) = self
            .snapshots
            .mark_trust(task.scholar_id, trust, Some(message))
            .await
        {
            error!(scholar_id = %task.scholar_id, error = ?err, "failed to mark snapshot trust");
        }
    }

    /// Keeps draining until the queue is empty or a batch makes no progress.
    pub async fn drain_until_empty(&self) -> anyhow::Result<DrainReport> {
        let mut total = DrainReport::default();
        while self.queue.depth().await? > 0 {
            let report = self.drain(self.settings.batch_size).await?;
            total.processed += report.processed;
            total.error_count += report.error_count;
            total.skipped += report.skipped;
            total.reclaimed += report.reclaimed;
            if report.processed == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// Polls the queue on a fixed interval until `shutdown` resolves. Drain
    /// errors are logged and the loop keeps going.
    pub async fn run<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            batch_size = self.settings.batch_size,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "refresh worker started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("refresh worker stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.drain(self.settings.batch_size).await {
                        error!(error = ?err, "refresh queue drain failed");
                    }
                }
            }
        }
    }
}
