use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    CohortRecords, PerformanceMetrics, RefreshTask, RosterEntry, Snapshot, TaskStatus,
    TrustStatus,
};
use crate::queue::EnqueueOutcome;

/// Read access to the source records owned by the surrounding application.
#[async_trait]
pub trait SourceRecords: Send + Sync {
    async fn cohort_of(&self, scholar_id: Uuid) -> anyhow::Result<Option<String>>;

    async fn cohort_roster(&self, cohort: &str) -> anyhow::Result<Vec<RosterEntry>>;

    async fn cohort_records(&self, cohort: &str) -> anyhow::Result<CohortRecords>;

    async fn lesson_cohort(&self, lesson_id: Uuid) -> anyhow::Result<Option<String>>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn get(&self, scholar_id: Uuid) -> anyhow::Result<Option<Snapshot>>;

    async fn get_many(&self, scholar_ids: &[Uuid]) -> anyhow::Result<Vec<Snapshot>>;

    /// Upserts a successful recompute: version 1 on insert, otherwise
    /// version + 1, always `READY` with the refresh log cleared.
    async fn commit(
        &self,
        scholar_id: Uuid,
        metrics: &PerformanceMetrics,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Snapshot>;

    /// Updates the trust status of an existing row. Returns false when the
    /// scholar has no snapshot yet.
    async fn mark_trust(
        &self,
        scholar_id: Uuid,
        status: TrustStatus,
        refresh_log: Option<&str>,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait RefreshQueue: Send + Sync {
    async fn enqueue(&self, scholar_id: Uuid, now: DateTime<Utc>)
        -> anyhow::Result<EnqueueOutcome>;

    /// Number of `PENDING` tasks, including ones still backing off.
    async fn depth(&self) -> anyhow::Result<i64>;

    async fn due(&self, limit: usize, now: DateTime<Utc>) -> anyhow::Result<Vec<RefreshTask>>;

    /// `PENDING -> PROCESSING` as a single conditional update. False means
    /// another worker won the task.
    async fn claim(&self, task_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool>;

    async fn complete(&self, task_id: Uuid, attempts: i32) -> anyhow::Result<bool>;

    async fn record_failure(
        &self,
        task_id: Uuid,
        attempts: i32,
        status: TaskStatus,
        error: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<bool>;

    /// Returns `PROCESSING` tasks locked before the cutoff to `PENDING`.
    async fn reclaim_orphans(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    async fn task_for(&self, scholar_id: Uuid) -> anyhow::Result<Option<RefreshTask>>;
}
