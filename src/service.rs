//! Read API over the snapshot store.
//!
//! A read never waits on the worker, with two exceptions: the first read for a
//! scholar with no snapshot, and the first read for a cohort with no snapshots
//! at all. Both recompute inline once so callers never see an empty payload.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{PerformanceMetrics, Snapshot, TrustStatus};
use crate::policy::{snapshot_age_seconds, FreshnessMeta, FreshnessPolicy};
use crate::queue::EnqueueOutcome;
use crate::report::{self, CohortEntry, CohortView, ScholarView};
use crate::store::{RefreshQueue, SnapshotStore, SourceRecords};
use crate::worker;

#[derive(Debug, Clone, Serialize)]
pub struct ScholarMetricsResponse {
    pub metrics: PerformanceMetrics,
    pub meta: FreshnessMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct CohortMetricsResponse {
    pub metrics: CohortView,
    pub meta: FreshnessMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScholarClassroomResponse {
    pub metrics: ScholarView,
    pub meta: FreshnessMeta,
}

#[derive(Clone)]
pub struct MetricsService {
    source: Arc<dyn SourceRecords>,
    snapshots: Arc<dyn SnapshotStore>,
    queue: Arc<dyn RefreshQueue>,
    policy: FreshnessPolicy,
}

impl MetricsService {
    pub fn new(
        source: Arc<dyn SourceRecords>,
        snapshots: Arc<dyn SnapshotStore>,
        queue: Arc<dyn RefreshQueue>,
        policy: FreshnessPolicy,
    ) -> Self {
        Self {
            source,
            snapshots,
            queue,
            policy,
        }
    }

    pub fn policy(&self) -> FreshnessPolicy {
        self.policy
    }

    pub async fn queue_depth(&self) -> anyhow::Result<i64> {
        self.queue.depth().await
    }

    pub async fn request_refresh(&self, scholar_id: Uuid) -> anyhow::Result<EnqueueOutcome> {
        let outcome = self
            .queue
            .enqueue(scholar_id, Utc::now())
            .await
            .with_context(|| format!("failed to enqueue refresh for {scholar_id}"))?;
        info!(scholar_id = %scholar_id, ?outcome, "refresh requested");
        Ok(outcome)
    }

    // Opportunistic enqueue from a read. The read is served either way.
    async fn enqueue_quietly(&self, scholar_id: Uuid, now: DateTime<Utc>) {
        match self.queue.enqueue(scholar_id, now).await {
            Ok(outcome) => debug!(scholar_id = %scholar_id, ?outcome, "refresh enqueued from read"),
            Err(err) => warn!(scholar_id = %scholar_id, error = ?err, "failed to enqueue refresh"),
        }
    }

    async fn depth_or_unknown(&self) -> Option<i64> {
        match self.queue.depth().await {
            Ok(depth) => Some(depth),
            Err(err) => {
                warn!(error = ?err, "failed to read refresh queue depth");
                None
            }
        }
    }

    fn snapshot_meta(&self, snapshot: &Snapshot, age: i64, depth: Option<i64>) -> FreshnessMeta {
        let mut meta = self.policy.meta(age, snapshot.trust_status, depth);
        if snapshot.trust_status != TrustStatus::Ready {
            meta.refresh_error = snapshot.refresh_log.clone();
        }
        meta
    }

    pub async fn scholar_metrics(&self, scholar_id: Uuid) -> anyhow::Result<ScholarMetricsResponse> {
        let now = Utc::now();
        let Some(snapshot) = self.snapshots.get(scholar_id).await? else {
            info!(scholar_id = %scholar_id, "no snapshot yet, bootstrapping");
            self.enqueue_quietly(scholar_id, now).await;
            let snapshot = worker::refresh_scholar(
                self.source.as_ref(),
                self.snapshots.as_ref(),
                scholar_id,
                now,
            )
            .await
            .with_context(|| format!("unable to bootstrap metrics for {scholar_id}"))?;
            let meta = self.snapshot_meta(&snapshot, 0, self.depth_or_unknown().await);
            return Ok(ScholarMetricsResponse {
                metrics: snapshot.metrics,
                meta,
            });
        };

        let age = snapshot_age_seconds(snapshot.updated_at, now);
        if self.policy.needs_refresh(age, snapshot.trust_status) {
            self.enqueue_quietly(scholar_id, now).await;
        }
        let meta = self.snapshot_meta(&snapshot, age, self.depth_or_unknown().await);

        Ok(ScholarMetricsResponse {
            metrics: snapshot.metrics,
            meta,
        })
    }

    pub async fn scholar_classroom_view(
        &self,
        scholar_id: Uuid,
    ) -> anyhow::Result<ScholarClassroomResponse> {
        let response = self.scholar_metrics(scholar_id).await?;
        Ok(ScholarClassroomResponse {
            metrics: report::build_scholar_view(&response.metrics),
            meta: response.meta,
        })
    }

    /// Recomputes every member of the cohort inline, regardless of freshness.
    pub async fn recompute_cohort(&self, cohort: &str) -> anyhow::Result<Vec<Snapshot>> {
        worker::refresh_cohort(self.source.as_ref(), self.snapshots.as_ref(), cohort, Utc::now())
            .await
    }

    pub async fn cohort_metrics(&self, cohort: &str) -> anyhow::Result<CohortMetricsResponse> {
        let now = Utc::now();
        let roster = self
            .source
            .cohort_roster(cohort)
            .await
            .with_context(|| format!("failed to load roster for cohort {cohort}"))?;
        let scholar_ids: Vec<Uuid> = roster.iter().map(|entry| entry.scholar_id).collect();

        let mut snapshots = self.snapshots.get_many(&scholar_ids).await?;
        if snapshots.is_empty() && !roster.is_empty() {
            info!(cohort, scholars = roster.len(), "no cohort snapshots yet, bootstrapping");
            snapshots = worker::refresh_cohort(
                self.source.as_ref(),
                self.snapshots.as_ref(),
                cohort,
                now,
            )
            .await?;
        }

        let mut entries = Vec::with_capacity(roster.len());
        for member in &roster {
            let Some(snapshot) = snapshots
                .iter()
                .find(|snapshot| snapshot.scholar_id == member.scholar_id)
            else {
                self.enqueue_quietly(member.scholar_id, now).await;
                continue;
            };

            let age = snapshot_age_seconds(snapshot.updated_at, now);
            if self.policy.needs_refresh(age, snapshot.trust_status) {
                self.enqueue_quietly(member.scholar_id, now).await;
            }
            entries.push(CohortEntry {
                scholar_id: member.scholar_id,
                guardian_email: member.guardian_email.clone(),
                metrics: snapshot.metrics.clone(),
                snapshot_age_seconds: age,
                refresh_status: snapshot.trust_status,
                warning: self
                    .policy
                    .warning(age, snapshot.trust_status)
                    .map(str::to_string),
            });
        }

        let meta = self.cohort_meta(&entries, self.depth_or_unknown().await);
        Ok(CohortMetricsResponse {
            metrics: report::build_cohort_view(&entries),
            meta,
        })
    }

    fn cohort_meta(&self, entries: &[CohortEntry], depth: Option<i64>) -> FreshnessMeta {
        let max_age = entries
            .iter()
            .map(|entry| entry.snapshot_age_seconds)
            .max()
            .unwrap_or(0);
        let status = if entries
            .iter()
            .any(|entry| entry.refresh_status == TrustStatus::Failed)
        {
            TrustStatus::Failed
        } else if entries
            .iter()
            .any(|entry| entry.refresh_status != TrustStatus::Ready)
        {
            TrustStatus::Pending
        } else {
            TrustStatus::Ready
        };

        let warnings: BTreeSet<String> = entries
            .iter()
            .filter_map(|entry| entry.warning.clone())
            .collect();

        let mut meta = self.policy.meta(max_age, status, depth);
        meta.warnings = (!warnings.is_empty()).then(|| warnings.into_iter().collect());
        meta
    }
}
