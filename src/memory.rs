//! In-process backend with the same semantics as the Postgres store.
//!
//! Every operation takes the lock once, so a claim is as atomic here as the
//! conditional update is in Postgres.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    AttendanceMark, CohortRecords, PerformanceMetrics, RefreshTask, ResultRecord, RosterEntry,
    ScholarRecords, Snapshot, TaskStatus, TrustStatus,
};
use crate::queue::{self, EnqueueOutcome};
use crate::store::{RefreshQueue, SnapshotStore, SourceRecords};

#[derive(Debug, Clone)]
struct ScholarRow {
    id: Uuid,
    cohort: Option<String>,
    guardian_email: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    scholars: Vec<ScholarRow>,
    results: HashMap<Uuid, Vec<ResultRecord>>,
    attendance: HashMap<Uuid, Vec<AttendanceMark>>,
    assignments: HashMap<String, i32>,
    lessons: HashMap<Uuid, String>,
    snapshots: HashMap<Uuid, Snapshot>,
    tasks: Vec<RefreshTask>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_scholar(&self, scholar_id: Uuid, cohort: Option<&str>, guardian_email: Option<&str>) {
        let mut inner = self.inner();
        inner.scholars.retain(|row| row.id != scholar_id);
        inner.scholars.push(ScholarRow {
            id: scholar_id,
            cohort: cohort.map(str::to_string),
            guardian_email: guardian_email.map(str::to_string),
        });
    }

    pub fn add_result(&self, scholar_id: Uuid, record: ResultRecord) {
        self.inner().results.entry(scholar_id).or_default().push(record);
    }

    pub fn add_attendance(&self, scholar_id: Uuid, present: bool) {
        self.inner()
            .attendance
            .entry(scholar_id)
            .or_default()
            .push(AttendanceMark { present });
    }

    pub fn add_assignment(&self, cohort: &str) {
        *self.inner().assignments.entry(cohort.to_string()).or_default() += 1;
    }

    pub fn add_lesson(&self, lesson_id: Uuid, cohort: &str) {
        self.inner().lessons.insert(lesson_id, cohort.to_string());
    }

    /// Rows held for the scholar in any status. The queue never holds more than one.
    pub fn task_rows_for(&self, scholar_id: Uuid) -> usize {
        self.inner()
            .tasks
            .iter()
            .filter(|task| task.scholar_id == scholar_id)
            .count()
    }
}

#[async_trait]
impl SourceRecords for MemoryStore {
    async fn cohort_of(&self, scholar_id: Uuid) -> anyhow::Result<Option<String>> {
        Ok(self
            .inner()
            .scholars
            .iter()
            .find(|row| row.id == scholar_id)
            .and_then(|row| row.cohort.clone()))
    }

    async fn cohort_roster(&self, cohort: &str) -> anyhow::Result<Vec<RosterEntry>> {
        Ok(self
            .inner()
            .scholars
            .iter()
            .filter(|row| row.cohort.as_deref() == Some(cohort))
            .map(|row| RosterEntry {
                scholar_id: row.id,
                guardian_email: row.guardian_email.clone(),
            })
            .collect())
    }

    async fn cohort_records(&self, cohort: &str) -> anyhow::Result<CohortRecords> {
        let inner = self.inner();
        let members = inner
            .scholars
            .iter()
            .filter(|row| row.cohort.as_deref() == Some(cohort))
            .map(|row| ScholarRecords {
                scholar_id: row.id,
                guardian_email: row.guardian_email.clone(),
                results: inner.results.get(&row.id).cloned().unwrap_or_default(),
                attendance: inner.attendance.get(&row.id).cloned().unwrap_or_default(),
            })
            .collect();

        Ok(CohortRecords {
            cohort: cohort.to_string(),
            members,
            assignment_total: inner.assignments.get(cohort).copied().unwrap_or(0),
        })
    }

    async fn lesson_cohort(&self, lesson_id: Uuid) -> anyhow::Result<Option<String>> {
        Ok(self.inner().lessons.get(&lesson_id).cloned())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn get(&self, scholar_id: Uuid) -> anyhow::Result<Option<Snapshot>> {
        Ok(self.inner().snapshots.get(&scholar_id).cloned())
    }

    async fn get_many(&self, scholar_ids: &[Uuid]) -> anyhow::Result<Vec<Snapshot>> {
        let inner = self.inner();
        Ok(scholar_ids
            .iter()
            .filter_map(|id| inner.snapshots.get(id).cloned())
            .collect())
    }

    async fn commit(
        &self,
        scholar_id: Uuid,
        metrics: &PerformanceMetrics,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Snapshot> {
        let mut inner = self.inner();
        let version = inner
            .snapshots
            .get(&scholar_id)
            .map(|existing| existing.version + 1)
            .unwrap_or(1);
        let snapshot = Snapshot {
            scholar_id,
            metrics: metrics.clone(),
            version,
            trust_status: TrustStatus::Ready,
            refresh_log: None,
            updated_at: now,
        };
        inner.snapshots.insert(scholar_id, snapshot.clone());
        Ok(snapshot)
    }

    async fn mark_trust(
        &self,
        scholar_id: Uuid,
        status: TrustStatus,
        refresh_log: Option<&str>,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner();
        let Some(snapshot) = inner.snapshots.get_mut(&scholar_id) else {
            return Ok(false);
        };
        snapshot.trust_status = status;
        snapshot.refresh_log = refresh_log.map(str::to_string);
        Ok(true)
    }
}

#[async_trait]
impl RefreshQueue for MemoryStore {
    async fn enqueue(
        &self,
        scholar_id: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<EnqueueOutcome> {
        let mut inner = self.inner();
        let position = inner
            .tasks
            .iter()
            .position(|task| task.scholar_id == scholar_id);
        let outcome = queue::enqueue_decision(position.map(|index| &inner.tasks[index]), now);
        match (outcome, position) {
            (EnqueueOutcome::Reset, Some(index)) => queue::reset_task(&mut inner.tasks[index], now),
            (EnqueueOutcome::Inserted, _) => inner.tasks.push(RefreshTask {
                id: Uuid::new_v4(),
                scholar_id,
                status: TaskStatus::Pending,
                attempts: 0,
                scheduled_at: now,
                locked_at: None,
                last_error: None,
            }),
            _ => {}
        }
        Ok(outcome)
    }

    async fn depth(&self) -> anyhow::Result<i64> {
        Ok(self
            .inner()
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .count() as i64)
    }

    async fn due(&self, limit: usize, now: DateTime<Utc>) -> anyhow::Result<Vec<RefreshTask>> {
        let mut due: Vec<RefreshTask> = self
            .inner()
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Pending && task.scheduled_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(&self, task_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut inner = self.inner();
        match inner
            .tasks
            .iter_mut()
            .find(|task| task.id == task_id && task.status == TaskStatus::Pending)
        {
            Some(task) => {
                task.status = TaskStatus::Processing;
                task.locked_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete(&self, task_id: Uuid, attempts: i32) -> anyhow::Result<bool> {
        let mut inner = self.inner();
        match inner
            .tasks
            .iter_mut()
            .find(|task| task.id == task_id && task.status == TaskStatus::Processing)
        {
            Some(task) => {
                task.status = TaskStatus::Done;
                task.attempts = attempts;
                task.last_error = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_failure(
        &self,
        task_id: Uuid,
        attempts: i32,
        status: TaskStatus,
        error: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner();
        match inner
            .tasks
            .iter_mut()
            .find(|task| task.id == task_id && task.status == TaskStatus::Processing)
        {
            Some(task) => {
                task.status = status;
                task.attempts = attempts;
                task.last_error = Some(error.to_string());
                if let Some(at) = scheduled_at {
                    task.scheduled_at = at;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reclaim_orphans(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let mut reclaimed = 0;
        for task in self.inner().tasks.iter_mut() {
            let orphaned = task.status == TaskStatus::Processing
                && task.locked_at.is_some_and(|locked| locked < locked_before);
            if orphaned {
                task.status = TaskStatus::Pending;
                task.scheduled_at = now;
                task.locked_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn task_for(&self, scholar_id: Uuid) -> anyhow::Result<Option<RefreshTask>> {
        Ok(self
            .inner()
            .tasks
            .iter()
            .find(|task| task.scholar_id == scholar_id)
            .cloned())
    }
}
