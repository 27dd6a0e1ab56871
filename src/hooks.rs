//! Invalidation hooks for writers of source records.
//!
//! A write to a result or attendance row marks its scholar dirty. A write to an
//! assignment marks every scholar in the lesson's cohort dirty, since the
//! assignment total is shared. Hooks never fail the write that triggered them.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::store::{RefreshQueue, SourceRecords};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceChange {
    ResultChanged { scholar_id: Uuid },
    AttendanceChanged { scholar_id: Uuid },
    AssignmentChanged { lesson_id: Uuid },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HookReport {
    pub enqueued: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct InvalidationHooks {
    source: Arc<dyn SourceRecords>,
    queue: Arc<dyn RefreshQueue>,
}

impl InvalidationHooks {
    pub fn new(source: Arc<dyn SourceRecords>, queue: Arc<dyn RefreshQueue>) -> Self {
        Self { source, queue }
    }

    pub async fn notify(&self, change: SourceChange) -> HookReport {
        match change {
            SourceChange::ResultChanged { scholar_id }
            | SourceChange::AttendanceChanged { scholar_id } => {
                self.on_source_record_changed(&[scholar_id]).await
            }
            SourceChange::AssignmentChanged { lesson_id } => self.on_lesson_changed(lesson_id).await,
        }
    }

    pub async fn on_source_record_changed(&self, scholar_ids: &[Uuid]) -> HookReport {
        let now = Utc::now();
        let mut report = HookReport::default();
        for scholar_id in scholar_ids {
            match self.queue.enqueue(*scholar_id, now).await {
                Ok(outcome) => {
                    report.enqueued += 1;
                    debug!(scholar_id = %scholar_id, ?outcome, "snapshot invalidated");
                }
                Err(err) => {
                    report.failed += 1;
                    error!(scholar_id = %scholar_id, error = ?err, "failed to enqueue snapshot refresh");
                }
            }
        }
        report
    }

    pub async fn on_lesson_changed(&self, lesson_id: Uuid) -> HookReport {
        let cohort = match self.source.lesson_cohort(lesson_id).await {
            Ok(Some(cohort)) => cohort,
            Ok(None) => {
                warn!(lesson_id = %lesson_id, "lesson has no cohort, nothing to invalidate");
                return HookReport::default();
            }
            Err(err) => {
                error!(lesson_id = %lesson_id, error = ?err, "failed to resolve lesson cohort");
                return HookReport {
                    enqueued: 0,
                    failed: 1,
                };
            }
        };

        let roster = match self.source.cohort_roster(&cohort).await {
            Ok(roster) => roster,
            Err(err) => {
                error!(cohort = %cohort, error = ?err, "failed to load cohort roster");
                return HookReport {
                    enqueued: 0,
                    failed: 1,
                };
            }
        };

        let scholar_ids: Vec<Uuid> = roster.iter().map(|entry| entry.scholar_id).collect();
        self.on_source_record_changed(&scholar_ids).await
    }
}
