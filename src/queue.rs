use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::{RefreshTask, TaskStatus};

pub const DEDUPE_WINDOW_SECONDS: i64 = 30;
pub const MAX_ATTEMPTS: i32 = 3;
pub const BACKOFF_STEP_SECONDS: i64 = 60;
pub const CLAIM_TIMEOUT_SECONDS: i64 = 600;
pub const MIN_CLAIM_TIMEOUT_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnqueueOutcome {
    Inserted,
    Deduplicated,
    Reset,
}

/// An active task scheduled less than the dedupe window ago absorbs the
/// request. Backoff schedules in the future count as recent.
pub fn enqueue_decision(existing: Option<&RefreshTask>, now: DateTime<Utc>) -> EnqueueOutcome {
    match existing {
        None => EnqueueOutcome::Inserted,
        Some(task)
            if task.status.is_active()
                && now - task.scheduled_at < Duration::seconds(DEDUPE_WINDOW_SECONDS) =>
        {
            EnqueueOutcome::Deduplicated
        }
        Some(_) => EnqueueOutcome::Reset,
    }
}

/// Applies a reset in place: a fresh cycle for the same row.
pub fn reset_task(task: &mut RefreshTask, now: DateTime<Utc>) {
    task.status = TaskStatus::Pending;
    task.attempts = 0;
    task.scheduled_at = now;
    task.locked_at = None;
    task.last_error = None;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retry {
        attempts: i32,
        scheduled_at: DateTime<Utc>,
    },
    Exhausted {
        attempts: i32,
    },
}

impl FailureDisposition {
    pub fn attempts(&self) -> i32 {
        match self {
            FailureDisposition::Retry { attempts, .. } | FailureDisposition::Exhausted { attempts } => {
                *attempts
            }
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            FailureDisposition::Retry { .. } => TaskStatus::Pending,
            FailureDisposition::Exhausted { .. } => TaskStatus::Failed,
        }
    }
}

pub fn failure_disposition(attempts_before: i32, now: DateTime<Utc>) -> FailureDisposition {
    let attempts = attempts_before + 1;
    if attempts >= MAX_ATTEMPTS {
        FailureDisposition::Exhausted { attempts }
    } else {
        FailureDisposition::Retry {
            attempts,
            scheduled_at: now + Duration::seconds(BACKOFF_STEP_SECONDS * i64::from(attempts)),
        }
    }
}

/// Claims locked before the cutoff are orphans. Short timeouts are raised to
/// the minimum so a live worker's claim is never taken back.
pub fn claim_cutoff(now: DateTime<Utc>, claim_timeout: Duration) -> DateTime<Utc> {
    now - claim_timeout.max(Duration::seconds(MIN_CLAIM_TIMEOUT_SECONDS))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub processed: usize,
    pub error_count: usize,
    pub skipped: usize,
    pub reclaimed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn task(status: TaskStatus, scheduled_at: DateTime<Utc>) -> RefreshTask {
        RefreshTask {
            id: Uuid::new_v4(),
            scholar_id: Uuid::new_v4(),
            status,
            attempts: 2,
            scheduled_at,
            locked_at: None,
            last_error: Some("boom".to_string()),
        }
    }

    #[test]
    fn recent_active_task_is_deduplicated() {
        let now = Utc::now();
        let pending = task(TaskStatus::Pending, now - Duration::seconds(29));
        assert_eq!(enqueue_decision(Some(&pending), now), EnqueueOutcome::Deduplicated);

        let backing_off = task(TaskStatus::Pending, now + Duration::seconds(120));
        assert_eq!(enqueue_decision(Some(&backing_off), now), EnqueueOutcome::Deduplicated);

        let processing = task(TaskStatus::Processing, now - Duration::seconds(5));
        assert_eq!(enqueue_decision(Some(&processing), now), EnqueueOutcome::Deduplicated);
    }

    #[test]
    fn old_or_terminal_task_is_reset() {
        let now = Utc::now();
        let old = task(TaskStatus::Pending, now - Duration::seconds(30));
        assert_eq!(enqueue_decision(Some(&old), now), EnqueueOutcome::Reset);

        let failed = task(TaskStatus::Failed, now - Duration::seconds(1));
        assert_eq!(enqueue_decision(Some(&failed), now), EnqueueOutcome::Reset);

        let done = task(TaskStatus::Done, now);
        assert_eq!(enqueue_decision(Some(&done), now), EnqueueOutcome::Reset);
        assert_eq!(enqueue_decision(None, now), EnqueueOutcome::Inserted);
    }

    #[test]
    fn reset_starts_a_fresh_cycle() {
        let now = Utc::now();
        let mut failed = task(TaskStatus::Failed, now - Duration::hours(1));
        failed.locked_at = Some(now - Duration::hours(1));
        reset_task(&mut failed, now);
        assert_eq!(failed.status, TaskStatus::Pending);
        assert_eq!(failed.attempts, 0);
        assert_eq!(failed.scheduled_at, now);
        assert_eq!(failed.locked_at, None);
        assert_eq!(failed.last_error, None);
    }

    #[test]
    fn backoff_is_linear_until_exhausted() {
        let now = Utc::now();
        assert_eq!(
            failure_disposition(0, now),
            FailureDisposition::Retry {
                attempts: 1,
                scheduled_at: now + Duration::seconds(60)
            }
        );
        assert_eq!(
            failure_disposition(1, now),
            FailureDisposition::Retry {
                attempts: 2,
                scheduled_at: now + Duration::seconds(120)
            }
        );
        let last = failure_disposition(2, now);
        assert_eq!(last, FailureDisposition::Exhausted { attempts: 3 });
        assert_eq!(last.status(), TaskStatus::Failed);
    }

    #[test]
    fn claim_cutoff_never_undercuts_the_minimum() {
        let now = Utc::now();
        assert_eq!(claim_cutoff(now, Duration::seconds(600)), now - Duration::seconds(600));
        assert_eq!(claim_cutoff(now, Duration::zero()), now - Duration::seconds(60));
        assert_eq!(claim_cutoff(now, Duration::seconds(-5)), now - Duration::seconds(60));
    }
}
