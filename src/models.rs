use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Exam,
    Assignment,
}

/// A scored exam or assignment result for one scholar.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub kind: RecordKind,
    pub title: Option<String>,
    pub subject_area: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttendanceMark {
    pub present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMetric {
    pub name: String,
    pub scholar_score: i32,
    pub cohort_average: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentMetric {
    pub name: String,
    pub score: i32,
    pub period_label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssignmentProgress {
    pub completed: i32,
    pub total: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub overall_score: i32,
    pub growth_rate: i32,
    pub attendance_rate: i32,
    pub assignments: AssignmentProgress,
    pub reading_minutes: i32,
    pub math_fluency: i32,
    pub subject_metrics: Vec<SubjectMetric>,
    pub assessments: Vec<AssessmentMetric>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustStatus {
    Ready,
    Pending,
    Failed,
}

impl TrustStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustStatus::Ready => "READY",
            TrustStatus::Pending => "PENDING",
            TrustStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "READY" => Ok(TrustStatus::Ready),
            "PENDING" => Ok(TrustStatus::Pending),
            "FAILED" => Ok(TrustStatus::Failed),
            other => anyhow::bail!("unknown trust status {other}"),
        }
    }
}

/// Latest computed metrics for one scholar.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub scholar_id: Uuid,
    pub metrics: PerformanceMetrics,
    pub version: i32,
    pub trust_status: TrustStatus,
    pub refresh_log: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
        }
    }

    /// Pending and processing rows block a second active task for the scholar.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Processing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(TaskStatus::Pending),
            "PROCESSING" => Ok(TaskStatus::Processing),
            "DONE" => Ok(TaskStatus::Done),
            "FAILED" => Ok(TaskStatus::Failed),
            other => anyhow::bail!("unknown task status {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTask {
    pub id: Uuid,
    pub scholar_id: Uuid,
    pub status: TaskStatus,
    pub attempts: i32,
    pub scheduled_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub scholar_id: Uuid,
    pub guardian_email: Option<String>,
}

/// Everything the aggregator needs for one member of a cohort.
#[derive(Debug, Clone, Default)]
pub struct ScholarRecords {
    pub scholar_id: Uuid,
    pub guardian_email: Option<String>,
    pub results: Vec<ResultRecord>,
    pub attendance: Vec<AttendanceMark>,
}

#[derive(Debug, Clone, Default)]
pub struct CohortRecords {
    pub cohort: String,
    pub members: Vec<ScholarRecords>,
    pub assignment_total: i32,
}
