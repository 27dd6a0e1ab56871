use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::hooks::{InvalidationHooks, SourceChange};
use crate::models::{
    AssessmentMetric, AssignmentProgress, AttendanceMark, CohortRecords, PerformanceMetrics,
    RecordKind, RefreshTask, ResultRecord, RosterEntry, ScholarRecords, Snapshot, SubjectMetric,
    TaskStatus, TrustStatus,
};
use crate::queue::{EnqueueOutcome, DEDUPE_WINDOW_SECONDS};
use crate::store::{RefreshQueue, SnapshotStore, SourceRecords};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres backend for source reads, snapshots, and the refresh queue.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const SNAPSHOT_COLUMNS: &str = "scholar_id, overall_score, growth_rate, attendance_rate, \
     assignments_completed, assignments_total, reading_minutes, math_fluency, \
     subject_metrics, assessments, version, trust_status, refresh_log, updated_at";

const TASK_COLUMNS: &str =
    "id, scholar_id, status, attempts, scheduled_at, locked_at, last_error";

fn snapshot_from_row(row: &PgRow) -> anyhow::Result<Snapshot> {
    let subject_metrics: Json<Vec<SubjectMetric>> = row.try_get("subject_metrics")?;
    let assessments: Json<Vec<AssessmentMetric>> = row.try_get("assessments")?;
    let trust_status: String = row.try_get("trust_status")?;

    Ok(Snapshot {
        scholar_id: row.try_get("scholar_id")?,
        metrics: PerformanceMetrics {
            overall_score: row.try_get("overall_score")?,
            growth_rate: row.try_get("growth_rate")?,
            attendance_rate: row.try_get("attendance_rate")?,
            assignments: AssignmentProgress {
                completed: row.try_get("assignments_completed")?,
                total: row.try_get("assignments_total")?,
            },
            reading_minutes: row.try_get("reading_minutes")?,
            math_fluency: row.try_get("math_fluency")?,
            subject_metrics: subject_metrics.0,
            assessments: assessments.0,
        },
        version: row.try_get("version")?,
        trust_status: trust_status.parse()?,
        refresh_log: row.try_get("refresh_log")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn task_from_row(row: &PgRow) -> anyhow::Result<RefreshTask> {
    let status: String = row.try_get("status")?;
    Ok(RefreshTask {
        id: row.try_get("id")?,
        scholar_id: row.try_get("scholar_id")?,
        status: status.parse()?,
        attempts: row.try_get("attempts")?,
        scheduled_at: row.try_get("scheduled_at")?,
        locked_at: row.try_get("locked_at")?,
        last_error: row.try_get("last_error")?,
    })
}

#[async_trait]
impl SourceRecords for PgStore {
    async fn cohort_of(&self, scholar_id: Uuid) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT cohort FROM metrics_snapshots.scholars WHERE id = $1")
            .bind(scholar_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|row| row.get::<Option<String>, _>("cohort")))
    }

    async fn cohort_roster(&self, cohort: &str) -> anyhow::Result<Vec<RosterEntry>> {
        let rows = sqlx::query(
            "SELECT id, guardian_email FROM metrics_snapshots.scholars \
             WHERE cohort = $1 ORDER BY full_name",
        )
        .bind(cohort)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RosterEntry {
                scholar_id: row.get("id"),
                guardian_email: row.get("guardian_email"),
            })
            .collect())
    }

    async fn cohort_records(&self, cohort: &str) -> anyhow::Result<CohortRecords> {
        let roster = self.cohort_roster(cohort).await?;
        let mut members: Vec<ScholarRecords> = roster
            .into_iter()
            .map(|entry| ScholarRecords {
                scholar_id: entry.scholar_id,
                guardian_email: entry.guardian_email,
                ..ScholarRecords::default()
            })
            .collect();
        let index: HashMap<Uuid, usize> = members
            .iter()
            .enumerate()
            .map(|(position, member)| (member.scholar_id, position))
            .collect();

        let results = sqlx::query(
            r#"
            SELECT r.scholar_id, r.score, (r.exam_id IS NOT NULL) AS is_exam,
                   COALESCE(e.title, a.title) AS title,
                   COALESCE(e.start_time, a.due_date) AS occurred_at,
                   COALESCE(le.subject_area, la.subject_area) AS subject_area
            FROM metrics_snapshots.results r
            JOIN metrics_snapshots.scholars s ON s.id = r.scholar_id
            LEFT JOIN metrics_snapshots.exams e ON e.id = r.exam_id
            LEFT JOIN metrics_snapshots.lessons le ON le.id = e.lesson_id
            LEFT JOIN metrics_snapshots.assignments a ON a.id = r.assignment_id
            LEFT JOIN metrics_snapshots.lessons la ON la.id = a.lesson_id
            WHERE s.cohort = $1
            "#,
        )
        .bind(cohort)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load results for cohort {cohort}"))?;

        for row in results {
            let scholar_id: Uuid = row.get("scholar_id");
            let Some(&position) = index.get(&scholar_id) else {
                continue;
            };
            let is_exam: bool = row.get("is_exam");
            members[position].results.push(ResultRecord {
                kind: if is_exam {
                    RecordKind::Exam
                } else {
                    RecordKind::Assignment
                },
                title: row.get("title"),
                subject_area: row.get("subject_area"),
                occurred_at: row.get("occurred_at"),
                score: row.get("score"),
            });
        }

        let attendance = sqlx::query(
            r#"
            SELECT att.scholar_id, att.present
            FROM metrics_snapshots.attendance att
            JOIN metrics_snapshots.scholars s ON s.id = att.scholar_id
            WHERE s.cohort = $1
            "#,
        )
        .bind(cohort)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load attendance for cohort {cohort}"))?;

        for row in attendance {
            let scholar_id: Uuid = row.get("scholar_id");
            if let Some(&position) = index.get(&scholar_id) {
                members[position].attendance.push(AttendanceMark {
                    present: row.get("present"),
                });
            }
        }

        let assignment_total: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM metrics_snapshots.assignments a
            JOIN metrics_snapshots.lessons l ON l.id = a.lesson_id
            WHERE l.cohort = $1
            "#,
        )
        .bind(cohort)
        .fetch_one(&self.pool)
        .await?
        .get("total");

        Ok(CohortRecords {
            cohort: cohort.to_string(),
            members,
            assignment_total: i32::try_from(assignment_total)
                .context("assignment count out of range")?,
        })
    }

    async fn lesson_cohort(&self, lesson_id: Uuid) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT cohort FROM metrics_snapshots.lessons WHERE id = $1")
            .bind(lesson_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("cohort")))
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn get(&self, scholar_id: Uuid) -> anyhow::Result<Option<Snapshot>> {
        let query =
            format!("SELECT {SNAPSHOT_COLUMNS} FROM metrics_snapshots.snapshots WHERE scholar_id = $1");
        sqlx::query(&query)
            .bind(scholar_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(snapshot_from_row)
            .transpose()
    }

    async fn get_many(&self, scholar_ids: &[Uuid]) -> anyhow::Result<Vec<Snapshot>> {
        if scholar_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM metrics_snapshots.snapshots WHERE scholar_id = ANY($1)"
        );
        sqlx::query(&query)
            .bind(scholar_ids)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(snapshot_from_row)
            .collect()
    }

    async fn commit(
        &self,
        scholar_id: Uuid,
        metrics: &PerformanceMetrics,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Snapshot> {
        let query = format!(
            r#"
            INSERT INTO metrics_snapshots.snapshots AS snap
            (scholar_id, overall_score, growth_rate, attendance_rate, assignments_completed,
             assignments_total, reading_minutes, math_fluency, subject_metrics, assessments,
             version, trust_status, refresh_log, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1, 'READY', NULL, $11)
            ON CONFLICT (scholar_id) DO UPDATE
            SET overall_score = EXCLUDED.overall_score,
                growth_rate = EXCLUDED.growth_rate,
                attendance_rate = EXCLUDED.attendance_rate,
                assignments_completed = EXCLUDED.assignments_completed,
                assignments_total = EXCLUDED.assignments_total,
                reading_minutes = EXCLUDED.reading_minutes,
                math_fluency = EXCLUDED.math_fluency,
                subject_metrics = EXCLUDED.subject_metrics,
                assessments = EXCLUDED.assessments,
                version = snap.version + 1,
                trust_status = 'READY',
                refresh_log = NULL,
                updated_at = EXCLUDED.updated_at
            RETURNING {SNAPSHOT_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(scholar_id)
            .bind(metrics.overall_score)
            .bind(metrics.growth_rate)
            .bind(metrics.attendance_rate)
            .bind(metrics.assignments.completed)
            .bind(metrics.assignments.total)
            .bind(metrics.reading_minutes)
            .bind(metrics.math_fluency)
            .bind(Json(&metrics.subject_metrics))
            .bind(Json(&metrics.assessments))
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to commit snapshot for {scholar_id}"))?;
        snapshot_from_row(&row)
    }

    async fn mark_trust(
        &self,
        scholar_id: Uuid,
        status: TrustStatus,
        refresh_log: Option<&str>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE metrics_snapshots.snapshots SET trust_status = $2, refresh_log = $3 \
             WHERE scholar_id = $1",
        )
        .bind(scholar_id)
        .bind(status.as_str())
        .bind(refresh_log)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl RefreshQueue for PgStore {
    async fn enqueue(
        &self,
        scholar_id: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<EnqueueOutcome> {
        // The conflict arm only fires outside the dedupe window, so no row
        // comes back for a recent active task.
        let row = sqlx::query(
            r#"
            INSERT INTO metrics_snapshots.refresh_tasks AS task
            (id, scholar_id, status, attempts, scheduled_at, created_at, updated_at)
            VALUES ($1, $2, 'PENDING', 0, $3, $3, $3)
            ON CONFLICT (scholar_id) DO UPDATE
            SET status = 'PENDING',
                attempts = 0,
                scheduled_at = EXCLUDED.scheduled_at,
                locked_at = NULL,
                last_error = NULL,
                updated_at = EXCLUDED.updated_at
            WHERE NOT (task.status IN ('PENDING', 'PROCESSING') AND task.scheduled_at > $4)
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(scholar_id)
        .bind(now)
        .bind(now - Duration::seconds(DEDUPE_WINDOW_SECONDS))
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to enqueue refresh for {scholar_id}"))?;

        Ok(match row {
            None => EnqueueOutcome::Deduplicated,
            Some(row) if row.get::<bool, _>("inserted") => EnqueueOutcome::Inserted,
            Some(_) => EnqueueOutcome::Reset,
        })
    }

    async fn depth(&self) -> anyhow::Result<i64> {
        let depth: i64 = sqlx::query(
            "SELECT COUNT(*) AS depth FROM metrics_snapshots.refresh_tasks WHERE status = 'PENDING'",
        )
        .fetch_one(&self.pool)
        .await?
        .get("depth");
        Ok(depth)
    }

    async fn due(&self, limit: usize, now: DateTime<Utc>) -> anyhow::Result<Vec<RefreshTask>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM metrics_snapshots.refresh_tasks \
             WHERE status = 'PENDING' AND scheduled_at <= $1 \
             ORDER BY scheduled_at LIMIT $2"
        );
        sqlx::query(&query)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(task_from_row)
            .collect()
    }

    async fn claim(&self, task_id: Uuid, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE metrics_snapshots.refresh_tasks \
             SET status = 'PROCESSING', locked_at = $2, updated_at = $2 \
             WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(task_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, task_id: Uuid, attempts: i32) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE metrics_snapshots.refresh_tasks \
             SET status = 'DONE', attempts = $2, last_error = NULL, locked_at = NULL, \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'PROCESSING'",
        )
        .bind(task_id)
        .bind(attempts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(
        &self,
        task_id: Uuid,
        attempts: i32,
        status: TaskStatus,
        error: &str,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE metrics_snapshots.refresh_tasks \
             SET status = $2, attempts = $3, last_error = $4, \
                 scheduled_at = COALESCE($5, scheduled_at), locked_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND status = 'PROCESSING'",
        )
        .bind(task_id)
        .bind(status.as_str())
        .bind(attempts)
        .bind(error)
        .bind(scheduled_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reclaim_orphans(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE metrics_snapshots.refresh_tasks \
             SET status = 'PENDING', scheduled_at = $2, locked_at = NULL, updated_at = $2 \
             WHERE status = 'PROCESSING' AND locked_at < $1",
        )
        .bind(locked_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn task_for(&self, scholar_id: Uuid) -> anyhow::Result<Option<RefreshTask>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM metrics_snapshots.refresh_tasks WHERE scholar_id = $1"
        );
        sqlx::query(&query)
            .bind(scholar_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(task_from_row)
            .transpose()
    }
}

fn at_nine(date: NaiveDate) -> anyhow::Result<DateTime<Utc>> {
    let naive = date.and_hms_opt(9, 0, 0).context("invalid time")?;
    Ok(Utc.from_utc_datetime(&naive))
}

async fn upsert_scholar(
    pool: &PgPool,
    full_name: &str,
    email: &str,
    guardian_email: Option<&str>,
    cohort: &str,
) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO metrics_snapshots.scholars AS scholar
        (id, full_name, email, guardian_email, cohort)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (email) DO UPDATE
        SET full_name = EXCLUDED.full_name,
            guardian_email = COALESCE(EXCLUDED.guardian_email, scholar.guardian_email),
            cohort = EXCLUDED.cohort
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(full_name)
    .bind(email)
    .bind(guardian_email)
    .bind(cohort)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

async fn upsert_lesson(pool: &PgPool, cohort: &str, subject_area: &str) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO metrics_snapshots.lessons (id, cohort, subject_area)
        VALUES ($1, $2, $3)
        ON CONFLICT (cohort, subject_area) DO UPDATE SET subject_area = EXCLUDED.subject_area
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(cohort)
    .bind(subject_area)
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

/// Returns the exam or assignment id for `(lesson, title)`, creating it when
/// missing. The flag is true when a new row was written.
async fn ensure_graded_item(
    pool: &PgPool,
    kind: RecordKind,
    lesson_id: Uuid,
    title: &str,
    occurred_at: DateTime<Utc>,
) -> anyhow::Result<(Uuid, bool)> {
    let (table, time_column) = match kind {
        RecordKind::Exam => ("exams", "start_time"),
        RecordKind::Assignment => ("assignments", "due_date"),
    };

    let existing = sqlx::query(&format!(
        "SELECT id FROM metrics_snapshots.{table} WHERE lesson_id = $1 AND title = $2"
    ))
    .bind(lesson_id)
    .bind(title)
    .fetch_optional(pool)
    .await?;
    if let Some(row) = existing {
        return Ok((row.get("id"), false));
    }

    let id = Uuid::new_v4();
    sqlx::query(&format!(
        "INSERT INTO metrics_snapshots.{table} (id, lesson_id, title, {time_column}) \
         VALUES ($1, $2, $3, $4)"
    ))
    .bind(id)
    .bind(lesson_id)
    .bind(title)
    .bind(occurred_at)
    .execute(pool)
    .await?;
    Ok((id, true))
}

async fn insert_result(
    pool: &PgPool,
    scholar_id: Uuid,
    kind: RecordKind,
    item_id: Uuid,
    score: f64,
    source_key: &str,
) -> anyhow::Result<bool> {
    let (exam_id, assignment_id) = match kind {
        RecordKind::Exam => (Some(item_id), None),
        RecordKind::Assignment => (None, Some(item_id)),
    };
    let result = sqlx::query(
        r#"
        INSERT INTO metrics_snapshots.results
        (id, scholar_id, exam_id, assignment_id, score, source_key)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(scholar_id)
    .bind(exam_id)
    .bind(assignment_id)
    .bind(score)
    .bind(source_key)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn insert_attendance(
    pool: &PgPool,
    scholar_id: Uuid,
    lesson_id: Uuid,
    taken_on: NaiveDate,
    present: bool,
) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO metrics_snapshots.attendance (id, scholar_id, lesson_id, taken_on, present)
        SELECT $1, $2, $3, $4, $5
        WHERE NOT EXISTS (
            SELECT 1 FROM metrics_snapshots.attendance
            WHERE scholar_id = $2 AND lesson_id = $3 AND taken_on = $4
        )
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(scholar_id)
    .bind(lesson_id)
    .bind(taken_on)
    .bind(present)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let scholars = vec![
        (
            "Avery Lee",
            "avery.lee@groupscholar.com",
            Some("morgan.lee@example.com"),
            "2026",
        ),
        (
            "Kiara Patel",
            "kiara.patel@groupscholar.com",
            Some("devi.patel@example.com"),
            "2026",
        ),
        ("Rowan Brooks", "rowan.brooks@groupscholar.com", None, "2026"),
        (
            "Jules Moreno",
            "jules.moreno@groupscholar.com",
            Some("ana.moreno@example.com"),
            "2025",
        ),
    ];

    let mut ids = HashMap::new();
    for (name, email, guardian, cohort) in scholars {
        let id = upsert_scholar(pool, name, email, guardian, cohort).await?;
        ids.insert(email, (id, cohort));
    }

    let results = vec![
        ("seed-001", "avery.lee@groupscholar.com", "Math", RecordKind::Exam, "Fractions check-in", (2026, 1, 12), 78.0),
        ("seed-002", "avery.lee@groupscholar.com", "Math", RecordKind::Exam, "Ratios unit test", (2026, 2, 20), 88.0),
        ("seed-003", "avery.lee@groupscholar.com", "ELA", RecordKind::Assignment, "Argument essay", (2026, 2, 6), 91.0),
        ("seed-004", "kiara.patel@groupscholar.com", "Math", RecordKind::Exam, "Fractions check-in", (2026, 1, 12), 64.0),
        ("seed-005", "kiara.patel@groupscholar.com", "Science", RecordKind::Exam, "Ecosystems lab", (2026, 2, 3), 72.0),
        ("seed-006", "kiara.patel@groupscholar.com", "ELA", RecordKind::Assignment, "Argument essay", (2026, 2, 6), 69.0),
        ("seed-007", "rowan.brooks@groupscholar.com", "Math", RecordKind::Exam, "Fractions check-in", (2026, 1, 12), 93.0),
        ("seed-008", "jules.moreno@groupscholar.com", "Social Studies", RecordKind::Exam, "Civics quiz", (2026, 1, 22), 81.0),
    ];

    for (source_key, email, area, kind, title, (year, month, day), score) in results {
        let (scholar_id, cohort) = ids
            .get(email)
            .copied()
            .with_context(|| format!("unknown seed scholar {email}"))?;
        let lesson_id = upsert_lesson(pool, cohort, area).await?;
        let date = NaiveDate::from_ymd_opt(year, month, day).context("invalid date")?;
        let (item_id, _) = ensure_graded_item(pool, kind, lesson_id, title, at_nine(date)?).await?;
        insert_result(pool, scholar_id, kind, item_id, score, source_key).await?;
    }

    let attendance = vec![
        ("avery.lee@groupscholar.com", "Math", (2026, 2, 2), true),
        ("avery.lee@groupscholar.com", "Math", (2026, 2, 4), true),
        ("kiara.patel@groupscholar.com", "Math", (2026, 2, 2), true),
        ("kiara.patel@groupscholar.com", "Math", (2026, 2, 4), false),
        ("rowan.brooks@groupscholar.com", "Math", (2026, 2, 2), false),
    ];

    for (email, area, (year, month, day), present) in attendance {
        let (scholar_id, cohort) = ids
            .get(email)
            .copied()
            .with_context(|| format!("unknown seed scholar {email}"))?;
        let lesson_id = upsert_lesson(pool, cohort, area).await?;
        let date = NaiveDate::from_ymd_opt(year, month, day).context("invalid date")?;
        insert_attendance(pool, scholar_id, lesson_id, date, present).await?;
    }

    info!(scholars = ids.len(), "seed data inserted");
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub invalidated: usize,
}

/// Imports result rows and fires the invalidation hooks for every write, the
/// same way any other writer of source records is expected to.
pub async fn import_csv(
    pool: &PgPool,
    hooks: &InvalidationHooks,
    csv_path: &std::path::Path,
) -> anyhow::Result<ImportSummary> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        full_name: String,
        email: String,
        guardian_email: Option<String>,
        cohort: String,
        subject_area: String,
        kind: RecordKind,
        title: String,
        occurred_at: NaiveDate,
        score: f64,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut summary = ImportSummary::default();

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let scholar_id = upsert_scholar(
            pool,
            &row.full_name,
            &row.email,
            row.guardian_email.as_deref().filter(|email| !email.is_empty()),
            &row.cohort,
        )
        .await?;
        let lesson_id = upsert_lesson(pool, &row.cohort, &row.subject_area).await?;
        let (item_id, created) = ensure_graded_item(
            pool,
            row.kind,
            lesson_id,
            &row.title,
            at_nine(row.occurred_at)?,
        )
        .await?;

        if created && row.kind == RecordKind::Assignment {
            let report = hooks
                .notify(SourceChange::AssignmentChanged { lesson_id })
                .await;
            summary.invalidated += report.enqueued;
        }

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));
        if insert_result(pool, scholar_id, row.kind, item_id, row.score, &source_key).await? {
            summary.inserted += 1;
            let report = hooks
                .notify(SourceChange::ResultChanged { scholar_id })
                .await;
            summary.invalidated += report.enqueued;
        } else {
            debug!(source_key = %source_key, "result already imported");
        }
    }

    Ok(summary)
}

// Needs a reachable DATABASE_URL; each test runs against a fresh migrated database.
#[cfg(all(test, feature = "postgres-tests"))]
mod tests {
    use super::*;
    use crate::aggregate::{build_metrics, AggregateInput};

    async fn scholar(pool: &PgPool, email: &str) -> Uuid {
        upsert_scholar(pool, "Avery Lee", email, None, "2026")
            .await
            .unwrap()
    }

    fn empty_metrics() -> PerformanceMetrics {
        build_metrics(AggregateInput {
            scholar_results: &[],
            cohort_results: &[],
            attendance: &[],
            assignment_total: 0,
        })
    }

    async fn task_rows(pool: &PgPool, scholar_id: Uuid) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM metrics_snapshots.refresh_tasks WHERE scholar_id = $1")
            .bind(scholar_id)
            .fetch_one(pool)
            .await
            .unwrap()
            .get("n")
    }

    #[sqlx::test]
    async fn enqueue_dedupes_inside_the_window_and_resets_after(pool: PgPool) {
        let store = PgStore::new(pool.clone());
        let id = scholar(&pool, "avery.lee@groupscholar.com").await;
        let now = Utc::now();

        assert_eq!(store.enqueue(id, now).await.unwrap(), EnqueueOutcome::Inserted);
        assert_eq!(
            store.enqueue(id, now + Duration::seconds(5)).await.unwrap(),
            EnqueueOutcome::Deduplicated
        );
        assert_eq!(
            store.enqueue(id, now + Duration::seconds(31)).await.unwrap(),
            EnqueueOutcome::Reset
        );
        assert_eq!(task_rows(&pool, id).await, 1);
        assert_eq!(store.depth().await.unwrap(), 1);
    }

    #[sqlx::test]
    async fn failed_task_is_revived_by_the_next_enqueue(pool: PgPool) {
        let store = PgStore::new(pool.clone());
        let id = scholar(&pool, "kiara.patel@groupscholar.com").await;
        let now = Utc::now();

        store.enqueue(id, now).await.unwrap();
        let task = store.task_for(id).await.unwrap().unwrap();
        assert!(store.claim(task.id, now).await.unwrap());
        assert!(store
            .record_failure(task.id, 3, TaskStatus::Failed, "no cohort", None)
            .await
            .unwrap());

        assert_eq!(
            store.enqueue(id, now + Duration::seconds(1)).await.unwrap(),
            EnqueueOutcome::Reset
        );
        let revived = store.task_for(id).await.unwrap().unwrap();
        assert_eq!(revived.status, TaskStatus::Pending);
        assert_eq!(revived.attempts, 0);
        assert_eq!(revived.last_error, None);
    }

    #[sqlx::test]
    async fn claim_is_won_once_and_orphans_return(pool: PgPool) {
        let store = PgStore::new(pool.clone());
        let id = scholar(&pool, "rowan.brooks@groupscholar.com").await;
        let now = Utc::now();

        store.enqueue(id, now).await.unwrap();
        let due = store.due(10, now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(store.claim(due[0].id, now).await.unwrap());
        assert!(!store.claim(due[0].id, now).await.unwrap());
        assert_eq!(store.depth().await.unwrap(), 0);

        let later = now + Duration::seconds(2);
        assert_eq!(
            store
                .reclaim_orphans(now - Duration::seconds(1), later)
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .reclaim_orphans(now + Duration::seconds(1), later)
                .await
                .unwrap(),
            1
        );
        let task = store.task_for(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.locked_at, None);
    }

    #[sqlx::test]
    async fn completion_only_applies_while_processing(pool: PgPool) {
        let store = PgStore::new(pool.clone());
        let id = scholar(&pool, "jules.moreno@groupscholar.com").await;
        let now = Utc::now();

        store.enqueue(id, now).await.unwrap();
        let task = store.task_for(id).await.unwrap().unwrap();
        assert!(store.claim(task.id, now).await.unwrap());
        assert_eq!(
            store.enqueue(id, now + Duration::seconds(31)).await.unwrap(),
            EnqueueOutcome::Reset
        );

        assert!(!store.complete(task.id, 1).await.unwrap());
        assert!(!store
            .record_failure(task.id, 1, TaskStatus::Pending, "late", Some(now))
            .await
            .unwrap());
        let reset = store.task_for(id).await.unwrap().unwrap();
        assert_eq!(reset.status, TaskStatus::Pending);
        assert_eq!(reset.attempts, 0);

        let later = now + Duration::seconds(40);
        assert!(store.claim(task.id, later).await.unwrap());
        assert!(store.complete(task.id, 1).await.unwrap());
        assert_eq!(
            store.task_for(id).await.unwrap().unwrap().status,
            TaskStatus::Done
        );
    }

    #[sqlx::test]
    async fn commit_bumps_version_and_restores_trust(pool: PgPool) {
        let store = PgStore::new(pool.clone());
        let id = scholar(&pool, "avery.lee@groupscholar.com").await;
        let metrics = empty_metrics();

        assert!(!store.mark_trust(id, TrustStatus::Failed, Some("x")).await.unwrap());
        let first = store.commit(id, &metrics, Utc::now()).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.metrics, metrics);

        assert!(store
            .mark_trust(id, TrustStatus::Failed, Some("no cohort"))
            .await
            .unwrap());
        let failed = store.get(id).await.unwrap().unwrap();
        assert_eq!(failed.trust_status, TrustStatus::Failed);
        assert_eq!(failed.refresh_log.as_deref(), Some("no cohort"));

        let second = store.commit(id, &metrics, Utc::now()).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.trust_status, TrustStatus::Ready);
        assert_eq!(second.refresh_log, None);
        assert_eq!(store.get_many(&[id, Uuid::new_v4()]).await.unwrap().len(), 1);
    }

    #[sqlx::test]
    async fn seeded_cohort_loads_every_record(pool: PgPool) {
        seed(&pool).await.unwrap();
        seed(&pool).await.unwrap();
        let store = PgStore::new(pool.clone());

        let records = store.cohort_records("2026").await.unwrap();
        assert_eq!(records.members.len(), 3);
        assert_eq!(records.assignment_total, 1);
        let results: usize = records.members.iter().map(|m| m.results.len()).sum();
        let marks: usize = records.members.iter().map(|m| m.attendance.len()).sum();
        assert_eq!(results, 7);
        assert_eq!(marks, 5);

        let avery = &records.members[0];
        assert_eq!(avery.guardian_email.as_deref(), Some("morgan.lee@example.com"));
        assert!(avery
            .results
            .iter()
            .any(|r| r.kind == RecordKind::Assignment && r.subject_area.as_deref() == Some("ELA")));
    }
}
