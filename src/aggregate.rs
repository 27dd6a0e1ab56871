//! Pure aggregation of raw result and attendance records into
//! [`PerformanceMetrics`]. Nothing here touches storage or the clock.

use chrono::{DateTime, Datelike, Utc};

use crate::models::{
    AssessmentMetric, AssignmentProgress, AttendanceMark, PerformanceMetrics, RecordKind,
    ResultRecord, SubjectMetric,
};

pub const MAX_SUBJECT_AREAS: usize = 4;
pub const RECENT_ASSESSMENTS: usize = 3;
pub const FALLBACK_ATTENDANCE_RATE: i32 = 96;
pub const FALLBACK_OVERALL_SCORE: i32 = 82;
pub const FALLBACK_READING_MINUTES: i32 = 300;
pub const FALLBACK_MATH_FLUENCY: i32 = 70;
const GENERAL_AREA: &str = "General";

/// Inputs for one scholar's recompute. `cohort_results` includes the scholar's
/// own results when the whole cohort is aggregated together.
#[derive(Debug, Clone, Copy)]
pub struct AggregateInput<'a> {
    pub scholar_results: &'a [ResultRecord],
    pub cohort_results: &'a [ResultRecord],
    pub attendance: &'a [AttendanceMark],
    pub assignment_total: i32,
}

fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}

pub fn clamp_score(value: f64) -> i32 {
    round_half_up(value).clamp(0.0, 100.0) as i32
}

pub fn clamp_growth(value: f64) -> i32 {
    round_half_up(value).clamp(-20.0, 20.0) as i32
}

/// Folds free-text subject labels into the fixed reporting vocabulary.
pub fn canonical_subject_area(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return GENERAL_AREA.to_string();
    };
    let normalized = raw.trim().to_lowercase();
    if normalized.contains("math") {
        "Mathematics".to_string()
    } else if normalized.contains("ela") || normalized.contains("english") {
        "ELA".to_string()
    } else if normalized.contains("science") {
        "Science".to_string()
    } else if normalized.contains("history") || normalized.contains("social") {
        "Social Studies".to_string()
    } else {
        raw.to_string()
    }
}

pub fn default_subject_metrics() -> Vec<SubjectMetric> {
    [
        ("Mathematics", 78, 76),
        ("ELA", 81, 79),
        ("Science", 74, 73),
        ("Social Studies", 75, 74),
    ]
    .into_iter()
    .map(|(name, scholar_score, cohort_average)| SubjectMetric {
        name: name.to_string(),
        scholar_score,
        cohort_average,
    })
    .collect()
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    total: f64,
    count: usize,
}

impl Tally {
    fn average(&self) -> Option<i32> {
        (self.count > 0).then(|| clamp_score(self.total / self.count as f64))
    }
}

// Keeps first-seen order so ties in the final sort stay deterministic.
fn tally_by_area(records: &[ResultRecord]) -> Vec<(String, Tally)> {
    let mut tallies: Vec<(String, Tally)> = Vec::new();
    for record in records {
        let area = canonical_subject_area(record.subject_area.as_deref());
        match tallies.iter_mut().find(|(name, _)| *name == area) {
            Some((_, tally)) => {
                tally.total += record.score;
                tally.count += 1;
            }
            None => tallies.push((
                area,
                Tally {
                    total: record.score,
                    count: 1,
                },
            )),
        }
    }
    tallies
}

pub fn aggregate_subject_metrics(
    scholar_results: &[ResultRecord],
    cohort_results: &[ResultRecord],
    max_areas: usize,
) -> Vec<SubjectMetric> {
    let cohort = tally_by_area(cohort_results);

    let mut metrics: Vec<SubjectMetric> = tally_by_area(scholar_results)
        .into_iter()
        .map(|(name, tally)| {
            let scholar_score = tally.average().unwrap_or(0);
            let cohort_average = cohort
                .iter()
                .find(|(area, _)| *area == name)
                .and_then(|(_, tally)| tally.average())
                .unwrap_or(scholar_score);
            SubjectMetric {
                name,
                scholar_score,
                cohort_average,
            }
        })
        .collect();

    metrics.sort_by(|a, b| b.scholar_score.cmp(&a.scholar_score));
    metrics.truncate(max_areas);
    metrics
}

pub fn period_label(date: DateTime<Utc>) -> String {
    let quarter = date.month0() / 3 + 1;
    format!("Q{} • {}", quarter, date.year())
}

pub fn recent_assessments(records: &[ResultRecord]) -> Vec<AssessmentMetric> {
    let mut sorted: Vec<&ResultRecord> = records.iter().collect();
    sorted.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));

    sorted
        .into_iter()
        .take(RECENT_ASSESSMENTS)
        .map(|record| AssessmentMetric {
            name: record
                .title
                .clone()
                .filter(|title| !title.is_empty())
                .unwrap_or_else(|| "Assessment".to_string()),
            score: clamp_score(record.score),
            period_label: record
                .occurred_at
                .map(period_label)
                .unwrap_or_else(|| "TBD".to_string()),
        })
        .collect()
}

pub fn growth_rate(records: &[ResultRecord]) -> i32 {
    let mut dated: Vec<(DateTime<Utc>, f64)> = records
        .iter()
        .filter_map(|record| record.occurred_at.map(|at| (at, record.score)))
        .collect();
    if dated.len() < 2 {
        return 0;
    }
    dated.sort_by(|a, b| a.0.cmp(&b.0));

    let first = dated[0].1;
    let last = dated[dated.len() - 1].1;
    clamp_growth(last - first)
}

pub fn attendance_rate(marks: &[AttendanceMark]) -> i32 {
    if marks.is_empty() {
        return FALLBACK_ATTENDANCE_RATE;
    }
    let present = marks.iter().filter(|mark| mark.present).count();
    clamp_score(present as f64 / marks.len() as f64 * 100.0)
}

fn find_area<'a>(areas: &'a [SubjectMetric], needles: &[&str]) -> Option<&'a SubjectMetric> {
    areas.iter().find(|metric| {
        let name = metric.name.to_lowercase();
        needles.iter().any(|needle| name.contains(needle))
    })
}

pub fn reading_minutes(areas: &[SubjectMetric]) -> i32 {
    match find_area(areas, &["ela", "english", "reading"]) {
        Some(metric) => (metric.scholar_score * 4).clamp(150, 420),
        None => FALLBACK_READING_MINUTES,
    }
}

pub fn math_fluency(areas: &[SubjectMetric]) -> i32 {
    match find_area(areas, &["math"]) {
        Some(metric) => clamp_score(f64::from(metric.scholar_score + 5)),
        None => FALLBACK_MATH_FLUENCY,
    }
}

pub fn overall_score(records: &[ResultRecord]) -> i32 {
    if records.is_empty() {
        return FALLBACK_OVERALL_SCORE;
    }
    let total: f64 = records.iter().map(|record| record.score).sum();
    clamp_score(total / records.len() as f64)
}

fn well_formed(records: &[ResultRecord]) -> Vec<ResultRecord> {
    records
        .iter()
        .filter(|record| record.score.is_finite())
        .cloned()
        .collect()
}

pub fn build_metrics(input: AggregateInput<'_>) -> PerformanceMetrics {
    let scholar_results = well_formed(input.scholar_results);
    let cohort_results = well_formed(input.cohort_results);

    let mut subject_metrics =
        aggregate_subject_metrics(&scholar_results, &cohort_results, MAX_SUBJECT_AREAS);
    if subject_metrics.is_empty() {
        subject_metrics = default_subject_metrics();
    }

    let completed = scholar_results
        .iter()
        .filter(|record| record.kind == RecordKind::Assignment)
        .count() as i32;

    PerformanceMetrics {
        overall_score: overall_score(&scholar_results),
        growth_rate: growth_rate(&scholar_results),
        attendance_rate: attendance_rate(input.attendance),
        assignments: AssignmentProgress {
            completed,
            total: input.assignment_total.max(completed),
        },
        reading_minutes: reading_minutes(&subject_metrics),
        math_fluency: math_fluency(&subject_metrics),
        assessments: recent_assessments(&scholar_results),
        subject_metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 9, 0, 0).unwrap()
    }

    fn exam(area: &str, score: f64, when: DateTime<Utc>) -> ResultRecord {
        ResultRecord {
            kind: RecordKind::Exam,
            title: Some(format!("{area} check-in")),
            subject_area: Some(area.to_string()),
            occurred_at: Some(when),
            score,
        }
    }

    fn assignment(area: &str, score: f64, when: DateTime<Utc>) -> ResultRecord {
        ResultRecord {
            kind: RecordKind::Assignment,
            ..exam(area, score, when)
        }
    }

    #[test]
    fn two_math_exams_without_attendance() {
        let results = vec![
            exam("Math", 80.0, at(2026, 1, 1)),
            exam("Math", 90.0, at(2026, 1, 10)),
        ];
        let metrics = build_metrics(AggregateInput {
            scholar_results: &results,
            cohort_results: &results,
            attendance: &[],
            assignment_total: 0,
        });

        assert_eq!(metrics.growth_rate, 10);
        assert_eq!(metrics.attendance_rate, 96);
        assert_eq!(metrics.overall_score, 85);
        assert_eq!(metrics.subject_metrics.len(), 1);
        assert_eq!(metrics.subject_metrics[0].name, "Mathematics");
        assert_eq!(metrics.subject_metrics[0].scholar_score, 85);
        assert_eq!(metrics.math_fluency, 90);
        assert_eq!(metrics.reading_minutes, FALLBACK_READING_MINUTES);
    }

    #[test]
    fn labels_fold_into_reporting_areas() {
        assert_eq!(canonical_subject_area(Some("Algebra / Math II")), "Mathematics");
        assert_eq!(canonical_subject_area(Some("English Language Arts")), "ELA");
        assert_eq!(canonical_subject_area(Some(" Earth Science ")), "Science");
        assert_eq!(canonical_subject_area(Some("World History")), "Social Studies");
        assert_eq!(canonical_subject_area(Some("Studio Art")), "Studio Art");
        assert_eq!(canonical_subject_area(None), "General");
    }

    #[test]
    fn areas_sorted_by_scholar_score_and_capped() {
        let when = at(2026, 2, 1);
        let scholar = vec![
            exam("Math", 70.0, when),
            exam("English", 92.0, when),
            exam("Science", 88.0, when),
            exam("History", 60.0, when),
            exam("Art", 99.0, when),
        ];
        let cohort = vec![exam("Math", 64.0, when), exam("Math", 75.0, when)];

        let areas = aggregate_subject_metrics(&scholar, &cohort, MAX_SUBJECT_AREAS);
        let names: Vec<&str> = areas.iter().map(|area| area.name.as_str()).collect();
        assert_eq!(names, vec!["Art", "ELA", "Science", "Mathematics"]);

        let math = &areas[3];
        assert_eq!(math.cohort_average, 70);
        // No cohort records for the area falls back to the scholar's own average.
        assert_eq!(areas[1].cohort_average, 92);
    }

    #[test]
    fn empty_records_use_baseline_shape() {
        let metrics = build_metrics(AggregateInput {
            scholar_results: &[],
            cohort_results: &[],
            attendance: &[],
            assignment_total: 6,
        });

        assert_eq!(metrics.subject_metrics, default_subject_metrics());
        assert_eq!(metrics.overall_score, FALLBACK_OVERALL_SCORE);
        assert_eq!(metrics.growth_rate, 0);
        assert_eq!(metrics.assignments, AssignmentProgress { completed: 0, total: 6 });
        assert_eq!(metrics.reading_minutes, 324);
        assert_eq!(metrics.math_fluency, 83);
        assert!(metrics.assessments.is_empty());
    }

    #[test]
    fn recent_assessments_newest_first_with_quarter_labels() {
        let mut undated = exam("Science", 71.0, at(2026, 1, 1));
        undated.occurred_at = None;
        undated.title = None;
        let records = vec![
            undated,
            exam("Math", 80.0, at(2025, 11, 3)),
            assignment("English", 88.0, at(2026, 4, 20)),
            exam("Science", 93.0, at(2026, 2, 14)),
        ];

        let assessments = recent_assessments(&records);
        assert_eq!(assessments.len(), 3);
        assert_eq!(assessments[0].score, 88);
        assert_eq!(assessments[0].period_label, "Q2 • 2026");
        assert_eq!(assessments[1].period_label, "Q1 • 2026");
        assert_eq!(assessments[2].period_label, "Q4 • 2025");

        let all = recent_assessments(&records[..1]);
        assert_eq!(all[0].name, "Assessment");
        assert_eq!(all[0].period_label, "TBD");
    }

    #[test]
    fn growth_needs_two_dated_records() {
        let mut undated = exam("Math", 10.0, at(2026, 1, 1));
        undated.occurred_at = None;
        assert_eq!(growth_rate(&[undated.clone(), exam("Math", 90.0, at(2026, 1, 2))]), 0);

        let swing = vec![
            exam("Math", 95.0, at(2026, 3, 1)),
            exam("Math", 40.0, at(2026, 1, 1)),
        ];
        assert_eq!(growth_rate(&swing), 20);
    }

    #[test]
    fn attendance_rounds_present_share() {
        let marks = [
            AttendanceMark { present: true },
            AttendanceMark { present: false },
            AttendanceMark { present: true },
        ];
        assert_eq!(attendance_rate(&marks), 67);
        assert_eq!(attendance_rate(&[]), FALLBACK_ATTENDANCE_RATE);
    }

    #[test]
    fn reading_minutes_clamped() {
        let low = vec![SubjectMetric {
            name: "ELA".to_string(),
            scholar_score: 20,
            cohort_average: 20,
        }];
        assert_eq!(reading_minutes(&low), 150);
        let high = vec![SubjectMetric {
            name: "Reading Lab".to_string(),
            scholar_score: 100,
            cohort_average: 100,
        }];
        assert_eq!(reading_minutes(&high), 400);
    }

    #[test]
    fn malformed_scores_are_excluded() {
        let results = vec![
            exam("Math", f64::NAN, at(2026, 1, 1)),
            exam("Math", 70.0, at(2026, 1, 2)),
            assignment("Math", f64::INFINITY, at(2026, 1, 3)),
        ];
        let metrics = build_metrics(AggregateInput {
            scholar_results: &results,
            cohort_results: &results,
            attendance: &[],
            assignment_total: 0,
        });
        assert_eq!(metrics.overall_score, 70);
        assert_eq!(metrics.growth_rate, 0);
        assert_eq!(metrics.assignments.completed, 0);
        assert_eq!(metrics.assessments.len(), 1);
    }

    #[test]
    fn completed_assignments_raise_total() {
        let when = at(2026, 5, 5);
        let results = vec![assignment("Math", 80.0, when), assignment("ELA", 90.0, when)];
        let metrics = build_metrics(AggregateInput {
            scholar_results: &results,
            cohort_results: &results,
            attendance: &[],
            assignment_total: 1,
        });
        assert_eq!(metrics.assignments, AssignmentProgress { completed: 2, total: 2 });
    }

    fn arb_record() -> impl Strategy<Value = ResultRecord> {
        (
            prop_oneof![Just(RecordKind::Exam), Just(RecordKind::Assignment)],
            prop_oneof![
                Just("Math"),
                Just("English"),
                Just("Biology Science"),
                Just("Civics")
            ],
            prop_oneof![-1.0e6..1.0e6f64, Just(f64::NAN)],
            proptest::option::of(0i64..2_000_000_000),
        )
            .prop_map(|(kind, area, score, secs)| ResultRecord {
                kind,
                title: None,
                subject_area: Some(area.to_string()),
                occurred_at: secs.and_then(|secs| DateTime::from_timestamp(secs, 0)),
                score,
            })
    }

    proptest! {
        #[test]
        fn scores_and_growth_stay_in_range(
            scholar in proptest::collection::vec(arb_record(), 0..20),
            cohort in proptest::collection::vec(arb_record(), 0..40),
            present in proptest::collection::vec(any::<bool>(), 0..30),
            total in 0i32..50,
        ) {
            let marks: Vec<AttendanceMark> =
                present.into_iter().map(|present| AttendanceMark { present }).collect();
            let metrics = build_metrics(AggregateInput {
                scholar_results: &scholar,
                cohort_results: &cohort,
                attendance: &marks,
                assignment_total: total,
            });

            prop_assert!((0..=100).contains(&metrics.overall_score));
            prop_assert!((0..=100).contains(&metrics.attendance_rate));
            prop_assert!((0..=100).contains(&metrics.math_fluency));
            prop_assert!((-20..=20).contains(&metrics.growth_rate));
            for area in &metrics.subject_metrics {
                prop_assert!((0..=100).contains(&area.scholar_score));
                prop_assert!((0..=100).contains(&area.cohort_average));
            }
            for assessment in &metrics.assessments {
                prop_assert!((0..=100).contains(&assessment.score));
            }
        }

        #[test]
        fn identical_inputs_give_identical_metrics(
            scholar in proptest::collection::vec(arb_record(), 0..20),
            cohort in proptest::collection::vec(arb_record(), 0..20),
        ) {
            let input = AggregateInput {
                scholar_results: &scholar,
                cohort_results: &cohort,
                attendance: &[],
                assignment_total: 3,
            };
            prop_assert_eq!(build_metrics(input), build_metrics(input));
        }
    }
}
