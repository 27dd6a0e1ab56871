use std::fmt::Write;

use serde::Serialize;
use uuid::Uuid;

use crate::models::{PerformanceMetrics, SubjectMetric, TrustStatus};
use crate::policy::FreshnessMeta;

pub const ON_TRACK_THRESHOLD: i32 = 80;
pub const ACCELERATED_THRESHOLD: i32 = 90;
pub const WATCH_THRESHOLD: i32 = 60;
const MIN_ASSESSMENT_COVERAGE: usize = 2;
const TOP_SUBJECTS: usize = 3;
const CLASSROOM_AVERAGE_LIFT: i32 = 2;

/// One scholar's snapshot as seen by a cohort read.
#[derive(Debug, Clone)]
pub struct CohortEntry {
    pub scholar_id: Uuid,
    pub guardian_email: Option<String>,
    pub metrics: PerformanceMetrics,
    pub snapshot_age_seconds: i64,
    pub refresh_status: TrustStatus,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasteryBands {
    pub on_track: i32,
    pub watch: i32,
    pub accelerated: i32,
}

impl MasteryBands {
    pub fn labeled(&self) -> [(&'static str, i32, &'static str); 3] {
        [
            ("On Track", self.on_track, "Meeting mastery targets"),
            ("Watch", self.watch, "Needs coaching"),
            ("Accelerated", self.accelerated, "Above grade level"),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubjectAverages {
    pub math: i32,
    pub ela: i32,
    pub science: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQuality {
    pub missing_contacts: usize,
    pub low_assessment_coverage: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortView {
    pub scholar_count: usize,
    pub mastery: MasteryBands,
    pub average_attendance: i32,
    pub top_subjects: Vec<SubjectMetric>,
    pub subject_averages: SubjectAverages,
    pub data_quality: DataQuality,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScholarView {
    pub mastery: MasteryBands,
    pub average_attendance: i32,
    pub top_subjects: Vec<SubjectMetric>,
}

pub fn calculate_average(values: &[i32]) -> i32 {
    if values.is_empty() {
        return 0;
    }
    let total: i64 = values.iter().map(|value| i64::from(*value)).sum();
    (total as f64 / values.len() as f64).round() as i32
}

fn percent(count: usize, total: usize) -> i32 {
    if total == 0 {
        return 0;
    }
    ((count as f64 / total as f64) * 100.0).round() as i32
}

pub fn subject_averages(metrics: &[&SubjectMetric]) -> SubjectAverages {
    let (mut math, mut ela, mut science) = (Vec::new(), Vec::new(), Vec::new());
    for metric in metrics {
        let name = metric.name.to_lowercase();
        if name.contains("math") {
            math.push(metric.scholar_score);
        } else if name.contains("ela") {
            ela.push(metric.scholar_score);
        } else if name.contains("science") {
            science.push(metric.scholar_score);
        }
    }

    SubjectAverages {
        math: calculate_average(&math),
        ela: calculate_average(&ela),
        science: calculate_average(&science),
    }
}

fn top_subjects(metrics: &[&SubjectMetric]) -> Vec<SubjectMetric> {
    let mut areas: Vec<(String, Vec<i32>, Vec<i32>)> = Vec::new();
    for metric in metrics {
        match areas.iter_mut().find(|(name, _, _)| *name == metric.name) {
            Some((_, scholar, cohort)) => {
                scholar.push(metric.scholar_score);
                cohort.push(metric.cohort_average);
            }
            None => areas.push((
                metric.name.clone(),
                vec![metric.scholar_score],
                vec![metric.cohort_average],
            )),
        }
    }

    let mut top: Vec<SubjectMetric> = areas
        .into_iter()
        .map(|(name, scholar, cohort)| SubjectMetric {
            name,
            scholar_score: calculate_average(&scholar),
            cohort_average: calculate_average(&cohort),
        })
        .collect();
    top.sort_by(|a, b| b.scholar_score.cmp(&a.scholar_score));
    top.truncate(TOP_SUBJECTS);
    top
}

pub fn build_cohort_view(entries: &[CohortEntry]) -> CohortView {
    let total = entries.len();
    if total == 0 {
        return CohortView::default();
    }

    let scores = entries.iter().map(|entry| entry.metrics.overall_score);
    let on_track = scores.clone().filter(|score| *score >= ON_TRACK_THRESHOLD).count();
    let watch = scores
        .clone()
        .filter(|score| (WATCH_THRESHOLD..ON_TRACK_THRESHOLD).contains(score))
        .count();
    let accelerated = scores.filter(|score| *score >= ACCELERATED_THRESHOLD).count();

    let attendance: Vec<i32> = entries
        .iter()
        .map(|entry| entry.metrics.attendance_rate)
        .collect();
    let subject_metrics: Vec<&SubjectMetric> = entries
        .iter()
        .flat_map(|entry| entry.metrics.subject_metrics.iter())
        .collect();

    CohortView {
        scholar_count: total,
        mastery: MasteryBands {
            on_track: percent(on_track, total),
            watch: percent(watch, total),
            accelerated: percent(accelerated, total),
        },
        average_attendance: calculate_average(&attendance),
        top_subjects: top_subjects(&subject_metrics),
        subject_averages: subject_averages(&subject_metrics),
        data_quality: DataQuality {
            missing_contacts: entries
                .iter()
                .filter(|entry| {
                    entry
                        .guardian_email
                        .as_deref()
                        .map_or(true, |email| email.trim().is_empty())
                })
                .count(),
            low_assessment_coverage: entries
                .iter()
                .filter(|entry| entry.metrics.assessments.len() < MIN_ASSESSMENT_COVERAGE)
                .count(),
        },
    }
}

/// Single-scholar split: the overall score is "on track", half the growth is
/// "accelerated", and the rest is "watch". Class averages are lifted by two
/// points, capped at 100.
pub fn build_scholar_view(metrics: &PerformanceMetrics) -> ScholarView {
    let on_track = metrics.overall_score.clamp(0, 100);
    let remaining = 100 - on_track;
    let accelerated = ((f64::from(metrics.growth_rate) / 2.0).round() as i32)
        .max(0)
        .min(remaining);

    ScholarView {
        mastery: MasteryBands {
            on_track,
            watch: remaining - accelerated,
            accelerated,
        },
        average_attendance: metrics.attendance_rate,
        top_subjects: metrics
            .subject_metrics
            .iter()
            .take(TOP_SUBJECTS)
            .map(|metric| SubjectMetric {
                cohort_average: (metric.cohort_average + CLASSROOM_AVERAGE_LIFT).min(100),
                ..metric.clone()
            })
            .collect(),
    }
}

pub fn render_markdown(cohort: &str, view: &CohortView, meta: &FreshnessMeta) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Cohort Performance Snapshot");
    let _ = writeln!(
        output,
        "Cohort {} ({} scholars), snapshot policy v{}",
        cohort, view.scholar_count, meta.policy_version
    );
    let _ = writeln!(
        output,
        "Oldest snapshot {}s (threshold {}s), refresh status {}",
        meta.snapshot_age_seconds, meta.stale_threshold_seconds, meta.refresh_status
    );
    if let Some(warnings) = &meta.warnings {
        for warning in warnings {
            let _ = writeln!(output, "> {warning}");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Mastery");
    if view.scholar_count == 0 {
        let _ = writeln!(output, "No scholars enrolled in this cohort.");
    } else {
        for (label, value, helper) in view.mastery.labeled() {
            let _ = writeln!(output, "- {label}: {value}% ({helper})");
        }
        let _ = writeln!(output, "- Average attendance: {}%", view.average_attendance);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Top Subjects");
    if view.top_subjects.is_empty() {
        let _ = writeln!(output, "No subject data yet.");
    } else {
        for subject in &view.top_subjects {
            let _ = writeln!(
                output,
                "- {}: scholar {} / cohort {}",
                subject.name, subject.scholar_score, subject.cohort_average
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Data Quality");
    let _ = writeln!(
        output,
        "- Missing guardian contacts: {}",
        view.data_quality.missing_contacts
    );
    let _ = writeln!(
        output,
        "- Scholars with fewer than {} assessments: {}",
        MIN_ASSESSMENT_COVERAGE, view.data_quality.low_assessment_coverage
    );

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::default_subject_metrics;
    use crate::models::{AssessmentMetric, AssignmentProgress};
    use crate::policy::SNAPSHOT_POLICY;

    fn metrics(overall: i32, attendance: i32, assessments: usize) -> PerformanceMetrics {
        PerformanceMetrics {
            overall_score: overall,
            growth_rate: 0,
            attendance_rate: attendance,
            assignments: AssignmentProgress::default(),
            reading_minutes: 300,
            math_fluency: 70,
            subject_metrics: default_subject_metrics(),
            assessments: (0..assessments)
                .map(|i| AssessmentMetric {
                    name: format!("Quiz {i}"),
                    score: overall,
                    period_label: "Q1 • 2026".to_string(),
                })
                .collect(),
        }
    }

    fn entry(overall: i32, email: Option<&str>, assessments: usize) -> CohortEntry {
        CohortEntry {
            scholar_id: Uuid::new_v4(),
            guardian_email: email.map(str::to_string),
            metrics: metrics(overall, 90, assessments),
            snapshot_age_seconds: 0,
            refresh_status: TrustStatus::Ready,
            warning: None,
        }
    }

    #[test]
    fn bands_use_80_and_90_thresholds() {
        let entries = vec![
            entry(95, Some("a@example.com"), 3),
            entry(85, Some("b@example.com"), 3),
            entry(70, None, 1),
            entry(50, Some(" "), 0),
        ];
        let view = build_cohort_view(&entries);

        assert_eq!(
            view.mastery,
            MasteryBands {
                on_track: 50,
                watch: 25,
                accelerated: 25
            }
        );
        assert_eq!(view.average_attendance, 90);
        assert_eq!(view.data_quality.missing_contacts, 2);
        assert_eq!(view.data_quality.low_assessment_coverage, 2);
        assert_eq!(view.subject_averages, SubjectAverages { math: 78, ela: 81, science: 74 });
        assert_eq!(view.top_subjects[0].name, "ELA");
        assert_eq!(view.top_subjects.len(), 3);
    }

    #[test]
    fn empty_cohort_has_empty_view() {
        assert_eq!(build_cohort_view(&[]), CohortView::default());
    }

    #[test]
    fn scholar_view_splits_remaining_share() {
        let mut grown = metrics(70, 88, 3);
        grown.growth_rate = 15;
        let view = build_scholar_view(&grown);
        assert_eq!(view.mastery.on_track, 70);
        assert_eq!(view.mastery.accelerated, 8);
        assert_eq!(view.mastery.watch, 22);
        assert_eq!(view.top_subjects.len(), 3);
        // Mathematics 78/76 in the default shape.
        assert_eq!(view.top_subjects[0].scholar_score, 78);
        assert_eq!(view.top_subjects[0].cohort_average, 78);

        let mut declining = metrics(99, 88, 3);
        declining.growth_rate = -12;
        let view = build_scholar_view(&declining);
        assert_eq!(view.mastery.accelerated, 0);
        assert_eq!(view.mastery.watch, 1);

        let mut capped = metrics(99, 88, 3);
        capped.subject_metrics[0].cohort_average = 99;
        assert_eq!(build_scholar_view(&capped).top_subjects[0].cohort_average, 100);
    }

    #[test]
    fn markdown_lists_bands_and_warnings() {
        let view = build_cohort_view(&[entry(92, None, 1)]);
        let meta = SNAPSHOT_POLICY.meta(900, TrustStatus::Ready, Some(2));
        let report = render_markdown("2026", &view, &meta);

        assert!(report.starts_with("# Cohort Performance Snapshot"));
        assert!(report.contains("Cohort 2026 (1 scholars)"));
        assert!(report.contains("- On Track: 100%"));
        assert!(report.contains("> Metrics may be slightly delayed."));
        assert!(report.contains("- Missing guardian contacts: 1"));
    }
}
