use crate::appreciation::{self, NOT_AVAILABLE};
use crate::config::{Averaging, EngineConfig, ScalePolicy};
use crate::semester;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

pub const DEFAULT_COEFFICIENT: f64 = 1.0;
pub const DEFAULT_MAX_SCORE: f64 = 20.0;

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Two-decimal rounding used for every average shown on a bulletin.
pub fn round_2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Reads a score the way the grading forms submit it: a JSON number or a
/// numeric string, with either `.` or `,` as decimal separator.
pub fn parse_score(raw: &serde_json::Value) -> Option<f64> {
    let v = match raw {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().replace(',', ".").parse::<f64>().ok()?,
        _ => return None,
    };
    usable(Some(v))
}

fn usable(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite() && *x >= 0.0)
}

fn positive_or(v: Option<f64>, default: f64) -> f64 {
    match v {
        Some(x) if x.is_finite() && x > 0.0 => x,
        _ => default,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradeRecord {
    pub student_id: String,
    pub subject_id: String,
    pub exam_id: Option<String>,
    pub school_id: String,
    pub grade_value: Option<f64>,
    pub max_grade: Option<f64>,
    pub coefficient: Option<f64>,
    pub exam_type: Option<String>,
    pub semester: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub id: String,
    pub name: String,
    pub coefficient: Option<f64>,
    pub max_score: Option<f64>,
}

impl Subject {
    pub fn effective_coefficient(&self) -> f64 {
        positive_or(self.coefficient, DEFAULT_COEFFICIENT)
    }

    pub fn effective_max_score(&self) -> f64 {
        positive_or(self.max_score, DEFAULT_MAX_SCORE)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RosterStudent {
    pub id: String,
    pub display_name: String,
    pub matricule: Option<String>,
    pub sort_order: i64,
}

/// Everything the engine needs for one class, already fetched into memory.
#[derive(Debug, Clone, Default)]
pub struct ClassSnapshot {
    pub class_id: String,
    pub class_name: String,
    pub students: Vec<RosterStudent>,
    pub subjects: Vec<Subject>,
    pub grades: Vec<GradeRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    Single,
    Composition,
}

impl AggregationMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Some(Self::Single),
            "composition" => Some(Self::Composition),
            _ => None,
        }
    }
}

pub fn is_composition_label(label: &str) -> bool {
    label.to_lowercase().contains("composition")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ScopeSelector {
    #[serde(rename_all = "camelCase")]
    Exam {
        exam_id: String,
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        semester: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    Semester { index: u32, label: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    #[serde(flatten)]
    pub selector: ScopeSelector,
    pub mode: AggregationMode,
}

impl Scope {
    /// An exam is a composition when its title or type says so.
    pub fn exam(
        exam_id: impl Into<String>,
        title: impl Into<String>,
        exam_type: Option<&str>,
        semester: Option<u32>,
    ) -> Self {
        let title = title.into();
        let composition =
            is_composition_label(&title) || exam_type.map(is_composition_label).unwrap_or(false);
        Self {
            selector: ScopeSelector::Exam {
                exam_id: exam_id.into(),
                title,
                semester,
            },
            mode: if composition {
                AggregationMode::Composition
            } else {
                AggregationMode::Single
            },
        }
    }

    pub fn semester(index: u32) -> Self {
        Self::period(semester::Period {
            index,
            kind: semester::PeriodKind::Semestre,
        })
    }

    /// A whole semester or trimester; the label keeps the period's own kind.
    pub fn period(period: semester::Period) -> Self {
        Self {
            selector: ScopeSelector::Semester {
                index: period.index,
                label: period.canonical(),
            },
            mode: AggregationMode::Composition,
        }
    }

    pub fn with_mode(mut self, mode: AggregationMode) -> Self {
        self.mode = mode;
        self
    }

    fn validate(&self) -> Result<(), CalcError> {
        let period = match &self.selector {
            ScopeSelector::Exam {
                exam_id,
                semester: period,
                ..
            } => {
                if exam_id.trim().is_empty() {
                    return Err(CalcError::new("bad_params", "scope exam id must not be empty"));
                }
                *period
            }
            ScopeSelector::Semester { index, .. } => Some(*index),
        };
        if period == Some(0) {
            return Err(CalcError::new("bad_params", "semester index must be >= 1"));
        }
        Ok(())
    }

    pub fn includes(&self, rec: &GradeRecord, cfg: &EngineConfig) -> bool {
        match &self.selector {
            ScopeSelector::Exam {
                exam_id,
                semester: period,
                ..
            } => {
                rec.exam_id.as_deref() == Some(exam_id.as_str())
                    && period
                        .map(|s| {
                            semester::matches_semester(
                                rec.semester.as_deref(),
                                s,
                                cfg.semester_matching,
                            )
                        })
                        .unwrap_or(true)
            }
            ScopeSelector::Semester { index, .. } => semester::matches_semester(
                rec.semester.as_deref(),
                *index,
                cfg.semester_matching,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExamKind {
    Devoir,
    Composition,
    Other,
}

fn exam_kind(exam_type: Option<&str>) -> ExamKind {
    let Some(t) = exam_type.map(str::trim) else {
        return ExamKind::Other;
    };
    if t.eq_ignore_ascii_case("devoir") {
        ExamKind::Devoir
    } else if t.eq_ignore_ascii_case("composition") {
        ExamKind::Composition
    } else {
        ExamKind::Other
    }
}

/// Value of a record on the subject's current scale, or None when unusable.
fn scaled_value(rec: &GradeRecord, subject_max: f64, cfg: &EngineConfig) -> Option<f64> {
    let v = usable(rec.grade_value)?;
    match cfg.scale_policy {
        ScalePolicy::Live => Some(v),
        ScalePolicy::Recorded => match rec.max_grade {
            Some(m) if m.is_finite() && m > 0.0 => Some(v * subject_max / m),
            _ => Some(v),
        },
    }
}

/// Mean over ascending values so the result never depends on input order.
fn sorted_mean(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len() as f64;
    Some(values.iter().sum::<f64>() / n)
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SubjectTally {
    pub devoir_avg: Option<f64>,
    pub composition_avg: Option<f64>,
    pub combined_avg: Option<f64>,
}

/// Aggregates the records of one student for one subject within one scope.
/// Records are expected to be pre-filtered to that student, subject and scope.
pub fn aggregate_subject<'a, I>(
    records: I,
    subject: &Subject,
    mode: AggregationMode,
    cfg: &EngineConfig,
) -> SubjectTally
where
    I: IntoIterator<Item = &'a GradeRecord>,
{
    let max = subject.effective_max_score();
    match mode {
        AggregationMode::Single => {
            let values: Vec<f64> = records
                .into_iter()
                .filter_map(|r| scaled_value(r, max, cfg))
                .collect();
            SubjectTally {
                devoir_avg: None,
                composition_avg: None,
                combined_avg: sorted_mean(values),
            }
        }
        AggregationMode::Composition => {
            let mut devoirs = Vec::new();
            let mut compositions = Vec::new();
            for r in records {
                let Some(v) = scaled_value(r, max, cfg) else {
                    continue;
                };
                match exam_kind(r.exam_type.as_deref()) {
                    ExamKind::Devoir => devoirs.push(v),
                    ExamKind::Composition => compositions.push(v),
                    ExamKind::Other => {}
                }
            }
            let devoir_avg = sorted_mean(devoirs);
            let composition_avg = sorted_mean(compositions);
            let combined_avg = match (devoir_avg, composition_avg) {
                (Some(d), Some(c)) => Some((d + c) / 2.0),
                (Some(d), None) => Some(d),
                (None, Some(c)) => Some(c),
                (None, None) => None,
            };
            SubjectTally {
                devoir_avg,
                composition_avg,
                combined_avg,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverallAverage {
    pub average: f64,
    pub has_grades: bool,
    pub total_coefficient: f64,
}

/// Weighted mean over `(average, coefficient)` pairs of graded subjects.
pub fn overall_average<I>(contributions: I) -> OverallAverage
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut sum = 0.0_f64;
    let mut denom = 0.0_f64;
    for (avg, coef) in contributions {
        sum += avg * coef;
        denom += coef;
    }
    if denom > 0.0 {
        OverallAverage {
            average: sum / denom,
            has_grades: true,
            total_coefficient: denom,
        }
    } else {
        OverallAverage {
            average: 0.0,
            has_grades: false,
            total_coefficient: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectResult {
    pub subject_id: String,
    pub subject_name: String,
    pub coefficient: f64,
    pub max_score: f64,
    pub devoir_avg: Option<f64>,
    pub composition_avg: Option<f64>,
    pub combined_avg: Option<f64>,
    pub normalized_avg: Option<f64>,
    pub weighted_points: Option<f64>,
    pub appreciation: &'static str,
    pub graded: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAggregate {
    pub student_id: String,
    pub display_name: String,
    pub matricule: Option<String>,
    pub sort_order: i64,
    pub per_subject: Vec<SubjectResult>,
    pub overall_average: f64,
    pub has_grades: bool,
    pub total_coefficient: f64,
    pub total_points: f64,
    /// Scale `overall_average` is expressed on: the reference scale, or under
    /// native averaging the coefficient-weighted mean of graded subjects' max scores.
    pub average_scale: f64,
    pub rank: Option<u32>,
    pub appreciation: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSummary {
    pub subject_id: String,
    pub name: String,
    pub coefficient: f64,
    pub max_score: f64,
    pub class_average: Option<f64>,
    pub highest: Option<f64>,
    pub lowest: Option<f64>,
    pub graded_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStats {
    pub class_average: Option<f64>,
    pub highest: Option<f64>,
    pub lowest: Option<f64>,
    pub graded_count: usize,
    pub pass_mark: f64,
    pub pass_count: usize,
    pub pass_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassResults {
    pub class_id: String,
    pub class_name: String,
    pub scope: Scope,
    pub reference_scale: f64,
    pub total_students: usize,
    pub ranked_students: usize,
    pub subjects: Vec<SubjectSummary>,
    pub rows: Vec<StudentAggregate>,
    pub stats: ClassStats,
}

fn compute_student(
    student: &RosterStudent,
    subjects: &[Subject],
    records: &HashMap<(&str, &str), Vec<&GradeRecord>>,
    scope: &Scope,
    cfg: &EngineConfig,
) -> StudentAggregate {
    let mut per_subject = Vec::with_capacity(subjects.len());
    let mut contributions: Vec<(f64, f64)> = Vec::new();
    let mut native_scale: Vec<(f64, f64)> = Vec::new();
    let mut total_points = 0.0_f64;

    for subject in subjects {
        let coefficient = subject.effective_coefficient();
        let max_score = subject.effective_max_score();
        let tally = records
            .get(&(student.id.as_str(), subject.id.as_str()))
            .map(|recs| aggregate_subject(recs.iter().copied(), subject, scope.mode, cfg))
            .unwrap_or_default();

        let normalized = tally
            .combined_avg
            .map(|avg| avg * cfg.reference_scale / max_score);
        let weighted = tally.combined_avg.map(|avg| avg * coefficient);
        if let (Some(avg), Some(norm), Some(points)) = (tally.combined_avg, normalized, weighted) {
            let basis = match cfg.averaging {
                Averaging::Reference => norm,
                Averaging::Native => avg,
            };
            contributions.push((basis, coefficient));
            native_scale.push((max_score, coefficient));
            total_points += points;
        }

        per_subject.push(SubjectResult {
            subject_id: subject.id.clone(),
            subject_name: subject.name.clone(),
            coefficient,
            max_score,
            devoir_avg: tally.devoir_avg.map(round_2),
            composition_avg: tally.composition_avg.map(round_2),
            combined_avg: tally.combined_avg.map(round_2),
            normalized_avg: normalized.map(round_2),
            weighted_points: weighted.map(round_2),
            appreciation: tally
                .combined_avg
                .map(|avg| appreciation::appreciation(avg, max_score))
                .unwrap_or(NOT_AVAILABLE),
            graded: tally.combined_avg.is_some(),
        });
    }

    let overall = overall_average(contributions);
    let average_scale = match cfg.averaging {
        Averaging::Reference => cfg.reference_scale,
        Averaging::Native => {
            let weighted = overall_average(native_scale);
            if weighted.has_grades {
                weighted.average
            } else {
                cfg.reference_scale
            }
        }
    };
    let overall_avg = round_2(overall.average);
    StudentAggregate {
        student_id: student.id.clone(),
        display_name: student.display_name.clone(),
        matricule: student.matricule.clone(),
        sort_order: student.sort_order,
        per_subject,
        overall_average: overall_avg,
        has_grades: overall.has_grades,
        total_coefficient: overall.total_coefficient,
        total_points: round_2(total_points),
        average_scale,
        rank: None,
        appreciation: if overall.has_grades {
            appreciation::appreciation(overall_avg, average_scale)
        } else {
            NOT_AVAILABLE
        },
    }
}

/// Assigns ranks in place and reorders rows for display.
///
/// Rank is one more than the number of graded students with a strictly greater
/// overall average, so equal averages share a rank. Students without grades
/// are not ranked and follow the ranked block in roster order.
pub fn rank_students(rows: &mut [StudentAggregate]) {
    rows.sort_by(|a, b| match (a.has_grades, b.has_grades) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (true, true) => b
            .overall_average
            .total_cmp(&a.overall_average)
            .then_with(|| a.sort_order.cmp(&b.sort_order))
            .then_with(|| a.student_id.cmp(&b.student_id)),
        (false, false) => a
            .sort_order
            .cmp(&b.sort_order)
            .then_with(|| a.student_id.cmp(&b.student_id)),
    });

    let mut current_rank = 0_u32;
    let mut previous: Option<f64> = None;
    for (i, row) in rows.iter_mut().enumerate() {
        if !row.has_grades {
            row.rank = None;
            continue;
        }
        if previous != Some(row.overall_average) {
            current_rank = i as u32 + 1;
            previous = Some(row.overall_average);
        }
        row.rank = Some(current_rank);
    }
}

fn min_max_mean(values: &[f64]) -> (Option<f64>, Option<f64>, Option<f64>) {
    if values.is_empty() {
        return (None, None, None);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    (
        sorted.first().copied(),
        sorted.last().copied(),
        Some(round_2(mean)),
    )
}

fn class_stats(rows: &[StudentAggregate], cfg: &EngineConfig) -> ClassStats {
    let averages: Vec<f64> = rows
        .iter()
        .filter(|r| r.has_grades)
        .map(|r| r.overall_average)
        .collect();
    let (lowest, highest, class_average) = min_max_mean(&averages);
    // passMark is on the reference scale; native averages are brought onto it first.
    let pass_count = rows
        .iter()
        .filter(|r| r.has_grades)
        .filter(|r| r.overall_average * cfg.reference_scale / r.average_scale >= cfg.pass_mark)
        .count();
    let pass_rate = if averages.is_empty() {
        None
    } else {
        Some(round_2(100.0 * pass_count as f64 / averages.len() as f64))
    };
    ClassStats {
        class_average,
        highest,
        lowest,
        graded_count: averages.len(),
        pass_mark: cfg.pass_mark,
        pass_count,
        pass_rate,
    }
}

fn subject_summaries(subjects: &[Subject], rows: &[StudentAggregate]) -> Vec<SubjectSummary> {
    subjects
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let values: Vec<f64> = rows
                .iter()
                .filter_map(|r| r.per_subject.get(i).and_then(|p| p.combined_avg))
                .collect();
            let (lowest, highest, class_average) = min_max_mean(&values);
            SubjectSummary {
                subject_id: s.id.clone(),
                name: s.name.clone(),
                coefficient: s.effective_coefficient(),
                max_score: s.effective_max_score(),
                class_average,
                highest,
                lowest,
                graded_count: values.len(),
            }
        })
        .collect()
}

/// Runs the whole pipeline for one class and one scope: aggregate every
/// student's subjects, average them, rank the cohort, summarise the class.
pub fn compute_class_results(
    snapshot: &ClassSnapshot,
    scope: &Scope,
    cfg: &EngineConfig,
) -> Result<ClassResults, CalcError> {
    if snapshot.class_id.trim().is_empty() {
        return Err(CalcError::new("bad_params", "class id must not be empty"));
    }
    scope.validate()?;
    if !(cfg.reference_scale.is_finite() && cfg.reference_scale > 0.0) {
        return Err(CalcError::new("bad_params", "reference scale must be > 0"));
    }

    let mut records: HashMap<(&str, &str), Vec<&GradeRecord>> = HashMap::new();
    for rec in &snapshot.grades {
        if scope.includes(rec, cfg) {
            records
                .entry((rec.student_id.as_str(), rec.subject_id.as_str()))
                .or_default()
                .push(rec);
        }
    }

    let mut rows: Vec<StudentAggregate> = snapshot
        .students
        .iter()
        .map(|s| compute_student(s, &snapshot.subjects, &records, scope, cfg))
        .collect();
    let subjects = subject_summaries(&snapshot.subjects, &rows);
    rank_students(&mut rows);
    let stats = class_stats(&rows, cfg);

    Ok(ClassResults {
        class_id: snapshot.class_id.clone(),
        class_name: snapshot.class_name.clone(),
        scope: scope.clone(),
        reference_scale: cfg.reference_scale,
        total_students: rows.len(),
        ranked_students: stats.graded_count,
        subjects,
        rows,
        stats,
    })
}
