use crate::appreciation::{self, LegendEntry};
use crate::calc::{
    self, AggregationMode, CalcError, ClassResults, ClassSnapshot, ClassStats, GradeRecord,
    RosterStudent, Scope, StudentAggregate, Subject, SubjectSummary,
};
use crate::config::EngineConfig;
use crate::semester;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeParams {
    pub exam_id: Option<String>,
    pub semester: Option<semester::Period>,
    pub mode: Option<AggregationMode>,
}

/// Accepts `{ examId?, semester?, mode? }`. `semester` may be a number or any
/// recognised semester spelling. At least one of examId/semester is required.
pub fn parse_scope_params(raw: Option<&serde_json::Value>) -> Result<ScopeParams, CalcError> {
    let Some(obj) = raw.and_then(|v| v.as_object()) else {
        return Err(CalcError::new("bad_params", "scope must be an object"));
    };

    let exam_id = match obj.get("examId") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str().map(str::trim) {
            Some(s) if !s.is_empty() => Some(s.to_string()),
            _ => {
                return Err(CalcError::new(
                    "bad_params",
                    "scope.examId must be a non-empty string",
                ))
            }
        },
    };

    let semester = match obj.get("semester") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let period = if let Some(n) = v.as_u64() {
                u32::try_from(n)
                    .ok()
                    .filter(|n| *n > 0)
                    .map(|index| semester::Period {
                        index,
                        kind: semester::PeriodKind::Semestre,
                    })
            } else {
                v.as_str().and_then(semester::parse_period)
            };
            let Some(period) = period else {
                return Err(CalcError::new(
                    "bad_params",
                    "scope.semester must be a positive integer or a semester tag",
                )
                .with_details(json!({ "semester": v })));
            };
            Some(period)
        }
    };

    let mode = match obj.get("mode") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(m) = v.as_str().and_then(AggregationMode::parse) else {
                return Err(CalcError::new(
                    "bad_params",
                    "scope.mode must be one of: single, composition",
                ));
            };
            Some(m)
        }
    };

    if exam_id.is_none() && semester.is_none() {
        return Err(CalcError::new(
            "bad_params",
            "scope requires examId or semester",
        ));
    }

    Ok(ScopeParams {
        exam_id,
        semester,
        mode,
    })
}

pub fn resolve_scope(
    conn: &Connection,
    class_id: &str,
    params: &ScopeParams,
) -> Result<Scope, CalcError> {
    let scope = match &params.exam_id {
        Some(exam_id) => {
            let row: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT title, exam_type FROM exams WHERE id = ? AND class_id = ?",
                    (exam_id, class_id),
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()
                .map_err(db_err)?;
            let Some((title, exam_type)) = row else {
                return Err(CalcError::new("not_found", "exam not found")
                    .with_details(json!({ "examId": exam_id })));
            };
            Scope::exam(
                exam_id.clone(),
                title,
                exam_type.as_deref(),
                params.semester.map(|p| p.index),
            )
        }
        None => match params.semester {
            Some(period) => Scope::period(period),
            None => return Err(CalcError::new("bad_params", "scope requires examId or semester")),
        },
    };
    Ok(match params.mode {
        Some(mode) => scope.with_mode(mode),
        None => scope,
    })
}

/// Reads one class from the workspace store. Only active students form the cohort.
pub fn load_class_snapshot(conn: &Connection, class_id: &str) -> Result<ClassSnapshot, CalcError> {
    if class_id.trim().is_empty() {
        return Err(CalcError::new("bad_params", "class id must not be empty"));
    }
    let class_name: Option<String> = conn
        .query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err)?;
    let Some(class_name) = class_name else {
        return Err(CalcError::new("not_found", "class not found"));
    };

    let mut students_stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, matricule, sort_order
             FROM students
             WHERE class_id = ? AND active = 1
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    let students: Vec<RosterStudent> = students_stmt
        .query_map([class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(RosterStudent {
                id: r.get(0)?,
                display_name: format!("{}, {}", last, first),
                matricule: r.get(3)?,
                sort_order: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut subjects_stmt = conn
        .prepare(
            "SELECT id, name, coefficient, max_score
             FROM subjects
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(db_err)?;
    let subjects: Vec<Subject> = subjects_stmt
        .query_map([class_id], |r| {
            Ok(Subject {
                id: r.get(0)?,
                name: r.get(1)?,
                coefficient: r.get(2)?,
                max_score: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    for s in &subjects {
        if s.coefficient.map(|c| c.is_finite() && c > 0.0) != Some(true) {
            tracing::warn!(
                subject_id = %s.id,
                subject = %s.name,
                "subject coefficient missing or invalid; using {}",
                calc::DEFAULT_COEFFICIENT
            );
        }
        if s.max_score.map(|m| m.is_finite() && m > 0.0) != Some(true) {
            tracing::warn!(
                subject_id = %s.id,
                subject = %s.name,
                "subject max score missing or invalid; using {}",
                calc::DEFAULT_MAX_SCORE
            );
        }
    }

    let mut grades_stmt = conn
        .prepare(
            "SELECT g.student_id, g.subject_id, g.exam_id, g.school_id, g.grade_value,
                    g.max_grade, g.coefficient, g.exam_type, g.semester
             FROM grades g
             JOIN students s ON s.id = g.student_id
             WHERE s.class_id = ?",
        )
        .map_err(db_err)?;
    let grades: Vec<GradeRecord> = grades_stmt
        .query_map([class_id], |r| {
            Ok(GradeRecord {
                student_id: r.get(0)?,
                subject_id: r.get(1)?,
                exam_id: r.get(2)?,
                school_id: r.get(3)?,
                grade_value: r.get(4)?,
                max_grade: r.get(5)?,
                coefficient: r.get(6)?,
                exam_type: r.get(7)?,
                semester: r.get(8)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    tracing::debug!(
        class_id,
        students = students.len(),
        subjects = subjects.len(),
        grades = grades.len(),
        "loaded class snapshot"
    );

    Ok(ClassSnapshot {
        class_id: class_id.to_string(),
        class_name,
        students,
        subjects,
        grades,
    })
}

pub fn compute_for_class(
    conn: &Connection,
    class_id: &str,
    params: &ScopeParams,
    cfg: &EngineConfig,
) -> Result<ClassResults, CalcError> {
    let snapshot = load_class_snapshot(conn, class_id)?;
    let scope = resolve_scope(conn, class_id, params)?;
    calc::compute_class_results(&snapshot, &scope, cfg)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulletinLine {
    pub subject_id: String,
    pub subject_name: String,
    pub devoir: Option<f64>,
    pub composition: Option<f64>,
    pub combined_avg: Option<f64>,
    pub coefficient: f64,
    pub max_score: f64,
    pub weighted_points: Option<f64>,
    pub appreciation: &'static str,
    pub class_average: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentBulletin {
    pub class_id: String,
    pub class_name: String,
    pub scope: Scope,
    pub student_id: String,
    pub display_name: String,
    pub matricule: Option<String>,
    pub per_subject: Vec<BulletinLine>,
    pub total_coefficient: f64,
    pub total_points: f64,
    pub overall_average: f64,
    pub average_scale: f64,
    pub reference_scale: f64,
    pub rank: Option<u32>,
    pub total_students: usize,
    pub ranked_students: usize,
    pub has_grades: bool,
    pub appreciation: &'static str,
    pub class_average: Option<f64>,
    pub highest: Option<f64>,
    pub lowest: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassBulletin {
    pub class_id: String,
    pub class_name: String,
    pub scope: Scope,
    pub reference_scale: f64,
    pub total_students: usize,
    pub ranked_students: usize,
    pub subjects: Vec<SubjectSummary>,
    pub students: Vec<StudentBulletin>,
    pub stats: ClassStats,
    pub legend: Vec<LegendEntry>,
}

fn bulletin_for(results: &ClassResults, row: &StudentAggregate) -> StudentBulletin {
    let per_subject = row
        .per_subject
        .iter()
        .zip(results.subjects.iter())
        .map(|(s, summary)| BulletinLine {
            subject_id: s.subject_id.clone(),
            subject_name: s.subject_name.clone(),
            devoir: s.devoir_avg,
            composition: s.composition_avg,
            combined_avg: s.combined_avg,
            coefficient: s.coefficient,
            max_score: s.max_score,
            weighted_points: s.weighted_points,
            appreciation: s.appreciation,
            class_average: summary.class_average,
        })
        .collect();

    StudentBulletin {
        class_id: results.class_id.clone(),
        class_name: results.class_name.clone(),
        scope: results.scope.clone(),
        student_id: row.student_id.clone(),
        display_name: row.display_name.clone(),
        matricule: row.matricule.clone(),
        per_subject,
        total_coefficient: row.total_coefficient,
        total_points: row.total_points,
        overall_average: row.overall_average,
        average_scale: row.average_scale,
        reference_scale: results.reference_scale,
        rank: row.rank,
        total_students: results.total_students,
        ranked_students: results.ranked_students,
        has_grades: row.has_grades,
        appreciation: row.appreciation,
        class_average: results.stats.class_average,
        highest: results.stats.highest,
        lowest: results.stats.lowest,
    }
}

pub fn student_bulletin(
    results: &ClassResults,
    student_id: &str,
) -> Result<StudentBulletin, CalcError> {
    let Some(row) = results.rows.iter().find(|r| r.student_id == student_id) else {
        return Err(CalcError::new("not_found", "student not in class cohort")
            .with_details(json!({ "studentId": student_id })));
    };
    Ok(bulletin_for(results, row))
}

pub fn class_bulletin(results: &ClassResults) -> ClassBulletin {
    ClassBulletin {
        class_id: results.class_id.clone(),
        class_name: results.class_name.clone(),
        scope: results.scope.clone(),
        reference_scale: results.reference_scale,
        total_students: results.total_students,
        ranked_students: results.ranked_students,
        subjects: results.subjects.clone(),
        students: results
            .rows
            .iter()
            .map(|row| bulletin_for(results, row))
            .collect(),
        stats: results.stats.clone(),
        legend: appreciation::legend(),
    }
}
