use crate::calc;
use crate::config;
use crate::db::{self, GradeInput, UpsertOutcome};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_rfc3339, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::semester;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};

const GRADES_BULK_MAX_EDITS: usize = 5000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl HandlerErr {
    fn bad(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }

    fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

fn opt_string(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn opt_positive(obj: &Map<String, Value>, key: &str) -> Result<Option<f64>, HandlerErr> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_f64() {
            Some(n) if n.is_finite() && n > 0.0 => Ok(Some(n)),
            _ => Err(HandlerErr::bad(format!("{} must be a number > 0", key))),
        },
    }
}

/// Validates one grade edit and fills defaults from the exam, subject and class.
fn resolve_grade_input(conn: &Connection, obj: &Map<String, Value>) -> Result<GradeInput, HandlerErr> {
    let student_id =
        opt_string(obj, "studentId").ok_or_else(|| HandlerErr::bad("missing studentId"))?;
    let subject_id =
        opt_string(obj, "subjectId").ok_or_else(|| HandlerErr::bad("missing subjectId"))?;
    let exam_id = opt_string(obj, "examId");

    let raw_value = obj.get("value").unwrap_or(&Value::Null);
    let Some(grade_value) = calc::parse_score(raw_value) else {
        let negative = raw_value.as_f64().map(|v| v < 0.0).unwrap_or(false);
        return Err(HandlerErr {
            code: "bad_params",
            message: if negative {
                "negative grades are not allowed".to_string()
            } else {
                "value must be a number >= 0".to_string()
            },
            details: Some(json!({ "value": raw_value })),
        });
    };

    let student_class: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(class_id) = student_class else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: Some(json!({ "studentId": student_id })),
        });
    };

    let subject: Option<(String, Option<f64>, Option<f64>)> = conn
        .query_row(
            "SELECT class_id, coefficient, max_score FROM subjects WHERE id = ?",
            [&subject_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((subject_class, subject_coef, subject_max)) = subject else {
        return Err(HandlerErr {
            code: "not_found",
            message: "subject not found".to_string(),
            details: Some(json!({ "subjectId": subject_id })),
        });
    };
    if subject_class != class_id {
        return Err(HandlerErr {
            code: "bad_params",
            message: "subject does not belong to the student's class".to_string(),
            details: Some(json!({ "studentId": student_id, "subjectId": subject_id })),
        });
    }

    let mut exam_type = opt_string(obj, "examType");
    let mut sem = opt_string(obj, "semester");
    if let Some(eid) = &exam_id {
        let exam: Option<(Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT exam_type, semester FROM exams WHERE id = ? AND class_id = ?",
                (eid, &class_id),
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(HandlerErr::db)?;
        let Some((exam_exam_type, exam_semester)) = exam else {
            return Err(HandlerErr {
                code: "not_found",
                message: "exam not found in the student's class".to_string(),
                details: Some(json!({ "examId": eid })),
            });
        };
        exam_type = exam_type.or(exam_exam_type);
        sem = sem.or(exam_semester);
    }

    let school_id = match opt_string(obj, "schoolId") {
        Some(s) => s,
        None => conn
            .query_row(
                "SELECT school_id FROM classes WHERE id = ?",
                [&class_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::db)?
            .unwrap_or_default(),
    };

    let max_grade = opt_positive(obj, "maxGrade")?
        .or(subject_max)
        .or(Some(calc::DEFAULT_MAX_SCORE));
    let coefficient = opt_positive(obj, "coefficient")?
        .or(subject_coef)
        .or(Some(calc::DEFAULT_COEFFICIENT));

    Ok(GradeInput {
        student_id,
        subject_id,
        exam_id,
        school_id,
        grade_value,
        max_grade,
        coefficient,
        exam_type: db::normalize_exam_type(exam_type.as_deref()),
        semester: sem.map(|s| semester::canonical_semester(&s)),
    })
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = optional_str(&req.params, "studentId");
    let subject_id = optional_str(&req.params, "subjectId");
    let exam_id = optional_str(&req.params, "examId");
    let semester_filter = match req.params.get("semester") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let idx = v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .or_else(|| v.as_str().and_then(semester::semester_index));
            match idx {
                Some(i) => Some(i),
                None => {
                    return err(
                        &req.id,
                        "bad_params",
                        "semester must be a positive integer or a semester tag",
                        None,
                    )
                }
            }
        }
    };
    let matching = match config::load_engine_config(conn) {
        Ok(cfg) => cfg.semester_matching,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT g.id, g.student_id, g.subject_id, g.exam_id, g.school_id, g.grade_value,
                g.max_grade, g.coefficient, g.exam_type, g.semester, g.updated_at
         FROM grades g
         JOIN students s ON s.id = g.student_id
         WHERE s.class_id = ?1
           AND (?2 IS NULL OR g.student_id = ?2)
           AND (?3 IS NULL OR g.subject_id = ?3)
           AND (?4 IS NULL OR g.exam_id = ?4)
         ORDER BY s.sort_order, g.subject_id, g.updated_at",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(
            (&class_id, &student_id, &subject_id, &exam_id),
            |r| {
                let sem: Option<String> = r.get(9)?;
                Ok((
                    sem.clone(),
                    json!({
                        "id": r.get::<_, String>(0)?,
                        "studentId": r.get::<_, String>(1)?,
                        "subjectId": r.get::<_, String>(2)?,
                        "examId": r.get::<_, Option<String>>(3)?,
                        "schoolId": r.get::<_, String>(4)?,
                        "value": r.get::<_, Option<f64>>(5)?,
                        "maxGrade": r.get::<_, Option<f64>>(6)?,
                        "coefficient": r.get::<_, Option<f64>>(7)?,
                        "examType": r.get::<_, Option<String>>(8)?,
                        "semester": sem,
                        "updatedAt": r.get::<_, Option<String>>(10)?
                    }),
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(rows) => {
            let grades: Vec<Value> = rows
                .into_iter()
                .filter(|(sem, _)| {
                    semester_filter
                        .map(|t| semester::matches_semester(sem.as_deref(), t, matching))
                        .unwrap_or(true)
                })
                .map(|(_, g)| g)
                .collect();
            ok(&req.id, json!({ "grades": grades }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_grades_upsert(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(obj) = req.params.as_object() else {
        return err(&req.id, "bad_params", "params must be an object", None);
    };
    let input = match resolve_grade_input(conn, obj) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match db::upsert_grade(conn, &input, &now_rfc3339()) {
        Ok(outcome) => ok(
            &req.id,
            json!({
                "gradeId": outcome.id(),
                "created": matches!(outcome, UpsertOutcome::Created(_)),
                "semester": input.semester
            }),
        ),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_grades_bulk_upsert(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(edits_arr) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing edits[]", None);
    };

    if edits_arr.len() > GRADES_BULK_MAX_EDITS {
        let rejected = edits_arr.len();
        return ok(
            &req.id,
            json!({
                "created": 0,
                "updated": 0,
                "rejected": rejected,
                "limitExceeded": true,
                "errors": [{
                    "index": -1,
                    "code": "too_many_edits",
                    "message": format!(
                        "bulk payload exceeds max edits: {} > {}",
                        rejected, GRADES_BULK_MAX_EDITS
                    )
                }]
            }),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let now = now_rfc3339();
    let mut created: usize = 0;
    let mut updated: usize = 0;
    let mut errors: Vec<Value> = Vec::new();

    for (i, edit) in edits_arr.iter().enumerate() {
        let Some(obj) = edit.as_object() else {
            errors.push(json!({
                "index": i,
                "code": "bad_params",
                "message": format!("edit at index {} must be an object", i),
            }));
            continue;
        };
        let input = match resolve_grade_input(&tx, obj) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "index": i,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        };
        match db::upsert_grade(&tx, &input, &now) {
            Ok(UpsertOutcome::Created(_)) => created += 1,
            Ok(UpsertOutcome::Updated(_)) => updated += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "code": "db_update_failed",
                "message": e.to_string(),
            })),
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    if !errors.is_empty() {
        tracing::warn!(rejected = errors.len(), "bulk grade upsert rejected some edits");
    }
    ok(
        &req.id,
        json!({
            "created": created,
            "updated": updated,
            "rejected": errors.len(),
            "limitExceeded": false,
            "errors": errors
        }),
    )
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute("DELETE FROM grades WHERE id = ?", [&grade_id]) {
        Ok(0) => err(&req.id, "not_found", "grade not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.upsert" => Some(handle_grades_upsert(state, req)),
        "grades.bulkUpsert" => Some(handle_grades_bulk_upsert(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        _ => None,
    }
}
