use crate::calc::{DEFAULT_COEFFICIENT, DEFAULT_MAX_SCORE};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_positive, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, coefficient, max_score, sort_order
         FROM subjects
         WHERE class_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let coefficient: Option<f64> = r.get(2)?;
            let max_score: Option<f64> = r.get(3)?;
            let sort_order: i64 = r.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "coefficient": coefficient,
                "maxScore": max_score,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let coefficient = match optional_positive(req, &req.params, "coefficient") {
        Ok(v) => v.unwrap_or(DEFAULT_COEFFICIENT),
        Err(e) => return e,
    };
    let max_score = match optional_positive(req, &req.params, "maxScore") {
        Ok(v) => v.unwrap_or(DEFAULT_MAX_SCORE),
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM subjects WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, class_id, name, coefficient, max_score, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &subject_id,
            &class_id,
            &name,
            coefficient,
            max_score,
            sort_order,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects", "name": name })),
        );
    }

    ok(
        &req.id,
        json!({
            "subjectId": subject_id,
            "coefficient": coefficient,
            "maxScore": max_score
        }),
    )
}

/// Changing the scale re-reads every historical grade of the subject under
/// the live scale policy.
fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };
    if let Some(obj) = patch.as_object() {
        if let Some(k) = obj
            .keys()
            .find(|k| !matches!(k.as_str(), "name" | "coefficient" | "maxScore"))
        {
            return err(
                &req.id,
                "bad_params",
                format!("unknown subject field: {}", k),
                None,
            );
        }
    }

    let current: Option<(String, Option<f64>, Option<f64>)> = match conn
        .query_row(
            "SELECT name, coefficient, max_score FROM subjects WHERE id = ?",
            [&subject_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((mut name, mut coefficient, mut max_score)) = current else {
        return err(&req.id, "not_found", "subject not found", None);
    };

    if let Some(v) = patch.get("name") {
        match v.as_str().map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => name = s.to_string(),
            None => return err(&req.id, "bad_params", "name must be a non-empty string", None),
        }
    }
    match optional_positive(req, patch, "coefficient") {
        Ok(Some(v)) => coefficient = Some(v),
        Ok(None) => {}
        Err(e) => return e,
    }
    match optional_positive(req, patch, "maxScore") {
        Ok(Some(v)) => max_score = Some(v),
        Ok(None) => {}
        Err(e) => return e,
    }

    if let Err(e) = conn.execute(
        "UPDATE subjects SET name = ?, coefficient = ?, max_score = ? WHERE id = ?",
        (&name, coefficient, max_score, &subject_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM grades WHERE subject_id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    let deleted = match tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "subjects" })),
            );
        }
    };
    if deleted == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "subject not found", None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
