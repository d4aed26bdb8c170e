use crate::calc::is_composition_label;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::semester;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn is_composition(title: &str, exam_type: Option<&str>) -> bool {
    is_composition_label(title) || exam_type.map(is_composition_label).unwrap_or(false)
}

fn handle_exams_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, title, exam_type, semester, date
         FROM exams
         WHERE class_id = ?
         ORDER BY COALESCE(date, ''), title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let exam_type: Option<String> = r.get(2)?;
            let sem: Option<String> = r.get(3)?;
            let date: Option<String> = r.get(4)?;
            Ok(json!({
                "id": id,
                "isComposition": is_composition(&title, exam_type.as_deref()),
                "title": title,
                "examType": exam_type,
                "semesterIndex": sem.as_deref().and_then(semester::semester_index),
                "semester": sem,
                "date": date
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(exams) => ok(&req.id, json!({ "exams": exams })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_exams_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_type = optional_str(&req.params, "examType");
    let sem = optional_str(&req.params, "semester").map(|s| semester::canonical_semester(&s));
    let date = optional_str(&req.params, "date");
    if let Some(d) = &date {
        if chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").is_err() {
            return err(
                &req.id,
                "bad_params",
                "date must be YYYY-MM-DD",
                Some(json!({ "date": d })),
            );
        }
    }

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

    let exam_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO exams(id, class_id, title, exam_type, semester, date) VALUES(?, ?, ?, ?, ?, ?)",
        (&exam_id, &class_id, &title, &exam_type, &sem, &date),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exams" })),
        );
    }

    ok(
        &req.id,
        json!({
            "examId": exam_id,
            "semester": sem,
            "isComposition": is_composition(&title, exam_type.as_deref())
        }),
    )
}

fn handle_exams_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exam_id = match required_str(req, "examId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM grades WHERE exam_id = ?", [&exam_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    let deleted = match tx.execute("DELETE FROM exams WHERE id = ?", [&exam_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "exams" })),
            );
        }
    };
    if deleted == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "exam not found", None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.list" => Some(handle_exams_list(state, req)),
        "exams.create" => Some(handle_exams_create(state, req)),
        "exams.delete" => Some(handle_exams_delete(state, req)),
        _ => None,
    }
}
