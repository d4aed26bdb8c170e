use crate::config;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_rfc3339, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::matricule;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, matricule, last_name, first_name, active, sort_order
         FROM students
         WHERE class_id = ?
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let matricule: Option<String> = r.get(1)?;
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            let active: i64 = r.get(4)?;
            let sort_order: i64 = r.get(5)?;
            Ok(json!({
                "id": id,
                "matricule": matricule,
                "lastName": last,
                "firstName": first,
                "displayName": format!("{}, {}", last, first),
                "active": active != 0,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

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

    let matricule = match optional_str(&req.params, "matricule") {
        Some(m) => m,
        None => {
            let generated = config::load_matricule_config(conn).and_then(|cfg| {
                matricule::next_matricule(conn, &cfg, matricule::current_year())
            });
            match generated {
                Ok(m) => m,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
    };

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, class_id, matricule, last_name, first_name, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &class_id,
            &matricule,
            &last_name,
            &first_name,
            active as i64,
            sort_order,
            now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "matricule": matricule,
            "sortOrder": sort_order
        }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let current: Option<(String, String, Option<String>, i64)> = match conn
        .query_row(
            "SELECT last_name, first_name, matricule, active FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((mut last_name, mut first_name, mut matricule, mut active)) = current else {
        return err(&req.id, "not_found", "student not found", None);
    };

    for (k, v) in patch {
        match k.as_str() {
            "lastName" | "firstName" => {
                let Some(s) = v.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return err(
                        &req.id,
                        "bad_params",
                        format!("{} must be a non-empty string", k),
                        None,
                    );
                };
                if k == "lastName" {
                    last_name = s.to_string();
                } else {
                    first_name = s.to_string();
                }
            }
            "matricule" => {
                matricule = v
                    .as_str()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
            }
            "active" => {
                let Some(b) = v.as_bool() else {
                    return err(&req.id, "bad_params", "active must be boolean", None);
                };
                active = b as i64;
            }
            other => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("unknown student field: {}", other),
                    None,
                )
            }
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE students
         SET last_name = ?, first_name = ?, matricule = ?, active = ?, updated_at = ?
         WHERE id = ?",
        (
            &last_name,
            &first_name,
            &matricule,
            active,
            now_rfc3339(),
            &student_id,
        ),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM grades WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    let deleted = match tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            );
        }
    };
    if deleted == 0 {
        let _ = tx.rollback();
        return err(&req.id, "not_found", "student not found", None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
