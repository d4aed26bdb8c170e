use crate::appreciation;
use crate::bulletin::{self, ScopeParams};
use crate::calc::ClassResults;
use crate::config;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{calc_err, db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

/// Shared front half of every results method: class id, scope and the saved
/// engine config, then one full class computation.
fn class_results(state: &AppState, req: &Request) -> Result<ClassResults, serde_json::Value> {
    let conn = db_conn(state, req)?;
    let class_id = required_str(req, "classId")?;
    let params: ScopeParams =
        bulletin::parse_scope_params(req.params.get("scope")).map_err(|e| calc_err(req, e))?;
    let cfg = config::load_engine_config(conn)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let results = bulletin::compute_for_class(conn, &class_id, &params, &cfg)
        .map_err(|e| calc_err(req, e))?;
    tracing::debug!(
        class_id = %class_id,
        total = results.total_students,
        ranked = results.ranked_students,
        "class results computed"
    );
    Ok(results)
}

fn handle_calc_class_results(state: &mut AppState, req: &Request) -> serde_json::Value {
    let results = match class_results(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match serde_json::to_value(&results) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "server_error", e.to_string(), None),
    }
}

fn handle_calc_appreciation(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(grade) = req.params.get("grade").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "grade must be a number", None);
    };
    let max_scale = match req.params.get("maxScale") {
        None => 20.0,
        Some(v) if v.is_null() => 20.0,
        Some(v) => match v.as_f64() {
            Some(n) => n,
            None => return err(&req.id, "bad_params", "maxScale must be a number", None),
        },
    };
    ok(
        &req.id,
        json!({
            "appreciation": appreciation::appreciation(grade, max_scale)
        }),
    )
}

fn handle_reports_student_bulletin(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let results = match class_results(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let report = match bulletin::student_bulletin(&results, &student_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    match serde_json::to_value(&report) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "server_error", e.to_string(), None),
    }
}

fn handle_reports_class_bulletin(state: &mut AppState, req: &Request) -> serde_json::Value {
    let results = match class_results(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match serde_json::to_value(bulletin::class_bulletin(&results)) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "server_error", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "calc.classResults" => Some(handle_calc_class_results(state, req)),
        "calc.appreciation" => Some(handle_calc_appreciation(state, req)),
        "reports.studentBulletin" => Some(handle_reports_student_bulletin(state, req)),
        "reports.classBulletin" => Some(handle_reports_class_bulletin(state, req)),
        _ => None,
    }
}
