use crate::config::{self, SettingsSection};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let engine = match config::load_engine_config(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let matricule = match config::load_matricule_config(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "engine": engine,
            "matricule": matricule
        }),
    )
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let section_raw = match required_str(req, "section") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(section) = SettingsSection::parse(&section_raw) else {
        return err(
            &req.id,
            "bad_params",
            "section must be one of: engine, matricule",
            Some(json!({ "section": section_raw })),
        );
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let merged: Result<Result<serde_json::Value, String>, anyhow::Error> = match section {
        SettingsSection::Engine => config::load_engine_config(conn).map(|mut cfg| {
            cfg.merge_patch(patch)?;
            serde_json::to_value(cfg).map_err(|e| e.to_string())
        }),
        SettingsSection::Matricule => config::load_matricule_config(conn).map(|mut cfg| {
            cfg.merge_patch(patch)?;
            serde_json::to_value(cfg).map_err(|e| e.to_string())
        }),
    };
    let value = match merged {
        Ok(Ok(v)) => v,
        Ok(Err(message)) => {
            return err(
                &req.id,
                "bad_params",
                message,
                Some(json!({ "section": section_raw })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Err(e) = db::settings_set_json(conn, section.key(), &value) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(section = %section_raw, "settings updated");
    ok(&req.id, json!({ "section": section_raw, "settings": value }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}
