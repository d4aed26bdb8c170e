use crate::backup;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::core::select_workspace;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;

fn path_param(req: &Request, key: &str) -> Result<PathBuf, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(PathBuf::from(v.trim())),
        _ => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match path_param(req, "outPath") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let export = match backup::export_workspace_bundle(&workspace_path, &out_path) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(path = %out_path.display(), error = %e, "backup export failed");
            return err(
                &req.id,
                "backup_failed",
                e.to_string(),
                Some(json!({ "path": out_path.to_string_lossy() })),
            );
        }
    };
    tracing::info!(path = %out_path.display(), "workspace exported");

    ok(
        &req.id,
        json!({
            "path": out_path.to_string_lossy(),
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "dbSha256": export.db_sha256
        }),
    )
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match path_param(req, "inPath") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(workspace_path) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if !in_path.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path.to_string_lossy() })),
        );
    }

    // Drop open handle before replacing file.
    state.db = None;

    let imported = backup::import_workspace_bundle(&in_path, &workspace_path);
    // Reopen whatever is on disk now, new or untouched.
    let reopened = select_workspace(state, &workspace_path);

    let import = match imported {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(path = %in_path.display(), error = %e, "backup import failed");
            return err(
                &req.id,
                "backup_failed",
                e.to_string(),
                Some(json!({ "path": in_path.to_string_lossy() })),
            );
        }
    };
    if let Err(e) = reopened {
        return err(&req.id, "db_open_failed", e.to_string(), None);
    }
    tracing::info!(path = %in_path.display(), "workspace imported");

    ok(
        &req.id,
        json!({
            "path": in_path.to_string_lossy(),
            "bundleFormatDetected": import.bundle_format_detected,
            "workspacePath": workspace_path.to_string_lossy()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.export" => Some(handle_backup_export(state, req)),
        "backup.import" => Some(handle_backup_import(state, req)),
        _ => None,
    }
}
