use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One line of input: `{"id", "method", "params"}`.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The open workspace, if any. `db` is None until `workspace.select` succeeds
/// and briefly while a backup is being imported.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    pub fn workspace_display(&self) -> Option<String> {
        self.workspace
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }
}
