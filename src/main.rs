mod appreciation;
mod backup;
mod bulletin;
mod calc;
mod config;
mod db;
mod ipc;
mod matricule;
mod semester;
mod telemetry;

use std::io::{self, BufRead, Write};

fn main() {
    let settings = config::Settings::from_env();
    if let Err(e) = telemetry::init_tracing(&settings) {
        eprintln!("failed to initialise logging: {e}");
    }

    let mut state = ipc::AppState::default();
    if let Some(path) = settings.workspace.as_deref() {
        if let Err(e) = ipc::open_workspace(&mut state, path) {
            tracing::error!(workspace = %path.display(), error = %e, "startup workspace not opened");
        }
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "bulletind ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                tracing::warn!(error = %e, "dropping malformed request line");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
