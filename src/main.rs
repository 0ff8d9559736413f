mod access;
mod backup;
mod bulletin;
mod calc;
mod db;
mod ipc;
mod logging;
mod promotion;
mod query;
mod setup;
mod transfer;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{error, info, warn};

const WORKSPACE_ENV: &str = "GRADEBOOKD_WORKSPACE";

fn initial_state() -> ipc::AppState {
    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };
    let Some(raw) = std::env::var_os(WORKSPACE_ENV) else {
        return state;
    };
    let path = PathBuf::from(raw);
    match db::open_db(&path) {
        Ok(conn) => {
            info!(workspace = %path.to_string_lossy(), "workspace opened from environment");
            state.workspace = Some(path);
            state.db = Some(conn);
        }
        Err(e) => error!(workspace = %path.to_string_lossy(), "cannot open workspace: {e:#}"),
    }
    state
}

fn main() {
    logging::init();
    info!(version = env!("CARGO_PKG_VERSION"), "gradebookd starting");

    let mut state = initial_state();

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
                // No id to echo back.
                warn!("bad request line: {e}");
                let resp = ipc::err("", "bad_json", e.to_string(), None);
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
    info!("stdin closed, shutting down");
}
