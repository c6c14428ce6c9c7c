//! The HTTP surface: liveness, health, and the host-driven `/attach` batch
//! endpoint that bypasses the JSON tool protocol (spec.md §4.6, §6).
//!
//! Grounded on `original_source/pwnomcp/router/attach.py` (request/response
//! shape, per-command error capture, "after only runs if attach
//! succeeded") and `original_source/pwnomcp/router/health.py`. The
//! original mounts `/attach` as its own FastAPI app "for mounting/serving
//! under loopback" (`attach.py::get_attach_app`), separate from the main
//! app's `/`/`/health` -- [`router`] and [`attach_router`] mirror that
//! split so [`crate::main`] can bind them to different listeners.

use crate::subprocess::SubprocessManager;
use crate::tools::DebuggerTools;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct HttpState {
    pub tools: Arc<DebuggerTools>,
    pub subprocess: SubprocessManager,
    pub workspace: String,
}

/// `/` and `/health` -- safe to expose on the main listener.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/health", get(health))
        .with_state(state)
}

/// `/attach` alone -- bound to its own loopback-only listener by default
/// (spec.md §6), since it batch-drives the debugger on a caller-supplied
/// pid with no auth of its own.
pub fn attach_router(state: HttpState) -> Router {
    Router::new().route("/attach", post(attach)).with_state(state)
}

async fn liveness() -> &'static str {
    "pwno debugger service is running"
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    components: HashMap<&'static str, &'static str>,
    active_processes: usize,
    workspace: String,
}

async fn health(State(state): State<HttpState>) -> Json<HealthResponse> {
    let mut components = HashMap::new();
    components.insert("debugger", "up");
    components.insert("subprocess_manager", "up");

    Json(HealthResponse {
        status: "ok",
        components,
        active_processes: state.subprocess.list().await.len(),
        workspace: state.workspace,
    })
}

#[derive(Debug, Deserialize)]
pub struct AttachRequest {
    #[serde(default)]
    pre: Vec<String>,
    pid: u32,
    #[serde(default)]
    after: Vec<String>,
    #[serde(rename = "where")]
    binary_path: Option<String>,
}

#[derive(Debug, Serialize)]
struct CommandRecord {
    command: String,
    success: bool,
}

#[derive(Debug, Serialize)]
struct AttachSummary {
    command: &'static str,
    success: bool,
    state: String,
    pid: Option<u32>,
}

#[derive(Debug, Serialize)]
struct AttachResponse {
    successful: bool,
    attach: AttachSummary,
    result: HashMap<String, CommandRecord>,
}

async fn attach(
    State(state): State<HttpState>,
    Json(req): Json<AttachRequest>,
) -> Json<AttachResponse> {
    let mut result = HashMap::new();

    if let Some(path) = &req.binary_path {
        let outcome = state.tools.set_file(path).await;
        result.insert(
            "set-file".to_string(),
            CommandRecord {
                command: format!("set_file {path}"),
                success: outcome.success,
            },
        );
    }

    for cmd in &req.pre {
        let outcome = state.tools.execute_console_raw(cmd).await;
        result.insert(
            cmd.clone(),
            CommandRecord {
                command: cmd.clone(),
                success: outcome.success,
            },
        );
    }

    let attach_outcome = state.tools.attach(req.pid).await;
    let session = state.tools.get_session_info().await;
    let attach_summary = AttachSummary {
        command: "attach",
        success: attach_outcome.outcome.success,
        state: format!("{:?}", session.state).to_lowercase(),
        pid: session.pid,
    };

    // `successful` reflects the attach itself, not the `after` batch --
    // individual command failures are captured per-command in `result`
    // and don't revise this flag (spec.md §4.6, §7 "errors inside
    // individual commands do not abort the batch").
    let successful = attach_outcome.outcome.success;

    if successful {
        for cmd in &req.after {
            let outcome = state.tools.execute_console_raw(cmd).await;
            result.insert(
                cmd.clone(),
                CommandRecord {
                    command: cmd.clone(),
                    success: outcome.success,
                },
            );
        }
    }

    Json(AttachResponse {
        successful,
        attach: attach_summary,
        result,
    })
}
