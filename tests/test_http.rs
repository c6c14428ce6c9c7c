//! Integration tests for the `/attach` HTTP surface, exercised directly as a
//! `tower::Service` rather than over a real TCP listener (spec.md §8
//! "Attach orchestration. POST /attach").
//!
//! Covers the two `successful` rules `router::attach` must follow:
//! a failing `after` command does not flip `successful` to false, and an
//! invalid pid does flip it, with `after` absent from `result` either way.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use pwno_debug::controller::DebuggerController;
use pwno_debug::exploit_pipe::ExploitPipeManager;
use pwno_debug::http::{attach_router, HttpState};
use pwno_debug::subprocess::SubprocessManager;
use pwno_debug::tools::DebuggerTools;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

async fn gdb_available() -> bool {
    tokio::process::Command::new("which")
        .arg("gdb")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn test_state() -> HttpState {
    let controller = Arc::new(
        DebuggerController::spawn("gdb")
            .await
            .expect("gdb must be on PATH for this test"),
    );
    let tools = Arc::new(DebuggerTools::new(controller, "test-session".to_string()));
    HttpState {
        tools,
        subprocess: SubprocessManager::new(),
        workspace: "/tmp".to_string(),
    }
}

async fn post_attach(state: HttpState, body: Value) -> Value {
    let app = attach_router(state);
    let request = Request::builder()
        .method("POST")
        .uri("/attach")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn attach_invalid_pid_is_unsuccessful_with_no_after_results() {
    if !gdb_available().await {
        eprintln!("skipping: gdb not on PATH");
        return;
    }
    let state = test_state().await;
    let body = serde_json::json!({
        "pid": 999_999_999,
        "after": ["info registers"],
    });
    let response = post_attach(state, body).await;

    assert_eq!(response["successful"], Value::Bool(false));
    let result = response["result"].as_object().expect("result object");
    assert!(
        !result.contains_key("info registers"),
        "after commands must not run once attach fails: {result:?}"
    );
}

#[tokio::test]
async fn attach_success_is_not_revised_by_a_failing_after_command() {
    if !gdb_available().await {
        eprintln!("skipping: gdb not on PATH");
        return;
    }
    let state = test_state().await;

    // A short-lived child to attach to -- attaching GDB to our own test
    // process would SIGSTOP the harness itself.
    let mut child = tokio::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("failed to spawn sleep");
    let pid = child.id().expect("child has a pid");

    let body = serde_json::json!({
        "pid": pid,
        "after": ["this-is-not-a-real-gdb-command"],
    });
    let response = post_attach(state, body).await;
    let _ = child.kill().await;

    assert_eq!(
        response["attach"]["success"],
        Value::Bool(true),
        "attach itself should have succeeded: {response:?}"
    );
    assert_eq!(
        response["successful"],
        Value::Bool(true),
        "a failing `after` command must not flip `successful`: {response:?}"
    );
    let result = response["result"].as_object().expect("result object");
    let after_record = result
        .get("this-is-not-a-real-gdb-command")
        .expect("after command result must still be recorded");
    assert_eq!(after_record["success"], Value::Bool(false));
}
