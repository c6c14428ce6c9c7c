//! Entry point for the pwno-debug remote debugging service.
//!
//! Initializes tracing, creates the workspace directory, spawns the
//! debugger controller, and serves the MCP tool surface over either
//! stdio or streamable-HTTP alongside the `/attach` HTTP surface
//! (teacher's `src/main.rs` stdio path kept almost verbatim; HTTP
//! serving modeled on axum's standard `serve` pattern).

use anyhow::{Context, Result};
use clap::Parser;
use pwno_debug::auth::AuthState;
use pwno_debug::config::Args;
use pwno_debug::controller::DebuggerController;
use pwno_debug::exploit_pipe::ExploitPipeManager;
use pwno_debug::http::{self, HttpState};
use pwno_debug::server::PwnoDebugServer;
use pwno_debug::subprocess::SubprocessManager;
use pwno_debug::tools::DebuggerTools;
use rmcp::transport::stdio;
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use rmcp::ServiceExt;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const GDB_PATH: &str = "pwndbg";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing to stderr so stdout stays free for MCP stdio
    // transport. Production mode drops ANSI color and switches to a
    // denser single-line format (spec.md §9 Design Notes).
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if pwno_debug::config::is_prod() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .init();
    }

    tracing::info!("starting pwno-debug v{}", env!("CARGO_PKG_VERSION"));

    if !std::path::Path::new(&args.workspace).exists() {
        std::fs::create_dir_all(&args.workspace)
            .with_context(|| format!("failed to create workspace dir {}", args.workspace))?;
        tracing::info!(workspace = %args.workspace, "created workspace directory");
    }

    let controller = Arc::new(
        DebuggerController::spawn(GDB_PATH)
            .await
            .context("failed to spawn debugger controller")?,
    );
    let tools = Arc::new(DebuggerTools::new(controller, uuid::Uuid::new_v4().to_string()));
    let subprocess = SubprocessManager::new();
    let pipes = ExploitPipeManager::new();

    if args.stdio {
        let mcp_server = PwnoDebugServer::new(tools, subprocess, pipes);
        let service = mcp_server.serve(stdio()).await.inspect_err(|e| {
            tracing::error!("serving error: {:?}", e);
        })?;
        service.waiting().await?;
        tracing::info!("pwno-debug server shut down");
        return Ok(());
    }

    let http_state = HttpState {
        tools: tools.clone(),
        subprocess: subprocess.clone(),
        workspace: args.workspace.clone(),
    };
    let auth = AuthState::from_path(args.auth_nonce_file.as_deref());

    let mcp_service = StreamableHttpService::new(
        move || Ok(PwnoDebugServer::new(tools.clone(), subprocess.clone(), pipes.clone())),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    // The nonce check gates only the MCP tool-call surface (mirroring the
    // Python prototype, where `/` `/health` `/attach` stay open and only
    // the MCP router carries the auth dependency).
    let mcp_router = axum::Router::new()
        .nest_service(&args.streamable_http_path, mcp_service)
        .layer(axum::middleware::from_fn_with_state(auth, pwno_debug::auth::require_auth));

    let app = http::router(http_state.clone()).merge(mcp_router);

    let addr = format!("{}:{}", args.host, args.port);
    let attach_addr = format!("{}:{}", args.resolved_attach_host(), args.resolved_attach_port());

    // `/attach` gets its own listener, bound to loopback by default, mirroring
    // the original's separate FastAPI app "for mounting/serving under
    // loopback" (spec.md §6) -- it batch-drives the debugger on a
    // caller-supplied pid with no auth of its own, so it isn't safe to expose
    // on the same listener as the rest of the HTTP surface.
    let attach_app = http::attach_router(http_state);
    let attach_listener = tokio::net::TcpListener::bind(&attach_addr)
        .await
        .with_context(|| format!("failed to bind {attach_addr}"))?;
    tracing::info!(attach_addr = %attach_addr, "listening (attach, loopback)");
    let attach_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(attach_listener, attach_app).await {
            tracing::error!("attach http server error: {e:?}");
        }
    });

    tracing::info!(
        %addr,
        mcp_path = %args.streamable_http_path,
        "listening"
    );
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("http server error")?;

    attach_task.abort();
    tracing::info!("pwno-debug server shut down");
    Ok(())
}
