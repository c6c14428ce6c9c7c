//! CLI arguments and environment variables (spec.md §6, §9).
//!
//! Grounded on the `clap` derive style used across the pack's own
//! debugger tooling (e.g. `BugStalker`'s DAP adapter binary) — a flat
//! `#[derive(Parser)]` struct with `long`/`default_value` attributes,
//! no subcommands needed here.

use clap::Parser;

/// Remote debugging service for autonomous security-research agents.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Host to bind the HTTP surface to. Ignored in --stdio mode.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the HTTP surface to. Ignored in --stdio mode.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Host the `/attach` endpoint binds its own listener to. Defaults to
    /// loopback only (spec.md §6 "The HTTP route is bound to loopback only
    /// by default"), independent of `host`.
    #[arg(long)]
    pub attach_host: Option<String>,

    /// Port the `/attach` endpoint's own listener binds to (defaults to
    /// `port` when unset).
    #[arg(long)]
    pub attach_port: Option<u16>,

    /// Path the MCP streamable-HTTP transport is served under.
    #[arg(long, default_value = "/mcp")]
    pub streamable_http_path: String,

    /// Serve the MCP tool surface over stdio instead of streamable-HTTP.
    #[arg(long)]
    pub stdio: bool,

    /// Directory new auxiliary processes and exploit pipes default their
    /// cwd to; created on startup if absent.
    #[arg(long, default_value = "/workspace")]
    pub workspace: String,

    /// Path to a file holding the bearer nonce `/attach` requires. Unset
    /// means development mode (every request authorized).
    #[arg(long)]
    pub auth_nonce_file: Option<String>,
}

impl Args {
    /// `/attach` binds its own listener here, defaulting to loopback only
    /// regardless of what `host` is set to -- a caller must opt in to
    /// exposing attach orchestration beyond the local machine.
    #[must_use]
    pub fn resolved_attach_host(&self) -> String {
        self.attach_host.clone().unwrap_or_else(|| "127.0.0.1".to_string())
    }

    #[must_use]
    pub fn resolved_attach_port(&self) -> u16 {
        self.attach_port.unwrap_or(self.port)
    }
}

/// The remote decompiler endpoint, read from `BINARY_URL` (spec.md §6).
/// Absent means [`crate::collaborators::decompile_remote`] is unreachable
/// and callers should treat decompilation as unavailable.
#[must_use]
pub fn binary_url() -> Option<String> {
    std::env::var("BINARY_URL").ok()
}

/// Whether the process should run in production mode: affects tracing
/// output format (compact human-readable in dev, JSON in prod) per
/// spec.md §9 Design Notes.
#[must_use]
pub fn is_prod() -> bool {
    std::env::var("PROD").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}
