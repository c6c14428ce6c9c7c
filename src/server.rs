//! MCP tool dispatch: the §6 tool table wired to [`DebuggerTools`],
//! [`SubprocessManager`], and [`ExploitPipeManager`].
//!
//! Grounded on the teacher's `src/server.rs` for the `rmcp` macro plumbing
//! (`tool_router`/`tool_handler`, `Parameters<T>`, `json_content`/
//! `err_result` helpers, rich per-tool descriptions) — the tool set itself
//! is rewritten from shell-process tools to the debugger/subprocess/pipe
//! tool table in spec.md §6.

use crate::error::{ErrorEnvelope, ToolError};
use crate::exploit_pipe::ExploitPipeManager;
use crate::subprocess::SubprocessManager;
use crate::tools::{ContextResult, DebuggerTools};
use nix::sys::signal::Signal;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

fn json_content<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

/// Renders a [`ToolError`] the way spec.md §7 requires: a normal
/// (non-transport) result carrying `{success:false, error, type}` rather
/// than an MCP-level error.
fn tool_error(e: ToolError) -> Result<CallToolResult, McpError> {
    json_content(&ErrorEnvelope::from(e))
}

fn err_result(msg: impl Into<String>) -> Result<CallToolResult, McpError> {
    tool_error(ToolError::Other(msg.into()))
}

// ---------------------------------------------------------------------------
// Parameter structs
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ExecuteParams {
    pub command: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SetFileParams {
    pub binary_path: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct AttachParams {
    pub pid: u32,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct RunParams {
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub start: bool,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct StepControlParams {
    pub command: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct LocationParams {
    pub location: Option<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct GetContextParams {
    pub context_type: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SetBreakpointParams {
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct BreakpointNumberParams {
    pub number: u32,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct GetMemoryParams {
    pub address: String,
    pub size: usize,
    pub format: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct RunCommandParams {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SpawnProcessParams {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct PidParams {
    pub pid: u32,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct KillProcessParams {
    pub pid: u32,
    #[serde(default = "default_signal")]
    pub signal: i32,
}

fn default_signal() -> i32 {
    15 // SIGTERM
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct PwncliParams {
    pub file: String,
    #[serde(default)]
    pub argument: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct SendInputParams {
    pub data: String,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// The debugger MCP server. Holds one [`DebuggerTools`] session, the
/// auxiliary [`SubprocessManager`], and the [`ExploitPipeManager`]
/// singleton slot.
#[derive(Clone)]
pub struct PwnoDebugServer {
    tools: Arc<DebuggerTools>,
    subprocess: SubprocessManager,
    pipes: ExploitPipeManager,
    tool_router: ToolRouter<PwnoDebugServer>,
}

impl PwnoDebugServer {
    #[must_use]
    pub fn new(tools: Arc<DebuggerTools>, subprocess: SubprocessManager, pipes: ExploitPipeManager) -> Self {
        Self {
            tools,
            subprocess,
            pipes,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router]
impl PwnoDebugServer {
    #[tool(description = "Execute an arbitrary GDB/pwndbg console command (e.g. `info registers`, `bt`, `heap`). Use the dedicated tools (step_control, get_context, set_breakpoint, ...) when one fits; this is the escape hatch for anything else. Returns a CommandOutcome with the raw records observed.")]
    async fn execute(&self, Parameters(params): Parameters<ExecuteParams>) -> Result<CallToolResult, McpError> {
        let outcome = self.tools.execute_console_raw(&params.command).await;
        json_content(&outcome)
    }

    #[tool(description = "Load a binary into the debugger by absolute path. Sets up the inferior for a subsequent `run` or breakpoint placement. Must be called before `run`.")]
    async fn set_file(&self, Parameters(params): Parameters<SetFileParams>) -> Result<CallToolResult, McpError> {
        let outcome = self.tools.set_file(&params.binary_path).await;
        json_content(&outcome)
    }

    #[tool(description = "Attach to a running process by pid. On success the inferior state becomes stopped and a post-attach snapshot (backtrace, heap summary) is returned alongside the attach outcome; on failure `context` is empty.")]
    async fn attach(&self, Parameters(params): Parameters<AttachParams>) -> Result<CallToolResult, McpError> {
        let result = self.tools.attach(params.pid).await;
        json_content(&serde_json::json!({
            "outcome": result.outcome,
            "context": result.context,
        }))
    }

    #[tool(description = "Run the loaded inferior, optionally with arguments. Set start=true to stop at the entry point instead of running freely. Fails with no_binary if set_file hasn't succeeded yet.")]
    async fn run(&self, Parameters(params): Parameters<RunParams>) -> Result<CallToolResult, McpError> {
        match self.tools.run(&params.args, params.start).await {
            Ok(outcome) => json_content(&outcome),
            Err(e) => tool_error(e),
        }
    }

    #[tool(description = "Step the stopped inferior. Accepts c/continue, n/next, s/step, ni/nexti, si/stepi. Rejects with bad_state unless the inferior is currently stopped, and unknown_step for any other alias.")]
    async fn step_control(&self, Parameters(params): Parameters<StepControlParams>) -> Result<CallToolResult, McpError> {
        match self.tools.step_control(&params.command).await {
            Ok(outcome) => json_content(&outcome),
            Err(e) => tool_error(e),
        }
    }

    #[tool(description = "Run until the current function returns. Requires the inferior to be stopped.")]
    async fn finish(&self) -> Result<CallToolResult, McpError> {
        match self.tools.finish().await {
            Ok(outcome) => json_content(&outcome),
            Err(e) => tool_error(e),
        }
    }

    #[tool(description = "Jump execution to a location without executing intervening instructions. Requires the inferior to be stopped.")]
    async fn jump(&self, Parameters(params): Parameters<LocationParams>) -> Result<CallToolResult, McpError> {
        let Some(location) = params.location else {
            return err_result("location is required");
        };
        match self.tools.jump(&location).await {
            Ok(outcome) => json_content(&outcome),
            Err(e) => tool_error(e),
        }
    }

    #[tool(description = "Run until a location is reached, or until the current frame returns if no location is given. Requires the inferior to be stopped.")]
    async fn until(&self, Parameters(params): Parameters<LocationParams>) -> Result<CallToolResult, McpError> {
        match self.tools.until(params.location.as_deref()).await {
            Ok(outcome) => json_content(&outcome),
            Err(e) => tool_error(e),
        }
    }

    #[tool(description = "Force an immediate return from the current function. Requires the inferior to be stopped.")]
    async fn return_from_function(&self) -> Result<CallToolResult, McpError> {
        match self.tools.return_from_function().await {
            Ok(outcome) => json_content(&outcome),
            Err(e) => tool_error(e),
        }
    }

    #[tool(description = "Interrupt a running inferior via -exec-interrupt. Safe to call at any time; has no effect if the inferior isn't running.")]
    async fn interrupt(&self) -> Result<CallToolResult, McpError> {
        let outcome = self.tools.interrupt().await;
        json_content(&outcome)
    }

    #[tool(description = "Get a rendered snapshot of the stopped inferior. context_type=\"all\" returns a fast composite of registers/stack/disassembly; regs/stack/code/disasm/backtrace delegate to pwndbg's console `context` command. Requires the inferior to be stopped.")]
    async fn get_context(&self, Parameters(params): Parameters<GetContextParams>) -> Result<CallToolResult, McpError> {
        match self.tools.get_context(&params.context_type).await {
            Ok(ContextResult::Quick(ctx)) => json_content(&ctx),
            Ok(ContextResult::Console(outcome)) => json_content(&outcome),
            Err(outcome) => json_content(&outcome),
        }
    }

    #[tool(description = "Insert a breakpoint at a location (function name, file:line, or *address), with an optional condition expression. Returns the breakpoint payload GDB assigned, including its number, plus a short rendered summary line.")]
    async fn set_breakpoint(&self, Parameters(params): Parameters<SetBreakpointParams>) -> Result<CallToolResult, McpError> {
        let outcome = self
            .tools
            .set_breakpoint(&params.location, params.condition.as_deref())
            .await;
        json_content(&outcome)
    }

    #[tool(description = "List all breakpoints currently known to GDB.")]
    async fn list_breakpoints(&self) -> Result<CallToolResult, McpError> {
        let outcome = self.tools.list_breakpoints().await;
        json_content(&outcome)
    }

    #[tool(description = "Delete a breakpoint by its GDB-assigned number.")]
    async fn delete_breakpoint(&self, Parameters(params): Parameters<BreakpointNumberParams>) -> Result<CallToolResult, McpError> {
        let outcome = self.tools.delete_breakpoint(params.number).await;
        json_content(&outcome)
    }

    #[tool(description = "Enable a previously disabled breakpoint by number.")]
    async fn enable_breakpoint(&self, Parameters(params): Parameters<BreakpointNumberParams>) -> Result<CallToolResult, McpError> {
        let outcome = self.tools.enable_breakpoint(params.number).await;
        json_content(&outcome)
    }

    #[tool(description = "Disable a breakpoint by number without removing it.")]
    async fn disable_breakpoint(&self, Parameters(params): Parameters<BreakpointNumberParams>) -> Result<CallToolResult, McpError> {
        let outcome = self.tools.disable_breakpoint(params.number).await;
        json_content(&outcome)
    }

    #[tool(description = "Walk the heap's chunk layout via pwndbg's `heap` command. Requires the inferior to be stopped with a loaded heap.")]
    async fn heap(&self) -> Result<CallToolResult, McpError> {
        let outcome = self.tools.heap().await;
        json_content(&outcome)
    }

    #[tool(description = "Summarize tcache/fastbin/unsorted-bin contents via pwndbg's `bins` command. Requires the inferior to be stopped.")]
    async fn bins(&self) -> Result<CallToolResult, McpError> {
        let outcome = self.tools.bins().await;
        json_content(&outcome)
    }

    #[tool(description = "List the inferior's memory mappings via pwndbg's `vmmap` command. Requires the inferior to be stopped.")]
    async fn vmmap(&self) -> Result<CallToolResult, McpError> {
        let outcome = self.tools.vmmap().await;
        json_content(&outcome)
    }

    #[tool(description = "Evaluate an expression in the context of the stopped inferior (e.g. a variable, a register, a pointer dereference). Returns the value as GDB formats it.")]
    async fn eval(&self, Parameters(params): Parameters<ExecuteParams>) -> Result<CallToolResult, McpError> {
        let outcome = self.tools.eval(&params.command).await;
        json_content(&outcome)
    }

    #[tool(description = "Read inferior memory at `address`. format=\"hex\" returns raw bytes plus a rendered hexdump, \"string\" reads a NUL-terminated C string, anything else returns a byte-granularity grid read of `size` bytes.")]
    async fn get_memory(&self, Parameters(params): Parameters<GetMemoryParams>) -> Result<CallToolResult, McpError> {
        let outcome = self
            .tools
            .get_memory(&params.address, params.size, &params.format)
            .await;
        json_content(&outcome)
    }

    #[tool(description = "Get a full snapshot of the current debugging session: loaded binary, pid, inferior state, known breakpoints, and registered watches.")]
    async fn get_session_info(&self) -> Result<CallToolResult, McpError> {
        let info = self.tools.get_session_info().await;
        json_content(&info)
    }

    #[tool(description = "Run an auxiliary shell command to completion (not the debugger inferior) and capture its output. Use for build steps, one-off helper scripts, or inspecting the filesystem. Blocks until the command exits or the timeout elapses.")]
    async fn run_command(&self, Parameters(params): Parameters<RunCommandParams>) -> Result<CallToolResult, McpError> {
        let result = self
            .subprocess
            .run(&params.command, params.cwd.as_deref(), &[], params.timeout_seconds)
            .await;
        json_content(&result)
    }

    #[tool(description = "Spawn an auxiliary shell command in the background (not the debugger inferior). Output is captured to temp files, not memory, so it survives a kill. Returns {pid, stdout_path, stderr_path}, plus the terminal result if the process already exited by the time this call returns.")]
    async fn spawn_process(&self, Parameters(params): Parameters<SpawnProcessParams>) -> Result<CallToolResult, McpError> {
        match self
            .subprocess
            .spawn(&params.command, params.cwd.as_deref(), &[])
            .await
        {
            Ok(result) => json_content(&result),
            Err(e) => err_result(e),
        }
    }

    #[tool(description = "Get the current output and status of a tracked auxiliary process started with spawn_process. If the process has exited, this also removes it from tracking after returning its final output.")]
    async fn get_process(&self, Parameters(params): Parameters<PidParams>) -> Result<CallToolResult, McpError> {
        match self.subprocess.get(params.pid).await {
            Ok(snapshot) => json_content(&snapshot),
            Err(e) => tool_error(ToolError::ProcessNotFound(e)),
        }
    }

    #[tool(description = "Send a signal (default SIGTERM, 15) to a tracked auxiliary process. Does not remove it from tracking -- a subsequent get_process still reads its final output.")]
    async fn kill_process(&self, Parameters(params): Parameters<KillProcessParams>) -> Result<CallToolResult, McpError> {
        let signal = Signal::try_from(params.signal)
            .map_err(|_| ())
            .unwrap_or(Signal::SIGTERM);
        match self.subprocess.kill(params.pid, signal).await {
            Ok(()) => json_content(&serde_json::json!({"success": true})),
            Err(e) => tool_error(ToolError::ProcessNotFound(e)),
        }
    }

    #[tool(description = "List tracked auxiliary processes with their pid, command, and running state.")]
    async fn list_processes(&self) -> Result<CallToolResult, McpError> {
        let processes = self.subprocess.list().await;
        json_content(&processes)
    }

    #[tool(description = "Start an interactive exploit script (e.g. a pwntools-based driver) as the singleton exploit pipe. Kills any prior pipe first. Returns the pid and, if the script prints an attach marker within the ready window, the attach snapshot.")]
    async fn pwncli(&self, Parameters(params): Parameters<PwncliParams>) -> Result<CallToolResult, McpError> {
        let command = if params.argument.is_empty() {
            params.file.clone()
        } else {
            format!("{} {}", params.file, params.argument)
        };
        match self.pipes.start(&command, None).await {
            Ok(pid) => {
                let ready = self.pipes.wait_ready(Duration::from_secs(5)).await.ok();
                let attach_result = self.pipes.attach_result().await.unwrap_or(None);
                json_content(&serde_json::json!({
                    "pid": pid,
                    "ready": ready,
                    "attachment": {"result": attach_result},
                }))
            }
            Err(e) => tool_error(e),
        }
    }

    #[tool(description = "Send raw bytes to the exploit pipe's stdin. No newline is appended -- include one in `data` if the script expects a line.")]
    async fn sendinput(&self, Parameters(params): Parameters<SendInputParams>) -> Result<CallToolResult, McpError> {
        match self.pipes.send(params.data.as_bytes()).await {
            Ok(()) => json_content(&serde_json::json!({"success": true})),
            Err(e) => tool_error(e),
        }
    }

    #[tool(description = "Drain and return all exploit pipe output produced since the last checkoutput call.")]
    async fn checkoutput(&self) -> Result<CallToolResult, McpError> {
        match self.pipes.release().await {
            Ok(output) => json_content(&serde_json::json!({"output": output})),
            Err(e) => tool_error(e),
        }
    }
}

#[tool_handler]
impl ServerHandler for PwnoDebugServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "pwno-debug".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Remote debugging service for autonomous security research. Drives one \
                 GDB/pwndbg subprocess: set_file loads a binary, run starts it, \
                 step_control/finish/jump/until/return_from_function advance execution once \
                 stopped, set_breakpoint/list_breakpoints/delete_breakpoint/enable_breakpoint/\
                 disable_breakpoint manage breakpoints, get_context/get_memory/eval/heap/bins/\
                 vmmap inspect state. attach takes over a running process instead of starting one. \
                 run_command/spawn_process/get_process/kill_process/list_processes manage \
                 auxiliary helper processes (builds, scripts) independent of the debugger \
                 inferior, with output captured to disk rather than memory. pwncli starts an \
                 interactive exploit script as a singleton pipe; sendinput/checkoutput drive \
                 it. execute is an escape hatch for any console command not covered by a \
                 dedicated tool."
                    .to_string(),
            ),
        }
    }
}
