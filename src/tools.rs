//! Tool-level operations exposed to the request surface: translates
//! controller primitives into the named debugger operations, enforces the
//! preconditions the raw controller doesn't know about (no binary loaded,
//! unknown step alias), and keeps [`SessionState`] in sync (spec.md §4.2).
//!
//! Grounded on `original_source/pwnomcp/tools/pwndbg.py` for the operation
//! set and the `step_control` alias map, rewritten as precondition checks
//! over an async controller rather than synchronous dict dispatch.

use crate::collaborators::{format_breakpoint, format_memory_dump};
use crate::controller::{CommandOutcome, DebuggerController, QuickContext, DEFAULT_MI_TIMEOUT};
use crate::error::ToolError;
use crate::state::{Breakpoint, InferiorState, SessionState};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A [`CommandOutcome`] plus an optional human-readable rendering of its
/// payload (`original_source/pwnomcp/utils/format.py`'s breakpoint/hexdump
/// formatting). `#[serde(flatten)]` keeps the wire shape identical to a bare
/// `CommandOutcome` when `rendered` is absent, so existing `success`/`command`
/// consumers don't need to change.
#[derive(Debug, Clone, Serialize)]
pub struct RenderedOutcome {
    #[serde(flatten)]
    pub outcome: CommandOutcome,
    pub rendered: Option<String>,
}

/// What `get_context` returns once it's decided which path to take
/// (spec.md §4.2 `get_context("all")` vs. everything else).
pub enum ContextResult {
    Quick(QuickContext),
    Console(CommandOutcome),
}

/// `attach`'s result bundles the MI outcome with a post-attach snapshot on
/// success: a backtrace and a heap summary via standard console commands
/// (spec.md §4.1 "immediately collect a post-attach snapshot (backtrace,
/// heap summary) via standard console commands"; `original_source/pwnomcp/gdb/controller.py`
/// collects exactly this pair). Failure returns an empty `context` rather
/// than omitting the field (spec.md §7).
pub struct AttachOutcome {
    pub outcome: CommandOutcome,
    pub context: Vec<CommandOutcome>,
}

fn resolve_step_alias(alias: &str) -> Option<&'static str> {
    match alias {
        "c" | "continue" => Some("continue"),
        "n" | "next" => Some("next"),
        "s" | "step" => Some("step"),
        "ni" | "nexti" => Some("nexti"),
        "si" | "stepi" => Some("stepi"),
        _ => None,
    }
}

fn parse_breakpoint(payload: &Value) -> Option<Breakpoint> {
    let bkpt = payload.get("bkpt").unwrap_or(payload);
    let number = bkpt
        .get("number")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<u32>().ok())?;
    let location = bkpt
        .get("original-location")
        .or_else(|| bkpt.get("func"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let address = bkpt
        .get("addr")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let enabled = bkpt.get("enabled").and_then(Value::as_str) != Some("n");
    let condition = bkpt
        .get("cond")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let hit_count = bkpt
        .get("times")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<u32>().ok())
        .unwrap_or(0);
    Some(Breakpoint {
        number,
        location,
        address,
        enabled,
        condition,
        hit_count,
    })
}

/// Bridges one [`DebuggerController`] to the session-scoped view a tool
/// call sees. One instance per debugging session.
pub struct DebuggerTools {
    controller: Arc<DebuggerController>,
    state: Mutex<SessionState>,
}

impl DebuggerTools {
    #[must_use]
    pub fn new(controller: Arc<DebuggerController>, session_id: String) -> Self {
        Self {
            controller,
            state: Mutex::new(SessionState::new(session_id)),
        }
    }

    async fn sync_state_from_controller(&self) {
        let mut state = self.state.lock().await;
        state.set_state(self.controller.get_state().await);
        if let Some(pid) = self.controller.get_pid().await {
            state.set_pid(pid);
        }
    }

    pub async fn set_file(&self, path: &str) -> CommandOutcome {
        let outcome = self.controller.load_file(path).await;
        if outcome.success {
            let mut state = self.state.lock().await;
            state.set_binary(path.to_string());
        }
        self.sync_state_from_controller().await;
        outcome
    }

    pub async fn attach(&self, pid: u32) -> AttachOutcome {
        let outcome = self.controller.attach(pid).await;
        self.sync_state_from_controller().await;
        let context = if outcome.success {
            vec![
                self.execute_console_raw("backtrace").await,
                self.execute_console_raw("heap").await,
            ]
        } else {
            Vec::new()
        };
        AttachOutcome { outcome, context }
    }

    pub async fn run(&self, args: &str, start_at_entry: bool) -> Result<CommandOutcome, ToolError> {
        if !self.state.lock().await.binary_loaded {
            return Err(ToolError::NoBinary);
        }
        let outcome = self.controller.run(args, start_at_entry).await;
        self.sync_state_from_controller().await;
        Ok(outcome)
    }

    async fn require_stopped(&self) -> Result<(), ToolError> {
        let current = self.controller.get_state().await;
        if current != InferiorState::Stopped {
            return Err(ToolError::BadState(format!("{current:?}")));
        }
        Ok(())
    }

    pub async fn step_control(&self, alias: &str) -> Result<CommandOutcome, ToolError> {
        let kind = resolve_step_alias(alias).ok_or_else(|| ToolError::UnknownStep(alias.to_string()))?;
        self.require_stopped().await?;
        let outcome = match kind {
            "continue" => self.controller.continue_execution().await,
            "next" => self.controller.next().await,
            "step" => self.controller.step().await,
            "nexti" => self.controller.nexti().await,
            "stepi" => self.controller.stepi().await,
            _ => unreachable!(),
        };
        self.sync_state_from_controller().await;
        Ok(outcome)
    }

    pub async fn finish(&self) -> Result<CommandOutcome, ToolError> {
        self.require_stopped().await?;
        let outcome = self.controller.finish().await;
        self.sync_state_from_controller().await;
        Ok(outcome)
    }

    pub async fn jump(&self, location: &str) -> Result<CommandOutcome, ToolError> {
        self.require_stopped().await?;
        let outcome = self.controller.jump(location).await;
        self.sync_state_from_controller().await;
        Ok(outcome)
    }

    pub async fn until(&self, location: Option<&str>) -> Result<CommandOutcome, ToolError> {
        self.require_stopped().await?;
        let outcome = self.controller.until(location).await;
        self.sync_state_from_controller().await;
        Ok(outcome)
    }

    pub async fn return_from_function(&self) -> Result<CommandOutcome, ToolError> {
        self.require_stopped().await?;
        let outcome = self.controller.return_from_function().await;
        self.sync_state_from_controller().await;
        Ok(outcome)
    }

    pub async fn interrupt(&self) -> CommandOutcome {
        self.controller.interrupt().await
    }

    /// Execute an arbitrary console command with no precondition — used by
    /// the `/attach` batch endpoint's `pre`/`after` lists, which run
    /// regardless of inferior state (spec.md §4.6).
    pub async fn execute_console_raw(&self, command: &str) -> CommandOutcome {
        self.controller.execute_console(command, DEFAULT_MI_TIMEOUT).await
    }

    /// pwndbg's heap-chunk walk. No dedicated MI primitive exists for this
    /// (SPEC_FULL.md's heap/vmmap passthrough supplement) — it's a named
    /// `execute_console_raw` call, same as any other console command.
    pub async fn heap(&self) -> CommandOutcome {
        self.execute_console_raw("heap").await
    }

    /// pwndbg's tcache-bin summary.
    pub async fn bins(&self) -> CommandOutcome {
        self.execute_console_raw("bins").await
    }

    /// pwndbg's memory-map listing.
    pub async fn vmmap(&self) -> CommandOutcome {
        self.execute_console_raw("vmmap").await
    }

    /// `"all"` delegates to the composite quick-context path; anything
    /// else (`regs`, `stack`, `code`, `disasm`, `backtrace`) becomes a
    /// console `context {kind}` call (spec.md §4.2).
    pub async fn get_context(&self, kind: &str) -> Result<ContextResult, CommandOutcome> {
        if kind == "all" {
            self.controller
                .get_quick_context()
                .await
                .map(ContextResult::Quick)
        } else {
            Ok(ContextResult::Console(self.controller.get_context(kind).await))
        }
    }

    /// `hex` reads raw bytes, `string` uses `x/s`, anything else is a
    /// 1-byte-word grid read (spec.md §4.2). A `hex` read also gets a
    /// `hexdump`-style rendering of the returned bytes.
    pub async fn get_memory(&self, addr: &str, size: usize, fmt: &str) -> RenderedOutcome {
        let outcome = match fmt {
            "hex" => self.controller.read_memory_bytes(addr, size).await,
            "string" => {
                self.controller
                    .execute_console(&format!("x/s {addr}"), DEFAULT_MI_TIMEOUT)
                    .await
            }
            _ => self.controller.read_memory_grid(addr, fmt, 1, 1, size).await,
        };
        let rendered = (fmt == "hex")
            .then(|| outcome.responses.last())
            .flatten()
            .and_then(|record| record.payload.get("memory"))
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("contents"))
            .and_then(Value::as_str)
            .and_then(|hex_str| hex::decode(hex_str).ok())
            .map(|bytes| format_memory_dump(addr, &bytes));
        RenderedOutcome { outcome, rendered }
    }

    pub async fn eval(&self, expr: &str) -> CommandOutcome {
        self.controller.eval(expr).await
    }

    pub async fn set_breakpoint(&self, location: &str, condition: Option<&str>) -> RenderedOutcome {
        let outcome = self.controller.set_breakpoint(location, condition).await;
        let mut rendered = None;
        if outcome.success {
            if let Some(record) = outcome.responses.last() {
                if let Some(bp) = parse_breakpoint(&record.payload) {
                    rendered = Some(format_breakpoint(&bp));
                    self.state.lock().await.set_breakpoint(bp);
                }
            }
        }
        RenderedOutcome { outcome, rendered }
    }

    pub async fn list_breakpoints(&self) -> CommandOutcome {
        let outcome = self.controller.list_breakpoints().await;
        if outcome.success {
            if let Some(record) = outcome.responses.last() {
                if let Some(body) = record
                    .payload
                    .get("BreakpointTable")
                    .and_then(|t| t.get("body"))
                    .and_then(Value::as_array)
                {
                    let mut state = self.state.lock().await;
                    for entry in body {
                        if let Some(bp) = parse_breakpoint(entry) {
                            state.set_breakpoint(bp);
                        }
                    }
                }
            }
        }
        outcome
    }

    pub async fn delete_breakpoint(&self, number: u32) -> CommandOutcome {
        let outcome = self.controller.delete_breakpoint(number).await;
        if outcome.success {
            self.state.lock().await.remove_breakpoint(number);
        }
        outcome
    }

    async fn toggle_breakpoint(&self, number: u32, enabled: bool) -> CommandOutcome {
        let outcome = if enabled {
            self.controller.enable_breakpoint(number).await
        } else {
            self.controller.disable_breakpoint(number).await
        };
        if outcome.success {
            let mut state = self.state.lock().await;
            if let Some(bp) = state.breakpoints.get_mut(&number) {
                bp.enabled = enabled;
            }
        }
        outcome
    }

    pub async fn enable_breakpoint(&self, number: u32) -> CommandOutcome {
        self.toggle_breakpoint(number, true).await
    }

    pub async fn disable_breakpoint(&self, number: u32) -> CommandOutcome {
        self.toggle_breakpoint(number, false).await
    }

    pub async fn get_session_info(&self) -> SessionState {
        self.sync_state_from_controller().await;
        self.state.lock().await.clone()
    }
}
