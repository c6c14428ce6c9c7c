//! Owns the GDB/pwndbg child process: spawns it with the machine
//! interface, serializes command writes, correlates asynchronous output
//! back to the issuing call, and tracks [`InferiorState`] from notify
//! records. See spec.md §4.1.

use crate::error::ToolError;
use crate::mi::{self, MIResponse, RecordKind};
use crate::state::InferiorState;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex, Notify};

/// Default per-call timeout when the caller doesn't specify one.
pub const DEFAULT_MI_TIMEOUT: Duration = Duration::from_secs(15);

/// Setup MI commands that MUST run before any user command (spec.md
/// §4.1). Uses `-gdb-set`, the MI-native spelling, rather than mixing in
/// console `set` syntax (Open Question 1, resolved in SPEC_FULL.md).
const SETUP_COMMANDS: &[&str] = &[
    "-gdb-set mi-async on",
    "-gdb-set pagination off",
    "-gdb-set confirm off",
    "-gdb-set follow-fork-mode parent",
    "-gdb-set detach-on-fork off",
];

/// What a single MI command returns to its caller (spec.md §3).
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommandOutcome {
    pub command: String,
    pub responses: Vec<RecordSnapshot>,
    pub success: bool,
    pub error: Option<String>,
    pub state: InferiorState,
    /// Stop reason observed between send and completion, if any (spec.md
    /// §4.1 "the stop reason ... is preserved ... as metadata").
    pub stop_reason: Option<Value>,
}

/// A serializable snapshot of one [`MIResponse`] (the parser's type isn't
/// `Serialize` itself since `text`/`payload` overlap by kind; this is the
/// flattened view tools and the wire protocol see).
#[derive(Debug, Clone, serde::Serialize)]
pub struct RecordSnapshot {
    pub kind: &'static str,
    pub message: String,
    pub payload: Value,
    pub text: Option<String>,
}

impl From<&MIResponse> for RecordSnapshot {
    fn from(r: &MIResponse) -> Self {
        Self {
            kind: match r.kind {
                RecordKind::Console => "console",
                RecordKind::Output => "output",
                RecordKind::Log => "log",
                RecordKind::Notify => "notify",
                RecordKind::Result => "result",
            },
            message: r.message.clone(),
            payload: r.payload.clone(),
            text: r.text.clone(),
        }
    }
}

impl CommandOutcome {
    fn controller_dead(command: &str, state: InferiorState) -> Self {
        Self {
            command: command.to_string(),
            responses: Vec::new(),
            success: false,
            error: Some(ToolError::ControllerDead.to_string()),
            state,
            stop_reason: None,
        }
    }

    fn timeout(command: &str, state: InferiorState) -> Self {
        Self {
            command: command.to_string(),
            responses: Vec::new(),
            success: false,
            error: Some("timeout".to_string()),
            state,
            stop_reason: None,
        }
    }
}

/// A call waiting on its terminating result record.
struct PendingCall {
    tx: oneshot::Sender<CommandOutcome>,
    command: String,
    notify_seq_at_send: u64,
    /// Non-terminating records tagged with this call's correlation id,
    /// accumulated as they arrive.
    buffered: Vec<MIResponse>,
}

struct Inner {
    stdin: Mutex<ChildStdin>,
    next_id: Mutex<u64>,
    outstanding: Mutex<HashMap<u64, PendingCall>>,
    state: Mutex<InferiorState>,
    pid: Mutex<Option<u32>>,
    notify_seq: AtomicU64,
    last_stopped: Mutex<Option<(u64, Value)>>,
    alive: AtomicBool,
    state_changed: Notify,
    /// Untokened console/notify chatter not attributable to any call.
    sidebar: Mutex<Vec<MIResponse>>,
}

impl Inner {
    async fn set_state(&self, new_state: InferiorState) {
        let mut guard = self.state.lock().await;
        if *guard != new_state {
            *guard = new_state;
            drop(guard);
            self.state_changed.notify_waiters();
        }
    }

    async fn handle_notify(&self, resp: MIResponse) {
        let seq = self.notify_seq.fetch_add(1, Ordering::SeqCst) + 1;
        match resp.message.as_str() {
            "running" => self.set_state(InferiorState::Running).await,
            "stopped" => {
                self.set_state(InferiorState::Stopped).await;
                *self.last_stopped.lock().await = Some((seq, resp.payload.clone()));
            }
            "thread-group-started" => {
                if let Some(pid) = resp
                    .payload
                    .get("pid")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<u32>().ok())
                {
                    *self.pid.lock().await = Some(pid);
                }
            }
            "thread-group-exited" => self.set_state(InferiorState::Exited).await,
            _ => {}
        }
        let mut sidebar = self.sidebar.lock().await;
        sidebar.push(resp);
        if sidebar.len() > 1000 {
            let excess = sidebar.len() - 1000;
            sidebar.drain(0..excess);
        }
    }

    async fn buffer_stream(&self, resp: MIResponse) {
        if let Some(cid) = resp.correlation_id {
            let mut outstanding = self.outstanding.lock().await;
            if let Some(call) = outstanding.get_mut(&cid) {
                call.buffered.push(resp);
                return;
            }
        }
        let mut sidebar = self.sidebar.lock().await;
        sidebar.push(resp);
        if sidebar.len() > 1000 {
            let excess = sidebar.len() - 1000;
            sidebar.drain(0..excess);
        }
    }

    async fn complete_call(&self, resp: MIResponse) {
        let Some(cid) = resp.correlation_id else {
            return;
        };
        let call = {
            let mut outstanding = self.outstanding.lock().await;
            outstanding.remove(&cid)
        };
        let Some(call) = call else {
            // Already timed out and discarded; drop silently (spec.md §4.1).
            return;
        };

        let message = resp.message.clone();
        let success = message == "done" || message == "running";
        let error = if message == "error" {
            Some(
                resp.payload
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            )
        } else {
            None
        };

        let stop_reason = {
            let last = self.last_stopped.lock().await;
            match &*last {
                Some((seq, payload)) if *seq > call.notify_seq_at_send => Some(payload.clone()),
                _ => None,
            }
        };

        let mut responses: Vec<RecordSnapshot> =
            call.buffered.iter().map(RecordSnapshot::from).collect();
        responses.push(RecordSnapshot::from(&resp));

        let state = *self.state.lock().await;
        let outcome = CommandOutcome {
            command: call.command,
            responses,
            success,
            error,
            state,
            stop_reason,
        };
        let _ = call.tx.send(outcome);
    }

    async fn discard(&self, cid: u64) {
        self.outstanding.lock().await.remove(&cid);
    }

    async fn fail_all_outstanding(&self) {
        let mut outstanding = self.outstanding.lock().await;
        for (_, call) in outstanding.drain() {
            let state = *self.state.lock().await;
            let _ = call
                .tx
                .send(CommandOutcome::controller_dead(&call.command, state));
        }
    }
}

/// Spawns and drives one GDB/pwndbg subprocess speaking MI3.
pub struct DebuggerController {
    inner: Arc<Inner>,
    _child: Child,
}

impl DebuggerController {
    /// Spawn `pwndbg --interpreter=mi3 --quiet` and run the setup sequence
    /// (spec.md §4.1 spawn contract). `gdb_path` lets callers point at a
    /// specific pwndbg/gdb binary; defaults to `"pwndbg"` on the PATH.
    pub async fn spawn(gdb_path: &str) -> Result<Self, ToolError> {
        let mut cmd = Command::new(gdb_path);
        cmd.arg("--interpreter=mi3")
            .arg("--quiet")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::SpawnFailed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::SpawnFailed("no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::SpawnFailed("no stdout pipe".to_string()))?;

        let inner = Arc::new(Inner {
            stdin: Mutex::new(stdin),
            next_id: Mutex::new(1),
            outstanding: Mutex::new(HashMap::new()),
            state: Mutex::new(InferiorState::Idle),
            pid: Mutex::new(None),
            notify_seq: AtomicU64::new(0),
            last_stopped: Mutex::new(None),
            alive: AtomicBool::new(true),
            state_changed: Notify::new(),
            sidebar: Mutex::new(Vec::new()),
        });

        let reader_inner = inner.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(resp) = mi::parse_line(&line) else {
                            continue;
                        };
                        match resp.kind {
                            RecordKind::Notify => reader_inner.handle_notify(resp).await,
                            RecordKind::Result => reader_inner.complete_call(resp).await,
                            _ => reader_inner.buffer_stream(resp).await,
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "error reading GDB MI stream; record skipped");
                    }
                }
            }
            tracing::info!("GDB stdout closed; controller marked dead");
            reader_inner.alive.store(false, Ordering::SeqCst);
            reader_inner.fail_all_outstanding().await;
        });

        let controller = Self {
            inner,
            _child: child,
        };

        for setup in SETUP_COMMANDS {
            let outcome = controller.execute_mi(setup, DEFAULT_MI_TIMEOUT).await;
            if !outcome.success {
                tracing::warn!(command = %setup, error = ?outcome.error, "setup command failed");
            }
        }

        Ok(controller)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    pub async fn get_state(&self) -> InferiorState {
        *self.inner.state.lock().await
    }

    pub async fn get_pid(&self) -> Option<u32> {
        *self.inner.pid.lock().await
    }

    /// Wait for the inferior's state to change from `current`, or until
    /// `timeout` elapses. Used by tool-level snapshot/attach flows that
    /// want to observe a transition rather than poll.
    pub async fn wait_for_state_change(&self, current: InferiorState, timeout: Duration) {
        if *self.inner.state.lock().await != current {
            return;
        }
        let notified = self.inner.state_changed.notified();
        let _ = tokio::time::timeout(timeout, notified).await;
    }

    async fn send(&self, command_text: &str, timeout: Duration) -> CommandOutcome {
        if !self.is_alive() {
            return CommandOutcome::controller_dead(command_text, self.get_state().await);
        }

        let (cid, rx) = {
            let mut next_id = self.inner.next_id.lock().await;
            let cid = *next_id;
            *next_id += 1;

            let (tx, rx) = oneshot::channel();
            let seq_at_send = self.inner.notify_seq.load(Ordering::SeqCst);
            self.inner.outstanding.lock().await.insert(
                cid,
                PendingCall {
                    tx,
                    command: command_text.to_string(),
                    notify_seq_at_send: seq_at_send,
                    buffered: Vec::new(),
                },
            );

            let wire = format!("{cid}{command_text}\n");
            let mut stdin = self.inner.stdin.lock().await;
            if let Err(e) = stdin.write_all(wire.as_bytes()).await {
                drop(stdin);
                self.inner.discard(cid).await;
                tracing::error!(error = %e, "failed to write MI command; controller dead");
                self.inner.alive.store(false, Ordering::SeqCst);
                return CommandOutcome::controller_dead(command_text, self.get_state().await);
            }
            let _ = stdin.flush().await;
            (cid, rx)
        };

        tracing::debug!(cid, command = %command_text, "sent MI command");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => CommandOutcome::controller_dead(command_text, self.get_state().await),
            Err(_) => {
                self.inner.discard(cid).await;
                CommandOutcome::timeout(command_text, self.get_state().await)
            }
        }
    }

    /// Issue a raw MI command (text already includes its leading `-`).
    pub async fn execute_mi(&self, command: &str, timeout: Duration) -> CommandOutcome {
        self.send(command, timeout).await
    }

    /// Issue a console (CLI-style) command, e.g. `context regs`, `heap`.
    pub async fn execute_console(&self, command: &str, timeout: Duration) -> CommandOutcome {
        self.send(command, timeout).await
    }

    // -- primitives named in spec.md §4.1 -----------------------------

    pub async fn load_file(&self, path: &str) -> CommandOutcome {
        let outcome = self
            .execute_mi(
                &format!("-file-exec-and-symbols {path}"),
                DEFAULT_MI_TIMEOUT,
            )
            .await;
        if outcome.success {
            if let Some(dir) = std::path::Path::new(path).parent() {
                if !dir.as_os_str().is_empty() {
                    let _ = self
                        .execute_mi(
                            &format!("-environment-cd {}", dir.display()),
                            DEFAULT_MI_TIMEOUT,
                        )
                        .await;
                }
            }
            self.inner.set_state(InferiorState::Loaded).await;
        }
        outcome
    }

    pub async fn attach(&self, pid: u32) -> CommandOutcome {
        let outcome = self
            .execute_mi(&format!("-target-attach {pid}"), DEFAULT_MI_TIMEOUT)
            .await;
        if outcome.success {
            *self.inner.pid.lock().await = Some(pid);
            self.inner.set_state(InferiorState::Stopped).await;
        }
        outcome
    }

    pub async fn run(&self, args: &str, start_at_entry: bool) -> CommandOutcome {
        if !args.is_empty() {
            let set_args = self
                .execute_mi(&format!("-exec-arguments {args}"), DEFAULT_MI_TIMEOUT)
                .await;
            if !set_args.success {
                return set_args;
            }
        }
        let cmd = if start_at_entry {
            "-exec-run --start"
        } else {
            "-exec-run"
        };
        self.execute_mi(cmd, DEFAULT_MI_TIMEOUT).await
    }

    async fn require_stopped(&self) -> Option<CommandOutcome> {
        if self.get_state().await != InferiorState::Stopped {
            return Some(CommandOutcome {
                command: String::new(),
                responses: Vec::new(),
                success: false,
                error: Some(ToolError::BadState(format!("{:?}", self.get_state().await)).to_string()),
                state: self.get_state().await,
                stop_reason: None,
            });
        }
        None
    }

    pub async fn continue_execution(&self) -> CommandOutcome {
        if let Some(rejected) = self.require_stopped().await {
            return rejected;
        }
        self.execute_mi("-exec-continue", DEFAULT_MI_TIMEOUT).await
    }

    pub async fn next(&self) -> CommandOutcome {
        if let Some(rejected) = self.require_stopped().await {
            return rejected;
        }
        self.execute_mi("-exec-next", DEFAULT_MI_TIMEOUT).await
    }

    pub async fn step(&self) -> CommandOutcome {
        if let Some(rejected) = self.require_stopped().await {
            return rejected;
        }
        self.execute_mi("-exec-step", DEFAULT_MI_TIMEOUT).await
    }

    pub async fn nexti(&self) -> CommandOutcome {
        if let Some(rejected) = self.require_stopped().await {
            return rejected;
        }
        self.execute_mi("-exec-next-instruction", DEFAULT_MI_TIMEOUT)
            .await
    }

    pub async fn stepi(&self) -> CommandOutcome {
        if let Some(rejected) = self.require_stopped().await {
            return rejected;
        }
        self.execute_mi("-exec-step-instruction", DEFAULT_MI_TIMEOUT)
            .await
    }

    pub async fn finish(&self) -> CommandOutcome {
        if let Some(rejected) = self.require_stopped().await {
            return rejected;
        }
        self.execute_mi("-exec-finish", DEFAULT_MI_TIMEOUT).await
    }

    pub async fn jump(&self, location: &str) -> CommandOutcome {
        if let Some(rejected) = self.require_stopped().await {
            return rejected;
        }
        self.execute_mi(&format!("-exec-jump {location}"), DEFAULT_MI_TIMEOUT)
            .await
    }

    pub async fn until(&self, location: Option<&str>) -> CommandOutcome {
        if let Some(rejected) = self.require_stopped().await {
            return rejected;
        }
        let cmd = match location {
            Some(loc) => format!("-exec-until {loc}"),
            None => "-exec-until".to_string(),
        };
        self.execute_mi(&cmd, DEFAULT_MI_TIMEOUT).await
    }

    pub async fn return_from_function(&self) -> CommandOutcome {
        if let Some(rejected) = self.require_stopped().await {
            return rejected;
        }
        self.execute_mi("-exec-return", DEFAULT_MI_TIMEOUT).await
    }

    pub async fn interrupt(&self) -> CommandOutcome {
        self.execute_mi("-exec-interrupt", DEFAULT_MI_TIMEOUT).await
    }

    pub async fn set_breakpoint(&self, location: &str, condition: Option<&str>) -> CommandOutcome {
        let cmd = match condition {
            Some(cond) => format!(r#"-break-insert -c "{cond}" {location}"#),
            None => format!("-break-insert {location}"),
        };
        self.execute_mi(&cmd, DEFAULT_MI_TIMEOUT).await
    }

    pub async fn list_breakpoints(&self) -> CommandOutcome {
        self.execute_mi("-break-list", DEFAULT_MI_TIMEOUT).await
    }

    pub async fn delete_breakpoint(&self, number: u32) -> CommandOutcome {
        self.execute_mi(&format!("-break-delete {number}"), DEFAULT_MI_TIMEOUT)
            .await
    }

    pub async fn enable_breakpoint(&self, number: u32) -> CommandOutcome {
        self.execute_mi(&format!("-break-enable {number}"), DEFAULT_MI_TIMEOUT)
            .await
    }

    pub async fn disable_breakpoint(&self, number: u32) -> CommandOutcome {
        self.execute_mi(&format!("-break-disable {number}"), DEFAULT_MI_TIMEOUT)
            .await
    }

    pub async fn eval(&self, expr: &str) -> CommandOutcome {
        self.execute_mi(
            &format!(r#"-data-evaluate-expression "{expr}""#),
            DEFAULT_MI_TIMEOUT,
        )
        .await
    }

    pub async fn read_memory_bytes(&self, addr: &str, count: usize) -> CommandOutcome {
        self.execute_mi(
            &format!("-data-read-memory-bytes {addr} {count}"),
            DEFAULT_MI_TIMEOUT,
        )
        .await
    }

    pub async fn read_memory_grid(
        &self,
        addr: &str,
        fmt: &str,
        word_size: usize,
        rows: usize,
        cols: usize,
    ) -> CommandOutcome {
        self.execute_mi(
            &format!("-data-read-memory {addr} {fmt} {word_size} {rows} {cols}"),
            DEFAULT_MI_TIMEOUT,
        )
        .await
    }

    /// `context {kind}` — rejected unless stopped (spec.md §4.1).
    pub async fn get_context(&self, kind: &str) -> CommandOutcome {
        if let Some(rejected) = self.require_stopped().await {
            return rejected;
        }
        self.execute_console(&format!("context {kind}"), DEFAULT_MI_TIMEOUT)
            .await
    }

    /// Fast composite snapshot: registers, stack frames, and a short
    /// disassembly window around $pc — preferred over a full pwndbg
    /// `context all` render for latency (spec.md §4.1).
    pub async fn get_quick_context(&self) -> Result<QuickContext, CommandOutcome> {
        if let Some(rejected) = self.require_stopped().await {
            return Err(rejected);
        }
        let registers = self
            .execute_mi("-data-list-register-values x", DEFAULT_MI_TIMEOUT)
            .await;
        let stack = self
            .execute_mi("-stack-list-frames", DEFAULT_MI_TIMEOUT)
            .await;
        let disasm = self
            .execute_mi(
                "-data-disassemble -s $pc -e $pc+32 -- 1",
                DEFAULT_MI_TIMEOUT,
            )
            .await;
        Ok(QuickContext {
            registers,
            stack,
            disasm,
        })
    }
}

/// The three-query bundle behind `get_context("all")`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QuickContext {
    pub registers: CommandOutcome,
    pub stack: CommandOutcome,
    pub disasm: CommandOutcome,
}
