//! The exploit pipe: one globally tracked interactive child process driving
//! a pwn script, with marker-classified dual output and an event-priority
//! `wait_ready` (spec.md §4.5).
//!
//! Grounded on `original_source/pwnomcp/pwnpipe.py` (marker prefixes, raw
//! vs. structured queues, `wait_ready` condition priority), adapted from
//! Python threads + a stdlib `queue.Queue`/`threading.Event` pair to tokio
//! tasks + `tokio::sync::Notify`, reusing the teacher's `src/session.rs`
//! async dual-reader-task split and drop-to-teardown idiom.

use crate::error::ToolError;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, Notify};

const ATTACH_MARKER: &str = "PWNCLI_ATTACH_RESULT:";
const IPC_MARKER: &str = "PWNO_IPC:";

/// A structured event pushed to the event queue (spec.md §4.5 marker
/// protocol). `Serialize` so it can cross the wire from `release_events`
/// verbatim.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipeEvent {
    Attached { payload: Value },
    Ipc { payload: Value },
    Output { stream: &'static str, line: String },
    Exited { code: Option<i32> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReadyReason {
    Attached,
    Output,
    Exited,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitReadyResult {
    pub ready: bool,
    pub reason: WaitReadyReason,
    pub wait_ms: u64,
}

struct Inner {
    stdin: Mutex<ChildStdin>,
    raw_queue: Mutex<Vec<String>>,
    events: Mutex<VecDeque<PipeEvent>>,
    attach_result: Mutex<Option<Value>>,
    alive: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    activity: Notify,
    pid: u32,
}

impl Inner {
    async fn push_line(&self, stream: &'static str, line: String) {
        if let Some(rest) = line.strip_prefix(ATTACH_MARKER) {
            if let Ok(payload) = serde_json::from_str::<Value>(rest.trim()) {
                *self.attach_result.lock().await = Some(payload.clone());
                self.events.lock().await.push_back(PipeEvent::Attached { payload });
                self.activity.notify_waiters();
                return;
            }
        }
        if let Some(rest) = line.strip_prefix(IPC_MARKER) {
            if let Ok(payload) = serde_json::from_str::<Value>(rest.trim()) {
                self.events.lock().await.push_back(PipeEvent::Ipc { payload });
                self.activity.notify_waiters();
                return;
            }
        }
        self.raw_queue.lock().await.push(line.clone());
        self.events
            .lock()
            .await
            .push_back(PipeEvent::Output { stream, line });
        self.activity.notify_waiters();
    }
}

/// A single interactive driver process. Construct via
/// [`ExploitPipeManager::start`], not directly, so the singleton-replace
/// contract in spec.md §4.5 is upheld.
pub struct ExploitPipe {
    inner: Arc<Inner>,
}

impl ExploitPipe {
    async fn spawn(command: &str, cwd: Option<&str>) -> Result<Self, ToolError> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        // SAFETY: pre_exec runs before exec in the forked child.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::SpawnFailed(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| ToolError::SpawnFailed("no pid".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::SpawnFailed("no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::SpawnFailed("no stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ToolError::SpawnFailed("no stderr pipe".to_string()))?;

        let inner = Arc::new(Inner {
            stdin: Mutex::new(stdin),
            raw_queue: Mutex::new(Vec::new()),
            events: Mutex::new(VecDeque::new()),
            attach_result: Mutex::new(None),
            alive: AtomicBool::new(true),
            exit_code: Mutex::new(None),
            activity: Notify::new(),
            pid,
        });

        let stdout_inner = inner.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stdout_inner.push_line("stdout", line).await;
            }
        });

        let stderr_inner = inner.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_inner.push_line("stderr", line).await;
            }
        });

        let wait_inner = inner.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let code = status.ok().and_then(|s| s.code());
            *wait_inner.exit_code.lock().await = code;
            wait_inner.alive.store(false, Ordering::SeqCst);
            wait_inner
                .events
                .lock()
                .await
                .push_back(PipeEvent::Exited { code });
            wait_inner.activity.notify_waiters();
            tracing::info!(pid = wait_inner.pid, ?code, "exploit pipe exited");
        });

        tracing::info!(pid, "exploit pipe spawned");

        Ok(Self { inner })
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Write raw bytes to the child's stdin. Does not append a newline
    /// (spec.md §4.5 — the caller controls line termination).
    pub async fn send(&self, bytes: &[u8]) -> Result<(), ToolError> {
        if !self.is_alive() {
            return Err(ToolError::PipeDead);
        }
        let mut stdin = self.inner.stdin.lock().await;
        stdin
            .write_all(bytes)
            .await
            .map_err(|e| ToolError::Other(format!("write to pipe failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ToolError::Other(format!("flush to pipe failed: {e}")))
    }

    /// Atomically drain and concatenate the raw output queue.
    pub async fn release(&self) -> String {
        let mut queue = self.inner.raw_queue.lock().await;
        let drained: Vec<String> = queue.drain(..).collect();
        drained.join("\n")
    }

    /// Atomically drain the structured event queue.
    pub async fn release_events(&self) -> Vec<PipeEvent> {
        let mut events = self.inner.events.lock().await;
        events.drain(..).collect()
    }

    #[must_use]
    pub async fn attach_result(&self) -> Option<Value> {
        self.inner.attach_result.lock().await.clone()
    }

    pub async fn exit_code(&self) -> Option<i32> {
        *self.inner.exit_code.lock().await
    }

    /// Block until the first of: attach marker seen, new output produced,
    /// child exited, or timeout (spec.md §4.5). Priority on simultaneous
    /// conditions is attached > output > exited > timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> WaitReadyResult {
        let start = Instant::now();
        let baseline_raw = self.inner.raw_queue.lock().await.len();
        let baseline_events = self.inner.events.lock().await.len();

        loop {
            if self.inner.attach_result.lock().await.is_some() {
                return done(start, WaitReadyReason::Attached);
            }
            if self.inner.raw_queue.lock().await.len() > baseline_raw
                || self.inner.events.lock().await.len() > baseline_events
            {
                return done(start, WaitReadyReason::Output);
            }
            if !self.is_alive() {
                return done(start, WaitReadyReason::Exited);
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return WaitReadyResult {
                    ready: false,
                    reason: WaitReadyReason::Timeout,
                    wait_ms: elapsed.as_millis() as u64,
                };
            }

            let remaining = timeout - elapsed;
            let _ = tokio::time::timeout(remaining, self.inner.activity.notified()).await;
        }
    }

    /// Send SIGKILL to the process group (spec.md §4.5 "kills any prior
    /// pipe before starting a new one").
    pub fn kill(&self) {
        let _ = nix::sys::signal::kill(Pid::from_raw(-(self.inner.pid as i32)), Signal::SIGKILL);
        self.inner.alive.store(false, Ordering::SeqCst);
    }
}

fn done(start: Instant, reason: WaitReadyReason) -> WaitReadyResult {
    WaitReadyResult {
        ready: true,
        reason,
        wait_ms: start.elapsed().as_millis() as u64,
    }
}

/// Owns at most one live [`ExploitPipe`]; starting a new one kills and
/// replaces whatever was running (spec.md §4.5).
#[derive(Clone)]
pub struct ExploitPipeManager {
    current: Arc<Mutex<Option<ExploitPipe>>>,
}

impl ExploitPipeManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn start(&self, command: &str, cwd: Option<&str>) -> Result<u32, ToolError> {
        let pipe = ExploitPipe::spawn(command, cwd).await?;
        let pid = pipe.pid();
        let mut current = self.current.lock().await;
        if let Some(prior) = current.take() {
            tracing::info!(prior_pid = prior.pid(), "killing prior exploit pipe");
            prior.kill();
        }
        *current = Some(pipe);
        Ok(pid)
    }

    pub async fn send(&self, bytes: &[u8]) -> Result<(), ToolError> {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(pipe) => pipe.send(bytes).await,
            None => Err(ToolError::NoPipe),
        }
    }

    pub async fn release(&self) -> Result<String, ToolError> {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(pipe) => Ok(pipe.release().await),
            None => Err(ToolError::NoPipe),
        }
    }

    pub async fn release_events(&self) -> Result<Vec<PipeEvent>, ToolError> {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(pipe) => Ok(pipe.release_events().await),
            None => Err(ToolError::NoPipe),
        }
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<WaitReadyResult, ToolError> {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(pipe) => Ok(pipe.wait_ready(timeout).await),
            None => Err(ToolError::NoPipe),
        }
    }

    pub async fn attach_result(&self) -> Result<Option<Value>, ToolError> {
        let current = self.current.lock().await;
        match current.as_ref() {
            Some(pipe) => Ok(pipe.attach_result().await),
            None => Err(ToolError::NoPipe),
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        self.current.lock().await.as_ref().map(ExploitPipe::pid)
    }

    pub async fn kill_current(&self) -> Result<(), ToolError> {
        let mut current = self.current.lock().await;
        match current.take() {
            Some(pipe) => {
                pipe.kill();
                Ok(())
            }
            None => Err(ToolError::NoPipe),
        }
    }
}

impl Default for ExploitPipeManager {
    fn default() -> Self {
        Self::new()
    }
}
