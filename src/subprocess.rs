//! Auxiliary process management: `run` (synchronous), `spawn`/`get`/`kill`/
//! `list` (tracked, file-backed) for commands that aren't the debugger
//! itself or the exploit pipe — git clones, build steps, helper scripts
//! (spec.md §4.4).
//!
//! Unlike the teacher's `registry.rs`, output is not buffered in memory:
//! each tracked process gets two temp files and the manager reads them on
//! demand, matching `original_source/pwnomcp/tools/subproc.py`'s
//! file-backed capture (so output survives a kill and a restart of the
//! reader).

use crate::process_guard::validate_command;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Ceiling mirrored from the teacher's process module (spec.md §7 timeout
/// containment applies equally to auxiliary commands).
pub const MAX_TIMEOUT_SECONDS: u64 = 3600;

#[must_use]
pub fn clamp_timeout(timeout: Option<u64>) -> Option<u64> {
    timeout.map(|t| t.min(MAX_TIMEOUT_SECONDS))
}

/// Outcome of a synchronous [`SubprocessManager::run`] call.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Outcome of [`SubprocessManager::spawn`]. If the child had already
/// exited by the time the manager checked (the ~100ms post-spawn poll),
/// `terminal` carries its final result so the caller doesn't need a
/// second round-trip.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnResult {
    pub pid: u32,
    pub stdout_path: String,
    pub stderr_path: String,
    pub terminal: Option<RunResult>,
}

/// Snapshot returned by [`SubprocessManager::get`].
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub running: bool,
    pub stdout: String,
    pub stderr: String,
    pub returncode: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub pid: u32,
    pub command: String,
    pub running: bool,
}

struct TrackedProcess {
    command: String,
    child: Option<Child>,
    stdout_path: std::path::PathBuf,
    stderr_path: std::path::PathBuf,
    started_at: Instant,
}

/// Tracks auxiliary subprocesses by OS pid, backed by temp files rather
/// than in-memory buffers (spec.md §4.4).
#[derive(Clone)]
pub struct SubprocessManager {
    entries: Arc<Mutex<HashMap<u32, TrackedProcess>>>,
}

impl SubprocessManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run a command to completion and capture its output in memory. For
    /// long-lived or fire-and-forget commands use [`Self::spawn`] instead.
    pub async fn run(
        &self,
        command: &str,
        cwd: Option<&str>,
        env: &[(String, String)],
        timeout_seconds: Option<u64>,
    ) -> RunResult {
        if let Err(reason) = validate_command(command) {
            return RunResult {
                returncode: -1,
                stdout: String::new(),
                stderr: reason.clone(),
                success: false,
                error: Some(reason),
            };
        }

        let mut cmd = build_command(command, cwd, env);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                return RunResult {
                    returncode: -1,
                    stdout: String::new(),
                    stderr: String::new(),
                    success: false,
                    error: Some(format!("spawn failed: {e}")),
                };
            }
        };

        let output = match clamp_timeout(timeout_seconds) {
            Some(secs) => {
                match tokio::time::timeout(Duration::from_secs(secs), child.wait_with_output())
                    .await
                {
                    Ok(Ok(out)) => out,
                    Ok(Err(e)) => {
                        return RunResult {
                            returncode: -1,
                            stdout: String::new(),
                            stderr: String::new(),
                            success: false,
                            error: Some(format!("wait failed: {e}")),
                        };
                    }
                    Err(_) => {
                        return RunResult {
                            returncode: -1,
                            stdout: String::new(),
                            stderr: String::new(),
                            success: false,
                            error: Some("timeout".to_string()),
                        };
                    }
                }
            }
            None => match child.wait_with_output().await {
                Ok(out) => out,
                Err(e) => {
                    return RunResult {
                        returncode: -1,
                        stdout: String::new(),
                        stderr: String::new(),
                        success: false,
                        error: Some(format!("wait failed: {e}")),
                    };
                }
            },
        };

        let returncode = output.status.code().unwrap_or(-1);
        RunResult {
            returncode,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: returncode == 0,
            error: None,
        }
    }

    /// Spawn a tracked, file-backed process. Pauses ~100ms after spawn and,
    /// if the child already exited, returns its terminal result in the same
    /// call (spec.md §4.4).
    pub async fn spawn(
        &self,
        command: &str,
        cwd: Option<&str>,
        env: &[(String, String)],
    ) -> Result<SpawnResult, String> {
        validate_command(command)?;

        let unique = uuid::Uuid::new_v4();
        let stdout_path = std::env::temp_dir().join(format!("pwno_stdout_{unique}.log"));
        let stderr_path = std::env::temp_dir().join(format!("pwno_stderr_{unique}.log"));

        let stdout_file = std::fs::File::create(&stdout_path)
            .map_err(|e| format!("failed to create stdout log: {e}"))?;
        let stderr_file = std::fs::File::create(&stderr_path)
            .map_err(|e| format!("failed to create stderr log: {e}"))?;

        let mut cmd = build_command(command, cwd, env);
        cmd.stdout(Stdio::from(stdout_file));
        cmd.stderr(Stdio::from(stderr_file));

        let child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn process: {e}"))?;
        let pid = child
            .id()
            .ok_or_else(|| "spawned process has no pid".to_string())?;

        {
            let mut entries = self.entries.lock().await;
            entries.insert(
                pid,
                TrackedProcess {
                    command: command.to_string(),
                    child: Some(child),
                    stdout_path: stdout_path.clone(),
                    stderr_path: stderr_path.clone(),
                    started_at: Instant::now(),
                },
            );
        }

        // Give short-lived failures (missing binary, bad args) a chance to
        // surface without a second round-trip from the caller.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let terminal = self.poll_exit(pid).await;

        Ok(SpawnResult {
            pid,
            stdout_path: stdout_path.display().to_string(),
            stderr_path: stderr_path.display().to_string(),
            terminal,
        })
    }

    /// If the tracked child has exited, read its log files and return the
    /// terminal result, without removing the entry (invariant: presence in
    /// the map tracks open file handles, not process liveness alone — see
    /// [`Self::get`] for the removal point).
    async fn poll_exit(&self, pid: u32) -> Option<RunResult> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&pid)?;
        let child = entry.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = fs::read_to_string(&entry.stdout_path)
                    .await
                    .unwrap_or_default();
                let stderr = fs::read_to_string(&entry.stderr_path)
                    .await
                    .unwrap_or_default();
                let returncode = status.code().unwrap_or(-1);
                Some(RunResult {
                    returncode,
                    stdout,
                    stderr,
                    success: returncode == 0,
                    error: None,
                })
            }
            _ => None,
        }
    }

    /// Read a tracked process's current output. If it has exited, this is
    /// also the point its entry is removed from the map — the pid stays
    /// resolvable via its log files' contents, but bookkeeping is dropped.
    pub async fn get(&self, pid: u32) -> Result<ProcessSnapshot, String> {
        let exited_status = {
            let mut entries = self.entries.lock().await;
            let entry = entries
                .get_mut(&pid)
                .ok_or_else(|| format!("process {pid} not found"))?;
            entry.child.as_mut().and_then(|c| c.try_wait().ok().flatten())
        };

        let (stdout_path, stderr_path) = {
            let entries = self.entries.lock().await;
            let entry = entries.get(&pid).expect("checked above");
            (entry.stdout_path.clone(), entry.stderr_path.clone())
        };

        let stdout = fs::read_to_string(&stdout_path).await.unwrap_or_default();
        let stderr = fs::read_to_string(&stderr_path).await.unwrap_or_default();

        if let Some(status) = exited_status {
            self.entries.lock().await.remove(&pid);
            return Ok(ProcessSnapshot {
                pid,
                running: false,
                stdout,
                stderr,
                returncode: status.code(),
            });
        }

        Ok(ProcessSnapshot {
            pid,
            running: true,
            stdout,
            stderr,
            returncode: None,
        })
    }

    /// Deliver a signal to a tracked process. Does not remove the entry —
    /// a subsequent [`Self::get`] still reads the final output (spec.md
    /// §4.4 "this preserves post-mortem log access").
    ///
    /// Signals the whole process group (negative pid), not just the
    /// tracked pid — `build_command` puts every spawned child in its own
    /// session via `setsid()` precisely so a shell pipeline's grandchildren
    /// are reachable here too.
    pub async fn kill(&self, pid: u32, signal: Signal) -> Result<(), String> {
        let entries = self.entries.lock().await;
        if !entries.contains_key(&pid) {
            return Err(format!("process {pid} not found"));
        }
        nix::sys::signal::kill(Pid::from_raw(-(pid as i32)), signal)
            .map_err(|e| format!("failed to signal process {pid}: {e}"))
    }

    /// List tracked processes, garbage-collecting entries whose child
    /// exited since the last poll (spec.md §4.4).
    pub async fn list(&self) -> Vec<ProcessSummary> {
        let pids: Vec<u32> = self.entries.lock().await.keys().copied().collect();
        for pid in pids {
            let _ = self.poll_exit(pid).await;
        }

        let mut entries = self.entries.lock().await;
        let exited: Vec<u32> = entries
            .iter_mut()
            .filter_map(|(pid, entry)| match entry.child.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(_)) => Some(*pid),
                    _ => None,
                },
                None => None,
            })
            .collect();

        let summaries = entries
            .iter()
            .map(|(pid, entry)| ProcessSummary {
                pid: *pid,
                command: entry.command.clone(),
                running: !exited.contains(pid),
            })
            .collect();

        for pid in exited {
            // Keep bookkeeping that `started_at` implies (age-based GC could
            // go here) but drop the entry only for those truly gone; `get`
            // remains the authoritative removal point for unread output.
            if entries
                .get(&pid)
                .is_some_and(|e| e.started_at.elapsed() > Duration::from_secs(30 * 60))
            {
                entries.remove(&pid);
            }
        }

        summaries
    }
}

impl Default for SubprocessManager {
    fn default() -> Self {
        Self::new()
    }
}

fn build_command(command: &str, cwd: Option<&str>, env: &[(String, String)]) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    cmd.kill_on_drop(false);

    // SAFETY: pre_exec runs before exec in the forked child.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd
}
