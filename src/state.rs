//! In-memory session record: loaded binary, breakpoints, watches, and the
//! last-seen inferior state. No I/O, no blocking — mutation happens only
//! on the task handling the current tool call (spec.md §4.3, §5).

use serde::Serialize;
use std::collections::HashMap;

/// State of the debugged process (the "inferior"), driven exclusively by
/// async notifications observed in [`crate::controller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InferiorState {
    Idle,
    Loaded,
    Running,
    Stopped,
    Exited,
}

impl Default for InferiorState {
    fn default() -> Self {
        Self::Idle
    }
}

/// A breakpoint as reported by GDB. Numbers are assigned by GDB; this
/// struct only mirrors what the controller already parsed out of a
/// `-break-insert`/`-break-list` payload.
#[derive(Debug, Clone, Serialize)]
pub struct Breakpoint {
    pub number: u32,
    pub location: String,
    pub address: Option<String>,
    pub enabled: bool,
    pub condition: Option<String>,
    pub hit_count: u32,
}

/// A memory watch registered by the agent (display-only; GDB itself is not
/// asked to track it as a hardware/software watchpoint).
#[derive(Debug, Clone, Serialize)]
pub struct Watch {
    pub address: String,
    pub size_bytes: usize,
    pub format: WatchFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchFormat {
    Hex,
    String,
    Int,
}

/// In-memory record of one debugging session.
///
/// Invariant: `binary_loaded ⇒ binary_path.is_some()`. `state` shadows the
/// controller's [`InferiorState`] for read-only reporting — the controller
/// is the single writer; [`crate::tools`] copies the controller's state in
/// here after every call.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub session_id: String,
    pub binary_path: Option<String>,
    pub binary_loaded: bool,
    pub pid: Option<u32>,
    pub state: InferiorState,
    pub breakpoints: HashMap<u32, Breakpoint>,
    pub watches: Vec<Watch>,
}

impl SessionState {
    #[must_use]
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            binary_path: None,
            binary_loaded: false,
            pid: None,
            state: InferiorState::Idle,
            breakpoints: HashMap::new(),
            watches: Vec::new(),
        }
    }

    /// Record that a binary has been loaded. Upholds the
    /// `binary_loaded ⇒ binary_path.is_some()` invariant by construction.
    pub fn set_binary(&mut self, path: String) {
        self.binary_path = Some(path);
        self.binary_loaded = true;
    }

    pub fn set_state(&mut self, state: InferiorState) {
        self.state = state;
    }

    pub fn set_pid(&mut self, pid: u32) {
        self.pid = Some(pid);
    }

    /// Replace the breakpoint table from a `-break-list`/`-break-insert`
    /// payload snapshot. GDB is the source of truth, not the prior local
    /// view — callers pass the freshly parsed set.
    pub fn set_breakpoint(&mut self, bp: Breakpoint) {
        self.breakpoints.insert(bp.number, bp);
    }

    pub fn remove_breakpoint(&mut self, number: u32) {
        self.breakpoints.remove(&number);
    }

    pub fn add_watch(&mut self, watch: Watch) {
        self.watches.push(watch);
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}
