//! Remote debugging service for autonomous security-research agents: a
//! GDB/MI orchestration layer, a tracked auxiliary-subprocess manager, a
//! singleton interactive exploit pipe, and the tool/HTTP surfaces over
//! them.

pub mod auth;
pub mod collaborators;
pub mod config;
pub mod controller;
pub mod error;
pub mod exploit_pipe;
pub mod http;
pub mod mi;
pub mod process_guard;
pub mod server;
pub mod state;
pub mod subprocess;
pub mod tools;
