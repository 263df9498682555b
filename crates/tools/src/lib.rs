//! Built-in tools for the Agent Orchestration Core.
//!
//! - `exec`/`process`: run commands foreground or auto-background after yieldMs,
//!   manage background sessions (list/poll/log/write/kill/clear/remove)
//! - `file_ops`: read/write/append/move/delete/list files within a workspace root

pub mod exec;
pub mod file_ops;
pub mod manager;
pub mod process;

pub use manager::ProcessManager;
