//! `agentcore` — the Agent Orchestration Core gateway binary's library half.
//!
//! Wires together C1 (repositories) through C10 (the REST/WS/SSE boundary)
//! behind one `AppState`. See `DESIGN.md` for the grounding ledger.

pub mod api;
pub mod bootstrap;
pub mod bus;
pub mod cancel;
pub mod cli;
pub mod executor;
pub mod hub;
pub mod locks;
pub mod repos;
pub mod scheduler;
pub mod state;
pub mod task_runner;
pub mod tools;
pub mod triggers;
pub mod workflow_engine;
