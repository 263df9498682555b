//! Thread/Message repository backing C1 of the Agent Orchestration Core.
//!
//! A `Thread` is an ordered, append-only conversation bound to one agent.
//! Every thread begins with exactly one system message capturing the
//! agent's `system_instructions` at creation time. This crate owns that
//! invariant plus the file-backed persistence of threads and their
//! messages.

pub mod store;
pub mod transcript;

pub use store::ThreadStore;
pub use transcript::TranscriptLog;
