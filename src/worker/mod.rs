//! Out-of-process super-resolution worker.
//!
//! The parent spawns this binary with piped stdin/stdout and talks to it in
//! JSON Lines. The worker keeps one model loaded between requests and
//! answers every command with exactly one response line.

pub mod audio;
pub mod backend;
pub mod bridge;
pub mod channel;
pub mod ipc_types;
pub mod model_cache;
pub mod worker_main;
