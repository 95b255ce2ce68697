//! Audio super-resolution worker.
//!
//! A long-lived child process that exposes a super-resolution model to a
//! parent process over JSON Lines on stdin/stdout. See [`worker`] for the
//! protocol loop and [`worker::bridge`] for the default model backend.

pub mod config;
pub mod logger;
pub mod worker;

pub use audiosr_types::{InferenceOutput, InferenceParams, Response, Status, Waveform};
pub use config::WorkerArgs;
pub use worker::worker_main::{run_worker, Flow, Worker};
