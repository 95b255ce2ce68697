//! Wire types shared between the super-resolution worker and the process
//! driving it.
//!
//! The protocol is JSON Lines: one request object per line on the worker's
//! stdin, one [`Response`] per line on its stdout.

use serde::{Deserialize, Serialize};

/// Default number of DDIM sampling steps when a request does not set one.
pub const DEFAULT_DDIM_STEPS: i64 = 100;

/// Default classifier-free guidance scale when a request does not set one.
pub const DEFAULT_GUIDANCE_SCALE: f64 = 3.5;

/// Outcome of a single command.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Response sent from the worker for every command it reads.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub message: String,
    /// Full diagnostic text. Only present on failed `process` commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: Status::Ok,
            message: message.into(),
            traceback: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
            traceback: None,
        }
    }

    pub fn error_with_traceback(message: impl Into<String>, traceback: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
            traceback: Some(traceback.into()),
        }
    }

    /// Reply to `ping`.
    pub fn ready() -> Self {
        Self::ok("ready")
    }

    /// Reply to a successful `process`.
    pub fn done() -> Self {
        Self::ok("done")
    }

    /// Reply to `shutdown`. Always the last line the worker writes.
    pub fn shutdown() -> Self {
        Self::ok("shutdown")
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Sampling parameters forwarded to the model on every inference call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InferenceParams {
    pub ddim_steps: i64,
    pub guidance_scale: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            ddim_steps: DEFAULT_DDIM_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            seed: None,
        }
    }
}

/// Raw audio returned by a backend that leaves persisting to the caller.
///
/// A flat array is a single channel. A nested array is either
/// (channel, time) or (time, channel); the worker normalizes it before
/// writing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Waveform {
    Mono(Vec<f32>),
    Multi(Vec<Vec<f32>>),
}

/// What an inference call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceOutput {
    /// The backend wrote the output file itself.
    Written,
    /// The backend returned samples that still need to be written to disk.
    Samples { sample_rate: u32, waveform: Waveform },
}
