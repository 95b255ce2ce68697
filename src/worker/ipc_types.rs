//! Request side of the worker protocol.
//!
//! Uses JSON Lines (one JSON object per line) over stdin/stdout pipes.
//! Responses live in `audiosr_types::Response`.

use std::path::PathBuf;

use audiosr_types::{InferenceParams, DEFAULT_DDIM_STEPS, DEFAULT_GUIDANCE_SCALE};
use serde_json::{Map, Value};
use thiserror::Error;

use super::backend::ModelKey;

/// Problems with the contents of a `process` request.
#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("model_name or device not specified")]
    MissingModel,

    #[error("input or output not specified")]
    MissingPaths,

    #[error("invalid {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },
}

/// Commands the parent can send to the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    /// Health check.
    Ping,
    /// Graceful shutdown.
    Shutdown,
    /// Run super-resolution on one file.
    Process(ProcessRequest),
    /// Anything else, carrying a printable form of the `command` value.
    Unsupported(String),
}

impl WorkerCommand {
    /// Classify a parsed request line.
    ///
    /// Lines that are valid JSON but not objects, or objects without a
    /// string `command`, are unsupported rather than fatal.
    pub fn from_value(value: Value) -> Self {
        let fields = match value {
            Value::Object(fields) => fields,
            other => return Self::Unsupported(other.to_string()),
        };
        match fields.get("command") {
            Some(Value::String(name)) => match name.as_str() {
                "ping" => Self::Ping,
                "shutdown" => Self::Shutdown,
                "process" => Self::Process(ProcessRequest { fields }),
                other => Self::Unsupported(other.to_string()),
            },
            Some(other) => Self::Unsupported(other.to_string()),
            None => Self::Unsupported("null".to_string()),
        }
    }
}

/// A `process` request.
///
/// Fields are validated lazily, in the order the procedure needs them, so
/// a request with a good model key but no `input` still reports the
/// missing path rather than failing up front.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessRequest {
    fields: Map<String, Value>,
}

impl ProcessRequest {
    pub fn model_key(&self) -> Result<ModelKey, RequestError> {
        match (self.non_empty_str("model_name"), self.non_empty_str("device")) {
            (Some(model_name), Some(device)) => Ok(ModelKey::new(model_name, device)),
            _ => Err(RequestError::MissingModel),
        }
    }

    /// `(input, output)` paths.
    pub fn paths(&self) -> Result<(PathBuf, PathBuf), RequestError> {
        match (self.non_empty_str("input"), self.non_empty_str("output")) {
            (Some(input), Some(output)) => Ok((PathBuf::from(input), PathBuf::from(output))),
            _ => Err(RequestError::MissingPaths),
        }
    }

    pub fn params(&self) -> Result<InferenceParams, RequestError> {
        let ddim_steps = match self.fields.get("ddim_steps") {
            Some(value) => coerce_int("ddim_steps", value)?,
            None => DEFAULT_DDIM_STEPS,
        };
        let guidance_scale = match self.fields.get("guidance_scale") {
            Some(value) => coerce_float("guidance_scale", value)?,
            None => DEFAULT_GUIDANCE_SCALE,
        };
        // A present `seed` must be usable, even if it is null.
        let seed = self
            .fields
            .get("seed")
            .map(|value| coerce_int("seed", value))
            .transpose()?;

        Ok(InferenceParams {
            ddim_steps,
            guidance_scale,
            seed,
        })
    }

    fn non_empty_str(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Accepts JSON integers, floats (truncated) and numeric strings.
fn coerce_int(field: &'static str, value: &Value) -> Result<i64, RequestError> {
    let invalid = |reason: String| RequestError::InvalidParameter { field, reason };
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
    let in_range = |f: &f64| (i64::MIN as f64..i64::MAX as f64).contains(&f.trunc());
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(in_range).map(|f| f.trunc() as i64))
            .ok_or_else(|| invalid(format!("{n} is not a representable integer"))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| invalid(format!("{s:?}: {e}"))),
        other => Err(invalid(format!("expected an integer, got {other}"))),
    }
}

fn coerce_float(field: &'static str, value: &Value) -> Result<f64, RequestError> {
    let invalid = |reason: String| RequestError::InvalidParameter { field, reason };
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| invalid(format!("{n} is not a float"))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| invalid(format!("{s:?}: {e}"))),
        other => Err(invalid(format!("expected a number, got {other}"))),
    }
}
