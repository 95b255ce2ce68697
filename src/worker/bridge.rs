//! Python bridge backend.
//!
//! Each built model is a child process running the bridge script with the
//! model loaded. The child's stdin/stdout are a private JSON Lines channel
//! (one request, one reply); its stderr is inherited so its logs and
//! progress bars land in the worker's diagnostic stream.
//!
//! Bridge protocol:
//! - startup: `{"status":"ready"}` once the model is loaded
//! - request: `{"input":..,"output":..,"ddim_steps":..,"guidance_scale":..,"seed"?:..}`
//! - reply: `{"status":"ok","written":true}`,
//!   `{"status":"ok","sample_rate":N,"waveform":[..]}` or
//!   `{"status":"error","message":..,"traceback"?:..}`
//!
//! Exit status 2 before `ready` means the script rejected its arguments.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use audiosr_types::{InferenceOutput, InferenceParams, Waveform};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::backend::{
    BackendLoader, BuildCall, BuildError, InferenceJob, ModelLost, SuperResolutionBackend,
};

/// Default interpreter used to run the bridge script.
pub const DEFAULT_PYTHON: &str = "python3";

/// Default path to the bridge script.
pub const DEFAULT_BRIDGE_SCRIPT: &str = "scripts/audiosr_bridge.py";

/// Exit status of a script that rejected its command line.
const USAGE_ERROR_STATUS: i32 = 2;

/// Environment for the bridge: no symlinks in the Hugging Face cache
/// (fails on Windows), frequent progress updates, unbuffered UTF-8 output.
const BRIDGE_ENV: [(&str, &str); 4] = [
    ("HF_HUB_DISABLE_SYMLINKS", "1"),
    ("TQDM_MININTERVAL", "1"),
    ("PYTHONUNBUFFERED", "1"),
    ("PYTHONIOENCODING", "utf-8"),
];

/// Failure reported by the bridge for one request.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BridgeFailure {
    pub message: String,
    pub traceback: Option<String>,
}

/// Resolves the bridge on first use.
#[derive(Debug, Clone)]
pub struct BridgeLoader {
    python: String,
    script: PathBuf,
}

impl BridgeLoader {
    pub fn new(python: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            script: script.into(),
        }
    }
}

impl BackendLoader for BridgeLoader {
    type Backend = PythonBridge;

    fn load(&mut self) -> Result<PythonBridge> {
        if !self.script.is_file() {
            bail!("bridge script not found: {}", self.script.display());
        }
        info!(
            "Using bridge {} {}",
            self.python,
            self.script.display()
        );
        Ok(PythonBridge {
            python: self.python.clone(),
            script: self.script.clone(),
        })
    }
}

#[derive(Debug)]
pub struct PythonBridge {
    python: String,
    script: PathBuf,
}

impl PythonBridge {
    fn command(&self, call: BuildCall<'_>) -> Command {
        let mut command = Command::new(&self.python);
        command.arg(&self.script);
        match call {
            BuildCall::Named { model_name, device } => {
                command
                    .arg("--model-name")
                    .arg(model_name)
                    .arg("--device")
                    .arg(device);
            }
            BuildCall::Positional(model_name, device) => {
                command.arg(model_name).arg(device);
            }
        }
        command
            .envs(BRIDGE_ENV)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()); // Bridge logs go to our stderr
        command
    }
}

impl SuperResolutionBackend for PythonBridge {
    type Model = BridgeModel;

    fn build_model(&mut self, call: BuildCall<'_>) -> Result<BridgeModel, BuildError> {
        debug!(
            "Spawning bridge: {} {} ({call:?})",
            self.python,
            self.script.display()
        );
        let mut child = self
            .command(call)
            .spawn()
            .with_context(|| format!("failed to spawn bridge {}", self.python))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("bridge stdin not available"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("bridge stdout not available"))?;
        let mut model = BridgeModel {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };

        match model.read_message()? {
            Some(message) if message.status == "ready" => {
                info!(
                    "Bridge ready: {} on {} (pid={})",
                    call.model_name(),
                    call.device(),
                    model.child.id()
                );
                Ok(model)
            }
            Some(message) => Err(anyhow::Error::new(message.into_failure("model build failed")).into()),
            None => {
                let status = model.child.wait().context("wait for bridge")?;
                if status.code() == Some(USAGE_ERROR_STATUS) {
                    Err(BuildError::SignatureMismatch(format!(
                        "bridge rejected its arguments ({status})"
                    )))
                } else {
                    Err(anyhow!("bridge exited while loading the model ({status})").into())
                }
            }
        }
    }

    fn super_resolution(
        &mut self,
        model: &mut BridgeModel,
        job: &InferenceJob<'_>,
    ) -> Result<InferenceOutput> {
        let request = BridgeRequest {
            input: job.input,
            output: job.output,
            params: job.params,
        };
        let mut line = serde_json::to_string(&request).context("serialize bridge request")?;
        line.push('\n');
        // Transport failures mean the child is gone or unusable.
        if let Err(e) = model
            .stdin
            .write_all(line.as_bytes())
            .and_then(|_| model.stdin.flush())
        {
            return Err(ModelLost(format!("write request to bridge: {e}")).into());
        }

        match model.read_message() {
            Ok(Some(reply)) => reply.into_output(),
            Ok(None) => Err(ModelLost("bridge exited before replying".to_string()).into()),
            Err(e) => Err(ModelLost(format!("{e:#}")).into()),
        }
    }
}

/// A bridge process with a model loaded.
#[derive(Debug)]
pub struct BridgeModel {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl BridgeModel {
    /// Next protocol message from the bridge, or `None` at end of output.
    ///
    /// Lines that are not protocol messages (stray prints) are forwarded to
    /// the log.
    fn read_message(&mut self) -> Result<Option<BridgeMessage>> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .stdout
                .read_line(&mut line)
                .context("read from bridge")?;
            if read == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<BridgeMessage>(trimmed) {
                Ok(message) => return Ok(Some(message)),
                Err(_) => info!("[bridge] {trimmed}"),
            }
        }
    }
}

impl Drop for BridgeModel {
    fn drop(&mut self) {
        debug!("Stopping bridge process (pid={})", self.child.id());
        let _ = self.child.kill();
        let _ = self.child.wait(); // Reap
    }
}

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    input: &'a Path,
    output: &'a Path,
    #[serde(flatten)]
    params: &'a InferenceParams,
}

#[derive(Debug, Deserialize)]
struct BridgeMessage {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    traceback: Option<String>,
    #[serde(default)]
    sample_rate: Option<u32>,
    #[serde(default)]
    waveform: Option<Waveform>,
}

impl BridgeMessage {
    fn into_output(self) -> Result<InferenceOutput> {
        if self.status != "ok" {
            return Err(self.into_failure("inference failed").into());
        }
        match (self.sample_rate, self.waveform) {
            (Some(sample_rate), Some(waveform)) => Ok(InferenceOutput::Samples {
                sample_rate,
                waveform,
            }),
            (None, None) => Ok(InferenceOutput::Written),
            _ => bail!("bridge reply has only one of sample_rate and waveform"),
        }
    }

    fn into_failure(self, fallback: &str) -> BridgeFailure {
        BridgeFailure {
            message: self.message.unwrap_or_else(|| fallback.to_string()),
            traceback: self.traceback,
        }
    }
}
