//! Worker process loop.
//!
//! Reads JSON commands from stdin one line at a time, runs each to
//! completion, and writes exactly one JSON response per command to the
//! protocol channel. All log output goes to stderr.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use std::time::Instant;

use anyhow::{Context, Result};
use audiosr_types::{InferenceOutput, Response};
use log::{debug, error, info, warn};
use serde_json::Value;

use super::audio;
use super::backend::{
    build_with_fallback, BackendLoader, InferenceJob, ModelLost, SuperResolutionBackend,
};
use super::bridge::{BridgeFailure, BridgeLoader};
use super::channel::{open_protocol_sink, ProtocolChannel};
use super::ipc_types::{ProcessRequest, WorkerCommand};
use super::model_cache::ModelCache;
use crate::config::WorkerArgs;

thread_local! {
    /// Backtrace of the latest panic on this thread, taken at the panic site.
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

/// Chain a panic hook that records the backtrace before unwinding starts.
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            PANIC_BACKTRACE.with(|slot| slot.replace(Some(Backtrace::force_capture())));
            previous(info);
        }));
    });
}

type ModelOf<L> = <<L as BackendLoader>::Backend as SuperResolutionBackend>::Model;

/// Whether the loop keeps reading after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Terminate,
}

pub struct Worker<L: BackendLoader, W: Write> {
    loader: L,
    /// Loaded on the first `process` command.
    backend: Option<L::Backend>,
    models: ModelCache<ModelOf<L>>,
    channel: ProtocolChannel<W>,
}

impl<L: BackendLoader, W: Write> Worker<L, W> {
    pub fn new(loader: L, channel: ProtocolChannel<W>) -> Self {
        Self {
            loader,
            backend: None,
            models: ModelCache::new(),
            channel,
        }
    }

    pub fn models(&self) -> &ModelCache<ModelOf<L>> {
        &self.models
    }

    pub fn into_channel(self) -> ProtocolChannel<W> {
        self.channel
    }

    /// Serve commands until `shutdown` or end of input.
    ///
    /// Errors returned from here are fatal: failing to read the input or to
    /// write a response. Per-command failures are reported and never end
    /// the loop.
    pub fn run<R: BufRead>(&mut self, mut input: R) -> Result<()> {
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = input
                .read_until(b'\n', &mut line)
                .context("read protocol input")?;
            if read == 0 {
                info!("Input closed, exiting");
                return Ok(());
            }
            if self.handle_line(&line)? == Flow::Terminate {
                return Ok(());
            }
        }
    }

    pub fn handle_line(&mut self, line: &[u8]) -> Result<Flow> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(Flow::Continue);
        }

        let value: Value = match serde_json::from_slice(line) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to parse command: {e}");
                self.emit(&Response::error(format!("invalid JSON: {e}")))?;
                return Ok(Flow::Continue);
            }
        };

        match WorkerCommand::from_value(value) {
            WorkerCommand::Ping => {
                self.emit(&Response::ready())?;
                Ok(Flow::Continue)
            }
            WorkerCommand::Shutdown => {
                info!("Shutdown requested");
                self.emit(&Response::shutdown())?;
                Ok(Flow::Terminate)
            }
            WorkerCommand::Process(request) => {
                let response = self.process(&request);
                self.emit(&response)?;
                Ok(Flow::Continue)
            }
            WorkerCommand::Unsupported(command) => {
                warn!("Unsupported command: {command}");
                self.emit(&Response::error(format!("unsupported command: {command}")))?;
                Ok(Flow::Continue)
            }
        }
    }

    fn emit(&mut self, response: &Response) -> Result<()> {
        self.channel
            .emit(response)
            .context("write response to protocol stream")
    }

    /// Run a `process` command. Every failure, including a panic in the
    /// backend, becomes an error response.
    fn process(&mut self, request: &ProcessRequest) -> Response {
        let started = Instant::now();
        install_panic_hook();
        PANIC_BACKTRACE.with(|slot| slot.take());
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_process(request))) {
            Ok(Ok(())) => {
                info!("Processed in {:.2?}", started.elapsed());
                Response::done()
            }
            Ok(Err(err)) => {
                error!("Process failed: {err:#}");
                error_response(&err)
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!("Process panicked: {msg}");
                let backtrace = PANIC_BACKTRACE
                    .with(|slot| slot.take())
                    .map_or_else(|| "backtrace unavailable".to_string(), |bt| bt.to_string());
                Response::error_with_traceback(
                    format!("process panicked: {msg}"),
                    format!("panicked: {msg}\n\n{backtrace}"),
                )
            }
        }
    }

    fn run_process(&mut self, request: &ProcessRequest) -> Result<()> {
        let key = request.model_key()?;

        let backend = match &mut self.backend {
            Some(backend) => backend,
            slot @ None => {
                info!("Loading super-resolution backend");
                let backend = self
                    .loader
                    .load()
                    .context("super-resolution backend unavailable")?;
                slot.insert(backend)
            }
        };

        let model = self.models.get_or_build(&key, |key| {
            info!("Building model {key}");
            let started = Instant::now();
            let model = build_with_fallback(&mut *backend, key)
                .with_context(|| format!("failed to build model {key}"))?;
            info!("Model {key} built in {:.2?}", started.elapsed());
            Ok(model)
        })?;

        let (input, output) = request.paths()?;
        let params = request.params()?;
        debug!(
            "Super-resolution {} -> {} ({params:?})",
            input.display(),
            output.display()
        );

        let job = InferenceJob {
            input: &input,
            output: &output,
            params: &params,
        };
        let output_kind = match backend.super_resolution(model, &job) {
            Ok(output_kind) => output_kind,
            Err(err) => {
                if err.downcast_ref::<ModelLost>().is_some() {
                    warn!("Model {key} is no longer usable, dropping it from the cache");
                    self.models.evict();
                }
                return Err(err);
            }
        };
        match output_kind {
            InferenceOutput::Written => {}
            InferenceOutput::Samples {
                sample_rate,
                waveform,
            } => {
                audio::write_wav(&output, sample_rate, &waveform)
                    .with_context(|| format!("failed to write {}", output.display()))?;
            }
        }
        Ok(())
    }
}

/// Error response with the full error chain as traceback, plus the
/// backend's own traceback when it sent one.
fn error_response(err: &anyhow::Error) -> Response {
    let mut traceback = format!("{err:?}");
    if let Some(remote) = err
        .downcast_ref::<BridgeFailure>()
        .and_then(|failure| failure.traceback.as_deref())
    {
        traceback.push_str("\n\nBridge traceback:\n");
        traceback.push_str(remote);
    }
    Response::error_with_traceback(format!("{err:#}"), traceback)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run the worker process on stdin/stdout.
pub fn run_worker(args: &WorkerArgs) -> Result<()> {
    info!(
        "Starting super-resolution worker v{} (pid={})",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );
    info!(
        "Bridge: {} {}",
        args.python,
        args.bridge_script.display()
    );

    let sink = open_protocol_sink(!args.no_stdout_isolation);
    let loader = BridgeLoader::new(args.python.clone(), args.bridge_script.clone());
    let mut worker = Worker::new(loader, ProtocolChannel::new(sink));

    info!("Ready, waiting for commands...");
    let stdin = io::stdin();
    let result = worker.run(stdin.lock());
    info!("Exiting");
    result
}
