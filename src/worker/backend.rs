//! The seam between the worker loop and whatever actually runs the model.
//!
//! A backend exposes two operations: build a model for a
//! `(model_name, device)` pair, and run super-resolution with a built model.
//! Backends are loaded lazily through a [`BackendLoader`] so that a missing
//! runtime only costs the first `process` request.

use std::fmt;
use std::path::Path;

use anyhow::Result;
use audiosr_types::{InferenceOutput, InferenceParams};
use log::debug;
use thiserror::Error;

/// Identifies the model currently held by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub model_name: String,
    pub device: String,
}

impl ModelKey {
    pub fn new(model_name: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            device: device.into(),
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.model_name, self.device)
    }
}

/// The two argument shapes a backend's build operation may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildCall<'a> {
    Named { model_name: &'a str, device: &'a str },
    Positional(&'a str, &'a str),
}

impl BuildCall<'_> {
    pub fn model_name(&self) -> &str {
        match self {
            Self::Named { model_name, .. } => model_name,
            Self::Positional(model_name, _) => model_name,
        }
    }

    pub fn device(&self) -> &str {
        match self {
            Self::Named { device, .. } => device,
            Self::Positional(_, device) => device,
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    /// The backend does not accept this call shape. Only this variant
    /// triggers a retry with the other shape.
    #[error("build call rejected: {0}")]
    SignatureMismatch(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl BuildError {
    fn into_anyhow(self) -> anyhow::Error {
        match self {
            Self::Failed(err) => err,
            other => anyhow::Error::new(other),
        }
    }
}

/// Inference failed because the model itself can no longer serve requests,
/// e.g. the process holding it died. The worker drops such a model from the
/// cache so the next request builds a fresh one.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ModelLost(pub String);

/// Paths and parameters for one inference call.
#[derive(Debug, Clone, Copy)]
pub struct InferenceJob<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub params: &'a InferenceParams,
}

pub trait SuperResolutionBackend {
    /// A loaded model bound to one `(model_name, device)` pair. Dropping it
    /// releases whatever the backend holds for it.
    type Model;

    fn build_model(&mut self, call: BuildCall<'_>) -> Result<Self::Model, BuildError>;

    fn super_resolution(
        &mut self,
        model: &mut Self::Model,
        job: &InferenceJob<'_>,
    ) -> Result<InferenceOutput>;
}

/// Deferred construction of a backend.
pub trait BackendLoader {
    type Backend: SuperResolutionBackend;

    fn load(&mut self) -> Result<Self::Backend>;
}

impl<F, B> BackendLoader for F
where
    F: FnMut() -> Result<B>,
    B: SuperResolutionBackend,
{
    type Backend = B;

    fn load(&mut self) -> Result<B> {
        self()
    }
}

/// Build a model, preferring named arguments and falling back to positional
/// ones when the backend rejects the named shape.
pub fn build_with_fallback<B: SuperResolutionBackend>(
    backend: &mut B,
    key: &ModelKey,
) -> Result<B::Model> {
    let named = BuildCall::Named {
        model_name: &key.model_name,
        device: &key.device,
    };
    match backend.build_model(named) {
        Ok(model) => Ok(model),
        Err(BuildError::SignatureMismatch(reason)) => {
            debug!("Named build rejected ({reason}), retrying positionally");
            backend
                .build_model(BuildCall::Positional(&key.model_name, &key.device))
                .map_err(BuildError::into_anyhow)
        }
        Err(BuildError::Failed(err)) => Err(err),
    }
}
