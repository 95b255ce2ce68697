//! Single-slot model cache.
//!
//! Holds at most one built model together with the key it was built for.
//! Key and model live in the same slot so they can only change together.

use anyhow::{anyhow, Result};
use log::info;

use super::backend::ModelKey;

struct CachedModel<M> {
    key: ModelKey,
    model: M,
}

pub struct ModelCache<M> {
    slot: Option<CachedModel<M>>,
}

impl<M> Default for ModelCache<M> {
    fn default() -> Self {
        Self { slot: None }
    }
}

impl<M> ModelCache<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key of the cached model, if any.
    pub fn key(&self) -> Option<&ModelKey> {
        self.slot.as_ref().map(|cached| &cached.key)
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    /// Drop the cached model, returning the key it was built for.
    pub fn evict(&mut self) -> Option<ModelKey> {
        self.slot.take().map(|cached| cached.key)
    }

    /// Return the model for `key`, building it first when the slot is empty
    /// or holds a different key.
    ///
    /// The previous model is only dropped after `build` succeeds; a failed
    /// build leaves the cache as it was.
    pub fn get_or_build<F>(&mut self, key: &ModelKey, build: F) -> Result<&mut M>
    where
        F: FnOnce(&ModelKey) -> Result<M>,
    {
        if self.key() != Some(key) {
            let model = build(key)?;
            if let Some(previous) = self.slot.take() {
                info!("Replacing cached model {} with {key}", previous.key);
            }
            self.slot = Some(CachedModel {
                key: key.clone(),
                model,
            });
        }

        match self.slot.as_mut() {
            Some(cached) => Ok(&mut cached.model),
            None => Err(anyhow!("model cache is empty after build")),
        }
    }
}
