//! Per-node compute pipeline slot.
//!
//! Each operator dispatcher owns one `KernelPipeline`. The pipeline is
//! built on the node's first execution, from the shape signature and the
//! tuned configuration resolved at that time, and reused by every later
//! execution. A later execution that derives a different signature is an
//! error: the shader was specialised for the first shape.

use crate::backend::{ComputeBackend, PipelineDesc, PipelineGuard, PipelineId};
use crate::tuning::ShaderConfig;
use crate::{Error, Result};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A built pipeline and the configuration it was specialised with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltKernel {
    pub pipeline: PipelineId,
    pub config: ShaderConfig,
}

struct Built {
    guard: PipelineGuard,
    signature: String,
    config: ShaderConfig,
}

/// Lazily built, shape-guarded pipeline slot.
pub struct KernelPipeline {
    label: String,
    state: Mutex<Option<Built>>,
}

impl KernelPipeline {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(None),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Return the pipeline for `signature`, building it with `build` if this
    /// is the first call.
    ///
    /// `build` returns the pipeline description and the configuration it
    /// encodes. It runs at most once per slot, under the slot's lock, so two
    /// requests racing on first use do not build twice.
    pub fn get_or_build<F>(
        &self,
        backend: &Arc<dyn ComputeBackend>,
        signature: &str,
        build: F,
    ) -> Result<BuiltKernel>
    where
        F: FnOnce() -> Result<(PipelineDesc, ShaderConfig)>,
    {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Dispatch(format!("pipeline slot '{}' poisoned", self.label)))?;

        if let Some(built) = state.as_ref() {
            if built.signature != signature {
                return Err(Error::ShapeChanged {
                    built: built.signature.clone(),
                    requested: signature.to_string(),
                });
            }
            return Ok(BuiltKernel {
                pipeline: built.guard.id(),
                config: built.config,
            });
        }

        let (desc, config) = build()?;
        let guard = PipelineGuard::new(backend, &desc)?;
        debug!(label = %self.label, signature, %config, "built compute pipeline");
        let kernel = BuiltKernel {
            pipeline: guard.id(),
            config,
        };
        *state = Some(Built {
            guard,
            signature: signature.to_string(),
            config,
        });
        Ok(kernel)
    }

    /// Whether the pipeline has been built.
    pub fn is_built(&self) -> bool {
        self.state.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}
