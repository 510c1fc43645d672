//! Backend selection and process-wide executor state.

use crate::backend::create_backend;
use crate::config::DriverConfig;
use crate::error::{Result, RuntimeError};
use crate::executor::Executor;
use nngpu_core::{
    Capabilities, ComputeBackend, ExecutorKind, Model, OperatorRegistry, PerformanceInfo,
    TuningCache,
};
use nngpu_operators::core_operator_registry;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

/// Chooses the backend for the whole process and builds executors on it.
///
/// The backend kind is fixed by the `DriverConfig` at construction. The
/// device is opened by `init_per_process` and released by
/// `deinit_per_process`.
pub struct ExecutorManager {
    config: DriverConfig,
    registry: Arc<OperatorRegistry>,
    tuning: Arc<TuningCache>,
    backend: Mutex<Option<Arc<dyn ComputeBackend>>>,
}

impl ExecutorManager {
    pub fn new(config: DriverConfig) -> Self {
        let tuning = config.tuning_cache();
        Self {
            config,
            registry: Arc::new(core_operator_registry()),
            tuning,
            backend: Mutex::new(None),
        }
    }

    /// Manager that uses an already opened backend instead of creating one.
    pub fn with_backend(config: DriverConfig, backend: Arc<dyn ComputeBackend>) -> Self {
        let manager = Self::new(config);
        *manager.slot() = Some(backend);
        manager
    }

    /// Replace the tuning cache used by executors created afterwards.
    pub fn with_tuning(mut self, tuning: Arc<TuningCache>) -> Self {
        self.tuning = tuning;
        self
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<dyn ComputeBackend>>> {
        self.backend
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn kind(&self) -> ExecutorKind {
        self.config.executor
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn registry(&self) -> &OperatorRegistry {
        &self.registry
    }

    pub fn tuning(&self) -> &Arc<TuningCache> {
        &self.tuning
    }

    /// Open the device and seed the tuning cache. Idempotent.
    pub fn init_per_process(&self) -> Result<()> {
        let mut slot = self.slot();
        if slot.is_none() {
            *slot = Some(create_backend(self.config.executor)?);
        }
        let entries = self.tuning.len();
        info!(executor = %self.config.executor, tuning_entries = entries, "executor manager ready");
        Ok(())
    }

    /// Release the device. Executors created earlier keep their own handle.
    pub fn deinit_per_process(&self) {
        if self.slot().take().is_some() {
            info!(executor = %self.config.executor, "executor manager shut down");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.slot().is_some()
    }

    /// Fixed performance metadata of the selected backend.
    pub fn capabilities(&self) -> Capabilities {
        let perf = match self.config.executor {
            ExecutorKind::VulkanCompute => 0.8,
            ExecutorKind::GlesCompute => 0.9,
            ExecutorKind::Recording => 1.0,
        };
        let info = PerformanceInfo {
            exec_time: perf,
            power_usage: perf,
        };
        Capabilities {
            float32_performance: info,
            quantized8_performance: info,
            relaxed_float32_to_float16_performance: info,
        }
    }

    /// One flag per model operation; unregistered operation types are `false`.
    pub fn supported_operations(&self, model: &Model) -> Vec<bool> {
        self.registry.supported_operations(model)
    }

    /// Build an uninitialized executor bound to `model`.
    pub fn create_executor(&self, model: Arc<Model>) -> Result<Executor> {
        let backend = self.slot().clone().ok_or_else(|| {
            RuntimeError::NotReady(format!(
                "{} executor manager is not initialized",
                self.config.executor
            ))
        })?;
        Ok(Executor::new(backend, Arc::clone(&self.tuning), model))
    }
}
