//! The driver's service boundary.

use crate::callback::PreparedModelCallback;
use crate::config::DriverConfig;
use crate::error::Result;
use crate::manager::ExecutorManager;
use crate::prepared::PreparedModel;
use nngpu_core::{
    Capabilities, DeviceStatus, ErrorStatus, ExecutionPreference, Model, validate_model,
};
use std::sync::Arc;
use tracing::{info, warn};

/// A named compute device exposed to the NN runtime.
pub struct Device {
    name: String,
    manager: ExecutorManager,
}

impl Device {
    pub fn new(name: impl Into<String>, config: DriverConfig) -> Self {
        Self::with_manager(name, ExecutorManager::new(config))
    }

    pub fn with_manager(name: impl Into<String>, manager: ExecutorManager) -> Self {
        Self {
            name: name.into(),
            manager,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &ExecutorManager {
        &self.manager
    }

    /// Bring up the process-wide backend.
    pub fn start(&self) -> Result<()> {
        self.manager.init_per_process()?;
        info!(device = %self.name, executor = %self.manager.kind(), "device started");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.manager.deinit_per_process();
        info!(device = %self.name, "device stopped");
    }

    pub fn get_capabilities(&self) -> (ErrorStatus, Capabilities) {
        (ErrorStatus::Success, self.manager.capabilities())
    }

    /// One flag per operation; an invalid model yields an empty vector.
    pub fn get_supported_operations(&self, model: &Model) -> (ErrorStatus, Vec<bool>) {
        if let Err(e) = validate_model(model) {
            warn!(device = %self.name, error = %e, "rejected model in support query");
            return (ErrorStatus::InvalidArgument, Vec::new());
        }
        (ErrorStatus::Success, self.manager.supported_operations(model))
    }

    /// Validate and prepare `model`, reporting the outcome to `callback`.
    #[tracing::instrument(skip_all, fields(device = %self.name, preference = ?preference))]
    pub fn prepare_model(
        &self,
        model: &Model,
        preference: ExecutionPreference,
        callback: Arc<dyn PreparedModelCallback>,
    ) -> ErrorStatus {
        if let Err(e) = validate_model(model) {
            warn!(error = %e, "rejected model");
            callback.notify(ErrorStatus::InvalidArgument, None);
            return ErrorStatus::InvalidArgument;
        }

        match PreparedModel::prepare(&self.manager, model.clone()) {
            Ok(prepared) => {
                callback.notify(ErrorStatus::Success, Some(Arc::new(prepared)));
                ErrorStatus::Success
            }
            Err(e) => {
                let status = e.status();
                warn!(error = %e, ?status, "model preparation failed");
                callback.notify(status, None);
                status
            }
        }
    }

    pub fn get_status(&self) -> DeviceStatus {
        DeviceStatus::Available
    }
}
