//! GPU executors and the device service for nngpu.
//!
//! # Architecture
//!
//! The runtime is layered as follows:
//! 1. **Backends** - `WgpuBackend` (Vulkan or GLES compute) and the host
//!    `RecordingBackend`, both implementing `nngpu_core::ComputeBackend`
//! 2. **Executor** - binds one model to a backend and interprets its
//!    operation list per request
//! 3. **ExecutorManager** - selects the backend once per process and builds
//!    executors
//! 4. **PreparedModel** - runs each request on its own worker thread and
//!    drains them all on drop
//! 5. **Device** - the service boundary (capabilities, support query,
//!    preparation, status)
//!
//! # Example
//!
//! ```no_run
//! use nngpu_runtime::{Device, DriverConfig, PreparedNotifier};
//! use nngpu_core::{ExecutionPreference, Model};
//!
//! fn main() -> anyhow::Result<()> {
//!     let device = Device::new("nngpu", DriverConfig::default());
//!     device.start()?;
//!
//!     let model = Model::default();
//!     let callback = PreparedNotifier::new();
//!     device.prepare_model(&model, ExecutionPreference::FastSingleAnswer, callback.clone());
//!     println!("prepare: {:?}", callback.wait());
//!
//!     device.shutdown();
//!     Ok(())
//! }
//! ```

pub mod backend;
mod callback;
mod config;
mod device;
mod error;
mod executor;
mod manager;
mod prepared;

pub use backend::{DispatchRecord, RecordingBackend, WgpuBackend, create_backend};
pub use callback::{ExecutionCallback, ExecutionNotifier, PreparedModelCallback, PreparedNotifier};
pub use config::DriverConfig;
pub use device::Device;
pub use error::{Result, RuntimeError};
pub use executor::Executor;
pub use manager::ExecutorManager;
pub use prepared::PreparedModel;
