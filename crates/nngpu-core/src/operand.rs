//! GPU storage for model operands.
//!
//! Constant tensors are uploaded once per prepared model into an
//! `OperandStore` shared by every execution. Inputs, outputs and
//! intermediates get fresh buffers in a `RequestArena` for each request, so
//! concurrent executions of one model never share mutable storage.

use crate::backend::{BufferGuard, BufferId, ComputeBackend};
use crate::types::{Model, OperandLifetime};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Buffers holding a model's constant tensors.
#[derive(Debug, Default)]
pub struct OperandStore {
    buffers: HashMap<usize, BufferGuard>,
}

impl OperandStore {
    /// Upload every constant tensor operand of `model`.
    ///
    /// Scalar parameters stay on the host; operators read them from the
    /// model's value blob when their dispatch is created.
    pub fn upload_constants(backend: &Arc<dyn ComputeBackend>, model: &Model) -> Result<Self> {
        let mut buffers = HashMap::new();
        for (index, operand) in model.operands.iter().enumerate() {
            if operand.lifetime != OperandLifetime::Constant {
                continue;
            }
            let data = model.constant_bytes(index)?;
            if data.len() != operand.byte_len() {
                return Err(Error::InvalidArgument(format!(
                    "constant operand {index} holds {} bytes but its dimensions {:?} need {}",
                    data.len(),
                    operand.dimensions,
                    operand.byte_len()
                )));
            }
            let guard = BufferGuard::with_data(backend, &format!("constant_{index}"), data)?;
            buffers.insert(index, guard);
        }
        debug!(constants = buffers.len(), "uploaded constant operands");
        Ok(Self { buffers })
    }

    pub fn get(&self, index: usize) -> Option<BufferId> {
        self.buffers.get(&index).map(BufferGuard::id)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Buffers owned by one in-flight request.
///
/// Everything is released when the arena is dropped.
pub struct RequestArena {
    backend: Arc<dyn ComputeBackend>,
    operands: HashMap<usize, BufferGuard>,
    scratch: Vec<BufferGuard>,
}

impl RequestArena {
    /// Allocate a buffer for every input, output and intermediate operand.
    pub fn allocate(backend: &Arc<dyn ComputeBackend>, model: &Model) -> Result<Self> {
        let mut operands = HashMap::new();
        for (index, operand) in model.operands.iter().enumerate() {
            if !operand.is_per_request() {
                continue;
            }
            let guard = BufferGuard::new(backend, &format!("operand_{index}"), operand.byte_len())?;
            operands.insert(index, guard);
        }
        Ok(Self {
            backend: Arc::clone(backend),
            operands,
            scratch: Vec::new(),
        })
    }

    pub fn get(&self, index: usize) -> Option<BufferId> {
        self.operands.get(&index).map(BufferGuard::id)
    }

    /// Allocate a temporary buffer that lives as long as the arena.
    pub fn scratch(&mut self, label: &str, size: usize) -> Result<BufferId> {
        let guard = BufferGuard::new(&self.backend, label, size)?;
        let id = guard.id();
        self.scratch.push(guard);
        Ok(id)
    }

    /// Copy host bytes into an operand's buffer.
    pub fn write(&self, index: usize, data: &[u8]) -> Result<()> {
        let id = self.require(index)?;
        self.backend.write_buffer(id, data)
    }

    /// Copy `len` bytes of an operand's buffer back to the host.
    pub fn read(&self, index: usize, len: usize) -> Result<Vec<u8>> {
        let id = self.require(index)?;
        self.backend.read_buffer(id, len)
    }

    fn require(&self, index: usize) -> Result<BufferId> {
        self.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!("operand {index} has no per-request buffer"))
        })
    }

    /// Number of buffers currently owned (operands plus scratch).
    pub fn buffer_count(&self) -> usize {
        self.operands.len() + self.scratch.len()
    }
}
