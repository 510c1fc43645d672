//! Model, operand and request types.
//!
//! These mirror the NN runtime's HAL data model: a model is a flat operand
//! table plus an operation list in topological order, and a request points
//! into caller-owned memory pools for its inputs and outputs.

use crate::{Error, Result};
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex};

/// Index of the batch dimension in an NHWC shape.
pub const SHAPE_IDX_BATCH: usize = 0;
/// Index of the height dimension in an NHWC shape.
pub const SHAPE_IDX_HEIGHT: usize = 1;
/// Index of the width dimension in an NHWC shape.
pub const SHAPE_IDX_WIDTH: usize = 2;
/// Index of the channel dimension in an NHWC shape.
pub const SHAPE_IDX_CHANNEL: usize = 3;

/// Element type of an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandType {
    Float32,
    Int32,
    Uint32,
    TensorFloat32,
    TensorInt32,
    TensorQuant8Asymm,
}

impl OperandType {
    /// Whether operands of this type are single scalar values.
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            OperandType::Float32 | OperandType::Int32 | OperandType::Uint32
        )
    }

    /// Size of one element in bytes.
    pub fn element_size(self) -> usize {
        match self {
            OperandType::TensorQuant8Asymm => 1,
            _ => 4,
        }
    }
}

/// `offset..offset + length`, failing when the end does not fit in `usize`.
pub fn byte_range(offset: usize, length: usize) -> Result<Range<usize>> {
    offset
        .checked_add(length)
        .map(|end| offset..end)
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "range of {length} bytes at offset {offset} overflows"
            ))
        })
}

/// Lifetime class of an operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandLifetime {
    /// Produced and consumed inside the graph.
    Intermediate,
    /// Bound from the request on every execution.
    ModelInput,
    /// Written back to the request on every execution.
    ModelOutput,
    /// Tensor data fixed at preparation time.
    Constant,
    /// Scalar operator parameter (stride, padding, activation, ...).
    ScalarParameter,
    /// Optional operand that was not provided.
    NoValue,
}

/// Byte range inside a model's constant value blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataLocation {
    pub offset: usize,
    pub length: usize,
}

/// One slot of a model's operand table.
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub operand_type: OperandType,
    pub dimensions: Vec<u32>,
    pub lifetime: OperandLifetime,
    /// Where constant and scalar data lives in `Model::operand_values`.
    pub location: DataLocation,
}

impl Operand {
    /// Create a tensor operand with no backing data.
    pub fn tensor(operand_type: OperandType, dimensions: &[u32], lifetime: OperandLifetime) -> Self {
        Self {
            operand_type,
            dimensions: dimensions.to_vec(),
            lifetime,
            location: DataLocation::default(),
        }
    }

    /// Number of elements described by the dimensions (1 for scalars).
    pub fn element_count(&self) -> usize {
        self.dimensions.iter().map(|&d| d as usize).product()
    }

    /// Size of the operand's data in bytes.
    pub fn byte_len(&self) -> usize {
        self.element_count() * self.operand_type.element_size()
    }

    /// Whether the operand's data is known at preparation time.
    pub fn is_constant(&self) -> bool {
        matches!(
            self.lifetime,
            OperandLifetime::Constant | OperandLifetime::ScalarParameter
        )
    }

    /// Whether the operand needs a per-request GPU buffer.
    pub fn is_per_request(&self) -> bool {
        matches!(
            self.lifetime,
            OperandLifetime::Intermediate | OperandLifetime::ModelInput | OperandLifetime::ModelOutput
        )
    }

    /// Interpret the dimensions as an NHWC 4-tuple.
    pub fn shape4(&self) -> Result<Shape4> {
        Shape4::from_dims(&self.dimensions)
    }
}

/// NHWC tensor shape with named accessors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Shape4 {
    pub batch: u32,
    pub height: u32,
    pub width: u32,
    pub channel: u32,
}

impl Shape4 {
    pub const fn new(batch: u32, height: u32, width: u32, channel: u32) -> Self {
        Self {
            batch,
            height,
            width,
            channel,
        }
    }

    /// Build a shape from a rank-4 dimension list.
    pub fn from_dims(dims: &[u32]) -> Result<Self> {
        match dims {
            [b, h, w, c] => Ok(Self::new(*b, *h, *w, *c)),
            _ => Err(Error::Shape(format!(
                "expected a rank-4 NHWC shape, got {dims:?}"
            ))),
        }
    }

    /// Dimension by NHWC index (`SHAPE_IDX_*`).
    pub fn dim(&self, index: usize) -> u32 {
        match index {
            SHAPE_IDX_BATCH => self.batch,
            SHAPE_IDX_HEIGHT => self.height,
            SHAPE_IDX_WIDTH => self.width,
            SHAPE_IDX_CHANNEL => self.channel,
            _ => 0,
        }
    }

    pub fn element_count(&self) -> usize {
        self.batch as usize * self.height as usize * self.width as usize * self.channel as usize
    }

    /// Number of (batch, y, x) positions, i.e. elements divided by channels.
    pub fn pixel_count(&self) -> usize {
        self.batch as usize * self.height as usize * self.width as usize
    }
}

impl fmt::Display for Shape4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.batch, self.height, self.width, self.channel
        )
    }
}

/// Operation codes, numbered as in NNAPI 1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum OperationType {
    Add = 0,
    AveragePool2d = 1,
    Concatenation = 2,
    Conv2d = 3,
    DepthwiseConv2d = 4,
    DepthToSpace = 5,
    Dequantize = 6,
    EmbeddingLookup = 7,
    Floor = 8,
    FullyConnected = 9,
    HashtableLookup = 10,
    L2Normalization = 11,
    L2Pool2d = 12,
    LocalResponseNormalization = 13,
    Logistic = 14,
    LshProjection = 15,
    Lstm = 16,
    MaxPool2d = 17,
    Mul = 18,
    Relu = 19,
    Relu1 = 20,
    Relu6 = 21,
    Reshape = 22,
    ResizeBilinear = 23,
    Rnn = 24,
    Softmax = 25,
    SpaceToDepth = 26,
    Svdf = 27,
    Tanh = 28,
}

impl OperationType {
    /// Numeric operation code used in shader signatures.
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            OperationType::Add => "ADD",
            OperationType::AveragePool2d => "AVERAGE_POOL_2D",
            OperationType::Concatenation => "CONCATENATION",
            OperationType::Conv2d => "CONV_2D",
            OperationType::DepthwiseConv2d => "DEPTHWISE_CONV_2D",
            OperationType::DepthToSpace => "DEPTH_TO_SPACE",
            OperationType::Dequantize => "DEQUANTIZE",
            OperationType::EmbeddingLookup => "EMBEDDING_LOOKUP",
            OperationType::Floor => "FLOOR",
            OperationType::FullyConnected => "FULLY_CONNECTED",
            OperationType::HashtableLookup => "HASHTABLE_LOOKUP",
            OperationType::L2Normalization => "L2_NORMALIZATION",
            OperationType::L2Pool2d => "L2_POOL_2D",
            OperationType::LocalResponseNormalization => "LOCAL_RESPONSE_NORMALIZATION",
            OperationType::Logistic => "LOGISTIC",
            OperationType::LshProjection => "LSH_PROJECTION",
            OperationType::Lstm => "LSTM",
            OperationType::MaxPool2d => "MAX_POOL_2D",
            OperationType::Mul => "MUL",
            OperationType::Relu => "RELU",
            OperationType::Relu1 => "RELU1",
            OperationType::Relu6 => "RELU6",
            OperationType::Reshape => "RESHAPE",
            OperationType::ResizeBilinear => "RESIZE_BILINEAR",
            OperationType::Rnn => "RNN",
            OperationType::Softmax => "SOFTMAX",
            OperationType::SpaceToDepth => "SPACE_TO_DEPTH",
            OperationType::Svdf => "SVDF",
            OperationType::Tanh => "TANH",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fused activation codes carried by convolution-family operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FusedActivation {
    None = 0,
    Relu = 1,
    Relu1 = 2,
    Relu6 = 3,
}

impl TryFrom<u32> for FusedActivation {
    type Error = Error;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            0 => Ok(FusedActivation::None),
            1 => Ok(FusedActivation::Relu),
            2 => Ok(FusedActivation::Relu1),
            3 => Ok(FusedActivation::Relu6),
            other => Err(Error::InvalidArgument(format!(
                "unknown fused activation code {other}"
            ))),
        }
    }
}

/// One node of the operation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub op_type: OperationType,
    /// Operand indices, in the operator's fixed argument order.
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

impl Operation {
    pub fn new(op_type: OperationType, inputs: Vec<usize>, outputs: Vec<usize>) -> Self {
        Self {
            op_type,
            inputs,
            outputs,
        }
    }
}

/// A validated model: operand table, operations in declaration order, and
/// the blob holding constant operand values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    pub operands: Vec<Operand>,
    pub operations: Vec<Operation>,
    pub input_indexes: Vec<usize>,
    pub output_indexes: Vec<usize>,
    pub operand_values: Vec<u8>,
    pub relax_computation_float32_to_float16: bool,
}

impl Model {
    /// Get an operand by index.
    pub fn operand(&self, index: usize) -> Result<&Operand> {
        self.operands.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "operand index {index} out of range (model has {} operands)",
                self.operands.len()
            ))
        })
    }

    /// NHWC shape of a rank-4 operand.
    pub fn shape4(&self, index: usize) -> Result<Shape4> {
        self.operand(index)?.shape4()
    }

    /// Raw bytes of a constant or scalar operand.
    pub fn constant_bytes(&self, index: usize) -> Result<&[u8]> {
        let operand = self.operand(index)?;
        if !operand.is_constant() {
            return Err(Error::InvalidArgument(format!(
                "operand {index} is {:?}, not a constant",
                operand.lifetime
            )));
        }
        let DataLocation { offset, length } = operand.location;
        let range = byte_range(offset, length)?;
        let end = range.end;
        self.operand_values.get(range).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "operand {index} data [{offset}, {end}) exceeds the value blob ({} bytes)",
                self.operand_values.len()
            ))
        })
    }

    fn scalar_word(&self, index: usize) -> Result<[u8; 4]> {
        let bytes = self.constant_bytes(index)?;
        bytes
            .get(..4)
            .and_then(|word| word.try_into().ok())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "scalar operand {index} holds {} bytes, expected 4",
                    bytes.len()
                ))
            })
    }

    /// Value of a scalar `UINT32`/`INT32` operand, read as unsigned.
    pub fn scalar_u32(&self, index: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.scalar_word(index)?))
    }

    /// Value of a scalar `INT32` operand.
    pub fn scalar_i32(&self, index: usize) -> Result<i32> {
        Ok(i32::from_le_bytes(self.scalar_word(index)?))
    }

    /// Value of a scalar `FLOAT32` operand.
    pub fn scalar_f32(&self, index: usize) -> Result<f32> {
        Ok(f32::from_le_bytes(self.scalar_word(index)?))
    }

    /// Append an operand whose value is stored in the value blob.
    pub fn push_constant_operand(
        &mut self,
        operand_type: OperandType,
        dimensions: &[u32],
        data: &[u8],
    ) -> usize {
        let lifetime = if operand_type.is_scalar() {
            OperandLifetime::ScalarParameter
        } else {
            OperandLifetime::Constant
        };
        let offset = self.operand_values.len();
        self.operand_values.extend_from_slice(data);
        self.operands.push(Operand {
            operand_type,
            dimensions: dimensions.to_vec(),
            lifetime,
            location: DataLocation {
                offset,
                length: data.len(),
            },
        });
        self.operands.len() - 1
    }

    /// Append a scalar `INT32` parameter operand.
    pub fn push_scalar_i32(&mut self, value: i32) -> usize {
        self.push_constant_operand(OperandType::Int32, &[], &value.to_le_bytes())
    }

    /// Append a scalar `FLOAT32` parameter operand.
    pub fn push_scalar_f32(&mut self, value: f32) -> usize {
        self.push_constant_operand(OperandType::Float32, &[], &value.to_le_bytes())
    }

    /// Append an operand without data (input, output or intermediate).
    pub fn push_operand(&mut self, operand: Operand) -> usize {
        self.operands.push(operand);
        self.operands.len() - 1
    }
}

/// Transport of a request memory pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// File-descriptor backed mapping; GPU writes need a flush to the mapping.
    MmapFd,
    /// Anonymous shared memory.
    Ashmem,
}

impl Transport {
    pub fn name(self) -> &'static str {
        match self {
            Transport::MmapFd => "mmap_fd",
            Transport::Ashmem => "ashmem",
        }
    }
}

impl std::str::FromStr for Transport {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "mmap_fd" => Ok(Transport::MmapFd),
            "ashmem" => Ok(Transport::Ashmem),
            other => Err(Error::InvalidArgument(format!(
                "unsupported memory transport '{other}'"
            ))),
        }
    }
}

/// Caller-owned memory shared with the driver for request inputs/outputs.
///
/// Cloning shares the same storage.
#[derive(Debug, Clone)]
pub struct MemoryPool {
    transport: Transport,
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryPool {
    /// Create a zero-filled pool for the named transport.
    pub fn new(transport: &str, size: usize) -> Result<Self> {
        Ok(Self {
            transport: transport.parse()?,
            data: Arc::new(Mutex::new(vec![0; size])),
        })
    }

    /// Create a pool holding a copy of `bytes`.
    pub fn from_bytes(transport: &str, bytes: &[u8]) -> Result<Self> {
        let pool = Self::new(transport, bytes.len())?;
        pool.write(0, bytes)?;
        Ok(pool)
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn len(&self) -> usize {
        self.lock().map(|data| data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<u8>>> {
        self.data
            .lock()
            .map_err(|_| Error::Backend("memory pool lock poisoned".into()))
    }

    /// Copy `length` bytes out of the pool.
    pub fn read(&self, offset: usize, length: usize) -> Result<Vec<u8>> {
        let range = byte_range(offset, length)?;
        let end = range.end;
        let data = self.lock()?;
        data.get(range).map(<[u8]>::to_vec).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "pool range [{offset}, {end}) exceeds pool size {}",
                data.len()
            ))
        })
    }

    /// Copy bytes into the pool (client side).
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let range = byte_range(offset, bytes.len())?;
        let end = range.end;
        let mut data = self.lock()?;
        let len = data.len();
        let dst = data.get_mut(range).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "pool range [{offset}, {end}) exceeds pool size {len}"
            ))
        })?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    /// Make GPU-produced bytes visible to CPU readers of the pool.
    pub fn sync_from_device(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.write(offset, bytes)?;
        if self.transport == Transport::MmapFd {
            tracing::trace!(offset, len = bytes.len(), "flushed mmap_fd pool range");
        }
        Ok(())
    }

    /// Copy of the whole pool.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.lock()?.clone())
    }
}

/// Location of one request argument inside a memory pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestArgument {
    pub has_no_value: bool,
    pub pool_index: usize,
    pub offset: usize,
    pub length: usize,
    /// Optional dimensions; empty means "as declared by the model".
    pub dimensions: Vec<u32>,
}

impl RequestArgument {
    pub fn new(pool_index: usize, offset: usize, length: usize) -> Self {
        Self {
            has_no_value: false,
            pool_index,
            offset,
            length,
            dimensions: Vec::new(),
        }
    }
}

/// One execution request against a prepared model.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub inputs: Vec<RequestArgument>,
    pub outputs: Vec<RequestArgument>,
    pub pools: Vec<MemoryPool>,
}

/// Status reported through the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorStatus {
    Success,
    InvalidArgument,
    GeneralFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    Available,
    Busy,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionPreference {
    LowPower,
    FastSingleAnswer,
    SustainedSpeed,
}

/// Relative performance metadata; lower is better, 1.0 is the CPU baseline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceInfo {
    pub exec_time: f32,
    pub power_usage: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Capabilities {
    pub float32_performance: PerformanceInfo,
    pub quantized8_performance: PerformanceInfo,
    pub relaxed_float32_to_float16_performance: PerformanceInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape4_accessors() {
        let shape = Shape4::from_dims(&[1, 8, 6, 3]).unwrap();
        assert_eq!(shape.dim(SHAPE_IDX_BATCH), 1);
        assert_eq!(shape.dim(SHAPE_IDX_HEIGHT), 8);
        assert_eq!(shape.dim(SHAPE_IDX_WIDTH), 6);
        assert_eq!(shape.dim(SHAPE_IDX_CHANNEL), 3);
        assert_eq!(shape.element_count(), 144);
        assert_eq!(shape.pixel_count(), 48);
        assert!(Shape4::from_dims(&[2, 3]).is_err());
    }

    #[test]
    fn test_scalar_operands_round_trip_through_value_blob() {
        let mut model = Model::default();
        let stride = model.push_scalar_i32(2);
        let beta = model.push_scalar_f32(0.5);

        assert_eq!(model.operands[stride].lifetime, OperandLifetime::ScalarParameter);
        assert_eq!(model.scalar_u32(stride).unwrap(), 2);
        assert_eq!(model.scalar_i32(stride).unwrap(), 2);
        assert_eq!(model.scalar_f32(beta).unwrap(), 0.5);
    }

    #[test]
    fn test_scalar_read_of_non_constant_fails() {
        let mut model = Model::default();
        let input = model.push_operand(Operand::tensor(
            OperandType::TensorFloat32,
            &[1, 2, 2, 1],
            OperandLifetime::ModelInput,
        ));
        let err = model.scalar_u32(input).unwrap_err();
        assert_eq!(err.status(), ErrorStatus::InvalidArgument);
    }

    #[test]
    fn test_memory_pool_transport_and_ranges() {
        assert!(MemoryPool::new("gralloc", 16).is_err());

        let pool = MemoryPool::new("ashmem", 8).unwrap();
        pool.write(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(pool.read(4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(pool.read(6, 4).is_err());
        assert!(pool.read(usize::MAX, 2).is_err());
        assert!(pool.write(usize::MAX - 1, &[0; 4]).is_err());

        let shared = pool.clone();
        shared.sync_from_device(0, &[9, 9]).unwrap();
        assert_eq!(pool.snapshot().unwrap(), vec![9, 9, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_operation_codes() {
        assert_eq!(OperationType::Conv2d.code(), 3);
        assert_eq!(OperationType::DepthwiseConv2d.code(), 4);
        assert_eq!(OperationType::Softmax.code(), 25);
        assert_eq!(OperationType::Softmax.to_string(), "SOFTMAX");
    }
}
