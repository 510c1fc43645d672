//! Common test utilities for runtime integration tests.
//!
//! Model builders for the supported operators plus helpers to lay out a
//! request in a single memory pool.

#![allow(dead_code)]

use nngpu_core::{
    ExecutorKind, MemoryPool, Model, Operand, OperandLifetime, OperandType, Operation,
    OperationType, Request, RequestArgument, TuningCache,
};
use nngpu_runtime::{DriverConfig, ExecutorManager, RecordingBackend};
use std::sync::Arc;

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

pub fn bytes_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|word| f32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect()
}

/// Deterministic, non-trivial test data.
pub fn ramp(len: usize, scale: f32) -> Vec<f32> {
    (0..len).map(|i| ((i % 7) as f32 - 3.0) * scale).collect()
}

fn push_input(model: &mut Model, dims: &[u32]) -> usize {
    let index = model.push_operand(Operand::tensor(
        OperandType::TensorFloat32,
        dims,
        OperandLifetime::ModelInput,
    ));
    model.input_indexes.push(index);
    index
}

fn push_output(model: &mut Model, dims: &[u32]) -> usize {
    let index = model.push_operand(Operand::tensor(
        OperandType::TensorFloat32,
        dims,
        OperandLifetime::ModelOutput,
    ));
    model.output_indexes.push(index);
    index
}

fn push_tensor_f32(model: &mut Model, dims: &[u32], values: &[f32]) -> usize {
    model.push_constant_operand(OperandType::TensorFloat32, dims, &f32_bytes(values))
}

/// Single CONV_2D model with explicit padding `[left, right, top, bottom]`
/// and stride `[width, height]`.
pub fn conv_model(
    input: [u32; 4],
    filter: [u32; 4],
    output: [u32; 4],
    padding: [i32; 4],
    stride: [i32; 2],
    activation: i32,
    weights: &[f32],
    bias: &[f32],
) -> Model {
    let mut model = Model::default();
    let input_index = push_input(&mut model, &input);
    let filter_index = push_tensor_f32(&mut model, &filter, weights);
    let bias_index = push_tensor_f32(&mut model, &[filter[0]], bias);

    let mut inputs = vec![input_index, filter_index, bias_index];
    for value in padding.iter().chain(&stride) {
        inputs.push(model.push_scalar_i32(*value));
    }
    inputs.push(model.push_scalar_i32(activation));

    let output_index = push_output(&mut model, &output);
    model
        .operations
        .push(Operation::new(OperationType::Conv2d, inputs, vec![output_index]));
    model
}

/// Input `(1, 8, 8, 3)`, filter `(8, 3, 3, 3)`, padding 1 on every side,
/// stride 1, output `(1, 8, 8, 8)`.
pub fn scenario_conv_model() -> Model {
    conv_model(
        [1, 8, 8, 3],
        [8, 3, 3, 3],
        [1, 8, 8, 8],
        [1, 1, 1, 1],
        [1, 1],
        0,
        &ramp(8 * 3 * 3 * 3, 0.1),
        &ramp(8, 0.5),
    )
}

/// Single DEPTHWISE_CONV_2D model with explicit padding.
pub fn depthwise_model(
    input: [u32; 4],
    filter: [u32; 4],
    output: [u32; 4],
    padding: [i32; 4],
    stride: [i32; 2],
    multiplier: i32,
    weights: &[f32],
    bias: &[f32],
) -> Model {
    let mut model = Model::default();
    let input_index = push_input(&mut model, &input);
    let filter_index = push_tensor_f32(&mut model, &filter, weights);
    let bias_index = push_tensor_f32(&mut model, &[filter[3]], bias);

    let mut inputs = vec![input_index, filter_index, bias_index];
    for value in padding.iter().chain(&stride) {
        inputs.push(model.push_scalar_i32(*value));
    }
    inputs.push(model.push_scalar_i32(multiplier));
    inputs.push(model.push_scalar_i32(0));

    let output_index = push_output(&mut model, &output);
    model.operations.push(Operation::new(
        OperationType::DepthwiseConv2d,
        inputs,
        vec![output_index],
    ));
    model
}

/// Single SOFTMAX model over a rank 2 or rank 4 tensor.
pub fn softmax_model(dims: &[u32], beta: f32) -> Model {
    let mut model = Model::default();
    let input_index = push_input(&mut model, dims);
    let beta_index = model.push_scalar_f32(beta);
    let output_index = push_output(&mut model, dims);
    model.operations.push(Operation::new(
        OperationType::Softmax,
        vec![input_index, beta_index],
        vec![output_index],
    ));
    model
}

/// Softmax followed by an ADD that has no GPU operator.
pub fn softmax_then_add_model() -> Model {
    let dims = [1, 16];
    let mut model = Model::default();
    let input_index = push_input(&mut model, &dims);
    let beta_index = model.push_scalar_f32(1.0);
    let hidden = model.push_operand(Operand::tensor(
        OperandType::TensorFloat32,
        &dims,
        OperandLifetime::Intermediate,
    ));
    model.operations.push(Operation::new(
        OperationType::Softmax,
        vec![input_index, beta_index],
        vec![hidden],
    ));

    let activation = model.push_scalar_i32(0);
    let output_index = push_output(&mut model, &dims);
    model.operations.push(Operation::new(
        OperationType::Add,
        vec![hidden, hidden, activation],
        vec![output_index],
    ));
    model
}

/// Lay out one request in a single `ashmem` pool: inputs first, then
/// zero-filled outputs.
pub fn make_request(model: &Model, inputs: &[&[f32]]) -> Request {
    let mut bytes = Vec::new();
    let mut request = Request::default();

    for (position, &index) in model.input_indexes.iter().enumerate() {
        let data = f32_bytes(inputs[position]);
        assert_eq!(data.len(), model.operands[index].byte_len());
        request
            .inputs
            .push(RequestArgument::new(0, bytes.len(), data.len()));
        bytes.extend_from_slice(&data);
    }
    for &index in &model.output_indexes {
        let length = model.operands[index].byte_len();
        request
            .outputs
            .push(RequestArgument::new(0, bytes.len(), length));
        bytes.resize(bytes.len() + length, 0);
    }

    request.pools.push(MemoryPool::from_bytes("ashmem", &bytes).unwrap());
    request
}

/// Output `position` of a finished request.
pub fn read_output(request: &Request, position: usize) -> Vec<f32> {
    let argument = &request.outputs[position];
    let pool = &request.pools[argument.pool_index];
    bytes_f32(&pool.read(argument.offset, argument.length).unwrap())
}

/// Manager on a recording backend with an empty tuning cache, so every node
/// uses its default configuration.
pub fn recording_manager() -> (ExecutorManager, Arc<RecordingBackend>) {
    recording_manager_with(RecordingBackend::new(), Arc::new(TuningCache::empty()))
}

pub fn recording_manager_with(
    backend: RecordingBackend,
    tuning: Arc<TuningCache>,
) -> (ExecutorManager, Arc<RecordingBackend>) {
    let backend = Arc::new(backend);
    let manager = ExecutorManager::with_backend(
        DriverConfig::new(ExecutorKind::Recording),
        backend.clone(),
    )
    .with_tuning(tuning);
    (manager, backend)
}

/// Host reference for an NHWC convolution with explicit padding.
pub fn reference_conv(
    input: &[f32],
    input_shape: [u32; 4],
    weights: &[f32],
    filter_shape: [u32; 4],
    bias: &[f32],
    output_shape: [u32; 4],
    pad: [i32; 2],
    stride: [i32; 2],
) -> Vec<f32> {
    let [batch, in_h, in_w, in_c] = input_shape.map(|d| d as i32);
    let [out_c, f_h, f_w, _] = filter_shape.map(|d| d as i32);
    let [_, out_h, out_w, _] = output_shape.map(|d| d as i32);
    let [pad_top, pad_left] = pad;
    let [stride_w, stride_h] = stride;

    let mut out = vec![0.0; (batch * out_h * out_w * out_c) as usize];
    for b in 0..batch {
        for oy in 0..out_h {
            for ox in 0..out_w {
                for oc in 0..out_c {
                    let mut acc = bias[oc as usize];
                    for ky in 0..f_h {
                        for kx in 0..f_w {
                            let iy = oy * stride_h - pad_top + ky;
                            let ix = ox * stride_w - pad_left + kx;
                            if iy < 0 || iy >= in_h || ix < 0 || ix >= in_w {
                                continue;
                            }
                            for ic in 0..in_c {
                                let x = input[(((b * in_h + iy) * in_w + ix) * in_c + ic) as usize];
                                let w = weights[(((oc * f_h + ky) * f_w + kx) * in_c + ic) as usize];
                                acc += x * w;
                            }
                        }
                    }
                    out[(((b * out_h + oy) * out_w + ox) * out_c + oc) as usize] = acc;
                }
            }
        }
    }
    out
}

pub fn assert_close(actual: &[f32], expected: &[f32], tolerance: f32) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tolerance,
            "element {i}: got {a}, expected {e}"
        );
    }
}

/// Install a debug-level subscriber for tests that want log output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .try_init();
}
