//! Dispatch parameter blocks and their derivation from model operands.
//!
//! The `#[repr(C)]` structs here are the uniform-buffer ABI of the kernels in
//! `shaders/`; field order must match the WGSL `Params` structs exactly.

use bytemuck::{Pod, Zeroable};
use nngpu_core::geometry::{explicit_output_size, explicit_padding, output_size};
use nngpu_core::{
    Error, FusedActivation, Model, OperandType, Operation, OperationType, PaddingScheme, Result,
    Shape4, ShaderSignature,
};

/// Dilation is not carried by the NN runtime's convolution operands.
pub const DEFAULT_DILATION: u32 = 1;

/// Parameter block shared by the convolution and depthwise kernels.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ConvParams {
    pub in_h: i32,
    pub in_w: i32,
    pub out_h: i32,
    pub out_w: i32,
    pub stride_h: i32,
    pub stride_w: i32,
    pub dilation_h: i32,
    pub dilation_w: i32,
    pub pad_h: i32,
    pub pad_w: i32,
    pub filter_h: i32,
    pub filter_w: i32,
    pub channels: i32,
    pub batch: i32,
    pub has_bias: i32,
    pub m: i32,
    pub k: i32,
    pub n: i32,
    pub tail_m: i32,
    pub depth_multiplier: i32,
    pub activation: i32,
    pub batch_idx: i32,
    pub partition_idx: i32,
    pub partition_size: i32,
    /// First output pixel covered by this dispatch's y axis.
    pub m_offset: i32,
    pub _pad: [i32; 3],
}

impl ConvParams {
    /// Rewrite the channel-dependent fields for a 3→4 channel promoted input.
    pub fn promote_channels(&mut self) {
        self.k = self.k / self.channels.max(1) * 4;
        self.channels = 4;
    }
}

/// Which convolution operand layout a node uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvKind {
    Standard,
    Depthwise,
}

impl ConvKind {
    pub fn op_type(self) -> OperationType {
        match self {
            ConvKind::Standard => OperationType::Conv2d,
            ConvKind::Depthwise => OperationType::DepthwiseConv2d,
        }
    }

    /// Input count of the explicit-padding form.
    pub fn explicit_arity(self) -> usize {
        match self {
            ConvKind::Standard => 10,
            ConvKind::Depthwise => 11,
        }
    }

    /// Input count of the padding-scheme form.
    pub fn scheme_arity(self) -> usize {
        match self {
            ConvKind::Standard => 7,
            ConvKind::Depthwise => 8,
        }
    }
}

/// Everything derived from a convolution node's operands.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvSetup {
    pub kind: ConvKind,
    pub input_index: usize,
    pub filter_index: usize,
    pub bias_index: usize,
    pub output_index: usize,
    pub input: Shape4,
    pub filter: Shape4,
    pub output: Shape4,
    pub scheme: PaddingScheme,
    pub params: ConvParams,
    pub signature: ShaderSignature,
}

fn shape_error(op: OperationType, message: String) -> Error {
    Error::Shape(format!("{op}: {message}"))
}

/// The kernels only read and write `f32`; anything else is declined.
fn require_type(
    op: OperationType,
    model: &Model,
    index: usize,
    expected: OperandType,
) -> Result<()> {
    let found = model.operand(index)?.operand_type;
    if found != expected {
        return Err(Error::Unsupported(format!(
            "{op} operand {index} is {found:?}, expected {expected:?}"
        )));
    }
    Ok(())
}

impl ConvSetup {
    /// Derive the parameter block and tuning signature of a convolution node.
    ///
    /// Accepts both operand layouts, selected by input count. Fails with
    /// `Unsupported` for any fused activation other than none.
    pub fn derive(kind: ConvKind, operation: &Operation, model: &Model) -> Result<Self> {
        let op = kind.op_type();
        let ins = &operation.inputs;
        let arity = ins.len();
        if arity != kind.explicit_arity() && arity != kind.scheme_arity() {
            return Err(Error::InvalidArgument(format!(
                "{op} expects {} or {} inputs, got {arity}",
                kind.explicit_arity(),
                kind.scheme_arity()
            )));
        }
        let output_index = *operation
            .outputs
            .first()
            .ok_or_else(|| Error::InvalidArgument(format!("{op} has no output")))?;

        for &index in &[ins[0], ins[1], ins[2], output_index] {
            require_type(op, model, index, OperandType::TensorFloat32)?;
        }
        for &index in &ins[3..] {
            require_type(op, model, index, OperandType::Int32)?;
        }

        let input = model.shape4(ins[0])?;
        let filter = model.shape4(ins[1])?;
        let output = model.shape4(output_index)?;
        let bias_len = model.operand(ins[2])?.element_count();

        let scalar = |position: usize| model.scalar_u32(ins[position]);

        // Scalar positions after the three tensors differ only by layout.
        let explicit = arity == kind.explicit_arity();
        let (stride_w, stride_h, multiplier_at, activation_at) = if explicit {
            (scalar(7)?, scalar(8)?, 9, arity - 1)
        } else {
            (scalar(4)?, scalar(5)?, 6, arity - 1)
        };
        let depth_multiplier = match kind {
            ConvKind::Standard => 1,
            ConvKind::Depthwise => scalar(multiplier_at)?,
        };
        let activation = scalar(activation_at)?;

        if stride_w == 0 || stride_h == 0 {
            return Err(Error::InvalidArgument(format!(
                "{op} stride must be positive, got {stride_w}x{stride_h}"
            )));
        }
        if depth_multiplier == 0 {
            return Err(Error::InvalidArgument(format!(
                "{op} depth multiplier must be positive"
            )));
        }
        if FusedActivation::try_from(activation)? != FusedActivation::None {
            return Err(Error::Unsupported(format!(
                "{op} with fused activation {activation}"
            )));
        }

        let (scheme, pad_h, pad_w, expected_h, expected_w) = if explicit {
            let left = scalar(3)?;
            let right = scalar(4)?;
            let top = scalar(5)?;
            let bottom = scalar(6)?;
            (
                PaddingScheme::infer(left, top),
                top,
                left,
                explicit_output_size(input.height, filter.height, stride_h, DEFAULT_DILATION, top, bottom),
                explicit_output_size(input.width, filter.width, stride_w, DEFAULT_DILATION, left, right),
            )
        } else {
            let scheme = PaddingScheme::try_from(scalar(3)?)?;
            let (pad_h, _) =
                explicit_padding(input.height, filter.height, stride_h, DEFAULT_DILATION, scheme);
            let (pad_w, _) =
                explicit_padding(input.width, filter.width, stride_w, DEFAULT_DILATION, scheme);
            (
                scheme,
                pad_h,
                pad_w,
                output_size(input.height, filter.height, stride_h, DEFAULT_DILATION, scheme),
                output_size(input.width, filter.width, stride_w, DEFAULT_DILATION, scheme),
            )
        };

        if (output.height, output.width) != (expected_h, expected_w) {
            return Err(shape_error(
                op,
                format!(
                    "output {output} does not match the {expected_h}x{expected_w} extent implied by input {input} and filter {filter}"
                ),
            ));
        }
        if output.batch != input.batch {
            return Err(shape_error(
                op,
                format!("output batch {} differs from input batch {}", output.batch, input.batch),
            ));
        }
        match kind {
            ConvKind::Standard => {
                if filter.batch != output.channel || filter.channel != input.channel {
                    return Err(shape_error(
                        op,
                        format!(
                            "filter {filter} must be [{}, h, w, {}]",
                            output.channel, input.channel
                        ),
                    ));
                }
            }
            ConvKind::Depthwise => {
                if filter.batch != 1 {
                    return Err(Error::Unsupported(format!(
                        "{op} filter {filter} must have batch 1"
                    )));
                }
                if filter.channel != output.channel
                    || output.channel != input.channel * depth_multiplier
                {
                    return Err(shape_error(
                        op,
                        format!(
                            "filter {filter} and output {output} must have {} channels (input {} x multiplier {depth_multiplier})",
                            input.channel * depth_multiplier,
                            input.channel
                        ),
                    ));
                }
            }
        }
        if bias_len != output.channel as usize {
            return Err(shape_error(
                op,
                format!("bias has {bias_len} elements, expected {}", output.channel),
            ));
        }

        let m = output.height * output.width;
        let n = output.channel;
        let k = input.channel * filter.height * filter.width;

        let params = ConvParams {
            in_h: input.height as i32,
            in_w: input.width as i32,
            out_h: output.height as i32,
            out_w: output.width as i32,
            stride_h: stride_h as i32,
            stride_w: stride_w as i32,
            dilation_h: DEFAULT_DILATION as i32,
            dilation_w: DEFAULT_DILATION as i32,
            pad_h: pad_h as i32,
            pad_w: pad_w as i32,
            filter_h: filter.height as i32,
            filter_w: filter.width as i32,
            channels: input.channel as i32,
            batch: input.batch as i32,
            has_bias: 1,
            m: m as i32,
            k: k as i32,
            n: n as i32,
            tail_m: (m % 4) as i32,
            depth_multiplier: depth_multiplier as i32,
            activation: activation as i32,
            batch_idx: 0,
            partition_idx: 0,
            partition_size: 0,
            m_offset: 0,
            _pad: [0; 3],
        };

        let signature = ShaderSignature {
            op_type: op,
            batch: input.batch,
            in_h: input.height,
            in_w: input.width,
            in_c: input.channel,
            out_h: output.height,
            out_w: output.width,
            out_c: output.channel,
            filter_h: filter.height,
            filter_w: filter.width,
            pad_h,
            pad_w,
            stride_h,
            stride_w,
            activation,
            has_bias: true,
        };

        Ok(Self {
            kind,
            input_index: ins[0],
            filter_index: ins[1],
            bias_index: ins[2],
            output_index,
            input,
            filter,
            output,
            scheme,
            params,
            signature,
        })
    }
}

/// Parameter block of the softmax kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct SoftmaxParams {
    pub channel_size: i32,
    pub outer_size: i32,
    pub channels: i32,
    pub logsoftmax: i32,
    pub beta: f32,
    pub row_offset: i32,
    pub _pad: [i32; 2],
}

/// Everything derived from a softmax node's operands.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftmaxSetup {
    pub input_index: usize,
    pub output_index: usize,
    pub params: SoftmaxParams,
    pub signature: ShaderSignature,
}

impl SoftmaxSetup {
    /// Rank 2 inputs are `[batch, size]`; rank 4 inputs are reduced over
    /// `h * w * c` per batch.
    pub fn derive(operation: &Operation, model: &Model) -> Result<Self> {
        let op = OperationType::Softmax;
        if operation.inputs.len() != 2 || operation.outputs.len() != 1 {
            return Err(Error::InvalidArgument(format!(
                "{op} expects 2 inputs and 1 output, got {} and {}",
                operation.inputs.len(),
                operation.outputs.len()
            )));
        }
        let input_index = operation.inputs[0];
        let output_index = operation.outputs[0];
        require_type(op, model, input_index, OperandType::TensorFloat32)?;
        require_type(op, model, output_index, OperandType::TensorFloat32)?;
        require_type(op, model, operation.inputs[1], OperandType::Float32)?;
        let input = model.operand(input_index)?;
        let output = model.operand(output_index)?;
        let beta = model.scalar_f32(operation.inputs[1])?;

        if !(beta > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "{op} beta must be positive, got {beta}"
            )));
        }
        if output.dimensions != input.dimensions {
            return Err(shape_error(
                op,
                format!(
                    "output {:?} differs from input {:?}",
                    output.dimensions, input.dimensions
                ),
            ));
        }

        let (batch, h, w, c) = match input.dimensions.as_slice() {
            [batch, size] => (*batch, 1, 1, *size),
            [batch, h, w, c] => (*batch, *h, *w, *c),
            dims => {
                return Err(shape_error(
                    op,
                    format!("input must be rank 2 or 4, got {dims:?}"),
                ));
            }
        };

        let params = SoftmaxParams {
            channel_size: 1,
            outer_size: batch as i32,
            channels: (h * w * c) as i32,
            logsoftmax: 0,
            beta,
            row_offset: 0,
            _pad: [0; 2],
        };

        let signature = ShaderSignature {
            op_type: op,
            batch,
            in_h: h,
            in_w: w,
            in_c: c,
            out_h: h,
            out_w: w,
            out_c: c,
            filter_h: 0,
            filter_w: 0,
            pad_h: 0,
            pad_w: 0,
            stride_h: 0,
            stride_w: 0,
            activation: 0,
            has_bias: false,
        };

        Ok(Self {
            input_index,
            output_index,
            params,
            signature,
        })
    }
}

/// Parameter block of the channel-promotion kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PromoteParams {
    /// Number of pixels to convert.
    pub total: u32,
    /// First pixel handled by this dispatch.
    pub offset: u32,
    pub src_channels: u32,
    pub dst_channels: u32,
}
