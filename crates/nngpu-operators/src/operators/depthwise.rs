//! DEPTHWISE_CONV_2D dispatcher.

use nngpu_core::geometry::{align, partition_count};
use nngpu_core::{
    CompileCtx, DispatchCtx, KernelPipeline, Model, OpDispatch, Operation, Operator, Result,
    ShaderConfig,
};
use tracing::debug;

use super::conv::conv_pipeline_desc;
use crate::params::{ConvKind, ConvSetup};

const DEPTHWISE_SHADER: &str = include_str!("../../shaders/depthwise_conv2d.wgsl");

/// Configuration used when the tuning cache has no entry for a shape.
pub const DEFAULT_DEPTHWISE_CONFIG: ShaderConfig = ShaderConfig::new([1, 1, 16], [1, 1, 1]);

/// Depthwise convolution with a `[1, h, w, in * multiplier]` filter.
///
/// Inputs (explicit padding form, 11 operands): input, filter, bias,
/// padding left/right/top/bottom, stride width/height, depth multiplier,
/// fused activation. Inputs (padding scheme form, 8 operands): input,
/// filter, bias, scheme, stride width/height, depth multiplier, fused
/// activation.
pub struct DepthwiseConv2dOp;

impl Operator for DepthwiseConv2dOp {
    fn name(&self) -> &str {
        "DEPTHWISE_CONV_2D"
    }

    fn supports(&self, operation: &Operation, model: &Model) -> bool {
        ConvSetup::derive(ConvKind::Depthwise, operation, model).is_ok()
    }

    fn create_dispatch(&self, ctx: &CompileCtx<'_>) -> Result<Box<dyn OpDispatch>> {
        ConvSetup::derive(ConvKind::Depthwise, ctx.operation, ctx.model)?;

        let label = ctx.label("depthwise_conv2d");
        Ok(Box::new(DepthwiseConv2dDispatch {
            operation: ctx.operation.clone(),
            pipeline: KernelPipeline::new(label.clone()),
            label,
        }))
    }
}

struct DepthwiseConv2dDispatch {
    operation: Operation,
    label: String,
    pipeline: KernelPipeline,
}

/// Workgroup counts and partition plan of one depthwise dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DepthwisePlan {
    pub workgroups: [u32; 3],
    pub partition_size: u32,
    pub partitions: u32,
}

/// x covers output columns, y output rows. Channels are split into
/// partitions of `group_y` channels; z covers the channels of one partition.
pub(crate) fn depthwise_plan(out_w: u32, out_h: u32, n: u32, config: &ShaderConfig) -> DepthwisePlan {
    let group_x = align(out_w, config.local_size_x);
    let group_y = align(out_h, config.local_size_y);
    let partition_size = group_y;
    let partitions = partition_count(n, partition_size);
    let group_z = align(n.min(partition_size), config.local_size_z);
    DepthwisePlan {
        workgroups: [group_x, group_y, group_z],
        partition_size,
        partitions,
    }
}

impl OpDispatch for DepthwiseConv2dDispatch {
    #[tracing::instrument(skip_all, fields(node = %self.label))]
    fn dispatch(&self, ctx: &mut DispatchCtx<'_>) -> Result<()> {
        let setup = ConvSetup::derive(ConvKind::Depthwise, &self.operation, ctx.model)?;
        let signature = setup.signature.key();

        let tuning = ctx.tuning;
        let kernel = self.pipeline.get_or_build(ctx.backend, &signature, || {
            let config = tuning.lookup_or(&signature, DEFAULT_DEPTHWISE_CONFIG);
            Ok((conv_pipeline_desc(&self.label, DEPTHWISE_SHADER, config), config))
        })?;

        let buffers = [
            ctx.buffer(setup.input_index)?,
            ctx.buffer(setup.filter_index)?,
            ctx.buffer(setup.bias_index)?,
            ctx.buffer(setup.output_index)?,
        ];

        let plan = depthwise_plan(
            setup.output.width,
            setup.output.height,
            setup.output.channel,
            &kernel.config,
        );
        debug!(?plan, batch = setup.input.batch, "dispatching depthwise convolution");

        let mut params = setup.params;
        params.partition_size = plan.partition_size as i32;
        for batch in 0..setup.input.batch {
            params.batch_idx = batch as i32;
            for partition in 0..plan.partitions {
                params.partition_idx = partition as i32;
                ctx.dispatch(
                    kernel.pipeline,
                    &buffers,
                    plan.workgroups,
                    bytemuck::bytes_of(&params),
                )?;
            }
        }
        Ok(())
    }
}
