//! Channel promotion pre-pass.
//!
//! Converts a 3-channel NHWC buffer into a 4-channel one (the fourth channel
//! zero-filled) so the convolution kernel reads whole `vec4`-sized pixels.

use nngpu_core::geometry::linear_chunks;
use nngpu_core::{
    BindingDesc, BufferId, DispatchCtx, KernelPipeline, PipelineDesc, Result, ShaderConfig,
};

use crate::params::PromoteParams;

const PROMOTE_SHADER: &str = include_str!("../../shaders/channel_promote.wgsl");

/// Configuration of the promotion kernel; it is not looked up in the tuning cache.
pub const DEFAULT_PROMOTE_CONFIG: ShaderConfig = ShaderConfig::new([256, 1, 1], [1, 1, 1]);

/// Channel count the convolution kernel is vectorised for.
pub const PROMOTED_CHANNELS: u32 = 4;

/// Channel count that triggers promotion.
pub const PROMOTABLE_CHANNELS: u32 = 3;

/// Pipeline slot and dispatch loop of the promotion kernel.
pub struct ChannelPromoter {
    label: String,
    pipeline: KernelPipeline,
}

impl ChannelPromoter {
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        Self {
            pipeline: KernelPipeline::new(label.clone()),
            label,
        }
    }

    /// Promote `pixels` pixels from `src` into `dst`.
    ///
    /// `dst` must hold `pixels * 4` floats. Splits the work into as many
    /// dispatches as the per-axis workgroup limit requires.
    pub fn run(
        &self,
        ctx: &mut DispatchCtx<'_>,
        src: BufferId,
        dst: BufferId,
        pixels: u32,
    ) -> Result<()> {
        let backend = ctx.backend;
        let kernel = self.pipeline.get_or_build(backend, "channel_promote_3_to_4", || {
            let config = DEFAULT_PROMOTE_CONFIG;
            let desc = PipelineDesc::new(self.label.clone(), PROMOTE_SHADER, "main")
                .def("LOCAL_SIZE_X", config.local_size_x)
                .bindings(&[BindingDesc::read(0), BindingDesc::read_write(1)])
                .param_size(size_of::<PromoteParams>() as u32);
            Ok((desc, config))
        })?;

        let chunks = linear_chunks(
            pixels,
            kernel.config.local_size_x,
            backend.max_workgroups_per_dimension(),
        );
        for chunk in chunks {
            let params = PromoteParams {
                total: pixels,
                offset: chunk.offset,
                src_channels: PROMOTABLE_CHANNELS,
                dst_channels: PROMOTED_CHANNELS,
            };
            ctx.dispatch(
                kernel.pipeline,
                &[src, dst],
                [chunk.groups, 1, 1],
                bytemuck::bytes_of(&params),
            )?;
        }
        Ok(())
    }
}
