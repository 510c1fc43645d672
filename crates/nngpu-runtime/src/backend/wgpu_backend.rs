//! wgpu compute backend for Vulkan and OpenGL ES devices.

use crate::error::{Result, RuntimeError};
use nngpu_core::{BindingDesc, BufferId, ComputeBackend, ExecutorKind, PipelineDesc, PipelineId};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, trace};

/// Round a byte count up to wgpu's copy alignment (minimum 4 bytes).
fn padded_size(size: usize) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT as usize;
    (size.max(align).div_ceil(align) * align) as u64
}

struct GpuPipeline {
    label: String,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    bindings: Vec<BindingDesc>,
    /// Binding index of the uniform parameter block, if any.
    param_binding: Option<u32>,
    param_size: u32,
}

/// A `ComputeBackend` driving one wgpu device.
///
/// Every dispatch is recorded into its own command buffer, submitted, and
/// waited on before `dispatch` returns.
pub struct WgpuBackend {
    kind: ExecutorKind,
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    max_workgroups: u32,
    next_id: AtomicU64,
    buffers: RwLock<HashMap<BufferId, Arc<wgpu::Buffer>>>,
    pipelines: RwLock<HashMap<PipelineId, Arc<GpuPipeline>>>,
}

impl WgpuBackend {
    /// Open the first adapter of the API selected by `kind`.
    ///
    /// # Errors
    /// Returns an error if `kind` is not a GPU backend, no adapter is found,
    /// or device creation fails.
    pub async fn new(kind: ExecutorKind) -> Result<Self> {
        let backends = match kind {
            ExecutorKind::VulkanCompute => wgpu::Backends::VULKAN,
            ExecutorKind::GlesCompute => wgpu::Backends::GL,
            ExecutorKind::Recording => {
                return Err(RuntimeError::InitError(
                    "the recording executor has no GPU device".to_string(),
                ));
            }
        };

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| {
                RuntimeError::InitError(format!("No {kind} adapter available: {e}"))
            })?;

        let adapter_info = adapter.get_info();
        let device_desc = wgpu::DeviceDescriptor {
            label: Some("nngpu"),
            required_limits: adapter.limits(),
            ..Default::default()
        };
        let (device, queue) = adapter
            .request_device(&device_desc)
            .await
            .map_err(|e| RuntimeError::InitError(format!("Failed to create device: {e}")))?;

        let max_workgroups = device.limits().max_compute_workgroups_per_dimension;
        info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            max_workgroups,
            "opened compute device"
        );

        Ok(Self {
            kind,
            device,
            queue,
            adapter_info,
            max_workgroups,
            next_id: AtomicU64::new(1),
            buffers: RwLock::new(HashMap::new()),
            pipelines: RwLock::new(HashMap::new()),
        })
    }

    /// Information about the GPU adapter.
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn buffer(&self, id: BufferId) -> Result<Arc<wgpu::Buffer>> {
        self.buffers
            .read()
            .map_err(|_| RuntimeError::AllocationError("buffer table lock poisoned".into()))?
            .get(&id)
            .cloned()
            .ok_or_else(|| RuntimeError::AllocationError(format!("unknown buffer {id:?}")))
    }

    fn pipeline(&self, id: PipelineId) -> Result<Arc<GpuPipeline>> {
        self.pipelines
            .read()
            .map_err(|_| RuntimeError::ExecutionError("pipeline table lock poisoned".into()))?
            .get(&id)
            .cloned()
            .ok_or_else(|| RuntimeError::ExecutionError(format!("unknown pipeline {id:?}")))
    }

    fn wait_idle(&self, submission: wgpu::SubmissionIndex) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(submission),
                timeout: None,
            })
            .map_err(|e| RuntimeError::WgpuError(format!("GPU poll failed: {e:?}")))?;
        Ok(())
    }

    fn compile(&self, desc: &PipelineDesc) -> Result<naga::Module> {
        use naga_oil::compose::{Composer, NagaModuleDescriptor, ShaderDefValue};

        let mut composer =
            Composer::default().with_capabilities(naga::valid::Capabilities::all());

        let shader_defs: HashMap<String, ShaderDefValue> = desc
            .defs
            .iter()
            .map(|(name, value)| (name.clone(), ShaderDefValue::UInt(*value)))
            .collect();

        composer
            .make_naga_module(NagaModuleDescriptor {
                source: desc.source,
                file_path: &format!("{}.wgsl", desc.label),
                shader_defs,
                ..Default::default()
            })
            .map_err(|e| RuntimeError::ShaderError(format!("{}: {e:?}", desc.label)))
    }

    fn build_pipeline(&self, desc: &PipelineDesc) -> Result<GpuPipeline> {
        let module = self.compile(desc)?;
        let shader_module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&desc.label),
                source: wgpu::ShaderSource::Naga(Cow::Owned(module)),
            });

        let mut entries: Vec<wgpu::BindGroupLayoutEntry> = desc
            .bindings
            .iter()
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding: binding.binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage {
                        read_only: binding.read_only,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let param_binding = (desc.param_size > 0).then(|| {
            desc.bindings
                .iter()
                .map(|binding| binding.binding + 1)
                .max()
                .unwrap_or(0)
        });
        if let Some(binding) = param_binding {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }

        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&format!("{}_layout", desc.label)),
                entries: &entries,
            });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&format!("{}_pipeline_layout", desc.label)),
                bind_group_layouts: &[&layout],
                immediate_size: 0,
            });

        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&desc.label),
                layout: Some(&pipeline_layout),
                module: &shader_module,
                entry_point: Some(desc.entry_point),
                compilation_options: Default::default(),
                cache: None,
            });

        Ok(GpuPipeline {
            label: desc.label.clone(),
            pipeline,
            layout,
            bindings: desc.bindings.clone(),
            param_binding,
            param_size: desc.param_size,
        })
    }

    fn encode_dispatch(
        &self,
        pipeline: &GpuPipeline,
        buffers: &[BufferId],
        workgroups: [u32; 3],
        params: &[u8],
    ) -> Result<wgpu::SubmissionIndex> {
        if buffers.len() != pipeline.bindings.len() {
            return Err(RuntimeError::ExecutionError(format!(
                "{} expects {} buffers, got {}",
                pipeline.label,
                pipeline.bindings.len(),
                buffers.len()
            )));
        }

        let resolved = buffers
            .iter()
            .map(|id| self.buffer(*id))
            .collect::<Result<Vec<_>>>()?;

        let uniform = match pipeline.param_binding {
            Some(_) => {
                if params.len() != pipeline.param_size as usize {
                    return Err(RuntimeError::ExecutionError(format!(
                        "{} expects a {}-byte parameter block, got {}",
                        pipeline.label,
                        pipeline.param_size,
                        params.len()
                    )));
                }
                let uniform = self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("{}_params", pipeline.label)),
                    size: padded_size(params.len()).next_multiple_of(16),
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                self.queue
                    .write_buffer(&uniform, 0, &pad_to_copy_alignment(params));
                Some(uniform)
            }
            None => None,
        };

        let mut entries: Vec<wgpu::BindGroupEntry> = pipeline
            .bindings
            .iter()
            .zip(&resolved)
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding.binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        if let (Some(binding), Some(uniform)) = (pipeline.param_binding, &uniform) {
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: uniform.as_entire_binding(),
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{}_bind_group", pipeline.label)),
            layout: &pipeline.layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&pipeline.label),
            });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&pipeline.label),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(&pipeline.pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            compute_pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
        }

        Ok(self.queue.submit(std::iter::once(encoder.finish())))
    }

    fn download(&self, id: BufferId, len: usize) -> Result<Vec<u8>> {
        let buffer = self.buffer(id)?;
        let copy_size = padded_size(len);
        if copy_size > buffer.size() {
            return Err(RuntimeError::AllocationError(format!(
                "read of {len} bytes exceeds buffer {id:?} ({} bytes)",
                buffer.size()
            )));
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("download_staging"),
            size: copy_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("download_copy"),
            });
        encoder.copy_buffer_to_buffer(&buffer, 0, &staging, 0, copy_size);
        let submission = self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.wait_idle(submission)?;

        receiver
            .recv()
            .map_err(|e| RuntimeError::ExecutionError(format!("Map recv failed: {e}")))??;

        let mut data = slice.get_mapped_range().to_vec();
        staging.unmap();
        data.truncate(len);
        Ok(data)
    }
}

fn pad_to_copy_alignment(data: &[u8]) -> Cow<'_, [u8]> {
    let padded = padded_size(data.len()) as usize;
    if padded == data.len() {
        Cow::Borrowed(data)
    } else {
        let mut owned = data.to_vec();
        owned.resize(padded, 0);
        Cow::Owned(owned)
    }
}

impl ComputeBackend for WgpuBackend {
    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    fn max_workgroups_per_dimension(&self) -> u32 {
        self.max_workgroups
    }

    fn create_buffer(&self, label: &str, size: usize) -> nngpu_core::Result<BufferId> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded_size(size),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let id = BufferId(self.next_id());
        self.buffers
            .write()
            .map_err(|_| RuntimeError::AllocationError("buffer table lock poisoned".into()))?
            .insert(id, Arc::new(buffer));
        trace!(label, size, ?id, "created buffer");
        Ok(id)
    }

    fn write_buffer(&self, buffer: BufferId, data: &[u8]) -> nngpu_core::Result<()> {
        let target = self.buffer(buffer)?;
        let bytes = pad_to_copy_alignment(data);
        if bytes.len() as u64 > target.size() {
            return Err(RuntimeError::AllocationError(format!(
                "write of {} bytes exceeds buffer {buffer:?} ({} bytes)",
                data.len(),
                target.size()
            ))
            .into());
        }
        self.queue.write_buffer(&target, 0, &bytes);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, len: usize) -> nngpu_core::Result<Vec<u8>> {
        Ok(self.download(buffer, len)?)
    }

    fn release_buffer(&self, buffer: BufferId) {
        if let Ok(mut buffers) = self.buffers.write() {
            buffers.remove(&buffer);
        }
    }

    #[tracing::instrument(skip_all, fields(label = %desc.label))]
    fn create_pipeline(&self, desc: &PipelineDesc) -> nngpu_core::Result<PipelineId> {
        let pipeline = self.build_pipeline(desc)?;
        let id = PipelineId(self.next_id());
        self.pipelines
            .write()
            .map_err(|_| RuntimeError::ExecutionError("pipeline table lock poisoned".into()))?
            .insert(id, Arc::new(pipeline));
        debug!(?id, defs = ?desc.defs, "built compute pipeline");
        Ok(id)
    }

    fn release_pipeline(&self, pipeline: PipelineId) {
        if let Ok(mut pipelines) = self.pipelines.write() {
            pipelines.remove(&pipeline);
        }
    }

    fn dispatch(
        &self,
        pipeline: PipelineId,
        buffers: &[BufferId],
        workgroups: [u32; 3],
        params: &[u8],
    ) -> nngpu_core::Result<()> {
        let pipeline = self.pipeline(pipeline)?;
        trace!(label = %pipeline.label, ?workgroups, "dispatch");
        let submission = self.encode_dispatch(&pipeline, buffers, workgroups, params)?;
        self.wait_idle(submission)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_size() {
        assert_eq!(padded_size(0), 4);
        assert_eq!(padded_size(3), 4);
        assert_eq!(padded_size(4), 4);
        assert_eq!(padded_size(9), 12);
    }

    #[test]
    fn test_pad_to_copy_alignment() {
        assert!(matches!(pad_to_copy_alignment(&[0; 8]), Cow::Borrowed(_)));
        assert_eq!(pad_to_copy_alignment(&[1, 2, 3]).as_ref(), &[1, 2, 3, 0]);
    }

    #[pollster::test]
    #[ignore] // Requires GPU
    async fn test_vulkan_backend_init() {
        let backend = WgpuBackend::new(ExecutorKind::VulkanCompute).await;
        assert!(backend.is_ok(), "Failed to initialize Vulkan backend");
        if let Ok(backend) = backend {
            let info = backend.adapter_info();
            println!("GPU: {} ({:?})", info.name, info.backend);
            assert!(backend.max_workgroups_per_dimension() >= 65535);
        }
    }

    #[pollster::test]
    async fn test_recording_kind_is_not_a_gpu() {
        assert!(WgpuBackend::new(ExecutorKind::Recording).await.is_err());
    }
}
