//! `wgpu` implementation of [`GpuDevice`].

use super::{BufferUsage, DeviceLimits, GpuDevice, PipelineDesc};
use crate::config::DeviceOptions;
use crate::error::{Result, RuntimeError};
use lumen_core::BindingKind;
use std::borrow::Cow;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Compute pipeline plus the bind group layout it was created with.
pub struct WgpuPipeline {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    label: String,
}

/// Production device backed by a `wgpu` adapter.
///
/// Uploads and dispatches are encoded into a single pending command encoder
/// that is submitted on [`GpuDevice::flush`].
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
    limits: DeviceLimits,
    encoder: Mutex<Option<wgpu::CommandEncoder>>,
    staging: Mutex<Vec<wgpu::Buffer>>,
    lost: Arc<Mutex<Option<String>>>,
}

impl WgpuDevice {
    /// Initialize with the best adapter matching `options`.
    ///
    /// # Errors
    /// Returns an error if no suitable GPU is found or initialization fails.
    pub async fn new(options: &DeviceOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: options.backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference,
                compatible_surface: None,
                force_fallback_adapter: options.force_fallback_adapter,
            })
            .await
            .map_err(|e| {
                RuntimeError::InitError(format!("Failed to find suitable GPU adapter: {e}"))
            })?;

        Self::with_adapter(&adapter).await
    }

    /// Initialize with a specific adapter.
    pub async fn with_adapter(adapter: &wgpu::Adapter) -> Result<Self> {
        let adapter_info = adapter.get_info();

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("lumen"),
                required_limits: adapter.limits(),
                ..Default::default()
            })
            .await
            .map_err(|e| RuntimeError::InitError(format!("Failed to create device: {e}")))?;

        let lost = Arc::new(Mutex::new(None));
        let lost_flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            tracing::error!(?reason, %message, "GPU device lost");
            *lost_flag.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(format!("{reason:?}: {message}"));
        });

        let wgpu_limits = device.limits();
        let limits = DeviceLimits {
            max_workgroups_per_dimension: wgpu_limits.max_compute_workgroups_per_dimension,
            max_buffer_size: wgpu_limits.max_buffer_size,
            max_storage_buffer_binding_size: wgpu_limits.max_storage_buffer_binding_size as u64,
        };

        tracing::info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            "Initialized GPU device"
        );

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            limits,
            encoder: Mutex::new(None),
            staging: Mutex::new(Vec::new()),
            lost,
        })
    }

    /// Get information about the GPU adapter.
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    fn pending(&self) -> MutexGuard<'_, Option<wgpu::CommandEncoder>> {
        self.encoder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_encoder<T>(&self, f: impl FnOnce(&mut wgpu::CommandEncoder) -> T) -> T {
        let mut pending = self.pending();
        let encoder = pending.get_or_insert_with(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("lumen_commands"),
                })
        });
        f(encoder)
    }

    fn build_pipeline(&self, desc: &PipelineDesc<'_>) -> WgpuPipeline {
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(desc.label),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(desc.wgsl.to_string())),
            });

        let entries: Vec<wgpu::BindGroupLayoutEntry> = desc
            .bindings
            .iter()
            .enumerate()
            .map(|(binding, kind)| wgpu::BindGroupLayoutEntry {
                binding: binding as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: match kind {
                        BindingKind::ReadOnlyStorage => {
                            wgpu::BufferBindingType::Storage { read_only: true }
                        }
                        BindingKind::Storage => wgpu::BufferBindingType::Storage { read_only: false },
                        BindingKind::Uniform => wgpu::BufferBindingType::Uniform,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(desc.label),
                entries: &entries,
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label),
                bind_group_layouts: &[&layout],
                immediate_size: 0,
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(desc.label),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(desc.entry_point),
                compilation_options: Default::default(),
                cache: None,
            });

        WgpuPipeline {
            pipeline,
            layout,
            label: desc.label.to_string(),
        }
    }

    /// Run `f` inside out-of-memory and validation error scopes.
    ///
    /// Errors caught here are returned instead of reaching the uncaptured
    /// error handler, which panics by default.
    fn scoped<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        let out_of_memory = self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let validation = self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let validation = futures::executor::block_on(validation.pop());
        let out_of_memory = futures::executor::block_on(out_of_memory.pop());
        (value, out_of_memory.or(validation))
    }

    fn submit_pending(&self) {
        if let Some(encoder) = self.pending().take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
        self.staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn copy_size(len: u64) -> u64 {
    len.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

impl GpuDevice for WgpuDevice {
    type Buffer = wgpu::Buffer;
    type Pipeline = WgpuPipeline;

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_buffer(&self, label: &str, size: u64, usage: BufferUsage) -> Result<wgpu::Buffer> {
        if size > self.limits.max_buffer_size {
            return Err(RuntimeError::Allocation(format!(
                "{label}: {size} bytes exceeds device maximum of {} bytes",
                self.limits.max_buffer_size
            )));
        }
        let usage = match usage {
            BufferUsage::Storage => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
            }
            BufferUsage::Uniform => wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        };
        let (buffer, error) = self.scoped(|| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        });
        match error {
            Some(error) => {
                buffer.destroy();
                Err(RuntimeError::Allocation(format!("{label}: {error}")))
            }
            None => Ok(buffer),
        }
    }

    fn destroy_buffer(&self, buffer: wgpu::Buffer) {
        buffer.destroy();
    }

    fn write_buffer(&self, buffer: &wgpu::Buffer, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let size = copy_size(data.len() as u64);
        if offset + size > buffer.size() {
            return Err(RuntimeError::ExecutionError(format!(
                "Upload of {} bytes at offset {offset} overflows buffer of {} bytes",
                data.len(),
                buffer.size()
            )));
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("upload_staging"),
            size,
            usage: wgpu::BufferUsages::MAP_WRITE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: true,
        });
        staging.slice(..).get_mapped_range_mut()[..data.len()].copy_from_slice(data);
        staging.unmap();

        self.with_encoder(|encoder| {
            encoder.copy_buffer_to_buffer(&staging, 0, buffer, offset, size);
        });
        self.staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(staging);
        Ok(())
    }

    fn copy_buffer(&self, source: &wgpu::Buffer, target: &wgpu::Buffer, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let size = copy_size(size);
        if size > source.size() || size > target.size() {
            return Err(RuntimeError::ExecutionError(format!(
                "Copy of {size} bytes between buffers of {} and {} bytes",
                source.size(),
                target.size()
            )));
        }
        self.with_encoder(|encoder| {
            encoder.copy_buffer_to_buffer(source, 0, target, 0, size);
        });
        Ok(())
    }

    fn read_buffer<'a>(
        &'a self,
        buffer: &'a wgpu::Buffer,
        len: u64,
    ) -> impl Future<Output = Result<Vec<u8>>> + 'a {
        async move {
            if len == 0 {
                return Ok(Vec::new());
            }
            let size = copy_size(len).min(buffer.size());

            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("download_staging"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            self.with_encoder(|encoder| {
                encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
            });
            self.submit_pending();

            let slice = staging.slice(..);
            let (sender, receiver) = futures::channel::oneshot::channel();
            slice.map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });
            self.device
                .poll(wgpu::PollType::Wait {
                    submission_index: None,
                    timeout: None,
                })
                .map_err(|e| {
                    RuntimeError::ExecutionError(format!("GPU poll failed during download: {e:?}"))
                })?;

            receiver
                .await
                .map_err(|e| RuntimeError::ExecutionError(format!("Map recv failed: {e}")))??;

            let mut data = slice.get_mapped_range().to_vec();
            staging.unmap();
            data.truncate(len as usize);
            self.check_lost()?;
            Ok(data)
        }
    }

    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> Result<WgpuPipeline> {
        let (pipeline, error) = self.scoped(|| self.build_pipeline(desc));
        match error {
            Some(error) => Err(RuntimeError::ExecutionError(format!(
                "Pipeline creation for {} failed: {error}",
                desc.label
            ))),
            None => Ok(pipeline),
        }
    }

    fn dispatch(
        &self,
        pipeline: &WgpuPipeline,
        bindings: &[&wgpu::Buffer],
        workgroups: [u32; 3],
    ) -> Result<()> {
        let entries: Vec<wgpu::BindGroupEntry> = bindings
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&pipeline.label),
            layout: &pipeline.layout,
            entries: &entries,
        });

        self.with_encoder(|encoder| {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&pipeline.label),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
        });
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.submit_pending();
        self.check_lost()
    }

    fn check_lost(&self) -> Result<()> {
        match &*self.lost.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(reason) => Err(RuntimeError::DeviceLost(reason.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[pollster::test]
    #[ignore = "requires GPU"]
    async fn test_device_init() {
        let device = WgpuDevice::new(&DeviceOptions::default()).await;
        assert!(device.is_ok(), "Failed to initialize device");

        if let Ok(device) = device {
            let info = device.adapter_info();
            println!("GPU: {} ({:?})", info.name, info.backend);
            assert!(device.limits().max_workgroups_per_dimension > 0);
        }
    }

    #[pollster::test]
    #[ignore = "requires GPU"]
    async fn test_upload_download_roundtrip() {
        let device = WgpuDevice::new(&DeviceOptions::default()).await.unwrap();
        let buffer = device
            .create_buffer("roundtrip", 64, BufferUsage::Storage)
            .unwrap();
        let data: Vec<u8> = (0u8..10).collect();

        device.write_buffer(&buffer, 0, &data).unwrap();
        let read = device.read_buffer(&buffer, 10).await.unwrap();

        assert_eq!(read, data);
        device.destroy_buffer(buffer);
    }

    #[pollster::test]
    #[ignore = "requires GPU"]
    async fn test_invalid_pipeline_is_an_error() {
        let device = WgpuDevice::new(&DeviceOptions::default()).await.unwrap();
        let result = device.create_pipeline(&PipelineDesc {
            label: "broken",
            operator: "Broken",
            wgsl: "@compute @workgroup_size(1) fn main() { let x: u32 = 1.5; }",
            entry_point: "main",
            bindings: &[],
        });
        assert!(matches!(result, Err(RuntimeError::ExecutionError(_))));
    }

    #[pollster::test]
    #[ignore = "requires GPU"]
    async fn test_copy_between_buffers() {
        let device = WgpuDevice::new(&DeviceOptions::default()).await.unwrap();
        let source = device.create_buffer("source", 16, BufferUsage::Storage).unwrap();
        let target = device.create_buffer("target", 16, BufferUsage::Storage).unwrap();

        device.write_buffer(&source, 0, &[7u8; 8]).unwrap();
        device.copy_buffer(&source, &target, 8).unwrap();

        assert_eq!(device.read_buffer(&target, 8).await.unwrap(), vec![7u8; 8]);
    }
}
