// gpu/device.rs: compute device abstraction and its wgpu backend.
//
// Responsibilities:
//   - `ComputeDevice`: the narrow device surface the engine and prober use:
//     buffer create/write/destroy, pipeline creation, submit, completion
//     await, readback, and the reported `max_buffer_size` limit.
//   - `WgpuDevice`: the real backend. Selects the first non-CPU adapter and
//     requests a device carrying the adapter's own buffer limits.
//   - `WorkgroupSize`: the 2D workgroup configuration injected into every
//     kernel through WGSL `override` constants.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` may pick a software rasterizer (llvmpipe)
// when a real GPU is present. We enumerate explicitly and prefer anything
// that is not DeviceType::Cpu, falling back to whatever exists.
//
// COMPLETION WITHOUT BLOCKING:
// wgpu reports completion through callbacks that only fire while the device
// is being polled. `await_completion` and `read_buffer` register a callback
// that resolves a oneshot channel, then alternate a non-blocking
// `device.poll(Maintain::Poll)` with a short tokio sleep. The calling task
// is suspended between polls; no runtime worker is parked inside the driver.
//
// ERROR SCOPES:
// wgpu reports validation and out-of-memory errors out of band. Every call
// that creates or records device work runs inside a pushed OutOfMemory +
// Validation scope, and a popped error becomes a `GpuError`. Without this an
// invalid pipeline or dispatch is dropped by the driver and the session
// "completes" with an all-zero staging buffer.
//
// NEW RUST CONCEPTS
// - Associated types (`type Buffer`, `type Pipeline`) let each backend keep
//   its native handle types while the engine stays generic.
// - `#[async_trait]` boxes the async methods into `Send` futures, so a
//   session can be awaited from any tokio task.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::oneshot;
use log::{debug, info, warn};
use thiserror::Error;

use crate::gpu::kernel::{BindingKind, Kernel, DEFAULT_WORKGROUP};

/// Default interval between non-blocking device polls while awaiting work.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================
// Workgroup size
// ============================================================

/// A workgroup size configuration for 2D compute dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl Default for WorkgroupSize {
    fn default() -> Self {
        WorkgroupSize { x: DEFAULT_WORKGROUP.0, y: DEFAULT_WORKGROUP.1 }
    }
}

impl WorkgroupSize {
    /// Total invocations per workgroup (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Return the constants map for `PipelineCompilationOptions`.
    ///
    /// Both kernels declare `override WORKGROUP_X` / `WORKGROUP_Y`, so the
    /// shader source stays identical and only the specialization values
    /// differ between devices.
    pub fn as_constants(&self) -> HashMap<String, f64> {
        HashMap::from([
            ("WORKGROUP_X".to_string(), self.x as f64),
            ("WORKGROUP_Y".to_string(), self.y as f64),
        ])
    }

    /// Workgroups needed to cover a `w`×`h` grid (ceiling division).
    ///
    /// The shader guards out-of-bounds invocations:
    /// ```wgsl
    /// if (gid.x >= params.width || gid.y >= params.height) { return; }
    /// ```
    pub fn dispatch_size(&self, w: u32, h: u32) -> (u32, u32) {
        (w.div_ceil(self.x), h.div_ceil(self.y))
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

// ============================================================
// Adapter info
// ============================================================

/// Adapter identity as reported by the backend.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
    pub driver: String,
}

impl From<wgpu::AdapterInfo> for AdapterInfo {
    fn from(raw: wgpu::AdapterInfo) -> Self {
        AdapterInfo {
            name: raw.name,
            vendor: raw.vendor,
            device: raw.device,
            device_type: raw.device_type,
            backend: raw.backend,
            driver: raw.driver,
        }
    }
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

// ============================================================
// Device trait
// ============================================================

/// Copy recorded after the compute pass of a [`Dispatch`].
pub struct BufferCopy<'a, D: ComputeDevice + ?Sized> {
    pub src: &'a D::Buffer,
    pub dst: &'a D::Buffer,
    pub size: u64,
}

/// One submitted unit of compute work: a single pass, optionally followed
/// by a buffer-to-buffer copy in the same command buffer.
///
/// `bindings[n]` is bound at `@group(0) @binding(n)`.
pub struct Dispatch<'a, D: ComputeDevice + ?Sized> {
    pub pipeline: &'a D::Pipeline,
    pub bindings: &'a [&'a D::Buffer],
    pub workgroups: (u32, u32),
    pub copy: Option<BufferCopy<'a, D>>,
}

/// The compute device surface consumed by the prober and the engine.
#[async_trait]
pub trait ComputeDevice: Send + Sync {
    type Buffer: Send + Sync;
    type Pipeline: Send + Sync;

    fn info(&self) -> &AdapterInfo;

    /// Largest buffer the device reports it can allocate, in bytes.
    fn max_buffer_size(&self) -> u64;

    fn workgroup_size(&self) -> WorkgroupSize {
        WorkgroupSize::default()
    }

    fn create_buffer(
        &self,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> Result<Self::Buffer, GpuError>;

    fn create_compute_pipeline(&self, kernel: Kernel) -> Result<Self::Pipeline, GpuError>;

    /// Queue a write of `data` at offset 0. Ordered before the next submit.
    fn write_buffer(&self, buffer: &Self::Buffer, data: &[u8]) -> Result<(), GpuError>;

    fn submit(&self, dispatch: Dispatch<'_, Self>) -> Result<(), GpuError>;

    /// Resolve once all submitted work has finished on the device.
    async fn await_completion(&self) -> Result<(), GpuError>;

    /// Map a MAP_READ buffer, copy its contents out and unmap it.
    async fn read_buffer(&self, buffer: &Self::Buffer) -> Result<Vec<u8>, GpuError>;

    /// Release the buffer's device memory. Consumes the handle, so a buffer
    /// cannot be released twice.
    fn destroy_buffer(&self, buffer: Self::Buffer);
}

// ============================================================
// wgpu backend
// ============================================================

/// A compiled kernel plus the bind group layout it was created with.
pub struct WgpuPipeline {
    kernel: Kernel,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

/// The wgpu compute device: adapter info, device, queue and limits.
///
/// # Field drop order
/// `_instance` is declared last so the `wgpu::Instance` outlives `device`
/// and `queue`. Some Vulkan layers crash when the instance is destroyed
/// while device-level objects still reference it.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: AdapterInfo,
    max_buffer_size: u64,
    workgroup_size: WorkgroupSize,
    poll_interval: Duration,
    _instance: wgpu::Instance,
}

impl WgpuDevice {
    /// A device with the default poll interval, or `None` when no adapter
    /// or device can be obtained. The failure reason is logged.
    pub fn request() -> Option<Self> {
        match Self::new(DEFAULT_POLL_INTERVAL) {
            Ok(device) => Some(device),
            Err(e) => {
                warn!("no compute device available: {e}");
                None
            }
        }
    }

    /// Create a device on the best available adapter.
    ///
    /// # Errors
    /// Returns `Err` if no adapter is found or the device request fails.
    pub fn new(poll_interval: Duration) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(poll_interval))
    }

    async fn init_async(poll_interval: Duration) -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(wgpu::Backends::PRIMARY);
        for a in &adapters {
            let info = a.get_info();
            debug!("adapter: {} ({:?}, {:?})", info.name, info.backend, info.device_type);
        }

        // Real hardware first; software rasterizers only as a last resort.
        let (hardware, software): (Vec<_>, Vec<_>) = adapters
            .into_iter()
            .partition(|a| a.get_info().device_type != wgpu::DeviceType::Cpu);
        let adapter = hardware
            .into_iter()
            .chain(software)
            .next()
            .ok_or(GpuError::NoSuitableAdapter)?;

        let info = AdapterInfo::from(adapter.get_info());
        let adapter_limits = adapter.limits();

        let required_limits = wgpu::Limits {
            max_buffer_size: adapter_limits.max_buffer_size,
            max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
            ..wgpu::Limits::downlevel_defaults()
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("tierforge"),
                    required_features: wgpu::Features::empty(),
                    required_limits,
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        // Only reached by errors raised outside `scoped`.
        device.on_uncaptured_error(Box::new(|e| {
            log::error!("wgpu uncaptured error: {e}");
        }));

        info!("compute device: {info}, max buffer {} bytes", adapter_limits.max_buffer_size);

        Ok(WgpuDevice {
            device,
            queue,
            info,
            max_buffer_size: adapter_limits.max_buffer_size,
            workgroup_size: WorkgroupSize::default(),
            poll_interval,
            _instance: instance,
        })
    }

    /// Run `f` inside OutOfMemory and Validation error scopes and turn the
    /// first captured error into a `GpuError`.
    fn scoped<T>(&self, op: &'static str, f: impl FnOnce() -> T) -> Result<T, GpuError> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        // Native backends resolve these futures immediately.
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        match validation.or(oom) {
            None => Ok(value),
            Some(e) => Err(GpuError::from_scope(op, e)),
        }
    }

    /// Drive the device until `rx` resolves.
    async fn poll_until<T>(&self, mut rx: oneshot::Receiver<T>) -> Result<T, GpuError> {
        loop {
            self.device.poll(wgpu::Maintain::Poll);
            match rx.try_recv() {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => tokio::time::sleep(self.poll_interval).await,
                Err(oneshot::Canceled) => return Err(GpuError::DeviceLost),
            }
        }
    }
}

impl fmt::Display for WgpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WgpuDevice {{ adapter: {}, workgroup: {}, max_buffer: {} }}",
            self.info, self.workgroup_size, self.max_buffer_size
        )
    }
}

#[async_trait]
impl ComputeDevice for WgpuDevice {
    type Buffer = wgpu::Buffer;
    type Pipeline = WgpuPipeline;

    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn max_buffer_size(&self) -> u64 {
        self.max_buffer_size
    }

    fn workgroup_size(&self) -> WorkgroupSize {
        self.workgroup_size
    }

    fn create_buffer(
        &self,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> Result<wgpu::Buffer, GpuError> {
        if size > self.max_buffer_size {
            return Err(GpuError::BufferTooLarge { requested: size, max: self.max_buffer_size });
        }
        self.scoped("create_buffer", || {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        })
    }

    fn create_compute_pipeline(&self, kernel: Kernel) -> Result<WgpuPipeline, GpuError> {
        self.scoped("create_compute_pipeline", || self.build_pipeline(kernel))
    }

    fn write_buffer(&self, buffer: &wgpu::Buffer, data: &[u8]) -> Result<(), GpuError> {
        self.scoped("write_buffer", || self.queue.write_buffer(buffer, 0, data))
    }

    fn submit(&self, dispatch: Dispatch<'_, Self>) -> Result<(), GpuError> {
        let expected = dispatch.pipeline.kernel.bindings().len();
        if dispatch.bindings.len() != expected {
            return Err(GpuError::BindingMismatch { expected, got: dispatch.bindings.len() });
        }
        self.scoped("submit", || self.record_and_submit(dispatch))
    }

    async fn await_completion(&self) -> Result<(), GpuError> {
        let (tx, rx) = oneshot::channel();
        self.queue.on_submitted_work_done(move || {
            let _ = tx.send(());
        });
        self.poll_until(rx).await
    }

    async fn read_buffer(&self, buffer: &wgpu::Buffer) -> Result<Vec<u8>, GpuError> {
        let slice = buffer.slice(..);
        let (tx, rx) = oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.poll_until(rx)
            .await?
            .map_err(|e| GpuError::BufferMap(e.to_string()))?;

        let bytes = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(bytes)
    }

    fn destroy_buffer(&self, buffer: wgpu::Buffer) {
        buffer.destroy();
    }
}

impl WgpuDevice {
    fn build_pipeline(&self, kernel: Kernel) -> WgpuPipeline {
        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kernel.label()),
            source: wgpu::ShaderSource::Wgsl(kernel.wgsl().into()),
        });

        let entries: Vec<wgpu::BindGroupLayoutEntry> = kernel
            .bindings()
            .iter()
            .enumerate()
            .map(|(binding, kind)| wgpu::BindGroupLayoutEntry {
                binding: binding as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: match kind {
                        BindingKind::Storage => {
                            wgpu::BufferBindingType::Storage { read_only: false }
                        }
                        BindingKind::Uniform => wgpu::BufferBindingType::Uniform,
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(kernel.label()),
            entries: &entries,
        });

        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(kernel.label()),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let constants = self.workgroup_size.as_constants();
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(kernel.entry_point()),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: kernel.entry_point(),
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                ..Default::default()
            },
            cache: None,
        });

        WgpuPipeline { kernel, pipeline, layout }
    }

    fn record_and_submit(&self, dispatch: Dispatch<'_, Self>) {
        let entries: Vec<wgpu::BindGroupEntry> = dispatch
            .bindings
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(dispatch.pipeline.kernel.label()),
            layout: &dispatch.pipeline.layout,
            entries: &entries,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(dispatch.pipeline.kernel.entry_point()),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(dispatch.pipeline.kernel.entry_point()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&dispatch.pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(dispatch.workgroups.0, dispatch.workgroups.1, 1);
        }
        if let Some(copy) = dispatch.copy {
            encoder.copy_buffer_to_buffer(copy.src, 0, copy.dst, 0, copy.size);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }
}

// ============================================================
// Error type
// ============================================================

/// Errors from device initialization, resource creation and execution.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No adapter found on any primary backend.
    #[error("no suitable compute adapter found")]
    NoSuitableAdapter,

    /// wgpu device request failed (driver issue, unsupported limits, etc.).
    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("buffer of {requested} bytes exceeds device limit of {max} bytes")]
    BufferTooLarge { requested: u64, max: u64 },

    #[error("kernel expects {expected} bindings, dispatch supplied {got}")]
    BindingMismatch { expected: usize, got: usize },

    #[error("buffer map failed: {0}")]
    BufferMap(String),

    /// A completion callback was dropped without firing.
    #[error("device lost while awaiting submitted work")]
    DeviceLost,

    /// The device rejected a call. `op` names the `ComputeDevice` method.
    #[error("{op}: validation failed: {message}")]
    Validation { op: &'static str, message: String },

    #[error("{op}: device out of memory")]
    OutOfMemory { op: &'static str },

    /// Execution failure reported by a backend without a richer type.
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

impl GpuError {
    fn from_scope(op: &'static str, error: wgpu::Error) -> Self {
        match error {
            wgpu::Error::OutOfMemory { .. } => GpuError::OutOfMemory { op },
            other => GpuError::Validation { op, message: other.to_string() },
        }
    }
}

// ============================================================
// Tests
// ============================================================
