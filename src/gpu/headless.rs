// gpu/headless.rs: CPU-emulated compute device.
//
// `HeadlessDevice` implements `ComputeDevice` without a GPU. Buffers are
// plain byte vectors; a dispatch runs the kernel's CPU reference function
// from gpu/kernel.rs over the bound buffers. Because the reference is the
// authoritative definition of each kernel, the headless device produces the
// same bytes the WGSL would.
//
// It serves three purposes:
//   1. Fallback backend for the CLI on machines without a usable adapter.
//   2. Test double: every call is recorded as a `DeviceEvent`, so tests can
//      assert dispatch counts, copy placement and buffer release.
//   3. Fault and latency injection: a simulated per-dispatch latency (which
//      honours tokio's paused clock), injected allocation, pipeline and
//      dispatch failures, and a hook that runs when a dispatch completes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::gpu::device::{AdapterInfo, ComputeDevice, Dispatch, GpuError};
use crate::gpu::kernel::{render_benchmark, render_step, GenerateParams, Kernel};

/// Something observable that happened on the device, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    BufferCreated { id: u64, label: String, size: u64 },
    BufferDestroyed { id: u64 },
    PipelineCreated { kernel: Kernel },
    BufferWritten { id: u64, len: usize },
    /// `ordinal` counts submits over the device's lifetime, starting at 1.
    Dispatched { ordinal: u64, kernel: Kernel, workgroups: (u32, u32), step: Option<u32> },
    Copied { src: u64, dst: u64, size: u64 },
    Completed { ordinal: u64 },
    BufferRead { id: u64 },
}

/// Handle to a headless buffer. Not `Clone`, so it is destroyed at most once.
#[derive(Debug)]
pub struct HeadlessBuffer {
    id: u64,
}

#[derive(Debug)]
pub struct HeadlessPipeline {
    kernel: Kernel,
}

type CompletionHook = Arc<dyn Fn(u64) + Send + Sync>;

/// CPU-backed [`ComputeDevice`].
pub struct HeadlessDevice {
    info: AdapterInfo,
    max_buffer_size: u64,
    dispatch_latency: Duration,
    fail_on: HashSet<u64>,
    fail_always: bool,
    fail_allocation: Option<u64>,
    fail_pipeline: bool,
    allocations: AtomicU64,
    on_complete: Option<CompletionHook>,
    next_id: AtomicU64,
    dispatches: AtomicU64,
    memory: Mutex<HashMap<u64, Vec<u8>>>,
    events: Mutex<Vec<DeviceEvent>>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    /// 1 GiB buffer limit, zero latency, no faults.
    pub fn new() -> Self {
        HeadlessDevice {
            info: AdapterInfo {
                name: "headless".to_string(),
                vendor: 0,
                device: 0,
                device_type: wgpu::DeviceType::Cpu,
                backend: wgpu::Backend::Empty,
                driver: "cpu-reference".to_string(),
            },
            max_buffer_size: 1 << 30,
            dispatch_latency: Duration::ZERO,
            fail_on: HashSet::new(),
            fail_always: false,
            fail_allocation: None,
            fail_pipeline: false,
            allocations: AtomicU64::new(0),
            on_complete: None,
            next_id: AtomicU64::new(1),
            dispatches: AtomicU64::new(0),
            memory: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.info.name = name.into();
        self
    }

    pub fn with_max_buffer_size(mut self, bytes: u64) -> Self {
        self.max_buffer_size = bytes;
        self
    }

    /// Time each `await_completion` takes, measured on tokio's clock.
    pub fn with_dispatch_latency(mut self, latency: Duration) -> Self {
        self.dispatch_latency = latency;
        self
    }

    /// Make the submit with this lifetime ordinal (1-based) fail.
    pub fn fail_on_dispatch(mut self, ordinal: u64) -> Self {
        self.fail_on.insert(ordinal);
        self
    }

    /// Make every submit fail.
    pub fn fail_every_dispatch(mut self) -> Self {
        self.fail_always = true;
        self
    }

    /// Make the `nth` `create_buffer` call (1-based, over the device's
    /// lifetime) fail as if the device ran out of memory.
    pub fn fail_on_allocation(mut self, nth: u64) -> Self {
        self.fail_allocation = Some(nth);
        self
    }

    /// Make every `create_compute_pipeline` call fail validation.
    pub fn fail_pipeline_creation(mut self) -> Self {
        self.fail_pipeline = true;
        self
    }

    /// Run `hook(ordinal)` when a dispatch's completion is awaited, before
    /// the awaiting caller resumes.
    pub fn on_dispatch_complete(mut self, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(hook));
        self
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().clone()
    }

    /// Number of submits so far.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches.load(Ordering::SeqCst)
    }

    /// Ids of buffers created and not yet destroyed.
    pub fn live_buffers(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.memory.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn record(&self, event: DeviceEvent) {
        self.events.lock().push(event);
    }
}

#[async_trait]
impl ComputeDevice for HeadlessDevice {
    type Buffer = HeadlessBuffer;
    type Pipeline = HeadlessPipeline;

    fn info(&self) -> &AdapterInfo {
        &self.info
    }

    fn max_buffer_size(&self) -> u64 {
        self.max_buffer_size
    }

    fn create_buffer(
        &self,
        label: &str,
        size: u64,
        _usage: wgpu::BufferUsages,
    ) -> Result<HeadlessBuffer, GpuError> {
        if size > self.max_buffer_size {
            return Err(GpuError::BufferTooLarge { requested: size, max: self.max_buffer_size });
        }
        let nth = self.allocations.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_allocation == Some(nth) {
            return Err(GpuError::OutOfMemory { op: "create_buffer" });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.memory.lock().insert(id, vec![0u8; size as usize]);
        self.record(DeviceEvent::BufferCreated { id, label: label.to_string(), size });
        Ok(HeadlessBuffer { id })
    }

    fn create_compute_pipeline(&self, kernel: Kernel) -> Result<HeadlessPipeline, GpuError> {
        if self.fail_pipeline {
            return Err(GpuError::Validation {
                op: "create_compute_pipeline",
                message: format!("injected failure for {}", kernel.label()),
            });
        }
        self.record(DeviceEvent::PipelineCreated { kernel });
        Ok(HeadlessPipeline { kernel })
    }

    fn write_buffer(&self, buffer: &HeadlessBuffer, data: &[u8]) -> Result<(), GpuError> {
        let mut memory = self.memory.lock();
        let dst = memory
            .get_mut(&buffer.id)
            .ok_or_else(|| GpuError::Dispatch(format!("write to released buffer {}", buffer.id)))?;
        let n = data.len().min(dst.len());
        dst[..n].copy_from_slice(&data[..n]);
        drop(memory);
        self.record(DeviceEvent::BufferWritten { id: buffer.id, len: data.len() });
        Ok(())
    }

    fn submit(&self, dispatch: Dispatch<'_, Self>) -> Result<(), GpuError> {
        let ordinal = self.dispatches.fetch_add(1, Ordering::SeqCst) + 1;
        let kernel = dispatch.pipeline.kernel;

        if self.fail_always || self.fail_on.contains(&ordinal) {
            return Err(GpuError::Dispatch(format!("injected failure at dispatch {ordinal}")));
        }

        let expected = kernel.bindings().len();
        if dispatch.bindings.len() != expected {
            return Err(GpuError::BindingMismatch { expected, got: dispatch.bindings.len() });
        }

        let mut memory = self.memory.lock();
        let step = match kernel {
            Kernel::Generate => {
                let params = memory
                    .get(&dispatch.bindings[1].id)
                    .and_then(|bytes| GenerateParams::from_bytes(bytes))
                    .ok_or_else(|| GpuError::Dispatch("params buffer unavailable".into()))?;
                let out = memory
                    .get_mut(&dispatch.bindings[0].id)
                    .ok_or_else(|| GpuError::Dispatch("storage buffer unavailable".into()))?;
                render_step(&params, out);
                Some(params.step)
            }
            Kernel::Benchmark => {
                let out = memory
                    .get_mut(&dispatch.bindings[0].id)
                    .ok_or_else(|| GpuError::Dispatch("storage buffer unavailable".into()))?;
                render_benchmark(out);
                None
            }
        };

        let copied = match &dispatch.copy {
            Some(copy) => {
                let size = copy.size as usize;
                let src = memory
                    .get(&copy.src.id)
                    .and_then(|bytes| bytes.get(..size))
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| GpuError::Dispatch("copy source unavailable".into()))?;
                memory
                    .get_mut(&copy.dst.id)
                    .and_then(|bytes| bytes.get_mut(..size))
                    .ok_or_else(|| GpuError::Dispatch("copy destination unavailable".into()))?
                    .copy_from_slice(&src);
                Some(DeviceEvent::Copied { src: copy.src.id, dst: copy.dst.id, size: copy.size })
            }
            None => None,
        };
        drop(memory);

        self.record(DeviceEvent::Dispatched { ordinal, kernel, workgroups: dispatch.workgroups, step });
        if let Some(event) = copied {
            self.record(event);
        }
        Ok(())
    }

    async fn await_completion(&self) -> Result<(), GpuError> {
        if !self.dispatch_latency.is_zero() {
            tokio::time::sleep(self.dispatch_latency).await;
        }
        let ordinal = self.dispatches.load(Ordering::SeqCst);
        self.record(DeviceEvent::Completed { ordinal });
        if let Some(hook) = &self.on_complete {
            hook(ordinal);
        }
        Ok(())
    }

    async fn read_buffer(&self, buffer: &HeadlessBuffer) -> Result<Vec<u8>, GpuError> {
        let bytes = self
            .memory
            .lock()
            .get(&buffer.id)
            .cloned()
            .ok_or_else(|| GpuError::BufferMap(format!("buffer {} already released", buffer.id)))?;
        self.record(DeviceEvent::BufferRead { id: buffer.id });
        Ok(bytes)
    }

    fn destroy_buffer(&self, buffer: HeadlessBuffer) {
        self.memory.lock().remove(&buffer.id);
        self.record(DeviceEvent::BufferDestroyed { id: buffer.id });
    }
}
