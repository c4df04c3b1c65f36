// engine.rs: generation sessions: GPU resource lifecycle and the step loop.
//
// SESSION LIFECYCLE
// ─────────────────
//   open     acquire the single-session slot, show progress 5,
//            allocate storage / params / staging buffers, build pipeline
//   step k   write params(k) → submit dispatch (+ copy to staging if k == n)
//            → await completion → boundary check → progress
//   finish   map staging, copy bytes out, unmap, release buffers
//
// Every exit path (success, cancellation, `?` on a device error, or the
// future being dropped mid-await) runs through `GenerationSession::drop`,
// which destroys whatever buffers are still held. `ComputeDevice::
// destroy_buffer` takes the handle by value and the session `take()`s each
// Option before destroying it, so a buffer is released exactly once.
// Progress is reset by `SessionProgress::drop` on the same paths.
//
// CANCELLATION
// ────────────
// The token is read only at step boundaries: before each submit and right
// after each completion. A cancellation that lands while dispatch k is in
// flight lets that dispatch finish, discards its result, and reports k-1
// completed steps. No copy to staging is performed after a cancellation
// is observed, because the copy is only recorded with the final dispatch.
//
// The engine does not reset the token. The orchestrator owns it and resets
// it before each attempt; a token that is already cancelled when a session
// opens stops the session before its first dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::cancel::CancellationContext;
use crate::error::{EngineError, RequestError};
use crate::gpu::device::{BufferCopy, ComputeDevice, Dispatch, GpuError};
use crate::gpu::kernel::{GenerateParams, Kernel, PARAMS_SIZE};
use crate::image::{GeneratedImage, BYTES_PER_PIXEL};
use crate::profile::Tier;
use crate::progress::{step_progress, NullProgress, ProgressSink, SessionProgress};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One generation attempt's parameters. Images are square.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub resolution: u32,
    pub steps: u32,
    pub seed: u32,
    pub prompt: String,
    pub negative_prompt: String,
}

impl GenerationRequest {
    /// Check the request against `tier`'s limits.
    pub fn validate(&self, tier: Tier) -> Result<(), RequestError> {
        let limits = tier.limits();
        if self.prompt.trim().is_empty() {
            return Err(RequestError::EmptyPrompt);
        }
        let len = self.prompt.chars().count();
        if len > limits.prompt_limit {
            return Err(RequestError::PromptTooLong { len, cap: limits.prompt_limit, tier });
        }
        let len = self.negative_prompt.chars().count();
        if len > limits.negative_limit {
            return Err(RequestError::NegativePromptTooLong {
                len,
                cap: limits.negative_limit,
                tier,
            });
        }
        if !limits.allows_resolution(self.resolution) {
            return Err(RequestError::ResolutionNotAllowed { resolution: self.resolution, tier });
        }
        if !limits.allows_steps(self.steps) {
            return Err(RequestError::StepsNotAllowed { steps: self.steps, tier });
        }
        Ok(())
    }

    /// Byte size of the storage and staging buffers.
    pub fn image_bytes(&self) -> u64 {
        self.resolution as u64 * self.resolution as u64 * BYTES_PER_PIXEL as u64
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs generation sessions on a compute device, one at a time.
pub struct GenerationEngine<D: ComputeDevice> {
    device: Option<Arc<D>>,
    progress: Arc<dyn ProgressSink>,
    active: AtomicBool,
}

impl<D: ComputeDevice> GenerationEngine<D> {
    /// `device` is `None` when no compute device could be obtained; every
    /// `generate` then fails with [`EngineError::DeviceUnavailable`].
    pub fn new(device: Option<Arc<D>>) -> Self {
        GenerationEngine { device, progress: Arc::new(NullProgress), active: AtomicBool::new(false) }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Run one session: `request.steps` sequential dispatches, then readback.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        tier: Tier,
        cancel: &CancellationContext,
    ) -> Result<GeneratedImage, EngineError> {
        let device = self.device.as_deref().ok_or(EngineError::DeviceUnavailable)?;
        request.validate(tier)?;

        let _slot = ActiveSession::acquire(&self.active)?;
        let mut progress = SessionProgress::open(self.progress.as_ref());
        let mut session = GenerationSession::open(device, request.image_bytes())?;

        info!(
            "session: {r}×{r}, {} steps, seed {} on {}",
            request.steps,
            request.seed,
            device.info(),
            r = request.resolution
        );

        let res = request.resolution;
        let workgroups = device.workgroup_size().dispatch_size(res, res);

        for step in 1..=request.steps {
            if cancel.is_cancelled() {
                return Err(session.cancelled(cancel, step - 1));
            }

            let params = GenerateParams { width: res, height: res, seed: request.seed, step };
            session.dispatch(&params, workgroups, step == request.steps)?;
            device.await_completion().await?;

            if cancel.is_cancelled() {
                return Err(session.cancelled(cancel, step - 1));
            }
            progress.advance(step_progress(step, request.steps));
            debug!("step {step}/{} done, progress {}%", request.steps, progress.last());
        }

        let bytes = session.read_staging().await?;
        session.release();
        let image = GeneratedImage::from_rgba(res, res, bytes)
            .map_err(|e| GpuError::Dispatch(e.to_string()))?;
        info!("session complete: {image}");
        Ok(image)
    }
}

/// Holds the engine's single-session slot for the lifetime of a session.
struct ActiveSession<'a>(&'a AtomicBool);

impl<'a> ActiveSession<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, EngineError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| EngineError::SessionActive)?;
        Ok(ActiveSession(flag))
    }
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Session resources
// ---------------------------------------------------------------------------

/// GPU resources owned by one in-flight generation.
struct GenerationSession<'d, D: ComputeDevice> {
    device: &'d D,
    storage: Option<D::Buffer>,
    params: Option<D::Buffer>,
    staging: Option<D::Buffer>,
    pipeline: Option<D::Pipeline>,
    image_bytes: u64,
}

impl<'d, D: ComputeDevice> GenerationSession<'d, D> {
    /// Allocate all three buffers and the pipeline. Anything allocated
    /// before a failure is released by `Drop`.
    fn open(device: &'d D, image_bytes: u64) -> Result<Self, GpuError> {
        let mut session = GenerationSession {
            device,
            storage: None,
            params: None,
            staging: None,
            pipeline: None,
            image_bytes,
        };
        session.storage = Some(device.create_buffer(
            "generate storage",
            image_bytes,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        )?);
        session.params = Some(device.create_buffer(
            "generate params",
            PARAMS_SIZE,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        )?);
        session.staging = Some(device.create_buffer(
            "generate staging",
            image_bytes,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        )?);
        session.pipeline = Some(device.create_compute_pipeline(Kernel::Generate)?);
        Ok(session)
    }

    /// Write `params` and submit one generate pass. With `copy_out`, the
    /// storage → staging copy is recorded in the same command buffer.
    fn dispatch(
        &self,
        params: &GenerateParams,
        workgroups: (u32, u32),
        copy_out: bool,
    ) -> Result<(), GpuError> {
        let (Some(storage), Some(params_buf), Some(staging), Some(pipeline)) =
            (&self.storage, &self.params, &self.staging, &self.pipeline)
        else {
            return Err(GpuError::Dispatch("session resources already released".into()));
        };

        self.device.write_buffer(params_buf, params.as_bytes())?;
        let copy = copy_out.then_some(BufferCopy { src: storage, dst: staging, size: self.image_bytes });
        self.device.submit(Dispatch {
            pipeline,
            bindings: &[storage, params_buf],
            workgroups,
            copy,
        })
    }

    async fn read_staging(&self) -> Result<Vec<u8>, GpuError> {
        let staging = self
            .staging
            .as_ref()
            .ok_or_else(|| GpuError::Dispatch("staging buffer already released".into()))?;
        self.device.read_buffer(staging).await
    }

    /// Release every buffer still held. Idempotent.
    fn release(&mut self) {
        for buffer in [self.storage.take(), self.params.take(), self.staging.take()]
            .into_iter()
            .flatten()
        {
            self.device.destroy_buffer(buffer);
        }
        self.pipeline = None;
    }

    /// Release resources and build the cancellation result.
    fn cancelled(&mut self, cancel: &CancellationContext, completed_steps: u32) -> EngineError {
        self.release();
        let cause = cancel.cause();
        info!("session cancelled ({cause}) after {completed_steps} steps");
        EngineError::Cancelled { cause, completed_steps }
    }
}

impl<D: ComputeDevice> Drop for GenerationSession<'_, D> {
    fn drop(&mut self) {
        self.release();
    }
}
