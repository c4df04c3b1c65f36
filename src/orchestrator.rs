// orchestrator.rs: validation, timeout supervision and single-shot retry.
//
// FLOW
// ────
//   Idle → Validating ─┬─ empty prompt / missing asset / bad request → Failed
//                      └─ Generating(1)
//   Generating(n) ─┬─ ok                                  → Succeeded
//                  ├─ Cancelled(User)                     → CancelledByUser
//                  ├─ DeviceUnavailable                   → Failed
//                  ├─ Cancelled(Timeout), n = 1           → TimedOut → AwaitingDecision
//                  │     ReduceAndRetry → Degrading   → Generating(2)
//                  │     RetryAsIs      → RetryingAsIs → Generating(2)
//                  │     Cancel         → CancelledByUser
//                  ├─ any other failure, n = 1            → Degrading → Generating(2)
//                  └─ any failure, n = 2                  → Failed (RetryExhausted)
//
// The orchestrator is the only place that decides between retry and a
// terminal outcome. Every terminal outcome is reported to the status sink.
//
// Each attempt resets the cancellation context, schedules a timer for the
// tier's timeout, runs the engine, and cancels the timer. The timer only
// requests `Timeout` cancellation; the engine stops at its next step
// boundary exactly as it would for a user cancel.
//
// A timer callback can already be running when its attempt ends. Attempts
// are numbered by an epoch; starting an attempt bumps the epoch and resets
// the context under one lock, and a callback only cancels while holding
// that lock with its own epoch still current.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;

use crate::assets::ModelAssetStore;
use crate::cancel::{CancelCause, CancelTrigger, CancellationContext};
use crate::clock::{Clock, TimerHandle};
use crate::degrade::degrade;
use crate::engine::{GenerationEngine, GenerationRequest};
use crate::error::{EngineError, GenerationError};
use crate::gpu::device::ComputeDevice;
use crate::image::GeneratedImage;
use crate::profile::{Preset, Tier};

/// Seeds drawn when none is given lie in `0..SEED_RANGE`.
pub const SEED_RANGE: u32 = 1 << 31;

// ---------------------------------------------------------------------------
// Timeout decisions
// ---------------------------------------------------------------------------

/// What to do after the first attempt timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDecision {
    ReduceAndRetry,
    RetryAsIs,
    Cancel,
}

/// An outside actor that resolves the timeout choice.
#[async_trait]
pub trait UserDecisionChannel: Send + Sync {
    async fn present_timeout_choice(&self) -> TimeoutDecision;
}

/// Always answers with the same decision.
#[derive(Debug, Clone, Copy)]
pub struct FixedDecision(pub TimeoutDecision);

#[async_trait]
impl UserDecisionChannel for FixedDecision {
    async fn present_timeout_choice(&self) -> TimeoutDecision {
        self.0
    }
}

// ---------------------------------------------------------------------------
// States and status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    Validating,
    Generating { attempt: u32 },
    TimedOut,
    AwaitingDecision,
    Degrading,
    RetryingAsIs,
    Succeeded,
    CancelledByUser,
    Failed,
}

/// User-facing status messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationStatus {
    Generating { attempt: u32, resolution: u32, steps: u32, seed: u32 },
    AttemptFailed { attempt: u32, reason: String },
    TimedOut,
    Retrying { degraded: bool, resolution: u32, steps: u32 },
    Succeeded { after_timeout: bool },
    Cancelled,
    Failed { reason: String },
}

impl GenerationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationStatus::Succeeded { .. }
                | GenerationStatus::Cancelled
                | GenerationStatus::Failed { .. }
        )
    }

    fn failed(error: &GenerationError) -> Self {
        let reason = match error {
            GenerationError::PromptRequired => "Prompt is required.".to_string(),
            GenerationError::AssetMissing { .. } => {
                "Model missing. Please download the model first.".to_string()
            }
            GenerationError::RetryExhausted(_) => "Generation failed after reducing settings. \
                 Please lower the power profile or resolution."
                .to_string(),
            other => format!("Generation error: {other}"),
        };
        GenerationStatus::Failed { reason }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationStatus::Generating { attempt: 1, .. } => write!(f, "Generating…"),
            GenerationStatus::Generating { attempt, .. } => write!(f, "Generating (attempt {attempt})…"),
            GenerationStatus::AttemptFailed { reason, .. } => write!(f, "Generation error: {reason}"),
            GenerationStatus::TimedOut => write!(f, "Generation timed out."),
            GenerationStatus::Retrying { degraded: true, .. } => {
                write!(f, "Retrying with reduced settings…")
            }
            GenerationStatus::Retrying { degraded: false, .. } => {
                write!(f, "Retrying with the same settings…")
            }
            GenerationStatus::Succeeded { after_timeout: false } => write!(f, "Generation complete."),
            GenerationStatus::Succeeded { after_timeout: true } => {
                write!(f, "Generation completed after timeout. Consider reducing settings.")
            }
            GenerationStatus::Cancelled => write!(f, "Generation cancelled."),
            GenerationStatus::Failed { reason } => write!(f, "{reason}"),
        }
    }
}

pub trait StatusSink: Send + Sync {
    fn report(&self, status: &GenerationStatus);
}

/// Logs statuses; failures at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatus;

impl StatusSink for LogStatus {
    fn report(&self, status: &GenerationStatus) {
        match status {
            GenerationStatus::Failed { .. } | GenerationStatus::AttemptFailed { .. } => {
                warn!("{status}")
            }
            _ => info!("{status}"),
        }
    }
}

/// Keeps every status; for tests and polling callers.
#[derive(Debug, Default)]
pub struct StatusRecorder {
    statuses: Mutex<Vec<GenerationStatus>>,
}

impl StatusRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self) -> Vec<GenerationStatus> {
        self.statuses.lock().clone()
    }

    pub fn last(&self) -> Option<GenerationStatus> {
        self.statuses.lock().last().cloned()
    }
}

impl StatusSink for StatusRecorder {
    fn report(&self, status: &GenerationStatus) {
        self.statuses.lock().push(status.clone());
    }
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// What the caller asks for. Text is clamped to the tier's caps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub resolution: u32,
    pub steps: u32,
    /// `None` draws a fresh seed.
    pub seed: Option<u32>,
}

impl From<&GenerationRequest> for GenerationParams {
    fn from(request: &GenerationRequest) -> Self {
        GenerationParams {
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            resolution: request.resolution,
            steps: request.steps,
            seed: Some(request.seed),
        }
    }
}

impl GenerationParams {
    /// Parameters from a tier preset.
    pub fn from_preset(tier: Tier, preset: Preset, prompt: impl Into<String>) -> Self {
        let (resolution, steps) = tier.limits().preset(preset);
        GenerationParams {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            resolution,
            steps,
            seed: None,
        }
    }
}

#[derive(Debug)]
pub struct GenerationOutcome {
    pub image: GeneratedImage,
    /// The timeout fired but the attempt still completed.
    pub after_timeout: bool,
    /// 1, or 2 if the result came from the retry.
    pub attempts: u32,
    /// The request that produced the image.
    pub request: GenerationRequest,
}

/// Cancels the orchestrator's current attempt from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    ctx: Arc<CancellationContext>,
}

impl CancelHandle {
    /// Explicit user cancel. Returns whether this call won the race.
    pub fn cancel(&self) -> bool {
        self.ctx.trigger(CancelTrigger::UserAction)
    }

    /// The host surface was hidden.
    pub fn visibility_lost(&self) -> bool {
        self.ctx.trigger(CancelTrigger::VisibilityLost)
    }
}

/// Cancels a scheduled timer when the attempt ends, however it ends.
struct TimerGuard<'a> {
    clock: &'a dyn Clock,
    handle: TimerHandle,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.clock.cancel(self.handle);
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct RetryOrchestrator<D: ComputeDevice> {
    engine: GenerationEngine<D>,
    detected: Tier,
    tier: Tier,
    model_id: String,
    assets: Arc<dyn ModelAssetStore>,
    clock: Arc<dyn Clock>,
    decisions: Arc<dyn UserDecisionChannel>,
    status: Arc<dyn StatusSink>,
    cancel: Arc<CancellationContext>,
    epoch: Arc<Mutex<u64>>,
    /// What the last run used; the degraded values once a retry succeeded.
    last: Option<GenerationParams>,
    last_seed: Option<u32>,
    transitions: Vec<FlowState>,
}

impl<D: ComputeDevice> RetryOrchestrator<D> {
    pub fn new(
        engine: GenerationEngine<D>,
        detected: Tier,
        assets: Arc<dyn ModelAssetStore>,
        clock: Arc<dyn Clock>,
        decisions: Arc<dyn UserDecisionChannel>,
    ) -> Self {
        RetryOrchestrator {
            engine,
            detected,
            tier: detected,
            model_id: crate::assets::DEFAULT_MODEL_ID.to_string(),
            assets,
            clock,
            decisions,
            status: Arc::new(LogStatus),
            cancel: Arc::new(CancellationContext::new()),
            epoch: Arc::new(Mutex::new(0)),
            last: None,
            last_seed: None,
            transitions: vec![FlowState::Idle],
        }
    }

    pub fn with_status(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status = sink;
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn detected_tier(&self) -> Tier {
        self.detected
    }

    /// Switch the active tier. Never exceeds the detected tier; returns the
    /// tier actually applied.
    pub fn set_tier(&mut self, requested: Tier) -> Tier {
        self.tier = self.detected.with_override(Some(requested));
        if self.tier != requested {
            info!("{requested} exceeds detected {}, using {}", self.detected, self.tier);
        }
        self.tier
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { ctx: Arc::clone(&self.cancel) }
    }

    pub fn last_seed(&self) -> Option<u32> {
        self.last_seed
    }

    /// States entered by the most recent run, starting at `Idle`.
    pub fn transitions(&self) -> &[FlowState] {
        &self.transitions
    }

    pub fn state(&self) -> FlowState {
        self.transitions.last().copied().unwrap_or(FlowState::Idle)
    }

    /// Run the previous parameters again with the previous seed. After a
    /// degraded retry succeeded, these are the degraded parameters.
    pub async fn regenerate_same_seed(&mut self) -> Result<GenerationOutcome, GenerationError> {
        let mut params = self.last.clone().ok_or(GenerationError::NoPreviousRun)?;
        params.seed = self.last_seed;
        self.run(params).await
    }

    /// Run the previous parameters again with a fresh seed.
    pub async fn regenerate_new_seed(&mut self) -> Result<GenerationOutcome, GenerationError> {
        let mut params = self.last.clone().ok_or(GenerationError::NoPreviousRun)?;
        params.seed = None;
        self.run(params).await
    }

    /// Validate, generate, and retry at most once.
    pub async fn run(&mut self, params: GenerationParams) -> Result<GenerationOutcome, GenerationError> {
        self.transitions.clear();
        self.enter(FlowState::Idle);
        self.enter(FlowState::Validating);

        let mut request = match self.validate(&params).await {
            Ok(request) => request,
            Err(e) => return Err(self.fail(e)),
        };
        self.last = Some(params);
        self.last_seed = Some(request.seed);

        let mut attempt = 1;
        loop {
            self.enter(FlowState::Generating { attempt });
            self.status.report(&GenerationStatus::Generating {
                attempt,
                resolution: request.resolution,
                steps: request.steps,
                seed: request.seed,
            });

            let (result, timer_fired) = self.attempt(&request).await;
            let err = match result {
                Ok(image) => {
                    self.last = Some(GenerationParams::from(&request));
                    self.enter(FlowState::Succeeded);
                    self.status.report(&GenerationStatus::Succeeded { after_timeout: timer_fired });
                    return Ok(GenerationOutcome {
                        image,
                        after_timeout: timer_fired,
                        attempts: attempt,
                        request,
                    });
                }
                Err(err) => err,
            };

            match err {
                EngineError::Cancelled { cause: CancelCause::Timeout, .. } if attempt == 1 => {
                    self.enter(FlowState::TimedOut);
                    self.status.report(&GenerationStatus::TimedOut);
                    self.enter(FlowState::AwaitingDecision);
                    let decision = self.decisions.present_timeout_choice().await;
                    info!("timeout decision: {decision:?}");
                    match decision {
                        TimeoutDecision::ReduceAndRetry => self.reduce(&mut request),
                        TimeoutDecision::RetryAsIs => {
                            self.enter(FlowState::RetryingAsIs);
                            self.status.report(&GenerationStatus::Retrying {
                                degraded: false,
                                resolution: request.resolution,
                                steps: request.steps,
                            });
                        }
                        TimeoutDecision::Cancel => return Err(self.cancelled()),
                    }
                }
                EngineError::Cancelled { cause: CancelCause::User | CancelCause::None, .. } => {
                    return Err(self.cancelled());
                }
                EngineError::DeviceUnavailable => {
                    return Err(self.fail(GenerationError::DeviceUnavailable));
                }
                EngineError::SessionActive => return Err(self.fail(GenerationError::SessionActive)),
                EngineError::InvalidRequest(e) => {
                    return Err(self.fail(GenerationError::InvalidRequest(e)));
                }
                err if attempt == 1 => {
                    warn!("attempt 1 failed: {err}");
                    self.status.report(&GenerationStatus::AttemptFailed {
                        attempt,
                        reason: err.to_string(),
                    });
                    self.reduce(&mut request);
                }
                err => return Err(self.fail(GenerationError::RetryExhausted(err))),
            }
            attempt += 1;
        }
    }

    async fn validate(&self, params: &GenerationParams) -> Result<GenerationRequest, GenerationError> {
        let prompt = params.prompt.trim();
        if prompt.is_empty() {
            return Err(GenerationError::PromptRequired);
        }
        if !self.assets.is_cached(&self.model_id).await {
            return Err(GenerationError::AssetMissing { model_id: self.model_id.clone() });
        }

        let limits = self.tier.limits();
        let request = GenerationRequest {
            resolution: params.resolution,
            steps: params.steps,
            seed: params.seed.unwrap_or_else(|| rand::thread_rng().gen_range(0..SEED_RANGE)),
            prompt: limits.clamp_prompt(prompt),
            negative_prompt: limits.clamp_negative(params.negative_prompt.trim()),
        };
        request.validate(self.tier)?;
        Ok(request)
    }

    /// One engine session under the tier's timeout.
    async fn attempt(&self, request: &GenerationRequest) -> (Result<GeneratedImage, EngineError>, bool) {
        let epoch = {
            let mut current = self.epoch.lock();
            *current += 1;
            self.cancel.reset();
            *current
        };

        let fired = Arc::new(AtomicBool::new(false));
        let timeout = self.tier.limits().timeout;
        let handle = {
            let cancel = Arc::clone(&self.cancel);
            let current = Arc::clone(&self.epoch);
            let fired = Arc::clone(&fired);
            self.clock.schedule(
                timeout,
                Box::new(move || {
                    let live = current.lock();
                    if *live != epoch {
                        debug!("timer of attempt epoch {epoch} fired late, ignored");
                        return;
                    }
                    fired.store(true, Ordering::SeqCst);
                    if cancel.trigger(CancelTrigger::Timer) {
                        warn!("generation exceeded {}s, cancelling", timeout.as_secs());
                    }
                }),
            )
        };
        let _timer = TimerGuard { clock: self.clock.as_ref(), handle };

        let result = self.engine.generate(request, self.tier, &self.cancel).await;
        (result, fired.load(Ordering::SeqCst))
    }

    fn reduce(&mut self, request: &mut GenerationRequest) {
        self.enter(FlowState::Degrading);
        let d = degrade(self.tier, request.resolution, request.steps);
        request.resolution = d.resolution;
        request.steps = d.steps;
        if d.clear_negative_prompt {
            request.negative_prompt.clear();
        }
        self.status.report(&GenerationStatus::Retrying {
            degraded: true,
            resolution: request.resolution,
            steps: request.steps,
        });
    }

    fn cancelled(&mut self) -> GenerationError {
        self.enter(FlowState::CancelledByUser);
        self.status.report(&GenerationStatus::Cancelled);
        GenerationError::Cancelled(CancelCause::User)
    }

    fn fail(&mut self, error: GenerationError) -> GenerationError {
        self.enter(FlowState::Failed);
        self.status.report(&GenerationStatus::failed(&error));
        error
    }

    fn enter(&mut self, state: FlowState) {
        debug!("flow: {:?} → {state:?}", self.state());
        self.transitions.push(state);
    }
}
