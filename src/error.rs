// error.rs: error taxonomy for requests, the engine and the orchestrator.
//
//   RequestError     a request that does not fit the active tier
//   EngineError      tagged result of one generation session
//   GenerationError  terminal outcome of an orchestrated run
//
// The engine never decides whether to retry. It reports what happened and
// the orchestrator maps each EngineError to a retry or a terminal status.

use thiserror::Error;

use crate::cancel::CancelCause;
use crate::gpu::device::GpuError;
use crate::profile::Tier;

/// A request that violates the active tier's limits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("prompt is required")]
    EmptyPrompt,

    #[error("prompt is {len} characters, {tier} allows {cap}")]
    PromptTooLong { len: usize, cap: usize, tier: Tier },

    #[error("negative prompt is {len} characters, {tier} allows {cap}")]
    NegativePromptTooLong { len: usize, cap: usize, tier: Tier },

    #[error("resolution {resolution} is not offered by {tier}")]
    ResolutionNotAllowed { resolution: u32, tier: Tier },

    #[error("{steps} steps is not offered by {tier}")]
    StepsNotAllowed { steps: u32, tier: Tier },
}

/// Result tags of [`GenerationEngine::generate`](crate::engine::GenerationEngine::generate).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Stopped at a step boundary. `completed_steps` counts steps whose
    /// completion was observed before the cancellation.
    #[error("generation cancelled ({cause}) after {completed_steps} steps")]
    Cancelled { cause: CancelCause, completed_steps: u32 },

    #[error("no compute device available")]
    DeviceUnavailable,

    #[error("another generation session is active")]
    SessionActive,

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    /// Any other device-level failure.
    #[error("generation failed: {0}")]
    Failed(#[from] GpuError),
}

impl EngineError {
    /// Cause carried by a cancellation, if this is one.
    pub fn cancel_cause(&self) -> Option<CancelCause> {
        match self {
            EngineError::Cancelled { cause, .. } => Some(*cause),
            _ => None,
        }
    }
}

/// Terminal failure of an orchestrated run. Every variant is reported.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// No compute device could be obtained. Not retried.
    #[error("no compute device available")]
    DeviceUnavailable,

    /// The model asset is not cached. Requires a download; not retried.
    #[error("model '{model_id}' is not cached; download it first")]
    AssetMissing { model_id: String },

    #[error("prompt is required")]
    PromptRequired,

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("another generation session is active")]
    SessionActive,

    /// Stopped by a user action, visibility loss, or a Cancel decision.
    #[error("generation cancelled ({0})")]
    Cancelled(CancelCause),

    /// The single retry failed too.
    #[error("generation failed after retry: {0}")]
    RetryExhausted(#[source] EngineError),

    #[error("nothing to regenerate yet")]
    NoPreviousRun,
}
