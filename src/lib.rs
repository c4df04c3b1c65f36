// tierforge: adaptive GPU image synthesis
// Capability-tiered generation with cooperative cancellation and
// degrade-and-retry on failure or timeout.

pub mod assets;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod degrade;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod image;
pub mod orchestrator;
pub mod probe;
pub mod profile;
pub mod progress;

pub use cancel::{CancelCause, CancelTrigger, CancellationContext};
pub use engine::{GenerationEngine, GenerationRequest};
pub use error::{EngineError, GenerationError, RequestError};
pub use gpu::device::{ComputeDevice, GpuError, WgpuDevice};
pub use gpu::headless::HeadlessDevice;
pub use image::GeneratedImage;
pub use orchestrator::{GenerationParams, RetryOrchestrator, TimeoutDecision};
pub use probe::CapabilityProber;
pub use profile::{Preset, ProfileLimits, Tier};
