// tests/test_engine.rs: GenerationEngine against the headless device.
//
// The headless device records every buffer, dispatch and copy, so these
// tests check the session lifecycle from the outside: dispatch ordering,
// copy placement, buffer release on every exit path, progress, and
// cancellation at step boundaries.

use std::sync::Arc;
use std::time::Duration;

use tierforge::cancel::{CancelCause, CancelTrigger, CancellationContext};
use tierforge::engine::{GenerationEngine, GenerationRequest};
use tierforge::error::{EngineError, RequestError};
use tierforge::gpu::device::GpuError;
use tierforge::gpu::headless::{DeviceEvent, HeadlessDevice};
use tierforge::gpu::kernel::{pixel, render_step, GenerateParams};
use tierforge::profile::Tier;
use tierforge::progress::{step_progress, ProgressEvent, ProgressRecorder, ProgressSink};

fn request(resolution: u32, steps: u32, seed: u32) -> GenerationRequest {
    GenerationRequest {
        resolution,
        steps,
        seed,
        prompt: "a red lighthouse at dusk".to_string(),
        negative_prompt: String::new(),
    }
}

fn engine(device: &Arc<HeadlessDevice>) -> GenerationEngine<HeadlessDevice> {
    GenerationEngine::new(Some(Arc::clone(device)))
}

fn dispatched_steps(events: &[DeviceEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::Dispatched { step, .. } => *step,
            _ => None,
        })
        .collect()
}

fn copies(events: &[DeviceEvent]) -> usize {
    events.iter().filter(|e| matches!(e, DeviceEvent::Copied { .. })).count()
}

/// Requests a user cancel once progress reaches `at`.
struct CancelAtProgress {
    ctx: Arc<CancellationContext>,
    at: u8,
    inner: ProgressRecorder,
}

impl ProgressSink for CancelAtProgress {
    fn update(&self, percent: u8) {
        self.inner.update(percent);
        if percent >= self.at {
            self.ctx.trigger(CancelTrigger::UserAction);
        }
    }

    fn reset(&self) {
        self.inner.reset();
    }
}

// ===== Success path =====

#[tokio::test]
async fn medium_512_runs_eight_sequential_dispatches_with_one_final_copy() {
    let device = Arc::new(HeadlessDevice::new());
    let ctx = CancellationContext::new();
    let image = engine(&device).generate(&request(512, 8, 7), Tier::Medium, &ctx).await.unwrap();

    assert_eq!((image.width(), image.height()), (512, 512));
    assert_eq!(image.as_bytes().len(), 512 * 512 * 4);

    let events = device.events();
    assert_eq!(dispatched_steps(&events), (1..=8).collect::<Vec<_>>());
    assert_eq!(copies(&events), 1);

    // The copy is recorded with the eighth dispatch and nothing is dispatched after it.
    let copy_at = events.iter().position(|e| matches!(e, DeviceEvent::Copied { .. })).unwrap();
    let last_dispatch = events
        .iter()
        .rposition(|e| matches!(e, DeviceEvent::Dispatched { .. }))
        .unwrap();
    assert!(matches!(events[last_dispatch], DeviceEvent::Dispatched { step: Some(8), .. }));
    assert!(copy_at > last_dispatch);

    assert!(device.live_buffers().is_empty());
}

#[tokio::test]
async fn image_matches_cpu_reference_of_final_step() {
    let device = Arc::new(HeadlessDevice::new());
    let ctx = CancellationContext::new();
    let image = engine(&device).generate(&request(256, 4, 42), Tier::UltraLow, &ctx).await.unwrap();

    let mut expected = vec![0u8; 256 * 256 * 4];
    render_step(&GenerateParams { width: 256, height: 256, seed: 42, step: 4 }, &mut expected);
    assert_eq!(image.as_bytes(), &expected[..]);

    let p = pixel(42, 0, 4).to_le_bytes();
    assert_eq!(image.pixel(0, 0), Some(p));
    assert_eq!(p[3], 255);
}

#[tokio::test]
async fn same_seed_gives_identical_bytes() {
    let ctx = CancellationContext::new();
    let req = request(256, 4, 42);

    let first = engine(&Arc::new(HeadlessDevice::new()))
        .generate(&req, Tier::UltraLow, &ctx)
        .await
        .unwrap();
    let second = engine(&Arc::new(HeadlessDevice::new()))
        .generate(&req, Tier::UltraLow, &ctx)
        .await
        .unwrap();
    assert_eq!(first, second);

    let other = engine(&Arc::new(HeadlessDevice::new()))
        .generate(&request(256, 4, 43), Tier::UltraLow, &ctx)
        .await
        .unwrap();
    assert_ne!(first, other);
}

#[tokio::test]
async fn progress_opens_at_five_rises_to_hundred_then_resets() {
    let device = Arc::new(HeadlessDevice::new());
    let progress = Arc::new(ProgressRecorder::new());
    let engine = engine(&device).with_progress(progress.clone());
    let ctx = CancellationContext::new();

    engine.generate(&request(512, 8, 1), Tier::Medium, &ctx).await.unwrap();

    let events = progress.events();
    assert_eq!(events.first(), Some(&ProgressEvent::Update(5)));
    assert_eq!(events.last(), Some(&ProgressEvent::Reset));

    let values: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Update(v) => Some(*v),
            ProgressEvent::Reset => None,
        })
        .collect();
    assert!(values.windows(2).all(|w| w[0] < w[1]), "not increasing: {values:?}");
    assert_eq!(values.last(), Some(&100));
    assert_eq!(values[1], step_progress(1, 8));
    assert_eq!(progress.current(), 0);
}

// ===== Cancellation =====

#[tokio::test]
async fn cancel_after_step_three_stops_before_step_four() {
    let device = Arc::new(HeadlessDevice::new());
    let ctx = Arc::new(CancellationContext::new());
    let sink = Arc::new(CancelAtProgress {
        ctx: Arc::clone(&ctx),
        at: step_progress(3, 8),
        inner: ProgressRecorder::new(),
    });
    let engine = engine(&device).with_progress(sink.clone());

    let err = engine.generate(&request(512, 8, 7), Tier::Medium, &ctx).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled { cause: CancelCause::User, completed_steps: 3 }));

    let events = device.events();
    assert_eq!(dispatched_steps(&events), vec![1, 2, 3]);
    assert_eq!(copies(&events), 0);
    assert!(!events.iter().any(|e| matches!(e, DeviceEvent::BufferRead { .. })));
    assert!(device.live_buffers().is_empty());

    // Progress never reached 100 and ended with a reset.
    let updates = sink.inner.events();
    assert!(!updates.contains(&ProgressEvent::Update(100)));
    assert_eq!(updates.last(), Some(&ProgressEvent::Reset));
}

#[tokio::test]
async fn cancel_during_a_dispatch_discards_that_step() {
    let ctx = Arc::new(CancellationContext::new());
    let hook_ctx = Arc::clone(&ctx);
    let device = Arc::new(HeadlessDevice::new().on_dispatch_complete(move |ordinal| {
        if ordinal == 3 {
            hook_ctx.trigger(CancelTrigger::VisibilityLost);
        }
    }));

    let err = engine(&device).generate(&request(512, 8, 7), Tier::Medium, &ctx).await.unwrap_err();
    // Dispatch 3 was in flight when the cancel landed: it finishes but does not count.
    assert!(matches!(err, EngineError::Cancelled { cause: CancelCause::User, completed_steps: 2 }));
    assert_eq!(device.dispatch_count(), 3);
    assert!(device.live_buffers().is_empty());
}

#[tokio::test]
async fn cancel_before_first_completion_reports_zero_steps() {
    let ctx = Arc::new(CancellationContext::new());
    let hook_ctx = Arc::clone(&ctx);
    let device = Arc::new(HeadlessDevice::new().on_dispatch_complete(move |_| {
        hook_ctx.trigger(CancelTrigger::Timer);
    }));

    let err = engine(&device).generate(&request(256, 4, 1), Tier::UltraLow, &ctx).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled { cause: CancelCause::Timeout, completed_steps: 0 }));
    assert_eq!(device.dispatch_count(), 1);
    assert!(device.live_buffers().is_empty());
}

#[tokio::test]
async fn already_cancelled_context_dispatches_nothing() {
    let device = Arc::new(HeadlessDevice::new());
    let ctx = CancellationContext::new();
    ctx.trigger(CancelTrigger::UserAction);

    let err = engine(&device).generate(&request(256, 1, 1), Tier::UltraLow, &ctx).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled { completed_steps: 0, .. }));
    assert_eq!(device.dispatch_count(), 0);
    assert!(device.live_buffers().is_empty());
}

#[tokio::test]
async fn first_cancel_cause_wins() {
    let ctx = Arc::new(CancellationContext::new());
    let hook_ctx = Arc::clone(&ctx);
    let device = Arc::new(HeadlessDevice::new().on_dispatch_complete(move |_| {
        hook_ctx.trigger(CancelTrigger::Timer);
        hook_ctx.trigger(CancelTrigger::UserAction);
    }));

    let err = engine(&device).generate(&request(256, 2, 1), Tier::UltraLow, &ctx).await.unwrap_err();
    assert_eq!(err.cancel_cause(), Some(CancelCause::Timeout));
}

// ===== Failures =====

#[tokio::test]
async fn device_failure_mid_session_releases_everything() {
    let device = Arc::new(HeadlessDevice::new().fail_on_dispatch(2));
    let progress = Arc::new(ProgressRecorder::new());
    let engine = engine(&device).with_progress(progress.clone());
    let ctx = CancellationContext::new();

    let err = engine.generate(&request(384, 4, 1), Tier::Low, &ctx).await.unwrap_err();
    assert!(matches!(err, EngineError::Failed(GpuError::Dispatch(_))));
    assert!(device.live_buffers().is_empty());
    assert_eq!(progress.events().last(), Some(&ProgressEvent::Reset));
}

#[tokio::test]
async fn oversized_storage_fails_before_any_allocation() {
    // Storage is allocated first; 256×256×4 exceeds the 1 KiB limit.
    let device = Arc::new(HeadlessDevice::new().with_max_buffer_size(1024));
    let ctx = CancellationContext::new();

    let err = engine(&device).generate(&request(256, 1, 1), Tier::UltraLow, &ctx).await.unwrap_err();
    assert!(matches!(err, EngineError::Failed(GpuError::BufferTooLarge { .. })));
    assert!(device.events().is_empty());
    assert_eq!(device.dispatch_count(), 0);
}

fn created_and_destroyed(events: &[DeviceEvent]) -> (Vec<u64>, Vec<u64>) {
    let created = events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::BufferCreated { id, .. } => Some(*id),
            _ => None,
        })
        .collect();
    let mut destroyed: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::BufferDestroyed { id } => Some(*id),
            _ => None,
        })
        .collect();
    destroyed.sort_unstable();
    (created, destroyed)
}

#[tokio::test]
async fn allocation_failure_releases_earlier_buffers_once() {
    // Allocation order is storage, params, staging.
    for (nth, allocated) in [(2u64, 1usize), (3, 2)] {
        let device = Arc::new(HeadlessDevice::new().fail_on_allocation(nth));
        let progress = Arc::new(ProgressRecorder::new());
        let ctx = CancellationContext::new();

        let err = engine(&device)
            .with_progress(progress.clone())
            .generate(&request(256, 2, 1), Tier::UltraLow, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Failed(GpuError::OutOfMemory { .. })), "{err}");

        let (created, destroyed) = created_and_destroyed(&device.events());
        assert_eq!(created.len(), allocated, "allocation {nth}");
        assert_eq!(destroyed, created, "allocation {nth}");
        assert!(device.live_buffers().is_empty());
        assert_eq!(device.dispatch_count(), 0);
        assert_eq!(progress.events().last(), Some(&ProgressEvent::Reset));
    }
}

#[tokio::test]
async fn pipeline_failure_releases_all_three_buffers_once() {
    let device = Arc::new(HeadlessDevice::new().fail_pipeline_creation());
    let ctx = CancellationContext::new();

    let err = engine(&device).generate(&request(256, 2, 1), Tier::UltraLow, &ctx).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Failed(GpuError::Validation { op: "create_compute_pipeline", .. })
    ));

    let (created, destroyed) = created_and_destroyed(&device.events());
    assert_eq!(created.len(), 3);
    assert_eq!(destroyed, created);
    assert!(device.live_buffers().is_empty());
    assert_eq!(device.dispatch_count(), 0);
}

#[tokio::test]
async fn missing_device_is_unavailable() {
    let engine: GenerationEngine<HeadlessDevice> = GenerationEngine::new(None);
    let ctx = CancellationContext::new();
    let err = engine.generate(&request(256, 1, 1), Tier::UltraLow, &ctx).await.unwrap_err();
    assert!(matches!(err, EngineError::DeviceUnavailable));
}

#[tokio::test]
async fn request_outside_tier_is_rejected_before_allocation() {
    let device = Arc::new(HeadlessDevice::new());
    let ctx = CancellationContext::new();
    let err = engine(&device).generate(&request(768, 8, 1), Tier::Medium, &ctx).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidRequest(RequestError::ResolutionNotAllowed { resolution: 768, .. })
    ));
    assert!(device.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_concurrent_session_is_refused() {
    let device = Arc::new(HeadlessDevice::new().with_dispatch_latency(Duration::from_millis(10)));
    let engine = engine(&device);
    let ctx = CancellationContext::new();
    let req = request(256, 2, 1);

    let (first, second) = tokio::join!(
        engine.generate(&req, Tier::UltraLow, &ctx),
        engine.generate(&req, Tier::UltraLow, &ctx),
    );
    assert!(first.is_ok());
    assert!(matches!(second, Err(EngineError::SessionActive)));

    // The slot is free again once the first session ends.
    assert!(engine.generate(&req, Tier::UltraLow, &ctx).await.is_ok());
    assert!(device.live_buffers().is_empty());
}
