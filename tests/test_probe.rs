// tests/test_probe.rs: CapabilityProber against the headless device.
//
// Benchmark timing is taken on tokio's clock, so with `start_paused` the
// headless device's simulated latency is exactly the measured time.

use std::time::Duration;

use tierforge::config::ProbeConfig;
use tierforge::gpu::headless::{DeviceEvent, HeadlessDevice};
use tierforge::gpu::kernel::Kernel;
use tierforge::probe::{CapabilityProber, ClassificationStrategy, ProbeSample};
use tierforge::profile::Tier;

const MIB: u64 = 1024 * 1024;

#[tokio::test]
async fn no_device_is_ultra_low_without_probing() {
    let report = CapabilityProber::default().probe::<HeadlessDevice>(None).await;
    assert_eq!(report.tier(), Tier::UltraLow);
    assert!(report.sample.is_none());
}

#[tokio::test(start_paused = true)]
async fn fast_large_device_is_high() {
    let device = HeadlessDevice::new();
    let report = CapabilityProber::default().probe(Some(&device)).await;
    assert_eq!(report.tier(), Tier::High);

    let sample = report.sample.unwrap();
    assert_eq!(sample.adapter_name, "headless");
    assert_eq!(sample.max_buffer_size, 1 << 30);
}

#[tokio::test(start_paused = true)]
async fn benchmark_time_selects_tier() {
    for (ms, tier) in [(10, Tier::High), (28, Tier::Medium), (50, Tier::Low)] {
        let device = HeadlessDevice::new().with_dispatch_latency(Duration::from_millis(ms));
        let report = CapabilityProber::default().probe(Some(&device)).await;
        assert_eq!(report.tier(), tier, "{ms} ms");
        assert!(report.sample.unwrap().elapsed >= Duration::from_millis(ms));
    }
}

#[tokio::test(start_paused = true)]
async fn small_buffer_limit_caps_the_tier() {
    let device = HeadlessDevice::new().with_max_buffer_size(100 * MIB);
    let report = CapabilityProber::default().probe(Some(&device)).await;
    assert_eq!(report.tier(), Tier::Low);
}

#[tokio::test(start_paused = true)]
async fn low_power_adapter_name_forces_ultra_low() {
    let device = HeadlessDevice::new().with_name("Apple iPhone 15 GPU");
    let report = CapabilityProber::default().probe(Some(&device)).await;
    assert_eq!(report.tier(), Tier::UltraLow);
}

#[tokio::test(start_paused = true)]
async fn probe_runs_one_benchmark_and_releases_its_buffers() {
    let device = HeadlessDevice::new();
    CapabilityProber::default().probe(Some(&device)).await;

    assert_eq!(device.dispatch_count(), 1);
    assert!(device.live_buffers().is_empty());
    let events = device.events();
    assert!(events.contains(&DeviceEvent::PipelineCreated { kernel: Kernel::Benchmark }));
    assert!(events.iter().any(|e| matches!(e, DeviceEvent::Copied { size, .. } if *size == 64 * 64 * 4)));
}

#[tokio::test]
async fn failed_benchmark_is_ultra_low_and_cleans_up() {
    let device = HeadlessDevice::new().fail_every_dispatch();
    let report = CapabilityProber::default().probe(Some(&device)).await;
    assert_eq!(report.tier(), Tier::UltraLow);
    assert!(report.sample.is_none());
    assert!(device.live_buffers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn thresholds_come_from_config() {
    let config = ProbeConfig { low_above_ms: 100.0, medium_above_ms: 50.0, ..Default::default() };
    let device = HeadlessDevice::new().with_dispatch_latency(Duration::from_millis(40));
    let report = CapabilityProber::from_config(&config).probe(Some(&device)).await;
    assert_eq!(report.tier(), Tier::High);
}

#[tokio::test(start_paused = true)]
async fn classification_strategy_is_replaceable() {
    struct AlwaysMedium;
    impl ClassificationStrategy for AlwaysMedium {
        fn classify(&self, _: &ProbeSample) -> Tier {
            Tier::Medium
        }
    }

    let device = HeadlessDevice::new().with_name("Apple iPhone");
    let report = CapabilityProber::new(AlwaysMedium).probe(Some(&device)).await;
    assert_eq!(report.tier(), Tier::Medium);
}
