// probe.rs: host capability probing and tier classification.
//
// A probe runs one fixed 64×64 benchmark dispatch, times it from submit to
// completion, reads the device's reported maximum buffer size, and hands
// both to a `ClassificationStrategy`.
//
// DEFAULT CLASSIFICATION (evaluated in this order)
// ────────────────────────────────────────────────
//   adapter name contains a low-power marker   → UltraLow
//   max buffer < 64 MiB                        → UltraLow
//   max buffer < 128 MiB                       → Low
//   max buffer < 256 MiB                       → Medium
//   benchmark > 35 ms                          → Low
//   benchmark > 20 ms                          → Medium
//   otherwise                                  → High
//
// The marker rule is a heuristic carried over as-is: one known mobile class
// always lands in the lowest tier regardless of what it measures. It lives
// in `ThresholdClassifier` only; swap the strategy to drop it.
//
// Timing uses `tokio::time::Instant`, so tests running on a paused clock see
// the headless device's simulated latency.

use std::time::Duration;

use log::{info, warn};
use tokio::time::Instant;

use crate::config::ProbeConfig;
use crate::gpu::device::{BufferCopy, ComputeDevice, Dispatch, GpuError};
use crate::gpu::kernel::{Kernel, BENCHMARK_SIZE};
use crate::profile::Tier;

const MIB: u64 = 1024 * 1024;

/// What the prober measured.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSample {
    pub adapter_name: String,
    pub max_buffer_size: u64,
    /// Submit-to-completion time of the benchmark dispatch.
    pub elapsed: Duration,
}

/// Maps a probe sample to a tier.
pub trait ClassificationStrategy: Send + Sync {
    fn classify(&self, sample: &ProbeSample) -> Tier;
}

/// Buffer-size and timing thresholds plus the low-power name heuristic.
#[derive(Debug, Clone)]
pub struct ThresholdClassifier {
    config: ProbeConfig,
}

impl Default for ThresholdClassifier {
    fn default() -> Self {
        Self::new(ProbeConfig::default())
    }
}

impl ThresholdClassifier {
    pub fn new(config: ProbeConfig) -> Self {
        ThresholdClassifier { config }
    }

    fn is_low_power(&self, adapter_name: &str) -> bool {
        self.config
            .low_power_markers
            .iter()
            .any(|marker| !marker.is_empty() && adapter_name.contains(marker.as_str()))
    }
}

/// Configured MiB thresholds in bytes. Values past `u64::MAX` bytes mean
/// "every device is below".
fn mib(n: u64) -> u64 {
    n.saturating_mul(MIB)
}

impl ClassificationStrategy for ThresholdClassifier {
    fn classify(&self, sample: &ProbeSample) -> Tier {
        let c = &self.config;
        if self.is_low_power(&sample.adapter_name) {
            return Tier::UltraLow;
        }
        if sample.max_buffer_size < mib(c.ultra_low_below_mib) {
            return Tier::UltraLow;
        }
        if sample.max_buffer_size < mib(c.low_below_mib) {
            return Tier::Low;
        }
        if sample.max_buffer_size < mib(c.medium_below_mib) {
            return Tier::Medium;
        }
        let ms = sample.elapsed.as_secs_f64() * 1000.0;
        if ms > c.low_above_ms {
            Tier::Low
        } else if ms > c.medium_above_ms {
            Tier::Medium
        } else {
            Tier::High
        }
    }
}

/// Outcome of a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub tier: Tier,
    /// `None` when there was no device or the benchmark failed.
    pub sample: Option<ProbeSample>,
}

impl ProbeReport {
    pub fn tier(&self) -> Tier {
        self.tier
    }
}

/// Classifies the host into a [`Tier`].
pub struct CapabilityProber {
    strategy: Box<dyn ClassificationStrategy>,
}

impl Default for CapabilityProber {
    fn default() -> Self {
        Self::new(ThresholdClassifier::default())
    }
}

impl CapabilityProber {
    pub fn new(strategy: impl ClassificationStrategy + 'static) -> Self {
        CapabilityProber { strategy: Box::new(strategy) }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(ThresholdClassifier::new(config.clone()))
    }

    /// Probe `device`, or report UltraLow straight away if there is none.
    ///
    /// Runs the benchmark exactly once; a benchmark failure is logged and
    /// classified as UltraLow.
    pub async fn probe<D: ComputeDevice>(&self, device: Option<&D>) -> ProbeReport {
        let Some(device) = device else {
            info!("no compute device, assuming {}", Tier::UltraLow);
            return ProbeReport { tier: Tier::UltraLow, sample: None };
        };

        let elapsed = match run_benchmark(device).await {
            Ok(elapsed) => elapsed,
            Err(e) => {
                warn!("benchmark dispatch failed on {}: {e}", device.info());
                return ProbeReport { tier: Tier::UltraLow, sample: None };
            }
        };

        let sample = ProbeSample {
            adapter_name: device.info().name.clone(),
            max_buffer_size: device.max_buffer_size(),
            elapsed,
        };
        let tier = self.strategy.classify(&sample);
        info!(
            "probe: {} max_buffer={} MiB benchmark={:.2} ms → {tier}",
            sample.adapter_name,
            sample.max_buffer_size / MIB,
            elapsed.as_secs_f64() * 1000.0
        );
        ProbeReport { tier, sample: Some(sample) }
    }
}

/// Time one 64×64 benchmark dispatch. Both buffers are released on every path.
async fn run_benchmark<D: ComputeDevice>(device: &D) -> Result<Duration, GpuError> {
    let size = (BENCHMARK_SIZE * BENCHMARK_SIZE * 4) as u64;
    let storage = device.create_buffer(
        "benchmark storage",
        size,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
    )?;
    let readback = match device.create_buffer(
        "benchmark readback",
        size,
        wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
    ) {
        Ok(buffer) => buffer,
        Err(e) => {
            device.destroy_buffer(storage);
            return Err(e);
        }
    };

    let result = timed_dispatch(device, &storage, &readback, size).await;
    device.destroy_buffer(readback);
    device.destroy_buffer(storage);
    result
}

async fn timed_dispatch<D: ComputeDevice>(
    device: &D,
    storage: &D::Buffer,
    readback: &D::Buffer,
    size: u64,
) -> Result<Duration, GpuError> {
    let pipeline = device.create_compute_pipeline(Kernel::Benchmark)?;
    let workgroups = device.workgroup_size().dispatch_size(BENCHMARK_SIZE, BENCHMARK_SIZE);

    let start = Instant::now();
    device.submit(Dispatch {
        pipeline: &pipeline,
        bindings: &[storage],
        workgroups,
        copy: Some(BufferCopy { src: storage, dst: readback, size }),
    })?;
    device.await_completion().await?;
    Ok(start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str, max_mib: u64, ms: u64) -> ProbeSample {
        ProbeSample {
            adapter_name: name.to_string(),
            max_buffer_size: max_mib * MIB,
            elapsed: Duration::from_millis(ms),
        }
    }

    #[test]
    fn buffer_thresholds_take_precedence_over_timing() {
        let c = ThresholdClassifier::default();
        assert_eq!(c.classify(&sample("gpu", 32, 1)), Tier::UltraLow);
        assert_eq!(c.classify(&sample("gpu", 64, 1)), Tier::Low);
        assert_eq!(c.classify(&sample("gpu", 127, 1)), Tier::Low);
        assert_eq!(c.classify(&sample("gpu", 128, 1)), Tier::Medium);
        assert_eq!(c.classify(&sample("gpu", 255, 100)), Tier::Medium);
    }

    #[test]
    fn timing_thresholds_apply_to_large_buffers() {
        let c = ThresholdClassifier::default();
        assert_eq!(c.classify(&sample("gpu", 256, 36)), Tier::Low);
        assert_eq!(c.classify(&sample("gpu", 256, 35)), Tier::Medium);
        assert_eq!(c.classify(&sample("gpu", 1024, 21)), Tier::Medium);
        assert_eq!(c.classify(&sample("gpu", 1024, 20)), Tier::High);
    }

    #[test]
    fn low_power_marker_wins_over_everything() {
        let c = ThresholdClassifier::default();
        assert_eq!(c.classify(&sample("Apple iPhone GPU", 4096, 1)), Tier::UltraLow);
    }

    #[test]
    fn empty_marker_never_matches() {
        let config = ProbeConfig { low_power_markers: vec![String::new()], ..Default::default() };
        let c = ThresholdClassifier::new(config);
        assert_eq!(c.classify(&sample("gpu", 4096, 1)), Tier::High);
    }

    #[test]
    fn huge_buffer_thresholds_saturate() {
        let config = ProbeConfig {
            ultra_low_below_mib: u64::MAX,
            low_below_mib: u64::MAX,
            medium_below_mib: u64::MAX,
            ..Default::default()
        };
        let c = ThresholdClassifier::new(config);
        assert_eq!(c.classify(&sample("gpu", 1 << 20, 1)), Tier::UltraLow);
    }

    #[test]
    fn classification_is_deterministic() {
        let c = ThresholdClassifier::default();
        let s = sample("gpu", 512, 25);
        let first = c.classify(&s);
        assert!((0..10).all(|_| c.classify(&s) == first));
    }
}
