// gpu/kernel.rs: compute kernels and their CPU reference implementations.
//
// Two kernels exist:
//   Generate: one dispatch per step, recomputes every pixel of the image.
//   Benchmark: fixed 64×64 workload timed by the capability prober.
//
// The CPU functions below are the authoritative definition of what each
// kernel writes. The WGSL in src/shaders/ must agree with them bit-for-bit;
// the headless device executes these functions in place of the shader, and
// the ignored wgpu tests compare GPU readback against them.
//
//
// PIXEL FUNCTION
// ──────────────
//   x     = seed ^ index ^ step
//   x     = 1664525 * x + 1013904223          (wrapping, 32-bit LCG)
//   pixel = 0xFF << 24 | b << 16 | g << 8 | r (r, g, b = low three bytes of x)
//
// The u32 is stored little-endian, so the bytes in memory read [r, g, b, 255]
// and the storage buffer can be handed out as RGBA8 without swizzling.
//
// Each step is a pure function of its inputs. The result of step k is
// overwritten entirely by step k+1; only the final step survives.

/// Both shaders declare `@workgroup_size(WORKGROUP_X, WORKGROUP_Y, 1)`.
pub const DEFAULT_WORKGROUP: (u32, u32) = (8, 8);

/// Edge length of the benchmark workload in pixels.
pub const BENCHMARK_SIZE: u32 = 64;

/// Size in bytes of the generate kernel's uniform block.
pub const PARAMS_SIZE: u64 = std::mem::size_of::<GenerateParams>() as u64;

/// Which binding type sits at each `@binding(n)` slot of group 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// `var<storage, read_write>`
    Storage,
    /// `var<uniform>`
    Uniform,
}

/// A compute kernel known to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    Generate,
    Benchmark,
}

impl Kernel {
    pub fn label(&self) -> &'static str {
        match self {
            Kernel::Generate => "generate.wgsl",
            Kernel::Benchmark => "benchmark.wgsl",
        }
    }

    /// WGSL source, embedded at compile time.
    pub fn wgsl(&self) -> &'static str {
        match self {
            Kernel::Generate => include_str!("../shaders/generate.wgsl"),
            Kernel::Benchmark => include_str!("../shaders/benchmark.wgsl"),
        }
    }

    pub fn entry_point(&self) -> &'static str {
        match self {
            Kernel::Generate => "generate",
            Kernel::Benchmark => "benchmark",
        }
    }

    /// Binding layout of group 0, indexed by binding number.
    pub fn bindings(&self) -> &'static [BindingKind] {
        match self {
            Kernel::Generate => &[BindingKind::Storage, BindingKind::Uniform],
            Kernel::Benchmark => &[BindingKind::Storage],
        }
    }
}

// ---------------------------------------------------------------------------
// Uniform params (must match WGSL struct Params exactly)
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GenerateParams {
    pub width: u32,
    pub height: u32,
    pub seed: u32,
    pub step: u32,
}

impl GenerateParams {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Decode a params block written by [`GenerateParams::as_bytes`].
    /// Returns `None` if `bytes` is shorter than the struct.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw = bytes.get(..PARAMS_SIZE as usize)?;
        Some(bytemuck::pod_read_unaligned(raw))
    }
}

// ---------------------------------------------------------------------------
// CPU reference
// ---------------------------------------------------------------------------

#[inline]
pub fn lcg(x: u32) -> u32 {
    x.wrapping_mul(1664525).wrapping_add(1013904223)
}

/// Packed RGBA8 value of pixel `index` at `step`.
#[inline]
pub fn pixel(seed: u32, index: u32, step: u32) -> u32 {
    let x = lcg(seed ^ index ^ step);
    let r = x & 0xFF;
    let g = (x >> 8) & 0xFF;
    let b = (x >> 16) & 0xFF;
    (0xFF << 24) | (b << 16) | (g << 8) | r
}

/// Fill `out` exactly as one generate dispatch would.
///
/// `out` must hold at least `width * height * 4` bytes; extra bytes are
/// left untouched, matching the shader's bounds guard.
pub fn render_step(params: &GenerateParams, out: &mut [u8]) {
    let n = (params.width * params.height) as usize;
    for (idx, px) in out.chunks_exact_mut(4).take(n).enumerate() {
        px.copy_from_slice(&pixel(params.seed, idx as u32, params.step).to_le_bytes());
    }
}

/// Fill `out` exactly as the benchmark dispatch would.
pub fn render_benchmark(out: &mut [u8]) {
    let n = (BENCHMARK_SIZE * BENCHMARK_SIZE) as usize;
    for (idx, word) in out.chunks_exact_mut(4).take(n).enumerate() {
        word.copy_from_slice(&lcg(idx as u32).to_le_bytes());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
