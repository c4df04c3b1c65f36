// gpu/mod.rs: compute device layer.
//
// `device` defines the `ComputeDevice` seam and its wgpu implementation.
// `headless` is a CPU-emulated device with the same interface. `kernel`
// holds the WGSL sources together with their CPU reference functions; the
// reference is authoritative, and the wgpu path is validated against it
// pixel-for-pixel.
//
// Everything above this module (probe, engine) is generic over
// `ComputeDevice` and never touches wgpu types beyond buffer usage flags.

pub mod device;
pub mod headless;
pub mod kernel;
