// degrade.rs: parameter reduction after a failed attempt.

use crate::profile::Tier;

/// Reduced parameters for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Degradation {
    pub resolution: u32,
    pub steps: u32,
    /// The retry should drop the negative prompt.
    pub clear_negative_prompt: bool,
}

/// Step `resolution` and `steps` each one notch down within `tier`'s sets.
///
/// Each value moves to the largest member strictly below it. A value that
/// is already at (or under) the floor of its set is returned unchanged.
/// The two parameters are reduced independently.
pub fn degrade(tier: Tier, resolution: u32, steps: u32) -> Degradation {
    let limits = tier.limits();
    Degradation {
        resolution: next_below(limits.resolutions, resolution).unwrap_or(resolution),
        steps: next_below(limits.steps, steps).unwrap_or(steps),
        clear_negative_prompt: true,
    }
}

/// Largest member of the ascending `set` strictly less than `value`.
fn next_below(set: &[u32], value: u32) -> Option<u32> {
    set.iter().rev().copied().find(|v| *v < value)
}
