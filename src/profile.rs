// profile.rs: capability tiers and their parameter limits.
//
// The catalog is static data: one `ProfileLimits` per `Tier`, fixed for the
// life of the process. Everything downstream (request validation, presets,
// degradation, timeout supervision) reads from here.
//
//   Tier      resolutions          steps                  prompt  negative  timeout
//   UltraLow  256 320              1 2 3 4                300     150       60 s
//   Low       256 384              2 3 4 5 6              400     200       90 s
//   Medium    256 384 512          4 6 8 10 12            600     300       120 s
//   High      256 384 512 768      6 8 10 12 15 20        800     400       120 s

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Capability classification of the host device, ordered weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
pub enum Tier {
    UltraLow,
    Low,
    Medium,
    High,
}

impl Tier {
    /// All tiers in ascending order.
    pub const ALL: [Tier; 4] = [Tier::UltraLow, Tier::Low, Tier::Medium, Tier::High];

    pub fn limits(self) -> &'static ProfileLimits {
        match self {
            Tier::UltraLow => &ULTRA_LOW,
            Tier::Low => &LOW,
            Tier::Medium => &MEDIUM,
            Tier::High => &HIGH,
        }
    }

    /// Tiers a user may pick on a device classified as `self`: every tier
    /// up to and including the detected one.
    pub fn selectable(self) -> &'static [Tier] {
        let all: &'static [Tier; 4] = &Tier::ALL;
        // Discriminants follow declaration order, which is `ALL`'s order.
        &all[..=self as usize]
    }

    /// Apply a requested tier, never exceeding the detected one.
    pub fn with_override(self, requested: Option<Tier>) -> Tier {
        requested.map_or(self, |r| r.min(self))
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::UltraLow => "UltraLow",
            Tier::Low => "Low",
            Tier::Medium => "Medium",
            Tier::High => "High",
        };
        f.pad(name)
    }
}

/// Error returned when parsing an unknown tier name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier '{0}' (expected UltraLow, Low, Medium or High)")]
pub struct ParseTierError(String);

impl FromStr for Tier {
    type Err = ParseTierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ultralow" | "ultra-low" => Ok(Tier::UltraLow),
            "low" => Ok(Tier::Low),
            "medium" => Ok(Tier::Medium),
            "high" => Ok(Tier::High),
            _ => Err(ParseTierError(s.to_string())),
        }
    }
}

/// Allowed parameter ranges for one tier.
///
/// Both sets are non-empty and strictly ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileLimits {
    pub resolutions: &'static [u32],
    pub steps: &'static [u32],
    /// Prompt cap, in characters.
    pub prompt_limit: usize,
    /// Negative-prompt cap, in characters.
    pub negative_limit: usize,
    pub timeout: Duration,
}

static ULTRA_LOW: ProfileLimits = ProfileLimits {
    resolutions: &[256, 320],
    steps: &[1, 2, 3, 4],
    prompt_limit: 300,
    negative_limit: 150,
    timeout: Duration::from_secs(60),
};

static LOW: ProfileLimits = ProfileLimits {
    resolutions: &[256, 384],
    steps: &[2, 3, 4, 5, 6],
    prompt_limit: 400,
    negative_limit: 200,
    timeout: Duration::from_secs(90),
};

static MEDIUM: ProfileLimits = ProfileLimits {
    resolutions: &[256, 384, 512],
    steps: &[4, 6, 8, 10, 12],
    prompt_limit: 600,
    negative_limit: 300,
    timeout: Duration::from_secs(120),
};

static HIGH: ProfileLimits = ProfileLimits {
    resolutions: &[256, 384, 512, 768],
    steps: &[6, 8, 10, 12, 15, 20],
    prompt_limit: 800,
    negative_limit: 400,
    timeout: Duration::from_secs(120),
};

/// Quick parameter picks within a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// Smallest resolution and fewest steps.
    Fast,
    /// Middle of each set (upper middle for even lengths).
    Balanced,
    /// Largest resolution and most steps.
    Best,
}

impl ProfileLimits {
    pub fn allows_resolution(&self, resolution: u32) -> bool {
        self.resolutions.contains(&resolution)
    }

    pub fn allows_steps(&self, steps: u32) -> bool {
        self.steps.contains(&steps)
    }

    /// `(resolution, steps)` for a preset.
    pub fn preset(&self, preset: Preset) -> (u32, u32) {
        fn pick(set: &[u32], preset: Preset) -> u32 {
            let idx = match preset {
                Preset::Fast => 0,
                Preset::Balanced => set.len() / 2,
                Preset::Best => set.len() - 1,
            };
            set[idx]
        }
        (pick(self.resolutions, preset), pick(self.steps, preset))
    }

    /// Truncate a prompt to the tier's character cap.
    pub fn clamp_prompt(&self, text: &str) -> String {
        clamp_chars(text, self.prompt_limit)
    }

    /// Truncate a negative prompt to the tier's character cap.
    pub fn clamp_negative(&self, text: &str) -> String {
        clamp_chars(text, self.negative_limit)
    }
}

/// Keep at most `cap` characters (not bytes) of `text`.
pub fn clamp_chars(text: &str, cap: usize) -> String {
    match text.char_indices().nth(cap) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sets_are_non_empty_and_strictly_ascending() {
        for tier in Tier::ALL {
            let l = tier.limits();
            assert!(!l.resolutions.is_empty(), "{tier}: no resolutions");
            assert!(!l.steps.is_empty(), "{tier}: no steps");
            assert!(l.resolutions.windows(2).all(|w| w[0] < w[1]), "{tier}: resolutions");
            assert!(l.steps.windows(2).all(|w| w[0] < w[1]), "{tier}: steps");
        }
    }

    #[test]
    fn tiers_are_ordered() {
        assert!(Tier::UltraLow < Tier::Low);
        assert!(Tier::Low < Tier::Medium);
        assert!(Tier::Medium < Tier::High);
    }

    #[test]
    fn timeouts_match_catalog() {
        assert_eq!(Tier::UltraLow.limits().timeout, Duration::from_secs(60));
        assert_eq!(Tier::Low.limits().timeout, Duration::from_secs(90));
        assert_eq!(Tier::High.limits().timeout, Duration::from_secs(120));
    }

    #[test]
    fn presets_pick_ends_and_middle() {
        let m = Tier::Medium.limits();
        assert_eq!(m.preset(Preset::Fast), (256, 4));
        assert_eq!(m.preset(Preset::Balanced), (384, 8));
        assert_eq!(m.preset(Preset::Best), (512, 12));

        let h = Tier::High.limits();
        assert_eq!(h.preset(Preset::Balanced), (512, 12));
    }

    #[test]
    fn selectable_tiers_stop_at_detected() {
        assert_eq!(Tier::UltraLow.selectable(), &[Tier::UltraLow]);
        assert_eq!(Tier::Medium.selectable(), &[Tier::UltraLow, Tier::Low, Tier::Medium]);
        assert_eq!(Tier::High.selectable(), &Tier::ALL);
        for (i, tier) in Tier::ALL.into_iter().enumerate() {
            assert_eq!(tier.selectable().len(), i + 1);
            assert_eq!(tier.selectable().last(), Some(&tier));
        }
    }

    #[test]
    fn override_never_exceeds_detected() {
        assert_eq!(Tier::Low.with_override(Some(Tier::High)), Tier::Low);
        assert_eq!(Tier::High.with_override(Some(Tier::Low)), Tier::Low);
        assert_eq!(Tier::Medium.with_override(None), Tier::Medium);
    }

    #[test]
    fn clamp_counts_characters_not_bytes() {
        assert_eq!(clamp_chars("héllo wörld", 5), "héllo");
        assert_eq!(clamp_chars("short", 300), "short");
        let long = "a".repeat(500);
        assert_eq!(Tier::UltraLow.limits().clamp_prompt(&long).len(), 300);
        assert_eq!(Tier::UltraLow.limits().clamp_negative(&long).len(), 150);
    }

    #[test]
    fn tier_names_parse() {
        assert_eq!("medium".parse::<Tier>(), Ok(Tier::Medium));
        assert_eq!("UltraLow".parse::<Tier>(), Ok(Tier::UltraLow));
        assert!("extreme".parse::<Tier>().is_err());
        assert_eq!(Tier::High.to_string(), "High");
    }
}
