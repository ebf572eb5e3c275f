//! Quality tiers and adaptive quality tracking
//!
//! Five tiers select the FIR tap count per phase mode and the convolver
//! head partition. The adaptive tracker watches per-block wall-clock
//! cost and nudges an advisory offset that the rebuild scheduler folds
//! into the tier; it never switches modes on its own.

use peq_dsp::params::PhaseMode;

/// Number of quality tiers
pub const QUALITY_TIERS: usize = 5;

/// Tier used until the host picks one
pub const DEFAULT_TIER: usize = 2;

/// FIR tap counts for natural mode, per tier
pub const NATURAL_TAPS: [usize; QUALITY_TIERS] = [128, 256, 512, 1024, 2048];

/// FIR tap counts for linear mode, per tier
pub const LINEAR_TAPS: [usize; QUALITY_TIERS] = [512, 1024, 2048, 4096, 8192];

/// Convolver head partition sizes, per tier
pub const HEAD_SIZES: [usize; QUALITY_TIERS] = [64, 128, 256, 512, 1024];

/// FIR tap count for a phase mode and tier
pub fn taps_for(mode: PhaseMode, tier: usize) -> usize {
    let tier = tier.min(QUALITY_TIERS - 1);
    match mode {
        PhaseMode::Linear => LINEAR_TAPS[tier],
        _ => NATURAL_TAPS[tier],
    }
}

/// Convolver head size for a tier
pub fn head_size_for(tier: usize) -> usize {
    HEAD_SIZES[tier.min(QUALITY_TIERS - 1)]
}

/// Linear-phase latency in samples for a tap count
#[inline]
pub fn latency_for_taps(taps: usize) -> usize {
    taps.saturating_sub(1) / 2
}

/// Consecutive hot blocks before stepping quality down
const OVERLOAD_BLOCKS: u32 = 3;

/// Consecutive cool blocks before stepping quality back up
const RECOVER_BLOCKS: u32 = 8;

/// Lowest allowed quality offset
const MIN_OFFSET: i32 = -2;

/// Tracks per-block processing cost against the real-time budget
#[derive(Debug, Default)]
pub struct AdaptiveQuality {
    offset: i32,
    over_count: u32,
    under_count: u32,
}

impl AdaptiveQuality {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one block's cost. Returns true when the offset changed.
    pub fn observe(&mut self, elapsed_secs: f64, block_secs: f64) -> bool {
        let load = elapsed_secs / block_secs.max(1e-9);

        if load > 0.9 {
            self.over_count += 1;
            self.under_count = 0;
            if self.over_count >= OVERLOAD_BLOCKS && self.offset > MIN_OFFSET {
                self.offset -= 1;
                self.over_count = 0;
                return true;
            }
        } else if load < 0.6 {
            self.under_count += 1;
            self.over_count = 0;
            if self.under_count >= RECOVER_BLOCKS && self.offset < 0 {
                self.offset += 1;
                self.under_count = 0;
                return true;
            }
        } else {
            self.over_count = 0;
            self.under_count = 0;
        }
        false
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    /// Fold the offset into a requested tier
    pub fn effective_tier(&self, tier: usize) -> usize {
        (tier as i32 + self.offset).clamp(0, QUALITY_TIERS as i32 - 1) as usize
    }

    pub fn reset(&mut self) {
        self.offset = 0;
        self.over_count = 0;
        self.under_count = 0;
    }
}
