//! Band parameter model and channel routing
//!
//! Everything here is plain value data: the control side fills these in,
//! clamps them once, and the audio side consumes them without further
//! validation.

use serde::{Deserialize, Serialize};

pub use crate::biquad::FilterShape;

/// Maximum EQ bands
pub const MAX_BANDS: usize = 24;

/// Maximum physical channels (7.1 surround)
pub const MAX_CHANNELS: usize = 8;

/// Maximum cascaded biquad stages per band (96 dB/oct)
pub const MAX_STAGES: usize = 8;

/// Frequency ceiling for the parameter range
pub const MAX_FREQUENCY_HZ: f64 = 192_000.0;

/// Dynamic EQ mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DynamicMode {
    /// Gain moves toward the static setting as the detector rises
    #[default]
    Up,
    /// Gain moves away from the static setting as the detector rises
    Down,
}

/// Global Q behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QMode {
    #[default]
    Fixed,
    /// Q widens with band gain (bells only)
    Proportional,
}

/// Optional output waveshaping stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CharacterMode {
    #[default]
    Clean,
    Warm,
}

/// Processing phase mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PhaseMode {
    /// Minimum-phase IIR path, zero added latency
    #[default]
    RealTime,
    /// Linear-phase FIR, short taps
    Natural,
    /// Linear-phase FIR, long taps
    Linear,
}

impl PhaseMode {
    #[inline]
    pub fn is_linear_phase(self) -> bool {
        !matches!(self, Self::RealTime)
    }
}

/// Mid/side routing target resolved from a channel role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum MsTarget {
    #[default]
    None = 0,
    Mid = 1,
    Side = 2,
}

/// Named channel role a band can be routed to.
///
/// Roles name positions in the host layout; `resolve` turns a role into a
/// channel bitmask plus an M/S target for the layout actually in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelRole {
    #[default]
    All,
    AllExceptLfe,
    Left,
    Right,
    Mid,
    Side,
    Center,
    Lfe,
    FrontPair,
    SurroundLeft,
    SurroundRight,
    SurroundPair,
    SurroundMid,
    SurroundSide,
    RearLeft,
    RearRight,
    RearPair,
    RearMid,
    RearSide,
    TopLeft,
    TopRight,
    TopPair,
    TopMid,
    TopSide,
}

/// A role resolved against a concrete channel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandRouting {
    /// Bitmask of physical channels this band touches
    pub channel_mask: u32,
    /// M/S processing applied within the masked stereo pair
    pub ms_target: MsTarget,
}

impl BandRouting {
    pub fn all(channel_count: usize) -> Self {
        Self {
            channel_mask: mask_all(channel_count),
            ms_target: MsTarget::None,
        }
    }

    #[inline]
    pub fn includes(&self, channel: usize) -> bool {
        self.channel_mask & (1 << channel) != 0
    }
}

#[inline]
fn mask_all(channel_count: usize) -> u32 {
    if channel_count >= 32 {
        u32::MAX
    } else {
        (1u32 << channel_count) - 1
    }
}

#[inline]
fn mask_of(channels: &[usize]) -> u32 {
    channels.iter().fold(0, |m, &c| m | (1 << c))
}

impl ChannelRole {
    /// Map this role to a channel mask + M/S target for a given layout.
    ///
    /// Layout convention: 0=L 1=R, then 2=C 3=LFE, 4=Ls 5=Rs, 6=Lrs 7=Rrs.
    /// Roles that name channels the layout does not have fall back to all
    /// channels with M/S disabled rather than silently dropping the band.
    pub fn resolve(self, channel_count: usize) -> BandRouting {
        let fallback = BandRouting::all(channel_count);
        let pair = |lo: usize, hi: usize, ms: MsTarget| {
            if channel_count > hi {
                BandRouting {
                    channel_mask: mask_of(&[lo, hi]),
                    ms_target: ms,
                }
            } else {
                fallback
            }
        };
        let single = |ch: usize| {
            if channel_count > ch {
                BandRouting {
                    channel_mask: mask_of(&[ch]),
                    ms_target: MsTarget::None,
                }
            } else {
                fallback
            }
        };

        match self {
            Self::All => fallback,
            Self::AllExceptLfe => {
                if channel_count > 3 {
                    BandRouting {
                        channel_mask: mask_all(channel_count) & !(1 << 3),
                        ms_target: MsTarget::None,
                    }
                } else {
                    fallback
                }
            }
            Self::Left => single(0),
            Self::Right => single(1),
            Self::Mid => pair(0, 1, MsTarget::Mid),
            Self::Side => pair(0, 1, MsTarget::Side),
            Self::Center => single(2),
            Self::Lfe => single(3),
            Self::FrontPair => pair(0, 1, MsTarget::None),
            Self::SurroundLeft => single(4),
            Self::SurroundRight => single(5),
            Self::SurroundPair => pair(4, 5, MsTarget::None),
            Self::SurroundMid => pair(4, 5, MsTarget::Mid),
            Self::SurroundSide => pair(4, 5, MsTarget::Side),
            Self::RearLeft => single(6),
            Self::RearRight => single(7),
            Self::RearPair => pair(6, 7, MsTarget::None),
            Self::RearMid => pair(6, 7, MsTarget::Mid),
            Self::RearSide => pair(6, 7, MsTarget::Side),
            // Top channels are not part of the supported layouts yet; they
            // resolve to the fallback until height layouts land.
            Self::TopLeft
            | Self::TopRight
            | Self::TopPair
            | Self::TopMid
            | Self::TopSide => fallback,
        }
    }
}

/// One band's full processing configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandParams {
    pub enabled: bool,
    pub bypassed: bool,
    pub solo: bool,
    pub shape: FilterShape,
    pub frequency_hz: f64,
    pub gain_db: f64,
    pub q: f64,
    /// dB/oct, honored by low/high-pass shapes only
    pub slope_db: f64,
    /// Per-band dry/wet
    pub mix: f64,
    pub role: ChannelRole,

    // Dynamic EQ
    pub dynamic_enabled: bool,
    pub dynamic_mode: DynamicMode,
    pub threshold_db: f64,
    pub attack_ms: f64,
    pub release_ms: f64,
    pub auto_scale: bool,
    pub use_external_detector: bool,

    // Harmonic shaping
    pub harmonic_bypassed: bool,
    pub odd_harmonic_db: f64,
    pub mix_odd: f64,
    pub even_harmonic_db: f64,
    pub mix_even: f64,
}

impl Default for BandParams {
    fn default() -> Self {
        Self {
            enabled: false,
            bypassed: false,
            solo: false,
            shape: FilterShape::Bell,
            frequency_hz: 1000.0,
            gain_db: 0.0,
            q: 0.707,
            slope_db: 12.0,
            mix: 1.0,
            role: ChannelRole::All,
            dynamic_enabled: false,
            dynamic_mode: DynamicMode::Up,
            threshold_db: -24.0,
            attack_ms: 10.0,
            release_ms: 120.0,
            auto_scale: false,
            use_external_detector: false,
            harmonic_bypassed: true,
            odd_harmonic_db: 0.0,
            mix_odd: 0.0,
            even_harmonic_db: 0.0,
            mix_even: 0.0,
        }
    }
}

impl BandParams {
    /// Clamp every field into its safe range. Runs once at snapshot build
    /// time so the audio side never sees degenerate values.
    pub fn clamped(mut self) -> Self {
        self.frequency_hz = self.frequency_hz.clamp(10.0, MAX_FREQUENCY_HZ);
        self.gain_db = self.gain_db.clamp(-48.0, 48.0);
        self.q = self.q.clamp(0.1, 18.0);
        self.slope_db = self.slope_db.clamp(6.0, 96.0);
        self.mix = self.mix.clamp(0.0, 1.0);
        self.threshold_db = self.threshold_db.clamp(-96.0, 12.0);
        self.attack_ms = self.attack_ms.clamp(0.05, 500.0);
        self.release_ms = self.release_ms.clamp(1.0, 2000.0);
        self.mix_odd = self.mix_odd.clamp(0.0, 1.0);
        self.mix_even = self.mix_even.clamp(0.0, 1.0);
        self.odd_harmonic_db = self.odd_harmonic_db.clamp(-24.0, 24.0);
        self.even_harmonic_db = self.even_harmonic_db.clamp(-24.0, 24.0);
        self
    }
}

/// Cut-shape slope decomposition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlopeStages {
    /// Number of cascaded 12 dB/oct biquad sections
    pub biquads: usize,
    /// One trailing 6 dB/oct one-pole section
    pub one_pole: bool,
}

/// Decompose a slope in dB/oct into biquad + one-pole stages.
///
/// `stages = floor(clamp(slope, 6, 96) / 12)`, remainder >= 6 adds one
/// one-pole. A 6 dB/oct slope is a lone one-pole with zero biquads.
pub fn slope_stages(slope_db: f64) -> SlopeStages {
    let slope = slope_db.clamp(6.0, 96.0);
    let biquads = (slope / 12.0).floor() as usize;
    let remainder = slope - biquads as f64 * 12.0;
    SlopeStages {
        biquads: biquads.min(MAX_STAGES),
        one_pole: remainder >= 6.0 || biquads == 0,
    }
}

/// Resonance tap level for sub-12 dB/oct cuts with high Q
///
/// `clamp((q - 0.707) / 6, 0, 0.8)`; zero for Butterworth Q and below.
#[inline]
pub fn resonance_tap(q: f64) -> f64 {
    ((q - 0.707) / 6.0).clamp(0.0, 0.8)
}

/// Effective Q under proportional Q mode (bells only)
///
/// `clamp(q * (1 + |gain|/18 * amount), 0.1, 18)`.
#[inline]
pub fn proportional_q(q: f64, gain_db: f64, amount: f64) -> f64 {
    (q * (1.0 + gain_db.abs() / 18.0 * amount)).clamp(0.1, 18.0)
}

/// Butterworth Q values for cascaded 12 dB/oct sections
///
/// Standard pole placement so an N-stage cascade is maximally flat.
pub fn butterworth_qs(stages: usize) -> [f64; MAX_STAGES] {
    let mut qs = [0.707; MAX_STAGES];
    if stages <= 1 {
        return qs;
    }
    let order = stages * 2;
    for (k, q) in qs.iter_mut().take(stages).enumerate() {
        let angle = std::f64::consts::PI * (2.0 * k as f64 + 1.0) / (2.0 * order as f64);
        *q = 1.0 / (2.0 * angle.sin());
    }
    qs
}
