//! Multi-band EQ cascade
//!
//! Owns all per-(channel, band) filter state: biquad stages for slope,
//! one-pole remainders, mid/side group processing, solo spotlight,
//! dynamic-EQ envelope followers and harmonic shaping. State persists
//! across blocks and is only reset on transport reset or sample-rate
//! change; `process` never allocates.

use peq_core::{
    db_to_linear, linear_to_db, MidSideSample, PeqError, PeqResult, Sample, StereoSample,
};

use crate::biquad::{Biquad, FilterShape, OnePole};
use crate::params::{
    butterworth_qs, proportional_q, resonance_tap, slope_stages, BandParams, DynamicMode, MsTarget,
    QMode, MAX_BANDS, MAX_CHANNELS, MAX_STAGES,
};
use crate::smoothing::ParamSmoother;
use crate::{MonoProcessor, Processor};

/// Stereo pairs eligible for mid/side grouping: front, surround, rear
const MS_PAIRS: [(usize, usize); 3] = [(0, 1), (4, 5), (6, 7)];

/// Global settings consumed by the cascade
#[derive(Debug, Clone, Copy)]
pub struct GlobalEqParams {
    pub bypass: bool,
    pub q_mode: QMode,
    /// Proportional-Q strength, 0..1
    pub q_amount: f64,
    pub smart_solo: bool,
}

impl Default for GlobalEqParams {
    fn default() -> Self {
        Self {
            bypass: false,
            q_mode: QMode::Fixed,
            q_amount: 1.0,
            smart_solo: false,
        }
    }
}

/// Blended peak/RMS envelope follower for the dynamic-EQ detector
#[derive(Debug, Clone)]
struct DynamicEnvelope {
    attack_coeff: f64,
    release_coeff: f64,
    peak_env: f64,
    rms_env: f64,
    last_attack_ms: f64,
    last_release_ms: f64,
}

impl DynamicEnvelope {
    fn new() -> Self {
        Self {
            attack_coeff: 0.0,
            release_coeff: 0.0,
            peak_env: 0.0,
            rms_env: 0.0,
            last_attack_ms: -1.0,
            last_release_ms: -1.0,
        }
    }

    fn set_times(&mut self, attack_ms: f64, release_ms: f64, sample_rate: f64) {
        if attack_ms == self.last_attack_ms && release_ms == self.last_release_ms {
            return;
        }
        self.attack_coeff = (-1.0 / (attack_ms.max(0.01) * 0.001 * sample_rate)).exp();
        self.release_coeff = (-1.0 / (release_ms.max(0.1) * 0.001 * sample_rate)).exp();
        self.last_attack_ms = attack_ms;
        self.last_release_ms = release_ms;
    }

    /// Track the detector level: 60% peak, 40% RMS blend
    #[inline]
    fn process(&mut self, input: f64) -> f64 {
        let rect = input.abs();
        let c = if rect > self.peak_env {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.peak_env = rect + c * (self.peak_env - rect);

        let sq = input * input;
        let c = if sq > self.rms_env {
            self.attack_coeff
        } else {
            self.release_coeff
        };
        self.rms_env = sq + c * (self.rms_env - sq);

        0.6 * self.peak_env + 0.4 * self.rms_env.sqrt()
    }

    fn reset(&mut self) {
        self.peak_env = 0.0;
        self.rms_env = 0.0;
    }
}

/// All filter state for one (channel, band) slot
#[derive(Debug, Clone)]
struct BandState {
    stages: [Biquad; MAX_STAGES],
    one_pole: OnePole,
    /// High-shelf half of the tilt shapes
    tilt_partner: Biquad,
    /// Band-pass resonance tap for sub-12 dB/oct cuts
    resonance: Biquad,
    /// Spotlight filter for the solo path
    solo_filter: Biquad,
    /// Band-pass detector for dynamic EQ
    detector: Biquad,
    envelope: DynamicEnvelope,

    freq: ParamSmoother,
    gain: ParamSmoother,
    q: ParamSmoother,
    mix: ParamSmoother,
    threshold: ParamSmoother,
    primed: bool,
}

impl BandState {
    fn new(sample_rate: f64) -> Self {
        Self {
            stages: std::array::from_fn(|_| Biquad::new(sample_rate)),
            one_pole: OnePole::new(sample_rate),
            tilt_partner: Biquad::new(sample_rate),
            resonance: Biquad::new(sample_rate),
            solo_filter: Biquad::new(sample_rate),
            detector: Biquad::new(sample_rate),
            envelope: DynamicEnvelope::new(),
            freq: ParamSmoother::new(sample_rate, 1000.0),
            gain: ParamSmoother::new(sample_rate, 0.0),
            q: ParamSmoother::new(sample_rate, 0.707),
            mix: ParamSmoother::new(sample_rate, 1.0),
            threshold: ParamSmoother::new(sample_rate, -24.0),
            primed: false,
        }
    }

    fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
        self.one_pole.reset();
        self.tilt_partner.reset();
        self.resonance.reset();
        self.solo_filter.reset();
        self.detector.reset();
        self.envelope.reset();
        self.primed = false;
    }
}

/// The per-block EQ processor
pub struct EqDsp {
    sample_rate: f64,
    channel_count: usize,
    // Indexed [channel][band]; allocated at prepare time only
    states: Vec<Vec<BandState>>,
    scratch_mid: Vec<f64>,
    scratch_side: Vec<f64>,
    det_mid: Vec<f64>,
    det_side: Vec<f64>,
    dry: Vec<Vec<f64>>,
}

impl EqDsp {
    pub fn new(sample_rate: f64, channel_count: usize, max_block: usize) -> PeqResult<Self> {
        if channel_count == 0 || channel_count > MAX_CHANNELS {
            return Err(PeqError::InvalidChannelCount(channel_count, MAX_CHANNELS));
        }
        if !(8000.0..=384_000.0).contains(&sample_rate) {
            return Err(PeqError::InvalidSampleRate(sample_rate));
        }

        Ok(Self {
            sample_rate,
            channel_count,
            states: (0..channel_count)
                .map(|_| (0..MAX_BANDS).map(|_| BandState::new(sample_rate)).collect())
                .collect(),
            scratch_mid: vec![0.0; max_block],
            scratch_side: vec![0.0; max_block],
            det_mid: vec![0.0; max_block],
            det_side: vec![0.0; max_block],
            dry: (0..channel_count).map(|_| vec![0.0; max_block]).collect(),
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn reset(&mut self) {
        for channel in &mut self.states {
            for band in channel.iter_mut() {
                band.reset();
            }
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        for channel in &mut self.states {
            for band in channel.iter_mut() {
                *band = BandState::new(sample_rate);
            }
        }
    }

    /// Process one block in place. `detector` is an optional external
    /// sidechain of the same block length, channel-planar like `buffers`.
    pub fn process(
        &mut self,
        buffers: &mut [&mut [Sample]],
        detector: Option<&[&[Sample]]>,
        bands: &[BandParams],
        globals: &GlobalEqParams,
    ) {
        if globals.bypass || buffers.is_empty() {
            return;
        }
        let block_len = buffers[0].len();
        self.ensure_scratch(block_len);

        let any_solo = bands
            .iter()
            .any(|b| b.enabled && !b.bypassed && b.solo);
        if any_solo {
            self.process_solo(buffers, bands, globals, block_len);
            return;
        }

        // Mid/side groups, one per eligible stereo pair
        for &(lo, hi) in &MS_PAIRS {
            if hi >= self.channel_count {
                continue;
            }
            let pair_mask = (1u32 << lo) | (1u32 << hi);
            let has_ms = bands.iter().take(MAX_BANDS).any(|b| {
                if !b.enabled || b.bypassed {
                    return false;
                }
                let routing = b.role.resolve(self.channel_count);
                routing.ms_target != MsTarget::None && routing.channel_mask == pair_mask
            });
            if !has_ms {
                continue;
            }

            for i in 0..block_len {
                let ms = StereoSample::new(buffers[lo][i], buffers[hi][i]).to_mid_side();
                self.scratch_mid[i] = ms.mid;
                self.scratch_side[i] = ms.side;
            }
            let mut det_encoded = false;

            for (bi, band) in bands.iter().take(MAX_BANDS).enumerate() {
                if !band.enabled || band.bypassed {
                    continue;
                }
                let routing = band.role.resolve(self.channel_count);
                if routing.channel_mask != pair_mask || routing.ms_target == MsTarget::None {
                    continue;
                }

                let external = if band.use_external_detector {
                    if let Some(det) = detector {
                        if !det_encoded {
                            for i in 0..block_len {
                                let ms = StereoSample::new(det[lo][i], det[hi][i]).to_mid_side();
                                self.det_mid[i] = ms.mid;
                                self.det_side[i] = ms.side;
                            }
                            det_encoded = true;
                        }
                        true
                    } else {
                        false
                    }
                } else {
                    false
                };

                // The detector reads the already-encoded mid/side signal
                let (buf, det_buf, state_ch) = match routing.ms_target {
                    MsTarget::Mid => (
                        &mut self.scratch_mid[..block_len],
                        external.then(|| &self.det_mid[..block_len]),
                        lo,
                    ),
                    _ => (
                        &mut self.scratch_side[..block_len],
                        external.then(|| &self.det_side[..block_len]),
                        hi,
                    ),
                };
                process_band_chain(
                    &mut self.states[state_ch][bi],
                    buf,
                    det_buf,
                    band,
                    globals,
                    self.sample_rate,
                );
            }

            for i in 0..block_len {
                let stereo = MidSideSample {
                    mid: self.scratch_mid[i],
                    side: self.scratch_side[i],
                }
                .to_stereo();
                buffers[lo][i] = stereo.left;
                buffers[hi][i] = stereo.right;
            }
        }

        // Remaining (channel, band) combinations, straight per-channel
        for (bi, band) in bands.iter().take(MAX_BANDS).enumerate() {
            if !band.enabled || band.bypassed {
                continue;
            }
            let routing = band.role.resolve(self.channel_count);
            if routing.ms_target != MsTarget::None {
                continue;
            }
            for ch in 0..self.channel_count {
                if !routing.includes(ch) {
                    continue;
                }
                let det_buf = if band.use_external_detector {
                    detector.map(|d| d[ch])
                } else {
                    None
                };
                process_band_chain(
                    &mut self.states[ch][bi],
                    buffers[ch],
                    det_buf,
                    band,
                    globals,
                    self.sample_rate,
                );
            }
        }
    }

    /// Solo override: only soloed bands reach the output, as band-pass
    /// spotlights summed from the dry input.
    fn process_solo(
        &mut self,
        buffers: &mut [&mut [Sample]],
        bands: &[BandParams],
        globals: &GlobalEqParams,
        block_len: usize,
    ) {
        for ch in 0..self.channel_count {
            self.dry[ch][..block_len].copy_from_slice(&buffers[ch][..block_len]);
            buffers[ch][..block_len].fill(0.0);
        }

        let (boost, q_scale) = if globals.smart_solo {
            (db_to_linear(6.0), 2.5)
        } else {
            (1.0, 1.0)
        };

        for (bi, band) in bands.iter().take(MAX_BANDS).enumerate() {
            if !band.enabled || band.bypassed || !band.solo {
                continue;
            }
            let routing = band.role.resolve(self.channel_count);
            let freq = band.frequency_hz.clamp(10.0, self.sample_rate * 0.49);
            let q = (band.q * q_scale).clamp(0.1, 18.0);

            for ch in 0..self.channel_count {
                if !routing.includes(ch) {
                    continue;
                }
                let state = &mut self.states[ch][bi];
                state.solo_filter.set_bandpass(freq, q);
                for i in 0..block_len {
                    buffers[ch][i] += boost * state.solo_filter.process_sample(self.dry[ch][i]);
                }
            }
        }

        for ch in 0..self.channel_count {
            for sample in buffers[ch][..block_len].iter_mut() {
                if !sample.is_finite() {
                    *sample = 0.0;
                }
            }
        }
    }

    fn ensure_scratch(&mut self, block_len: usize) {
        if self.scratch_mid.len() < block_len {
            self.scratch_mid.resize(block_len, 0.0);
            self.scratch_side.resize(block_len, 0.0);
            self.det_mid.resize(block_len, 0.0);
            self.det_side.resize(block_len, 0.0);
            for dry in &mut self.dry {
                dry.resize(block_len, 0.0);
            }
        }
    }
}

/// Run one band's full chain over a buffer in place.
///
/// Free function so the caller can borrow the band state and a scratch
/// buffer from the same struct.
fn process_band_chain(
    state: &mut BandState,
    buf: &mut [f64],
    external_detector: Option<&[f64]>,
    band: &BandParams,
    globals: &GlobalEqParams,
    sample_rate: f64,
) {
    let block_len = buf.len();

    if !state.primed {
        state.freq.snap_to(band.frequency_hz);
        state.gain.snap_to(band.gain_db);
        state.q.snap_to(band.q);
        state.mix.snap_to(band.mix);
        state.threshold.snap_to(band.threshold_db);
        state.primed = true;
    } else {
        state.freq.set_target(band.frequency_hz);
        state.gain.set_target(band.gain_db);
        state.q.set_target(band.q);
        state.mix.set_target(band.mix);
        state.threshold.set_target(band.threshold_db);
    }

    let freq = state
        .freq
        .advance_block(block_len)
        .clamp(10.0, sample_rate * 0.49);
    let gain = state.gain.advance_block(block_len);
    let q = state.q.advance_block(block_len).max(0.1);
    let mix = state.mix.advance_block(block_len).clamp(0.0, 1.0);
    let threshold = state.threshold.advance_block(block_len);

    let q_eff = if globals.q_mode == QMode::Proportional && band.shape == FilterShape::Bell {
        proportional_q(q, gain, globals.q_amount.clamp(0.0, 1.0))
    } else {
        q
    };

    // Configure the chain for this shape
    let stages = if band.shape.uses_slope() {
        slope_stages(band.slope_db)
    } else {
        crate::params::SlopeStages {
            biquads: 1,
            one_pole: false,
        }
    };
    let mut res_level = 0.0;

    match band.shape {
        FilterShape::LowPass | FilterShape::HighPass => {
            let qs = if stages.biquads <= 1 {
                [q_eff; MAX_STAGES]
            } else {
                butterworth_qs(stages.biquads)
            };
            for s in 0..stages.biquads {
                state.stages[s].update(band.shape, freq, 0.0, qs[s]);
            }
            if stages.one_pole {
                match band.shape {
                    FilterShape::LowPass => state.one_pole.set_low_pass(freq),
                    _ => state.one_pole.set_high_pass(freq),
                }
            }
            if band.slope_db < 12.0 {
                res_level = resonance_tap(q_eff);
                if res_level > 0.0 {
                    state.resonance.set_bandpass(freq, q_eff);
                }
            }
        }
        FilterShape::Tilt | FilterShape::FlatTilt => {
            state.stages[0].update(band.shape, freq, gain, q_eff);
            let partner_q = if band.shape == FilterShape::FlatTilt {
                0.5
            } else {
                q_eff
            };
            state
                .tilt_partner
                .update(FilterShape::HighShelf, freq, -gain * 0.5, partner_q);
        }
        _ => {
            state.stages[0].update(band.shape, freq, gain, q_eff);
        }
    }

    if band.dynamic_enabled {
        state.detector.set_bandpass(freq, q_eff.max(0.707));
        let scale = if band.auto_scale {
            (freq / 1000.0).max(0.05)
        } else {
            1.0
        };
        state
            .envelope
            .set_times(band.attack_ms * scale, band.release_ms * scale, sample_rate);
    }

    let odd_gain = db_to_linear(band.odd_harmonic_db);
    let even_gain = db_to_linear(band.even_harmonic_db);
    let harmonics_on =
        !band.harmonic_bypassed && (band.mix_odd > 0.0 || band.mix_even > 0.0);

    for i in 0..block_len {
        let dry = buf[i];

        let mut filtered = dry;
        match band.shape {
            FilterShape::LowPass | FilterShape::HighPass => {
                for s in 0..stages.biquads {
                    filtered = state.stages[s].process_sample(filtered);
                }
                if stages.one_pole {
                    filtered = state.one_pole.process_sample(filtered);
                }
                if res_level > 0.0 {
                    filtered += res_level * state.resonance.process_sample(dry);
                }
            }
            FilterShape::Tilt | FilterShape::FlatTilt => {
                filtered = state.stages[0].process_sample(filtered);
                filtered = state.tilt_partner.process_sample(filtered);
            }
            _ => {
                filtered = state.stages[0].process_sample(filtered);
            }
        }

        // Exactly 1.0 when dynamics are off, so the static path is
        // bit-identical to a build without the dynamic branch
        let dyn_gain = if band.dynamic_enabled {
            let det_in = match external_detector {
                Some(det) => det[i],
                None => dry,
            };
            let det = state.detector.process_sample(det_in);
            let level_db = linear_to_db(state.envelope.process(det));
            let over = level_db - threshold;
            let amount = (over / 12.0).clamp(0.0, 1.0);
            let applied = match band.dynamic_mode {
                DynamicMode::Up => {
                    if gain >= 0.0 {
                        gain * amount
                    } else {
                        gain * (1.0 - amount)
                    }
                }
                DynamicMode::Down => {
                    if gain >= 0.0 {
                        gain * (1.0 - amount)
                    } else {
                        gain * amount
                    }
                }
            };
            db_to_linear(applied - gain)
        } else {
            1.0
        };

        let mut out = dry + mix * dyn_gain * (filtered - dry);

        if harmonics_on {
            let delta = (out * out * out * odd_gain * 0.33 * band.mix_odd
                + out * out * even_gain * 0.5 * band.mix_even)
                .clamp(-4.0, 4.0);
            out += mix * delta;
            if out.abs() > 1.0 {
                out = out.tanh();
            }
        }

        buf[i] = if out.is_finite() { out } else { 0.0 };
    }
}
