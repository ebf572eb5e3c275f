//! Block-rate orchestration
//!
//! `EqEngine` lives on the audio thread. Each block it copies the active
//! snapshot, installs any finished impulse sets, runs the minimum-phase
//! or linear-phase path, applies the output stages, and crossfades
//! against a latency-aligned dry signal. Everything here is free of
//! locks and allocation; superseded impulse buffers travel back to the
//! control thread for disposal.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};

use peq_core::{db_to_linear, PeqError, PeqResult, Sample};
use peq_dsp::analyzer::{analyzer_tap, AnalyzerTap, AnalyzerTapReader};
use peq_dsp::delay::DelayLine;
use peq_dsp::eq::{EqDsp, GlobalEqParams};
use peq_dsp::metering::{MeterBank, MeterState};
use peq_dsp::params::{CharacterMode, PhaseMode, MAX_CHANNELS};
use peq_dsp::smoothing::ParamSmoother;

use crate::controller::EqController;
use crate::linear_phase::{ImpulseSet, LinearPhaseEq};
use crate::quality::{self, AdaptiveQuality};
use crate::rebuild::RebuildWorker;
use crate::snapshot::{ParamSnapshot, SnapshotBuffer};

/// Deepest supported dry-compensation delay: half the longest FIR
const MAX_DRY_DELAY: usize = 4096;

/// Analyzer tap capacity in samples
const TAP_CAPACITY: usize = 16384;

/// Waveshaper drive for the warm character stage
const CHARACTER_DRIVE: f64 = 1.2;

/// Scale applied to the mean band gain for auto-gain compensation
const AUTO_GAIN_SCALE: f64 = 0.5;

/// Retired impulse sets in flight back to the control thread
const RETIRE_QUEUE: usize = 4;

/// Renderer-side ends of the engine's analyzer taps
pub struct EngineTaps {
    pub pre: Vec<AnalyzerTapReader>,
    pub post: Vec<AnalyzerTapReader>,
}

/// The audio-thread half of the EQ
pub struct EqEngine {
    sample_rate: f64,
    channel_count: usize,
    snapshot: ParamSnapshot,
    buffer: Arc<SnapshotBuffer>,
    dsp: EqDsp,
    linear: LinearPhaseEq,
    impulse_rx: Receiver<ImpulseSet>,
    retire_tx: Sender<ImpulseSet>,
    dry: Vec<Vec<f64>>,
    dry_delay: Vec<DelayLine>,
    wet: ParamSmoother,
    wet_primed: bool,
    meters: MeterBank,
    pre_taps: Vec<AnalyzerTap>,
    post_taps: Vec<AnalyzerTap>,
    adaptive: AdaptiveQuality,
    quality_offset: Arc<AtomicI32>,
    active_mode: PhaseMode,
}

impl EqEngine {
    /// Build the engine pair: the audio-side processor, the control-side
    /// controller, and the analyzer tap readers for a renderer.
    pub fn create(
        sample_rate: f64,
        channel_count: usize,
        max_block: usize,
    ) -> PeqResult<(EqEngine, EqController, EngineTaps)> {
        if channel_count == 0 || channel_count > MAX_CHANNELS {
            return Err(PeqError::InvalidChannelCount(channel_count, MAX_CHANNELS));
        }
        if max_block == 0 {
            return Err(PeqError::InvalidBlockSize(max_block));
        }

        let buffer = Arc::new(SnapshotBuffer::new());
        let quality_offset = Arc::new(AtomicI32::new(0));
        let (worker, impulse_rx) = RebuildWorker::spawn();
        let (retire_tx, retire_rx) = bounded(RETIRE_QUEUE);

        let tap_channels = channel_count.min(2);
        let mut pre_taps = Vec::with_capacity(tap_channels);
        let mut pre_readers = Vec::with_capacity(tap_channels);
        let mut post_taps = Vec::with_capacity(tap_channels);
        let mut post_readers = Vec::with_capacity(tap_channels);
        for _ in 0..tap_channels {
            let (tap, reader) = analyzer_tap(TAP_CAPACITY, sample_rate);
            pre_taps.push(tap);
            pre_readers.push(reader);
            let (tap, reader) = analyzer_tap(TAP_CAPACITY, sample_rate);
            post_taps.push(tap);
            post_readers.push(reader);
        }

        let engine = EqEngine {
            sample_rate,
            channel_count,
            snapshot: ParamSnapshot::default(),
            buffer: Arc::clone(&buffer),
            dsp: EqDsp::new(sample_rate, channel_count, max_block)?,
            linear: LinearPhaseEq::new(
                channel_count,
                quality::head_size_for(quality::DEFAULT_TIER),
                max_block,
            ),
            impulse_rx,
            retire_tx,
            dry: (0..channel_count).map(|_| vec![0.0; max_block]).collect(),
            dry_delay: (0..channel_count)
                .map(|_| DelayLine::new(MAX_DRY_DELAY))
                .collect(),
            wet: ParamSmoother::new(sample_rate, 1.0),
            wet_primed: false,
            meters: MeterBank::new(sample_rate, channel_count),
            pre_taps,
            post_taps,
            adaptive: AdaptiveQuality::new(),
            quality_offset: Arc::clone(&quality_offset),
            active_mode: PhaseMode::RealTime,
        };

        let controller = EqController::new(
            buffer,
            worker,
            retire_rx,
            quality_offset,
            sample_rate,
            channel_count,
        );

        log::info!(
            "EQ engine prepared: {sample_rate} Hz, {channel_count} ch, max block {max_block}"
        );

        Ok((
            engine,
            controller,
            EngineTaps {
                pre: pre_readers,
                post: post_readers,
            },
        ))
    }

    /// Latency the active path adds, in samples
    pub fn latency_samples(&self) -> usize {
        if self.active_mode.is_linear_phase() {
            self.linear.latency_samples()
        } else {
            0
        }
    }

    pub fn meter_state(&self) -> MeterState {
        self.meters.state()
    }

    pub fn reset(&mut self) {
        self.dsp.reset();
        self.linear.reset();
        for delay in &mut self.dry_delay {
            delay.clear();
        }
        self.meters.reset();
        self.adaptive.reset();
        self.quality_offset.store(0, Ordering::Release);
    }

    /// Process one block in place. `sidechain`, when present, must match
    /// the block length and channel count.
    pub fn process_block(
        &mut self,
        buffers: &mut [&mut [Sample]],
        sidechain: Option<&[&[Sample]]>,
    ) {
        let block_len = match buffers.first() {
            Some(buf) => buf.len(),
            None => return,
        };
        let start = Instant::now();

        self.buffer.read_into(&mut self.snapshot);
        self.install_pending_impulses();

        if self.snapshot.phase_mode != self.active_mode {
            log::info!(
                "phase mode {:?} -> {:?}",
                self.active_mode,
                self.snapshot.phase_mode
            );
            self.active_mode = self.snapshot.phase_mode;
            self.dsp.reset();
            self.linear.reset();
            for delay in &mut self.dry_delay {
                delay.clear();
            }
        }

        for (tap, buffer) in self.pre_taps.iter_mut().zip(buffers.iter()) {
            tap.push(&buffer[..block_len]);
        }

        if self.snapshot.bypass {
            self.feed_output_stage(buffers, block_len);
            return;
        }

        for ch in 0..self.channel_count {
            self.dry[ch][..block_len].copy_from_slice(&buffers[ch][..block_len]);
        }

        match self.active_mode {
            PhaseMode::RealTime => {
                let globals = GlobalEqParams {
                    bypass: false,
                    q_mode: self.snapshot.q_mode,
                    q_amount: self.snapshot.q_amount,
                    smart_solo: self.snapshot.smart_solo,
                };
                self.dsp
                    .process(buffers, sidechain, &self.snapshot.bands, &globals);
            }
            _ => self.linear.process(buffers),
        }

        if self.snapshot.character == CharacterMode::Warm {
            for buffer in buffers.iter_mut() {
                for sample in buffer[..block_len].iter_mut() {
                    *sample = (CHARACTER_DRIVE * *sample).tanh() / CHARACTER_DRIVE;
                }
            }
        }

        let mut post_gain = db_to_linear(self.snapshot.output_trim_db);
        if self.snapshot.auto_gain {
            post_gain *= db_to_linear(self.auto_gain_db());
        }
        if self.snapshot.phase_invert {
            post_gain = -post_gain;
        }
        if post_gain != 1.0 {
            for buffer in buffers.iter_mut() {
                for sample in buffer[..block_len].iter_mut() {
                    *sample *= post_gain;
                }
            }
        }

        self.crossfade_dry(buffers, block_len);
        self.feed_output_stage(buffers, block_len);

        if self.active_mode.is_linear_phase() {
            let block_secs = block_len as f64 / self.sample_rate;
            if self
                .adaptive
                .observe(start.elapsed().as_secs_f64(), block_secs)
            {
                let offset = self.adaptive.offset();
                log::info!("adaptive quality offset -> {offset}");
                self.quality_offset.store(offset, Ordering::Release);
            }
        }
    }

    fn install_pending_impulses(&mut self) {
        while let Ok(set) = self.impulse_rx.try_recv() {
            log::debug!(
                "impulse set installed: {} taps, revision {}",
                set.taps,
                set.revision
            );
            // The superseded buffers are freed on the control thread
            let retired = self.linear.install(set);
            if self.retire_tx.try_send(retired).is_err() {
                log::warn!("retire queue full, dropping superseded impulse in place");
            }
        }
    }

    /// Mean gain of the active gain-shapes, scaled and limited, negated
    /// into a compensation gain.
    fn auto_gain_db(&self) -> f64 {
        let mut sum = 0.0;
        let mut count = 0;
        for band in &self.snapshot.bands {
            if band.enabled && !band.bypassed && band.shape.uses_gain() {
                sum += band.gain_db;
                count += 1;
            }
        }
        if count == 0 {
            return 0.0;
        }
        (-(sum / count as f64) * AUTO_GAIN_SCALE).clamp(-12.0, 12.0)
    }

    /// Latency-aligned dry/wet crossfade with a smoothed wet coefficient
    fn crossfade_dry(&mut self, buffers: &mut [&mut [Sample]], block_len: usize) {
        let latency = self.latency_samples();
        for delay in &mut self.dry_delay {
            if delay.delay() != latency {
                delay.set_delay(latency.min(MAX_DRY_DELAY));
            }
        }

        let mix = self.snapshot.mix.clamp(0.0, 1.0);
        if self.wet_primed {
            self.wet.set_target(mix);
        } else {
            self.wet.snap_to(mix);
            self.wet_primed = true;
        }

        for i in 0..block_len {
            let wet = self.wet.next_value();
            for ch in 0..self.channel_count {
                let dry = self.dry_delay[ch].process_sample(self.dry[ch][i]);
                buffers[ch][i] = dry + wet * (buffers[ch][i] - dry);
            }
        }
    }

    fn feed_output_stage(&mut self, buffers: &mut [&mut [Sample]], block_len: usize) {
        let mut refs: [&[Sample]; MAX_CHANNELS] = [&[]; MAX_CHANNELS];
        for (slot, buffer) in refs.iter_mut().zip(buffers.iter()) {
            *slot = &buffer[..block_len];
        }
        self.meters.process_block(&refs[..self.channel_count]);

        for (tap, buffer) in self.post_taps.iter_mut().zip(buffers.iter()) {
            tap.push(&buffer[..block_len]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::GlobalParams;
    use peq_dsp::params::{BandParams, ChannelRole, FilterShape};

    const SR: f64 = 48000.0;
    const BLOCK: usize = 256;

    fn sine(freq: f64, len: usize) -> Vec<f64> {
        (0..len)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / SR).sin())
            .collect()
    }

    fn bell(freq: f64, gain: f64) -> BandParams {
        BandParams {
            enabled: true,
            shape: FilterShape::Bell,
            frequency_hz: freq,
            gain_db: gain,
            q: 1.0,
            role: ChannelRole::All,
            ..Default::default()
        }
    }

    fn run_block(engine: &mut EqEngine, left: &mut [f64], right: &mut [f64]) {
        let mut bufs: Vec<&mut [f64]> = vec![left, right];
        engine.process_block(&mut bufs, None);
    }

    fn wait_rebuild(controller: &EqController) {
        for _ in 0..500 {
            if !controller.rebuild_busy() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("rebuild never finished");
    }

    #[test]
    fn test_default_engine_is_transparent() {
        let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
        controller.tick(&[], &GlobalParams::default());

        let input = sine(440.0, BLOCK);
        let mut left = input.clone();
        let mut right = input.clone();
        run_block(&mut engine, &mut left, &mut right);

        assert_eq!(left, input);
        assert_eq!(right, input);
        assert_eq!(engine.latency_samples(), 0);
    }

    #[test]
    fn test_global_bypass_passthrough() {
        let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
        let globals = GlobalParams {
            bypass: true,
            ..Default::default()
        };
        controller.tick(&[bell(1000.0, 12.0)], &globals);

        let input = sine(440.0, BLOCK);
        let mut left = input.clone();
        let mut right = input.clone();
        run_block(&mut engine, &mut left, &mut right);
        assert_eq!(left, input);
    }

    #[test]
    fn test_global_mix_crossfade() {
        let input = sine(1000.0, BLOCK);

        let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
        controller.tick(&[bell(1000.0, 12.0)], &GlobalParams::default());
        let mut full_l = input.clone();
        let mut full_r = input.clone();
        run_block(&mut engine, &mut full_l, &mut full_r);

        let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
        let globals = GlobalParams {
            mix: 0.5,
            ..Default::default()
        };
        controller.tick(&[bell(1000.0, 12.0)], &globals);
        let mut half_l = input.clone();
        let mut half_r = input.clone();
        run_block(&mut engine, &mut half_l, &mut half_r);

        for i in 0..BLOCK {
            let expected = input[i] + 0.5 * (full_l[i] - input[i]);
            assert!((half_l[i] - expected).abs() < 1e-9, "mismatch at {i}");
        }
    }

    #[test]
    fn test_phase_invert_and_trim() {
        let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
        let globals = GlobalParams {
            output_trim_db: -6.0,
            phase_invert: true,
            ..Default::default()
        };
        // One transparent band keeps the wet path active
        controller.tick(&[bell(1000.0, 0.0)], &globals);

        let input = sine(440.0, BLOCK);
        let mut left = input.clone();
        let mut right = input.clone();
        run_block(&mut engine, &mut left, &mut right);

        let gain = -db_to_linear(-6.0);
        for i in 0..BLOCK {
            assert!((left[i] - input[i] * gain).abs() < 1e-9);
        }
    }

    #[test]
    fn test_auto_gain_compensates_boost() {
        let input = sine(1000.0, 8192);

        let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, 8192).unwrap();
        let globals = GlobalParams {
            auto_gain: true,
            ..Default::default()
        };
        controller.tick(&[bell(1000.0, 12.0)], &globals);
        let mut comp_l = input.clone();
        let mut comp_r = input.clone();
        run_block(&mut engine, &mut comp_l, &mut comp_r);

        let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, 8192).unwrap();
        controller.tick(&[bell(1000.0, 12.0)], &GlobalParams::default());
        let mut raw_l = input.clone();
        let mut raw_r = input.clone();
        run_block(&mut engine, &mut raw_l, &mut raw_r);

        let rms = |b: &[f64]| (b[4096..].iter().map(|x| x * x).sum::<f64>() / 4096.0).sqrt();
        assert!(rms(&comp_l) < rms(&raw_l));
    }

    #[test]
    fn test_warm_character_stays_bounded() {
        let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
        let globals = GlobalParams {
            character: CharacterMode::Warm,
            ..Default::default()
        };
        controller.tick(&[bell(440.0, 18.0)], &globals);

        let input: Vec<f64> = sine(440.0, BLOCK).iter().map(|x| x * 2.0).collect();
        let mut left = input.clone();
        let mut right = input.clone();
        run_block(&mut engine, &mut left, &mut right);

        for &sample in &left {
            assert!(sample.abs() <= 1.0 / CHARACTER_DRIVE + 1e-9);
            assert!(sample.is_finite());
        }
    }

    #[test]
    fn test_linear_phase_reports_tier_latency() {
        let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
        let globals = GlobalParams {
            phase_mode: PhaseMode::Natural,
            quality_tier: 1,
            ..Default::default()
        };
        // Natural tier 1 = 256 taps = 127 samples
        let reported = controller.tick(&[bell(1000.0, 6.0)], &globals);
        assert_eq!(reported, Some(127));

        // Wait for the rebuild, then let the engine pick the set up
        for _ in 0..200 {
            if !controller.rebuild_busy() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let input = sine(440.0, BLOCK);
        let mut left = input.clone();
        let mut right = input.clone();
        run_block(&mut engine, &mut left, &mut right);
        assert_eq!(engine.latency_samples(), 127);
    }

    #[test]
    fn test_quality_switch_swaps_convolver_bank() {
        let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
        let input = sine(1000.0, BLOCK);
        let band = bell(1000.0, 6.0);

        let globals = GlobalParams {
            phase_mode: PhaseMode::Natural,
            quality_tier: 0,
            ..Default::default()
        };
        controller.tick(&[band], &globals);
        wait_rebuild(&controller);
        let mut left = input.clone();
        let mut right = input.clone();
        run_block(&mut engine, &mut left, &mut right);
        assert_eq!(engine.latency_samples(), 63);

        // Tier 4 changes the head partition size; the worker ships a
        // fresh convolver bank and the engine swaps it in
        let globals = GlobalParams {
            phase_mode: PhaseMode::Natural,
            quality_tier: 4,
            ..Default::default()
        };
        controller.tick(&[band], &globals);
        wait_rebuild(&controller);
        let mut left = input.clone();
        let mut right = input.clone();
        run_block(&mut engine, &mut left, &mut right);
        assert_eq!(engine.latency_samples(), 1023);
        assert!(left.iter().all(|x| x.is_finite()));

        // Retired buffers drain on the next tick
        controller.tick(&[band], &globals);
    }

    #[test]
    fn test_warm_character_applies_in_linear_mode() {
        let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
        let globals = GlobalParams {
            phase_mode: PhaseMode::Natural,
            quality_tier: 0,
            character: CharacterMode::Warm,
            ..Default::default()
        };
        controller.tick(&[], &globals);
        wait_rebuild(&controller);

        // Hot input through a flat response still hits the waveshaper
        let input: Vec<f64> = sine(440.0, BLOCK).iter().map(|x| x * 2.0).collect();
        for _ in 0..4 {
            let mut left = input.clone();
            let mut right = input.clone();
            run_block(&mut engine, &mut left, &mut right);
            assert!(left.iter().all(|x| x.abs() <= 1.0 / CHARACTER_DRIVE + 1e-9));
        }
    }

    #[test]
    fn test_meters_follow_output() {
        let (mut engine, mut controller, _taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
        controller.tick(&[], &GlobalParams::default());

        let input = sine(440.0, BLOCK);
        for _ in 0..64 {
            let mut left = input.clone();
            let mut right = input.clone();
            run_block(&mut engine, &mut left, &mut right);
        }
        let state = engine.meter_state();
        assert!(state.peak_db[0] > -3.5 && state.peak_db[0] < 0.5);
        assert!(state.correlation > 0.9);
    }

    #[test]
    fn test_analyzer_taps_receive_samples() {
        let (mut engine, mut controller, mut taps) = EqEngine::create(SR, 2, BLOCK).unwrap();
        controller.tick(&[], &GlobalParams::default());

        let input = sine(440.0, BLOCK);
        let mut left = input.clone();
        let mut right = input.clone();
        run_block(&mut engine, &mut left, &mut right);

        assert_eq!(taps.pre[0].available(), BLOCK);
        assert_eq!(taps.post[0].available(), BLOCK);
        let mut out = vec![0.0f32; BLOCK];
        assert_eq!(taps.post[0].pull(&mut out), BLOCK);
    }
}
