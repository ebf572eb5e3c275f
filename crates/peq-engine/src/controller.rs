//! Control-thread tick
//!
//! Runs at UI cadence (~10 Hz). Each tick builds a fresh snapshot from
//! the host-owned parameters, publishes it, and drives the FIR rebuild
//! debounce. Never touches audio buffers.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;

use peq_dsp::fir::FirWindow;
use peq_dsp::params::{BandParams, CharacterMode, PhaseMode, QMode, MAX_BANDS};

use crate::linear_phase::ImpulseSet;
use crate::quality::{self, DEFAULT_TIER, QUALITY_TIERS};
use crate::rebuild::{RebuildJob, RebuildWorker};
use crate::snapshot::{ParamSnapshot, SnapshotBuffer};

/// Quiet ticks a parameter change waits before triggering a rebuild,
/// so continuous dragging does not thrash the worker
const DEBOUNCE_TICKS: u32 = 6;

/// Host-owned global settings, sampled once per tick
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct GlobalParams {
    pub bypass: bool,
    pub mix: f64,
    pub output_trim_db: f64,
    pub phase_invert: bool,
    pub character: CharacterMode,
    pub auto_gain: bool,
    pub q_mode: QMode,
    pub q_amount: f64,
    pub smart_solo: bool,
    pub phase_mode: PhaseMode,
    pub quality_tier: usize,
    pub fir_window: FirWindow,
}

impl Default for GlobalParams {
    fn default() -> Self {
        Self {
            bypass: false,
            mix: 1.0,
            output_trim_db: 0.0,
            phase_invert: false,
            character: CharacterMode::Clean,
            auto_gain: false,
            q_mode: QMode::Fixed,
            q_amount: 1.0,
            smart_solo: false,
            phase_mode: PhaseMode::RealTime,
            quality_tier: DEFAULT_TIER,
            fir_window: FirWindow::Hann,
        }
    }
}

/// The control-side half of the EQ
pub struct EqController {
    buffer: Arc<SnapshotBuffer>,
    worker: RebuildWorker,
    retire_rx: Receiver<ImpulseSet>,
    quality_offset: Arc<AtomicI32>,
    sample_rate: f64,
    channel_count: usize,
    snapshot: ParamSnapshot,
    revision: u64,
    last_hash: u64,
    quiet_ticks: u32,
    rebuild_pending: bool,
    last_config: Option<(PhaseMode, usize, FirWindow)>,
    last_latency: usize,
    engine_head: usize,
}

impl EqController {
    pub(crate) fn new(
        buffer: Arc<SnapshotBuffer>,
        worker: RebuildWorker,
        retire_rx: Receiver<ImpulseSet>,
        quality_offset: Arc<AtomicI32>,
        sample_rate: f64,
        channel_count: usize,
    ) -> Self {
        Self {
            buffer,
            worker,
            retire_rx,
            quality_offset,
            sample_rate,
            channel_count,
            snapshot: ParamSnapshot::default(),
            revision: 0,
            last_hash: 0,
            quiet_ticks: 0,
            rebuild_pending: false,
            last_config: None,
            last_latency: 0,
            engine_head: quality::head_size_for(DEFAULT_TIER),
        }
    }

    /// True while a FIR rebuild is queued or running
    pub fn rebuild_busy(&self) -> bool {
        self.worker.busy()
    }

    /// Current adaptive quality offset, as reported by the audio side
    pub fn quality_offset(&self) -> i32 {
        self.quality_offset.load(Ordering::Acquire)
    }

    /// Build and publish a snapshot, drive the rebuild schedule.
    /// Returns the new latency to report to the host when it changed.
    pub fn tick(&mut self, bands: &[BandParams], globals: &GlobalParams) -> Option<usize> {
        self.revision += 1;

        // Free impulse buffers the audio thread retired
        while self.retire_rx.try_recv().is_ok() {}

        self.snapshot.channel_count = self.channel_count;
        self.snapshot.bypass = globals.bypass;
        self.snapshot.mix = globals.mix.clamp(0.0, 1.0);
        self.snapshot.output_trim_db = globals.output_trim_db.clamp(-48.0, 48.0);
        self.snapshot.phase_invert = globals.phase_invert;
        self.snapshot.character = globals.character;
        self.snapshot.auto_gain = globals.auto_gain;
        self.snapshot.q_mode = globals.q_mode;
        self.snapshot.q_amount = globals.q_amount.clamp(0.0, 1.0);
        self.snapshot.smart_solo = globals.smart_solo;
        self.snapshot.phase_mode = globals.phase_mode;
        self.snapshot.quality_tier = globals.quality_tier.min(QUALITY_TIERS - 1);
        self.snapshot.fir_window = globals.fir_window;
        self.snapshot.revision = self.revision;

        self.snapshot.bands = [BandParams::default(); MAX_BANDS];
        for (slot, band) in self.snapshot.bands.iter_mut().zip(bands.iter()) {
            *slot = *band;
        }
        self.snapshot.resolve();

        self.buffer.publish(&self.snapshot);

        let hash = self.snapshot.band_hash();
        let mut latency = 0;

        if globals.phase_mode.is_linear_phase() {
            let offset = self.quality_offset.load(Ordering::Acquire);
            let tier = (self.snapshot.quality_tier as i32 + offset)
                .clamp(0, QUALITY_TIERS as i32 - 1) as usize;
            let taps = quality::taps_for(globals.phase_mode, tier);
            latency = quality::latency_for_taps(taps);

            let config = (globals.phase_mode, tier, globals.fir_window);
            if self.last_config != Some(config) {
                // Configuration changes rebuild immediately
                self.last_config = Some(config);
                self.rebuild_pending = true;
                self.quiet_ticks = DEBOUNCE_TICKS;
            } else if hash != self.last_hash {
                self.rebuild_pending = true;
                self.quiet_ticks = 0;
            } else if self.rebuild_pending {
                self.quiet_ticks += 1;
            }

            if self.rebuild_pending
                && self.quiet_ticks >= DEBOUNCE_TICKS
                && !self.worker.busy()
            {
                let head = quality::head_size_for(tier);
                let mut job =
                    RebuildJob::from_snapshot(&self.snapshot, self.sample_rate, taps, head);
                // A head-size change needs a worker-built convolver bank
                job.build_bank = head != self.engine_head;
                if self.worker.submit(job) {
                    self.rebuild_pending = false;
                    self.engine_head = head;
                    latency = self.worker.pending_latency();
                }
            }
        } else {
            self.last_config = None;
            self.rebuild_pending = false;
        }
        self.last_hash = hash;

        if latency != self.last_latency {
            self.last_latency = latency;
            log::info!("reported latency changed to {latency} samples");
            Some(latency)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EqEngine;
    use peq_dsp::params::{ChannelRole, FilterShape};
    use std::time::Duration;

    fn bell(gain: f64) -> BandParams {
        BandParams {
            enabled: true,
            shape: FilterShape::Bell,
            frequency_hz: 1000.0,
            gain_db: gain,
            q: 1.0,
            role: ChannelRole::All,
            ..Default::default()
        }
    }

    fn wait_idle(controller: &EqController) {
        for _ in 0..500 {
            if !controller.rebuild_busy() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("rebuild never finished");
    }

    #[test]
    fn test_realtime_mode_reports_zero_latency_once() {
        let (_engine, mut controller, _taps) = EqEngine::create(48000.0, 2, 256).unwrap();
        assert_eq!(controller.tick(&[], &GlobalParams::default()), None);
        assert_eq!(controller.tick(&[], &GlobalParams::default()), None);
    }

    #[test]
    fn test_mode_switch_reports_latency_and_schedules() {
        let (_engine, mut controller, _taps) = EqEngine::create(48000.0, 2, 256).unwrap();
        controller.tick(&[bell(6.0)], &GlobalParams::default());

        let globals = GlobalParams {
            phase_mode: PhaseMode::Linear,
            quality_tier: 0,
            ..Default::default()
        };
        // Linear tier 0 = 512 taps
        assert_eq!(controller.tick(&[bell(6.0)], &globals), Some(255));
        assert!(controller.rebuild_busy());
        wait_idle(&controller);

        // Back to real time: latency drops to zero
        assert_eq!(controller.tick(&[bell(6.0)], &GlobalParams::default()), Some(0));
    }

    #[test]
    fn test_reported_latency_is_pending_before_install() {
        let (_engine, mut controller, _taps) = EqEngine::create(48000.0, 2, 256).unwrap();
        let globals = GlobalParams {
            phase_mode: PhaseMode::Linear,
            quality_tier: 4,
            ..Default::default()
        };

        // Linear tier 4 = 8192 taps; the latency comes from the worker's
        // pending value at submit time, while the rebuild still runs
        assert_eq!(controller.tick(&[bell(6.0)], &globals), Some(4095));
        assert!(controller.rebuild_busy());
        wait_idle(&controller);
    }

    #[test]
    fn test_parameter_change_debounces() {
        let (_engine, mut controller, _taps) = EqEngine::create(48000.0, 2, 256).unwrap();
        let globals = GlobalParams {
            phase_mode: PhaseMode::Natural,
            quality_tier: 0,
            ..Default::default()
        };

        // First tick is a config change: immediate rebuild
        controller.tick(&[bell(6.0)], &globals);
        wait_idle(&controller);

        // A band edit must wait out the quiet period
        controller.tick(&[bell(7.0)], &globals);
        for _ in 0..DEBOUNCE_TICKS - 1 {
            assert!(
                !controller.rebuild_busy(),
                "rebuild fired before the debounce elapsed"
            );
            controller.tick(&[bell(7.0)], &globals);
        }
        controller.tick(&[bell(7.0)], &globals);
        assert!(controller.rebuild_busy());
        wait_idle(&controller);
    }

    #[test]
    fn test_dragging_defers_rebuild() {
        let (_engine, mut controller, _taps) = EqEngine::create(48000.0, 2, 256).unwrap();
        let globals = GlobalParams {
            phase_mode: PhaseMode::Natural,
            quality_tier: 0,
            ..Default::default()
        };
        controller.tick(&[bell(6.0)], &globals);
        wait_idle(&controller);

        // Continuous dragging: the hash changes every tick, so the
        // quiet counter never accumulates
        for step in 0..20 {
            controller.tick(&[bell(6.0 + step as f64 * 0.1)], &globals);
            assert!(!controller.rebuild_busy());
        }
    }
}
