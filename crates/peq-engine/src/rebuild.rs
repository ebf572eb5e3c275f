//! Background FIR rebuild worker
//!
//! A single dedicated thread turns parameter snapshots into partitioned
//! impulse sets. Jobs and results travel over bounded channels; the
//! control thread polls a busy flag instead of joining, and the audio
//! thread drains results with `try_recv` at block start. There is no
//! cancellation: a stale rebuild completes, is installed, and is then
//! superseded by the next one.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use peq_dsp::convolution::PreparedImpulse;
use peq_dsp::fir::{FirDesigner, FirWindow};
use peq_dsp::params::{BandParams, MsTarget, MAX_BANDS};

use crate::linear_phase::{ConvolverBank, ImpulseSet};
use crate::quality::latency_for_taps;
use crate::snapshot::ParamSnapshot;

/// Front stereo pair mask; mid/side FIR responses apply here only
const FRONT_PAIR_MASK: u32 = 0b11;

/// Everything the worker needs to rebuild an impulse set
pub struct RebuildJob {
    pub bands: [BandParams; MAX_BANDS],
    pub ms_targets: [MsTarget; MAX_BANDS],
    pub band_channel_masks: [u32; MAX_BANDS],
    pub channel_count: usize,
    pub sample_rate: f64,
    pub taps: usize,
    pub head_size: usize,
    pub window: FirWindow,
    pub revision: u64,
    /// Ship a fresh convolver bank with the set, for a head-size change
    pub build_bank: bool,
}

impl RebuildJob {
    pub fn from_snapshot(
        snapshot: &ParamSnapshot,
        sample_rate: f64,
        taps: usize,
        head_size: usize,
    ) -> Self {
        Self {
            bands: snapshot.bands,
            ms_targets: snapshot.ms_targets,
            band_channel_masks: snapshot.band_channel_masks,
            channel_count: snapshot.channel_count,
            sample_rate,
            taps,
            head_size,
            window: snapshot.fir_window,
            revision: snapshot.revision,
            build_bank: false,
        }
    }

    fn band_active(&self, index: usize) -> bool {
        self.bands[index].enabled && !self.bands[index].bypassed
    }

    /// Bands contributing to one physical channel's FIR response.
    /// Mid/side bands on the front pair are excluded; they get their
    /// own convolvers. M/S bands on other pairs degrade to plain
    /// per-channel magnitude.
    fn channel_bands(&self, channel: usize) -> Vec<BandParams> {
        (0..MAX_BANDS)
            .filter(|&i| {
                self.band_active(i)
                    && self.band_channel_masks[i] & (1 << channel) != 0
                    && !(self.ms_targets[i] != MsTarget::None
                        && self.band_channel_masks[i] == FRONT_PAIR_MASK)
            })
            .map(|i| self.bands[i])
            .collect()
    }

    fn ms_bands(&self, target: MsTarget) -> Vec<BandParams> {
        (0..MAX_BANDS)
            .filter(|&i| {
                self.band_active(i)
                    && self.ms_targets[i] == target
                    && self.band_channel_masks[i] == FRONT_PAIR_MASK
            })
            .map(|i| self.bands[i])
            .collect()
    }
}

/// Handle held by the control thread
pub struct RebuildWorker {
    job_tx: Option<Sender<RebuildJob>>,
    busy: Arc<AtomicBool>,
    pending_latency: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl RebuildWorker {
    /// Spawn the worker. The returned receiver belongs to the audio
    /// side; it is drained non-blockingly at block start.
    pub fn spawn() -> (Self, Receiver<ImpulseSet>) {
        let (job_tx, job_rx) = bounded::<RebuildJob>(1);
        let (result_tx, result_rx) = bounded::<ImpulseSet>(2);
        let busy = Arc::new(AtomicBool::new(false));
        let pending_latency = Arc::new(AtomicUsize::new(0));

        let worker_busy = Arc::clone(&busy);
        let handle = std::thread::Builder::new()
            .name("peq-fir-rebuild".into())
            .spawn(move || {
                for job in job_rx.iter() {
                    let revision = job.revision;
                    let set = build_impulse_set(&job);
                    if result_tx.try_send(set).is_err() {
                        log::warn!("impulse set for revision {revision} dropped, audio side behind");
                    }
                    worker_busy.store(false, Ordering::Release);
                }
            })
            .ok();

        (
            Self {
                job_tx: Some(job_tx),
                busy,
                pending_latency,
                handle,
            },
            result_rx,
        )
    }

    /// True while a rebuild is queued or running
    pub fn busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Latency of the most recently submitted job, in samples
    pub fn pending_latency(&self) -> usize {
        self.pending_latency.load(Ordering::Acquire)
    }

    /// Queue a rebuild. Returns false when the worker is still busy;
    /// the caller retries on a later tick.
    pub fn submit(&self, job: RebuildJob) -> bool {
        if self.busy.swap(true, Ordering::AcqRel) {
            return false;
        }
        let latency = latency_for_taps(job.taps);
        let revision = job.revision;
        match self.job_tx.as_ref() {
            Some(tx) if tx.try_send(job).is_ok() => {
                self.pending_latency.store(latency, Ordering::Release);
                log::debug!("FIR rebuild scheduled for revision {revision}");
                true
            }
            _ => {
                self.busy.store(false, Ordering::Release);
                false
            }
        }
    }
}

impl Drop for RebuildWorker {
    fn drop(&mut self) {
        self.job_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Design and partition every impulse in the set. Worker thread only.
fn build_impulse_set(job: &RebuildJob) -> ImpulseSet {
    let designer = FirDesigner::new(job.sample_rate, job.taps);

    let channels = (0..job.channel_count)
        .map(|ch| {
            let bands = job.channel_bands(ch);
            let fir = designer.design(&bands, job.taps, job.window);
            PreparedImpulse::prepare(&fir, job.head_size)
        })
        .collect();

    let ms_impulse = |target: MsTarget| {
        let bands = job.ms_bands(target);
        if bands.is_empty() {
            None
        } else {
            let fir = designer.design(&bands, job.taps, job.window);
            Some(PreparedImpulse::prepare(&fir, job.head_size))
        }
    };

    ImpulseSet {
        channels,
        mid: ms_impulse(MsTarget::Mid),
        side: ms_impulse(MsTarget::Side),
        bank: job
            .build_bank
            .then(|| ConvolverBank::new(job.channel_count, job.head_size)),
        taps: job.taps,
        head_size: job.head_size,
        revision: job.revision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peq_dsp::params::{ChannelRole, FilterShape};
    use std::time::Duration;

    fn snapshot_with_band(role: ChannelRole) -> ParamSnapshot {
        let mut snapshot = ParamSnapshot::default();
        snapshot.bands[0] = BandParams {
            enabled: true,
            shape: FilterShape::Bell,
            frequency_hz: 1000.0,
            gain_db: 6.0,
            q: 1.0,
            role,
            ..Default::default()
        };
        snapshot.revision = 42;
        snapshot.resolve();
        snapshot
    }

    #[test]
    fn test_worker_builds_and_clears_busy() {
        let (worker, results) = RebuildWorker::spawn();
        let snapshot = snapshot_with_band(ChannelRole::All);
        let job = RebuildJob::from_snapshot(&snapshot, 48000.0, 256, 64);

        assert!(worker.submit(job));
        assert_eq!(worker.pending_latency(), 127);

        let set = results.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(set.channels.len(), 2);
        assert_eq!(set.taps, 256);
        assert_eq!(set.revision, 42);
        assert!(set.mid.is_none());

        // Busy clears after the result is posted
        for _ in 0..100 {
            if !worker.busy() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!worker.busy());
    }

    #[test]
    fn test_mid_band_produces_ms_impulses() {
        let (worker, results) = RebuildWorker::spawn();
        let snapshot = snapshot_with_band(ChannelRole::Mid);
        let job = RebuildJob::from_snapshot(&snapshot, 48000.0, 128, 64);

        assert!(worker.submit(job));
        let set = results.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(set.mid.is_some());
        assert!(set.side.is_none());
    }

    #[test]
    fn test_submit_while_busy_is_rejected() {
        let (worker, results) = RebuildWorker::spawn();
        let snapshot = snapshot_with_band(ChannelRole::All);

        // Large design keeps the worker occupied long enough to observe
        assert!(worker.submit(RebuildJob::from_snapshot(&snapshot, 48000.0, 8192, 1024)));
        let rejected = !worker.submit(RebuildJob::from_snapshot(&snapshot, 48000.0, 128, 64));
        let _ = results.recv_timeout(Duration::from_secs(20));
        assert!(rejected);
    }

    #[test]
    fn test_head_change_job_carries_bank() {
        let (worker, results) = RebuildWorker::spawn();
        let snapshot = snapshot_with_band(ChannelRole::All);
        let mut job = RebuildJob::from_snapshot(&snapshot, 48000.0, 256, 128);
        job.build_bank = true;

        assert!(worker.submit(job));
        let set = results.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(set.bank.is_some());
        assert_eq!(set.head_size, 128);
    }

    #[test]
    fn test_channel_band_selection_honours_masks() {
        let mut snapshot = snapshot_with_band(ChannelRole::Left);
        snapshot.resolve();
        let job = RebuildJob::from_snapshot(&snapshot, 48000.0, 128, 64);

        assert_eq!(job.channel_bands(0).len(), 1);
        assert_eq!(job.channel_bands(1).len(), 0);
    }
}
