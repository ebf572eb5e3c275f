//! Parameter snapshots and the lock-free double buffer
//!
//! The control thread builds a complete `ParamSnapshot` each tick and
//! publishes it by flipping an atomic index; the audio thread copies the
//! active snapshot once at block start. Every block therefore processes
//! with parameters from exactly one tick.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use sha2::{Digest, Sha256};

use peq_dsp::fir::FirWindow;
use peq_dsp::params::{
    BandParams, CharacterMode, MsTarget, PhaseMode, QMode, MAX_BANDS,
};

/// One audio block's complete processing configuration.
///
/// Immutable after `resolve`; the audio thread never validates fields
/// because `BandParams::clamped` ran at build time.
#[derive(Debug, Clone, Copy)]
pub struct ParamSnapshot {
    pub channel_count: usize,
    pub bypass: bool,
    /// Global dry/wet, 0..1
    pub mix: f64,
    pub output_trim_db: f64,
    pub phase_invert: bool,
    pub character: CharacterMode,
    pub auto_gain: bool,
    pub q_mode: QMode,
    pub q_amount: f64,
    pub smart_solo: bool,
    pub phase_mode: PhaseMode,
    /// Requested quality tier, 0..4
    pub quality_tier: usize,
    pub fir_window: FirWindow,
    pub bands: [BandParams; MAX_BANDS],
    /// Resolved M/S target per band
    pub ms_targets: [MsTarget; MAX_BANDS],
    /// Resolved physical-channel bitmask per band
    pub band_channel_masks: [u32; MAX_BANDS],
    /// Monotonic tick counter, bumped on every publish
    pub revision: u64,
}

impl Default for ParamSnapshot {
    fn default() -> Self {
        Self {
            channel_count: 2,
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
            quality_tier: crate::quality::DEFAULT_TIER,
            fir_window: FirWindow::Hann,
            bands: [BandParams::default(); MAX_BANDS],
            ms_targets: [MsTarget::None; MAX_BANDS],
            band_channel_masks: [0; MAX_BANDS],
            revision: 0,
        }
    }
}

impl ParamSnapshot {
    /// Clamp every band and resolve channel routing for the layout.
    /// Runs on the control thread before publication.
    pub fn resolve(&mut self) {
        for i in 0..MAX_BANDS {
            self.bands[i] = self.bands[i].clamped();
            let routing = self.bands[i].role.resolve(self.channel_count);
            self.ms_targets[i] = routing.ms_target;
            self.band_channel_masks[i] = routing.channel_mask;
        }
    }

    /// Fingerprint of the band parameters that shape the FIR response.
    /// Used by the rebuild scheduler to detect changes worth a rebuild.
    pub fn band_hash(&self) -> u64 {
        let mut hasher = Sha256::new();
        for band in &self.bands {
            hasher.update([
                band.enabled as u8,
                band.bypassed as u8,
                band.shape as u8,
                band.role as u8,
            ]);
            hasher.update(band.frequency_hz.to_le_bytes());
            hasher.update(band.gain_db.to_le_bytes());
            hasher.update(band.q.to_le_bytes());
            hasher.update(band.slope_db.to_le_bytes());
            hasher.update(band.mix.to_le_bytes());
        }
        hasher.update(self.channel_count.to_le_bytes());

        let digest = hasher.finalize();
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(first)
    }
}

/// Two-slot snapshot exchange between the control and audio threads.
///
/// Single writer, single reader. The writer fills the inactive slot and
/// flips the index with Release; the reader loads the index with Acquire
/// and copies that slot. The writer cadence (~10 Hz) is orders of
/// magnitude slower than a block, so the slot a reader is copying is
/// never the one being written.
pub struct SnapshotBuffer {
    slots: [UnsafeCell<ParamSnapshot>; 2],
    active: AtomicUsize,
}

// Safety: the single-writer/single-reader contract above; slots are only
// accessed through `publish` (writer) and `read_into` (reader).
unsafe impl Sync for SnapshotBuffer {}
unsafe impl Send for SnapshotBuffer {}

impl SnapshotBuffer {
    pub fn new() -> Self {
        Self {
            slots: [
                UnsafeCell::new(ParamSnapshot::default()),
                UnsafeCell::new(ParamSnapshot::default()),
            ],
            active: AtomicUsize::new(0),
        }
    }

    /// Write the inactive slot and make it active. Control thread only.
    pub fn publish(&self, snapshot: &ParamSnapshot) {
        let inactive = 1 - self.active.load(Ordering::Relaxed);
        unsafe {
            *self.slots[inactive].get() = *snapshot;
        }
        self.active.store(inactive, Ordering::Release);
    }

    /// Copy the active snapshot. Audio thread only, once per block.
    pub fn read_into(&self, out: &mut ParamSnapshot) {
        let active = self.active.load(Ordering::Acquire);
        unsafe {
            *out = *self.slots[active].get();
        }
    }
}

impl Default for SnapshotBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peq_dsp::params::ChannelRole;

    #[test]
    fn test_resolve_clamps_and_routes() {
        let mut snapshot = ParamSnapshot::default();
        snapshot.bands[0].enabled = true;
        snapshot.bands[0].gain_db = 200.0;
        snapshot.bands[0].role = ChannelRole::Mid;
        snapshot.resolve();

        assert_eq!(snapshot.bands[0].gain_db, 48.0);
        assert_eq!(snapshot.ms_targets[0], MsTarget::Mid);
        assert_eq!(snapshot.band_channel_masks[0], 0b11);
    }

    #[test]
    fn test_band_hash_tracks_band_changes() {
        let mut a = ParamSnapshot::default();
        a.resolve();
        let base = a.band_hash();

        let mut b = a;
        b.bands[3].gain_db = 1.5;
        assert_ne!(b.band_hash(), base);

        // Globals that do not shape the response leave the hash alone
        let mut c = a;
        c.mix = 0.3;
        c.output_trim_db = -6.0;
        assert_eq!(c.band_hash(), base);
    }

    #[test]
    fn test_publish_read_round_trip() {
        let buffer = SnapshotBuffer::new();
        let mut snapshot = ParamSnapshot::default();
        snapshot.revision = 7;
        snapshot.mix = 0.25;
        buffer.publish(&snapshot);

        let mut out = ParamSnapshot::default();
        buffer.read_into(&mut out);
        assert_eq!(out.revision, 7);
        assert_eq!(out.mix, 0.25);
    }

    #[test]
    fn test_snapshot_atomicity_under_publication() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::time::Duration;

        let buffer = Arc::new(SnapshotBuffer::new());
        let done = Arc::new(AtomicBool::new(false));
        let writer_buffer = Arc::clone(&buffer);
        let writer_done = Arc::clone(&done);

        // Writer stamps every parameter field with the same tick value;
        // any torn read shows two different stamps in one snapshot. The
        // sleep models the control-tick cadence the buffer documents: a
        // publish interval far longer than one snapshot copy.
        let writer = std::thread::spawn(move || {
            for tick in 1..400u64 {
                let mut snapshot = ParamSnapshot::default();
                snapshot.revision = tick;
                snapshot.mix = tick as f64;
                snapshot.output_trim_db = tick as f64;
                for band in snapshot.bands.iter_mut() {
                    band.gain_db = tick as f64;
                }
                writer_buffer.publish(&snapshot);
                std::thread::sleep(Duration::from_micros(200));
            }
            writer_done.store(true, Ordering::Release);
        });

        let mut out = ParamSnapshot::default();
        while !done.load(Ordering::Acquire) {
            buffer.read_into(&mut out);
            if out.revision == 0 {
                continue;
            }
            let stamp = out.revision as f64;
            assert_eq!(out.mix, stamp);
            assert_eq!(out.output_trim_db, stamp);
            for band in &out.bands {
                assert_eq!(band.gain_db, stamp);
            }
        }
        writer.join().unwrap();
    }
}
