//! Linear-phase processing path
//!
//! One partitioned convolver per physical channel plus a mid/side pair
//! for the front channels. Impulses arrive pre-partitioned from the
//! rebuild worker and are swapped in wholesale between blocks; the
//! superseded buffers leave in the same `ImpulseSet`, so the audio
//! thread never frees them. A head-size change ships a whole
//! pre-built convolver bank the same way.

use peq_core::{MidSideSample, Sample, StereoSample};
use peq_dsp::convolution::{PartitionedConvolver, PreparedImpulse};
use peq_dsp::Processor;

use crate::quality::latency_for_taps;

/// A complete rebuilt impulse response set, one entry per convolver slot
pub struct ImpulseSet {
    /// Per physical channel
    pub channels: Vec<PreparedImpulse>,
    /// Front-pair mid convolver, when any band targets mid
    pub mid: Option<PreparedImpulse>,
    /// Front-pair side convolver, when any band targets side
    pub side: Option<PreparedImpulse>,
    /// Fresh convolver bank when the head size changed; built on the
    /// rebuild worker so installing stays allocation-free
    pub bank: Option<ConvolverBank>,
    pub taps: usize,
    pub head_size: usize,
    /// Snapshot revision the set was built from
    pub revision: u64,
}

/// Convolver bank sized for one head partition size
pub struct ConvolverBank {
    channels: Vec<PartitionedConvolver>,
    mid: PartitionedConvolver,
    side: PartitionedConvolver,
    head_size: usize,
}

impl ConvolverBank {
    pub fn new(channel_count: usize, head_size: usize) -> Self {
        Self {
            channels: (0..channel_count)
                .map(|_| PartitionedConvolver::new(head_size))
                .collect(),
            mid: PartitionedConvolver::new(head_size),
            side: PartitionedConvolver::new(head_size),
            head_size,
        }
    }
}

/// Convolver bank for the linear-phase path
pub struct LinearPhaseEq {
    channels: Vec<PartitionedConvolver>,
    mid: PartitionedConvolver,
    side: PartitionedConvolver,
    ms_active: bool,
    head_size: usize,
    taps: usize,
    scratch_mid: Vec<f64>,
    scratch_side: Vec<f64>,
}

impl LinearPhaseEq {
    pub fn new(channel_count: usize, head_size: usize, max_block: usize) -> Self {
        let bank = ConvolverBank::new(channel_count, head_size);
        Self {
            channels: bank.channels,
            mid: bank.mid,
            side: bank.side,
            ms_active: false,
            head_size: bank.head_size,
            taps: 0,
            scratch_mid: vec![0.0; max_block],
            scratch_side: vec![0.0; max_block],
        }
    }

    /// Swap a finished impulse set in and return it carrying the
    /// superseded buffers, so the caller can hand them back for
    /// disposal off the audio thread. Only swaps; never allocates or
    /// frees. A set carrying a bank for a new head size swaps the
    /// whole convolver bank first.
    pub fn install(&mut self, mut set: ImpulseSet) -> ImpulseSet {
        if let Some(bank) = set.bank.as_mut() {
            if bank.head_size != self.head_size {
                log::debug!(
                    "linear-phase partitioning: head {} -> {}",
                    self.head_size,
                    bank.head_size
                );
                std::mem::swap(&mut self.channels, &mut bank.channels);
                std::mem::swap(&mut self.mid, &mut bank.mid);
                std::mem::swap(&mut self.side, &mut bank.side);
                self.head_size = bank.head_size;
                self.ms_active = false;
            }
        }
        if set.head_size != self.head_size {
            log::warn!(
                "impulse set for head {} on head {}, kept previous response",
                set.head_size,
                self.head_size
            );
            return set;
        }

        for (conv, impulse) in self.channels.iter_mut().zip(set.channels.iter_mut()) {
            conv.install(impulse);
        }
        self.ms_active = set.mid.is_some() || set.side.is_some();
        if let Some(mid) = set.mid.as_mut() {
            self.mid.install(mid);
        }
        if let Some(side) = set.side.as_mut() {
            self.side.install(side);
        }
        self.taps = set.taps;
        set
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn taps(&self) -> usize {
        self.taps
    }

    /// Symmetric-FIR group delay in samples
    pub fn latency_samples(&self) -> usize {
        latency_for_taps(self.taps)
    }

    /// Convolve one block in place
    pub fn process(&mut self, buffers: &mut [&mut [Sample]]) {
        let block_len = match buffers.first() {
            Some(buf) => buf.len(),
            None => return,
        };
        if self.scratch_mid.len() < block_len {
            self.scratch_mid.resize(block_len, 0.0);
            self.scratch_side.resize(block_len, 0.0);
        }

        // Mid/side responses run on the encoded front pair; the
        // per-channel convolvers then apply the channel responses.
        if self.ms_active && buffers.len() >= 2 {
            for i in 0..block_len {
                let ms = StereoSample::new(buffers[0][i], buffers[1][i]).to_mid_side();
                self.scratch_mid[i] = ms.mid;
                self.scratch_side[i] = ms.side;
            }
            self.mid.process_block(&mut self.scratch_mid[..block_len]);
            self.side.process_block(&mut self.scratch_side[..block_len]);
            for i in 0..block_len {
                let stereo = MidSideSample {
                    mid: self.scratch_mid[i],
                    side: self.scratch_side[i],
                }
                .to_stereo();
                buffers[0][i] = stereo.left;
                buffers[1][i] = stereo.right;
            }
        }

        for (conv, buffer) in self.channels.iter_mut().zip(buffers.iter_mut()) {
            conv.process_block(buffer);
        }
    }

    pub fn reset(&mut self) {
        for conv in &mut self.channels {
            conv.reset();
        }
        self.mid.reset();
        self.side.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_set(channel_count: usize, head_size: usize, taps: usize) -> ImpulseSet {
        ImpulseSet {
            channels: (0..channel_count)
                .map(|_| PreparedImpulse::identity(head_size))
                .collect(),
            mid: None,
            side: None,
            bank: None,
            taps,
            head_size,
            revision: 1,
        }
    }

    #[test]
    fn test_identity_bank_is_transparent() {
        let mut lp = LinearPhaseEq::new(2, 64, 128);
        lp.install(identity_set(2, 64, 257));

        let input: Vec<f64> = (0..128).map(|i| (i as f64 * 0.1).sin()).collect();
        let mut left = input.clone();
        let mut right = input.clone();
        let mut bufs: Vec<&mut [f64]> = vec![&mut left, &mut right];
        lp.process(&mut bufs);

        for i in 0..128 {
            assert!((left[i] - input[i]).abs() < 1e-12);
            assert!((right[i] - input[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_latency_from_taps() {
        let mut lp = LinearPhaseEq::new(2, 64, 128);
        assert_eq!(lp.latency_samples(), 0);
        lp.install(identity_set(2, 64, 257));
        assert_eq!(lp.latency_samples(), 128);
    }

    #[test]
    fn test_install_returns_set_for_disposal() {
        let mut lp = LinearPhaseEq::new(2, 64, 128);
        lp.install(identity_set(2, 64, 129));
        let retired = lp.install(identity_set(2, 64, 257));

        // The returned set still owns two channels' worth of buffers
        assert_eq!(retired.channels.len(), 2);
        assert_eq!(lp.taps(), 257);
    }

    #[test]
    fn test_bank_swap_changes_head_size() {
        let mut lp = LinearPhaseEq::new(2, 128, 128);
        lp.install(identity_set(2, 128, 511));
        assert_eq!(lp.head_size(), 128);

        let mut set = identity_set(2, 256, 1023);
        set.bank = Some(ConvolverBank::new(2, 256));
        let retired = lp.install(set);
        assert_eq!(lp.head_size(), 256);
        assert_eq!(lp.taps(), 1023);
        // The retired bank now holds the old head-128 convolvers
        assert_eq!(
            retired.bank.as_ref().map(|b| b.channels[0].head_size()),
            Some(128)
        );

        // Still transparent after the swap
        let input: Vec<f64> = (0..128).map(|i| (i as f64 * 0.1).sin()).collect();
        let mut left = input.clone();
        let mut right = input.clone();
        let mut bufs: Vec<&mut [f64]> = vec![&mut left, &mut right];
        lp.process(&mut bufs);
        for i in 0..128 {
            assert!((left[i] - input[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_mismatched_set_without_bank_keeps_previous() {
        let mut lp = LinearPhaseEq::new(2, 128, 128);
        lp.install(identity_set(2, 128, 511));
        lp.install(identity_set(2, 256, 1023));
        assert_eq!(lp.head_size(), 128);
        assert_eq!(lp.taps(), 511);
    }

    #[test]
    fn test_ms_set_round_trips_clean_pair() {
        // Identity mid and side responses must reconstruct L/R exactly
        let mut lp = LinearPhaseEq::new(2, 64, 128);
        let mut set = identity_set(2, 64, 129);
        set.mid = Some(PreparedImpulse::identity(64));
        set.side = Some(PreparedImpulse::identity(64));
        lp.install(set);

        let input_l: Vec<f64> = (0..128).map(|i| (i as f64 * 0.11).sin()).collect();
        let input_r: Vec<f64> = (0..128).map(|i| (i as f64 * 0.23).cos()).collect();
        let mut left = input_l.clone();
        let mut right = input_r.clone();
        let mut bufs: Vec<&mut [f64]> = vec![&mut left, &mut right];
        lp.process(&mut bufs);

        for i in 0..128 {
            assert!((left[i] - input_l[i]).abs() < 1e-9);
            assert!((right[i] - input_r[i]).abs() < 1e-9);
        }
    }
}
