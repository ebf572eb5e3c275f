//! Partitioned convolution
//!
//! Uniform partitioning with a direct time-domain head stage: the first
//! `head_size` taps run as plain FIR against the input history, so the
//! convolver itself adds no buffering latency. The remaining taps are
//! split into `head_size` segments convolved in the frequency domain
//! one block behind, which is exactly the delay those taps carry anyway.
//!
//! Impulse preparation (FFT of the segments) happens off the audio
//! thread; `install` only swaps buffers.

use std::sync::Arc;

use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;

use peq_core::Sample;

use crate::Processor;

/// Smallest supported head partition
pub const MIN_HEAD_SIZE: usize = 64;

/// Largest supported head partition
pub const MAX_HEAD_SIZE: usize = 1024;

/// An impulse response pre-partitioned for a specific head size.
///
/// Built on the rebuild worker; installing it into a convolver is a
/// pointer swap.
pub struct PreparedImpulse {
    head_ir: Vec<f64>,
    partitions: Vec<Vec<Complex<f64>>>,
    fdl: Vec<Vec<Complex<f64>>>,
    head_size: usize,
    taps: usize,
}

impl PreparedImpulse {
    /// Partition `ir` for a convolver with the given head size.
    /// Runs FFTs; call from the rebuild worker only.
    pub fn prepare(ir: &[f64], head_size: usize) -> Self {
        let head_size = head_size.clamp(MIN_HEAD_SIZE, MAX_HEAD_SIZE);
        let fft_size = head_size * 2;
        let spectrum_len = head_size + 1;

        let mut planner = RealFftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(fft_size);

        let mut head_ir = vec![0.0; head_size];
        let head_len = ir.len().min(head_size);
        head_ir[..head_len].copy_from_slice(&ir[..head_len]);

        let mut partitions = Vec::new();
        let mut offset = head_size;
        while offset < ir.len() {
            let end = (offset + head_size).min(ir.len());
            let mut padded = vec![0.0; fft_size];
            padded[..end - offset].copy_from_slice(&ir[offset..end]);

            let mut spectrum = vec![Complex::new(0.0, 0.0); spectrum_len];
            fft.process(&mut padded, &mut spectrum).ok();
            partitions.push(spectrum);

            offset = end;
        }

        let fdl = (0..partitions.len())
            .map(|_| vec![Complex::new(0.0, 0.0); spectrum_len])
            .collect();

        Self {
            head_ir,
            partitions,
            fdl,
            head_size,
            taps: ir.len(),
        }
    }

    /// Identity impulse (unity passthrough)
    pub fn identity(head_size: usize) -> Self {
        let mut ir = vec![0.0; 1];
        ir[0] = 1.0;
        Self::prepare(&ir, head_size)
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn taps(&self) -> usize {
        self.taps
    }
}

/// Single-channel partitioned convolver
pub struct PartitionedConvolver {
    head_ir: Vec<f64>,
    partitions: Vec<Vec<Complex<f64>>>,

    // Direct-stage input history ring
    history: Vec<f64>,
    hist_pos: usize,

    // Frequency delay line of recent input spectra, newest at fdl_pos
    fdl: Vec<Vec<Complex<f64>>>,
    fdl_pos: usize,

    // Overlap-save window: previous block in the first half, the block
    // being accumulated in the second
    input_window: Vec<f64>,
    window_pos: usize,

    // Tail contribution for the block currently playing out
    tail_out: Vec<f64>,

    fft_forward: Arc<dyn RealToComplex<f64>>,
    fft_inverse: Arc<dyn ComplexToReal<f64>>,

    // Scratch, preallocated
    scratch_time: Vec<f64>,
    scratch_spectrum: Vec<Complex<f64>>,
    scratch_acc: Vec<Complex<f64>>,

    head_size: usize,
}

impl PartitionedConvolver {
    pub fn new(head_size: usize) -> Self {
        let head_size = head_size.clamp(MIN_HEAD_SIZE, MAX_HEAD_SIZE);
        let fft_size = head_size * 2;
        let spectrum_len = head_size + 1;
        let mut planner = RealFftPlanner::<f64>::new();

        let identity = PreparedImpulse::identity(head_size);

        Self {
            head_ir: identity.head_ir,
            partitions: identity.partitions,
            history: vec![0.0; head_size],
            hist_pos: 0,
            fdl: identity.fdl,
            fdl_pos: 0,
            input_window: vec![0.0; fft_size],
            window_pos: 0,
            tail_out: vec![0.0; head_size],
            fft_forward: planner.plan_fft_forward(fft_size),
            fft_inverse: planner.plan_fft_inverse(fft_size),
            scratch_time: vec![0.0; fft_size],
            scratch_spectrum: vec![Complex::new(0.0, 0.0); spectrum_len],
            scratch_acc: vec![Complex::new(0.0, 0.0); spectrum_len],
            head_size,
        }
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    /// Swap in a prepared impulse, leaving the superseded buffers in
    /// `prepared` so the caller can drop them off the audio thread.
    /// No FFT work, no allocation, no deallocation. A mismatched head
    /// size is ignored; the caller swaps in a matching convolver bank
    /// before installing impulses.
    pub fn install(&mut self, prepared: &mut PreparedImpulse) {
        if prepared.head_size != self.head_size {
            log::warn!(
                "impulse prepared for head {} installed on head {}, dropped",
                prepared.head_size,
                self.head_size
            );
            return;
        }

        std::mem::swap(&mut self.head_ir, &mut prepared.head_ir);
        // The FDL holds input spectra, not filter state, so it survives
        // an impulse swap when the partition count matches.
        if prepared.partitions.len() != self.fdl.len() {
            std::mem::swap(&mut self.fdl, &mut prepared.fdl);
            self.fdl_pos = 0;
        }
        std::mem::swap(&mut self.partitions, &mut prepared.partitions);
    }

    /// Process one sample
    #[inline]
    pub fn process_sample(&mut self, input: Sample) -> Sample {
        let head = self.head_size;

        self.history[self.hist_pos] = input;
        let mut direct = 0.0;
        for (j, &h) in self.head_ir.iter().enumerate() {
            let idx = (self.hist_pos + head - j) % head;
            direct += h * self.history[idx];
        }
        self.hist_pos = (self.hist_pos + 1) % head;

        let output = direct + self.tail_out[self.window_pos];

        self.input_window[head + self.window_pos] = input;
        self.window_pos += 1;
        if self.window_pos == head {
            self.advance_tail();
            self.window_pos = 0;
        }

        output
    }

    pub fn process_block(&mut self, buffer: &mut [Sample]) {
        for sample in buffer.iter_mut() {
            *sample = self.process_sample(*sample);
        }
    }

    /// Completed an input block: push its spectrum into the FDL and
    /// compute the tail contribution for the next block.
    fn advance_tail(&mut self) {
        let head = self.head_size;
        let fft_size = head * 2;

        if self.partitions.is_empty() {
            self.tail_out.fill(0.0);
            // Still maintain the overlap window
            self.input_window.copy_within(head..fft_size, 0);
            return;
        }

        self.scratch_time.copy_from_slice(&self.input_window);
        self.fft_forward
            .process(&mut self.scratch_time, &mut self.scratch_spectrum)
            .ok();

        let slots = self.fdl.len();
        self.fdl_pos = (self.fdl_pos + 1) % slots;
        self.fdl[self.fdl_pos].copy_from_slice(&self.scratch_spectrum);

        for bin in self.scratch_acc.iter_mut() {
            *bin = Complex::new(0.0, 0.0);
        }
        for (p, partition) in self.partitions.iter().enumerate() {
            let slot = &self.fdl[(self.fdl_pos + slots - p) % slots];
            for ((acc, x), h) in self.scratch_acc.iter_mut().zip(slot).zip(partition) {
                *acc += x * h;
            }
        }

        self.fft_inverse
            .process(&mut self.scratch_acc, &mut self.scratch_time)
            .ok();

        // Overlap-save: the second half is the valid linear convolution
        let norm = 1.0 / fft_size as f64;
        for (out, &sample) in self.tail_out.iter_mut().zip(&self.scratch_time[head..]) {
            *out = sample * norm;
        }

        self.input_window.copy_within(head..fft_size, 0);
    }
}

impl Processor for PartitionedConvolver {
    fn reset(&mut self) {
        self.history.fill(0.0);
        self.hist_pos = 0;
        for slot in &mut self.fdl {
            slot.fill(Complex::new(0.0, 0.0));
        }
        self.fdl_pos = 0;
        self.input_window.fill(0.0);
        self.window_pos = 0;
        self.tail_out.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convolve_reference(ir: &[f64], input: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; input.len()];
        for (n, o) in out.iter_mut().enumerate() {
            for (k, &h) in ir.iter().enumerate() {
                if n >= k {
                    *o += h * input[n - k];
                }
            }
        }
        out
    }

    #[test]
    fn test_identity_passthrough() {
        let mut conv = PartitionedConvolver::new(64);
        for i in 0..512 {
            let x = (i as f64 * 0.13).sin();
            let y = conv.process_sample(x);
            assert!((y - x).abs() < 1e-12);
        }
    }

    #[test]
    fn test_head_only_impulse() {
        // IR shorter than the head runs entirely in the direct stage
        let ir = vec![0.5, 0.25, -0.125];
        let mut conv = PartitionedConvolver::new(64);
        conv.install(&mut PreparedImpulse::prepare(&ir, 64));

        let input: Vec<f64> = (0..256).map(|i| (i as f64 * 0.07).sin()).collect();
        let expected = convolve_reference(&ir, &input);

        for (n, &x) in input.iter().enumerate() {
            let y = conv.process_sample(x);
            assert!((y - expected[n]).abs() < 1e-9, "mismatch at {n}");
        }
    }

    #[test]
    fn test_long_impulse_matches_direct_convolution() {
        // IR spanning the head plus several tail partitions
        let ir: Vec<f64> = (0..300)
            .map(|i| ((i as f64 * 0.31).sin()) / (1.0 + i as f64 * 0.1))
            .collect();
        let mut conv = PartitionedConvolver::new(64);
        conv.install(&mut PreparedImpulse::prepare(&ir, 64));

        let input: Vec<f64> = (0..1024).map(|i| (i as f64 * 0.05).cos()).collect();
        let expected = convolve_reference(&ir, &input);

        for (n, &x) in input.iter().enumerate() {
            let y = conv.process_sample(x);
            assert!((y - expected[n]).abs() < 1e-9, "mismatch at {n}");
        }
    }

    #[test]
    fn test_zero_added_latency() {
        // A delta IR must come back in the same sample
        let ir = vec![1.0];
        let mut conv = PartitionedConvolver::new(128);
        conv.install(&mut PreparedImpulse::prepare(&ir, 128));

        let y = conv.process_sample(1.0);
        assert!((y - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_mismatched_head_size_dropped() {
        let mut conv = PartitionedConvolver::new(64);
        let before_head = conv.head_size();
        conv.install(&mut PreparedImpulse::prepare(&[1.0, 0.5], 128));
        assert_eq!(conv.head_size(), before_head);
        // Still the identity
        let y = conv.process_sample(0.75);
        assert!((y - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_reset_clears_tail() {
        let ir: Vec<f64> = (0..200).map(|i| 1.0 / (1.0 + i as f64)).collect();
        let mut conv = PartitionedConvolver::new(64);
        conv.install(&mut PreparedImpulse::prepare(&ir, 64));

        for _ in 0..512 {
            conv.process_sample(1.0);
        }
        conv.reset();
        let y = conv.process_sample(0.0);
        assert!(y.abs() < 1e-12);
    }

    #[test]
    fn test_install_hands_back_superseded_buffers() {
        let mut conv = PartitionedConvolver::new(64);
        let mut first = PreparedImpulse::prepare(&[1.0, 0.5], 64);
        conv.install(&mut first);

        let ir: Vec<f64> = (0..200).map(|i| 1.0 / (1.0 + i as f64)).collect();
        let mut second = PreparedImpulse::prepare(&ir, 64);
        let tail_partitions = second.partitions.len();
        conv.install(&mut second);

        // The short impulse's buffers came back for off-thread disposal
        assert!((second.head_ir[0] - 1.0).abs() < 1e-12);
        assert!((second.head_ir[1] - 0.5).abs() < 1e-12);
        assert!(second.partitions.is_empty());
        assert_eq!(conv.partitions.len(), tail_partitions);
    }
}
