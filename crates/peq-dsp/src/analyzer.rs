//! Lock-free analyzer taps
//!
//! Pre- and post-processing sample streams for an external spectrum
//! renderer. The audio side pushes without blocking; overflow drops
//! samples rather than stalling the block. Decimation bounds the tap
//! bandwidth at high sample rates.

use peq_core::Sample;
use rtrb::{Consumer, Producer, RingBuffer};

/// Decimation stride for a given sample rate: 2x at >= 96 kHz,
/// 4x at >= 192 kHz.
pub fn decimation_stride(sample_rate: f64) -> usize {
    if sample_rate >= 192_000.0 {
        4
    } else if sample_rate >= 96_000.0 {
        2
    } else {
        1
    }
}

/// Audio-side half of an analyzer tap
pub struct AnalyzerTap {
    producer: Producer<f32>,
    stride: usize,
    phase: usize,
}

/// Renderer-side half of an analyzer tap
pub struct AnalyzerTapReader {
    consumer: Consumer<f32>,
}

/// Create a connected tap pair sized for `capacity` samples
pub fn analyzer_tap(capacity: usize, sample_rate: f64) -> (AnalyzerTap, AnalyzerTapReader) {
    let (producer, consumer) = RingBuffer::new(capacity);
    (
        AnalyzerTap {
            producer,
            stride: decimation_stride(sample_rate),
            phase: 0,
        },
        AnalyzerTapReader { consumer },
    )
}

impl AnalyzerTap {
    /// Push a block of samples, decimated. Never blocks; drops on overflow.
    pub fn push(&mut self, samples: &[Sample]) {
        for &sample in samples {
            if self.phase == 0 {
                // Push failure means the renderer is behind; drop the sample
                let _ = self.producer.push(sample as f32);
            }
            self.phase += 1;
            if self.phase >= self.stride {
                self.phase = 0;
            }
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.stride = decimation_stride(sample_rate);
        self.phase = 0;
    }
}

impl AnalyzerTapReader {
    /// Pull up to `out.len()` samples; returns the number written
    pub fn pull(&mut self, out: &mut [f32]) -> usize {
        let mut written = 0;
        while written < out.len() {
            match self.consumer.pop() {
                Ok(sample) => {
                    out[written] = sample;
                    written += 1;
                }
                Err(_) => break,
            }
        }
        written
    }

    /// Number of samples waiting in the tap
    pub fn available(&self) -> usize {
        self.consumer.slots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pull_round_trip() {
        let (mut tap, mut reader) = analyzer_tap(1024, 48000.0);
        let input: Vec<Sample> = (0..256).map(|i| i as Sample).collect();
        tap.push(&input);

        let mut out = vec![0.0f32; 256];
        let n = reader.pull(&mut out);
        assert_eq!(n, 256);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[255], 255.0);
    }

    #[test]
    fn test_decimation_strides() {
        assert_eq!(decimation_stride(48_000.0), 1);
        assert_eq!(decimation_stride(96_000.0), 2);
        assert_eq!(decimation_stride(192_000.0), 4);
    }

    #[test]
    fn test_decimated_push() {
        let (mut tap, mut reader) = analyzer_tap(1024, 96_000.0);
        let input: Vec<Sample> = (0..100).map(|i| i as Sample).collect();
        tap.push(&input);

        let mut out = vec![0.0f32; 100];
        let n = reader.pull(&mut out);
        assert_eq!(n, 50);
        // Every other sample survives
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 2.0);
    }

    #[test]
    fn test_overflow_drops_without_blocking() {
        let (mut tap, mut reader) = analyzer_tap(16, 48000.0);
        let input: Vec<Sample> = (0..64).map(|i| i as Sample).collect();
        tap.push(&input);

        let mut out = vec![0.0f32; 64];
        let n = reader.pull(&mut out);
        assert_eq!(n, 16);
    }
}
