//! Dry-path delay compensation
//!
//! When the linear-phase path reports latency, the dry signal of the
//! global mix crossfade is delayed by the same amount so dry and wet
//! stay phase-aligned.

use peq_core::Sample;

/// Circular buffer delay line for compensation
#[derive(Debug, Clone)]
pub struct DelayLine {
    buffer: Vec<Sample>,
    write_pos: usize,
    delay_samples: usize,
}

impl DelayLine {
    /// Create new delay line with maximum capacity
    pub fn new(max_delay: usize) -> Self {
        Self {
            buffer: vec![0.0; max_delay + 1],
            write_pos: 0,
            delay_samples: 0,
        }
    }

    /// Set delay amount. Growing past the pre-allocated capacity
    /// reallocates and must not happen on the audio thread.
    pub fn set_delay(&mut self, samples: usize) {
        if samples >= self.buffer.len() {
            self.buffer.resize(samples + 1, 0.0);
        }
        self.delay_samples = samples;
    }

    #[inline]
    pub fn delay(&self) -> usize {
        self.delay_samples
    }

    /// Process a single sample
    #[inline]
    pub fn process_sample(&mut self, input: Sample) -> Sample {
        if self.delay_samples == 0 {
            return input;
        }

        let buffer_len = self.buffer.len();
        let read_pos = (self.write_pos + buffer_len - self.delay_samples) % buffer_len;

        let output = self.buffer[read_pos];
        self.buffer[self.write_pos] = input;
        self.write_pos = (self.write_pos + 1) % buffer_len;

        output
    }

    /// Clear buffer (reset to zeros)
    pub fn clear(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
    }
}
