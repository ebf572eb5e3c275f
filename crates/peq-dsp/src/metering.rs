//! Output metering
//!
//! Per-channel smoothed RMS/peak in dB and an incremental windowed
//! stereo correlation. A skip factor bounds cost at very high sample
//! rates by updating every 2nd or 3rd block.

use peq_core::{linear_to_db, Sample, DB_FLOOR};

use crate::params::MAX_CHANNELS;

/// Per-channel level meter with smoothed RMS and peak ballistics
#[derive(Debug, Clone)]
pub struct ChannelMeter {
    rms_sq: f64,
    peak: f64,
    rms_coeff: f64,
    peak_release: f64,
}

impl ChannelMeter {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            rms_sq: 0.0,
            peak: 0.0,
            // ~300 ms RMS window, ~1.5 s peak fallback
            rms_coeff: (-1.0 / (0.3 * sample_rate)).exp(),
            peak_release: (-1.0 / (1.5 * sample_rate)).exp(),
        }
    }

    #[inline]
    pub fn process(&mut self, sample: Sample) {
        let sq = sample * sample;
        self.rms_sq = sq + self.rms_coeff * (self.rms_sq - sq);
        let abs = sample.abs();
        if abs > self.peak {
            self.peak = abs;
        } else {
            self.peak *= self.peak_release;
        }
    }

    pub fn rms_db(&self) -> f64 {
        linear_to_db(self.rms_sq.sqrt())
    }

    pub fn peak_db(&self) -> f64 {
        linear_to_db(self.peak)
    }

    pub fn reset(&mut self) {
        self.rms_sq = 0.0;
        self.peak = 0.0;
    }
}

/// Stereo correlation meter
///
/// Measures the correlation between left and right channels:
/// - +1.0 = Mono (identical L/R)
/// -  0.0 = Unrelated (no correlation)
/// - -1.0 = Out of phase (inverted L/R)
#[derive(Debug, Clone)]
pub struct CorrelationMeter {
    sum_lr: f64,
    sum_ll: f64,
    sum_rr: f64,
    buffer_l: Vec<f64>,
    buffer_r: Vec<f64>,
    write_pos: usize,
    smoothed: f64,
    smooth_coeff: f64,
}

impl CorrelationMeter {
    /// window_ms: analysis window in milliseconds
    pub fn new(sample_rate: f64, window_ms: f64) -> Self {
        let window_samples = ((window_ms * 0.001 * sample_rate) as usize).max(1);

        Self {
            sum_lr: 0.0,
            sum_ll: 0.0,
            sum_rr: 0.0,
            buffer_l: vec![0.0; window_samples],
            buffer_r: vec![0.0; window_samples],
            write_pos: 0,
            smoothed: 0.0,
            smooth_coeff: 0.1,
        }
    }

    /// Process a stereo sample pair
    pub fn process(&mut self, left: Sample, right: Sample) {
        // Remove old values
        let old_l = self.buffer_l[self.write_pos];
        let old_r = self.buffer_r[self.write_pos];

        self.sum_lr -= old_l * old_r;
        self.sum_ll -= old_l * old_l;
        self.sum_rr -= old_r * old_r;

        // Add new values
        self.sum_lr += left * right;
        self.sum_ll += left * left;
        self.sum_rr += right * right;

        self.buffer_l[self.write_pos] = left;
        self.buffer_r[self.write_pos] = right;

        self.write_pos = (self.write_pos + 1) % self.buffer_l.len();

        let denominator = (self.sum_ll * self.sum_rr).sqrt();
        let raw_correlation = if denominator > 1e-10 {
            self.sum_lr / denominator
        } else {
            0.0
        };

        self.smoothed =
            self.smoothed * (1.0 - self.smooth_coeff) + raw_correlation * self.smooth_coeff;
    }

    pub fn process_block(&mut self, left: &[Sample], right: &[Sample]) {
        for (&l, &r) in left.iter().zip(right.iter()) {
            self.process(l, r);
        }
    }

    /// Get current correlation (-1.0 to +1.0)
    pub fn correlation(&self) -> f64 {
        self.smoothed.clamp(-1.0, 1.0)
    }

    pub fn reset(&mut self) {
        self.sum_lr = 0.0;
        self.sum_ll = 0.0;
        self.sum_rr = 0.0;
        self.buffer_l.fill(0.0);
        self.buffer_r.fill(0.0);
        self.write_pos = 0;
        self.smoothed = 0.0;
    }
}

/// Readable meter state for an external display
#[derive(Debug, Clone, Copy)]
pub struct MeterState {
    pub rms_db: [f64; MAX_CHANNELS],
    pub peak_db: [f64; MAX_CHANNELS],
    pub correlation: f64,
}

impl Default for MeterState {
    fn default() -> Self {
        Self {
            rms_db: [DB_FLOOR; MAX_CHANNELS],
            peak_db: [DB_FLOOR; MAX_CHANNELS],
            correlation: 0.0,
        }
    }
}

/// All output meters, updated every `skip_factor` blocks
#[derive(Debug)]
pub struct MeterBank {
    channels: Vec<ChannelMeter>,
    correlation: CorrelationMeter,
    skip_factor: usize,
    block_counter: usize,
    state: MeterState,
}

impl MeterBank {
    pub fn new(sample_rate: f64, channel_count: usize) -> Self {
        // Every 2nd block at >= 96k, every 3rd at >= 192k
        let skip_factor = if sample_rate >= 192_000.0 {
            3
        } else if sample_rate >= 96_000.0 {
            2
        } else {
            1
        };

        Self {
            channels: (0..channel_count.min(MAX_CHANNELS))
                .map(|_| ChannelMeter::new(sample_rate))
                .collect(),
            correlation: CorrelationMeter::new(sample_rate, 300.0),
            skip_factor,
            block_counter: 0,
            state: MeterState::default(),
        }
    }

    /// Feed one processed block, channel-planar
    pub fn process_block(&mut self, channels: &[&[Sample]]) {
        self.block_counter += 1;
        if self.block_counter % self.skip_factor != 0 {
            return;
        }

        for (meter, data) in self.channels.iter_mut().zip(channels.iter()) {
            for &sample in data.iter() {
                meter.process(sample);
            }
        }
        if channels.len() >= 2 {
            self.correlation.process_block(channels[0], channels[1]);
        }

        for (i, meter) in self.channels.iter().enumerate() {
            self.state.rms_db[i] = meter.rms_db();
            self.state.peak_db[i] = meter.peak_db();
        }
        self.state.correlation = self.correlation.correlation();
    }

    pub fn state(&self) -> MeterState {
        self.state
    }

    pub fn reset(&mut self) {
        for meter in &mut self.channels {
            meter.reset();
        }
        self.correlation.reset();
        self.block_counter = 0;
        self.state = MeterState::default();
    }
}
