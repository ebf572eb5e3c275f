//! peq-dsp: DSP processors for the multi-band parametric EQ
//!
//! ## Modules
//! - `biquad` - TDF-II biquad and one-pole filter sections
//! - `params` - band parameter model, filter shapes, M/S routing roles
//! - `smoothing` - zipper-free parameter ramps
//! - `eq` - multi-band cascade with dynamics, harmonics, M/S and solo
//! - `fir` - linear-phase FIR synthesis from analytic band responses
//! - `convolution` - partitioned convolution with a direct head stage
//! - `metering` - per-channel RMS/peak and stereo correlation
//! - `analyzer` - lock-free spectrum analyzer taps
//! - `delay` - dry-path latency compensation delay line

pub mod analyzer;
pub mod biquad;
pub mod convolution;
pub mod delay;
pub mod eq;
pub mod fir;
pub mod metering;
pub mod params;
pub mod smoothing;

use peq_core::Sample;

/// Trait for all DSP processors
pub trait Processor: Send {
    /// Reset processor state
    fn reset(&mut self);

    /// Get latency in samples
    fn latency(&self) -> usize {
        0
    }
}

/// Mono processor trait
pub trait MonoProcessor: Processor {
    /// Process a single sample
    fn process_sample(&mut self, input: Sample) -> Sample;

    /// Process a block of samples
    fn process_block(&mut self, buffer: &mut [Sample]) {
        for sample in buffer.iter_mut() {
            *sample = self.process_sample(*sample);
        }
    }
}

/// Processor configuration for sample rate changes
pub trait ProcessorConfig {
    fn set_sample_rate(&mut self, sample_rate: f64);
}
