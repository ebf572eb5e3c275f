//! Biquad and one-pole filter sections using Transposed Direct Form II
//!
//! TDF-II is numerically optimal for floating-point arithmetic,
//! minimizing quantization noise and ensuring stability.

use peq_core::Sample;
use std::f64::consts::PI;

use crate::{MonoProcessor, Processor, ProcessorConfig};

/// Filter shapes available per band
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FilterShape {
    Bell,
    LowShelf,
    HighShelf,
    LowPass,
    HighPass,
    Notch,
    BandPass,
    AllPass,
    Tilt,
    FlatTilt,
}

impl FilterShape {
    pub fn from_index(index: usize) -> Self {
        match index {
            1 => Self::LowShelf,
            2 => Self::HighShelf,
            3 => Self::LowPass,
            4 => Self::HighPass,
            5 => Self::Notch,
            6 => Self::BandPass,
            7 => Self::AllPass,
            8 => Self::Tilt,
            9 => Self::FlatTilt,
            _ => Self::Bell,
        }
    }

    /// True for shapes whose gain parameter affects the response
    pub fn uses_gain(self) -> bool {
        matches!(
            self,
            Self::Bell | Self::LowShelf | Self::HighShelf | Self::Tilt | Self::FlatTilt
        )
    }

    /// True for the cut shapes that honor the slope parameter
    pub fn uses_slope(self) -> bool {
        matches!(self, Self::LowPass | Self::HighPass)
    }
}

impl Default for FilterShape {
    fn default() -> Self {
        Self::Bell
    }
}

/// Biquad coefficients
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    /// Calculate lowpass filter coefficients
    pub fn lowpass(freq: f64, q: f64, sample_rate: f64) -> Self {
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = (1.0 - cos_omega) / 2.0;
        let b1 = 1.0 - cos_omega;
        let b2 = (1.0 - cos_omega) / 2.0;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Calculate highpass filter coefficients
    pub fn highpass(freq: f64, q: f64, sample_rate: f64) -> Self {
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = (1.0 + cos_omega) / 2.0;
        let b1 = -(1.0 + cos_omega);
        let b2 = (1.0 + cos_omega) / 2.0;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Calculate bandpass filter coefficients (constant 0 dB peak gain)
    pub fn bandpass(freq: f64, q: f64, sample_rate: f64) -> Self {
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = alpha;
        let b1 = 0.0;
        let b2 = -alpha;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Calculate notch filter coefficients
    pub fn notch(freq: f64, q: f64, sample_rate: f64) -> Self {
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = 1.0;
        let b1 = -2.0 * cos_omega;
        let b2 = 1.0;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Calculate allpass filter coefficients
    pub fn allpass(freq: f64, q: f64, sample_rate: f64) -> Self {
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = 1.0 - alpha;
        let b1 = -2.0 * cos_omega;
        let b2 = 1.0 + alpha;
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Calculate peaking (bell) EQ filter coefficients
    pub fn peaking(freq: f64, q: f64, gain_db: f64, sample_rate: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);

        let b0 = 1.0 + alpha * a;
        let b1 = -2.0 * cos_omega;
        let b2 = 1.0 - alpha * a;
        let a0 = 1.0 + alpha / a;
        let a1 = -2.0 * cos_omega;
        let a2 = 1.0 - alpha / a;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Calculate low shelf filter coefficients
    pub fn low_shelf(freq: f64, q: f64, gain_db: f64, sample_rate: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);
        let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;

        let b0 = a * ((a + 1.0) - (a - 1.0) * cos_omega + two_sqrt_a_alpha);
        let b1 = 2.0 * a * ((a - 1.0) - (a + 1.0) * cos_omega);
        let b2 = a * ((a + 1.0) - (a - 1.0) * cos_omega - two_sqrt_a_alpha);
        let a0 = (a + 1.0) + (a - 1.0) * cos_omega + two_sqrt_a_alpha;
        let a1 = -2.0 * ((a - 1.0) + (a + 1.0) * cos_omega);
        let a2 = (a + 1.0) + (a - 1.0) * cos_omega - two_sqrt_a_alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Calculate high shelf filter coefficients
    pub fn high_shelf(freq: f64, q: f64, gain_db: f64, sample_rate: f64) -> Self {
        let a = 10.0_f64.powf(gain_db / 40.0);
        let omega = 2.0 * PI * freq / sample_rate;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * q);
        let two_sqrt_a_alpha = 2.0 * a.sqrt() * alpha;

        let b0 = a * ((a + 1.0) + (a - 1.0) * cos_omega + two_sqrt_a_alpha);
        let b1 = -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_omega);
        let b2 = a * ((a + 1.0) + (a - 1.0) * cos_omega - two_sqrt_a_alpha);
        let a0 = (a + 1.0) - (a - 1.0) * cos_omega + two_sqrt_a_alpha;
        let a1 = 2.0 * ((a - 1.0) - (a + 1.0) * cos_omega);
        let a2 = (a + 1.0) - (a - 1.0) * cos_omega - two_sqrt_a_alpha;

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Bypass (unity gain, no filtering)
    pub fn bypass() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }

    /// Complex magnitude response at a given frequency
    pub fn magnitude_at(&self, freq: f64, sample_rate: f64) -> f64 {
        let omega = 2.0 * PI * freq / sample_rate;
        let (cos1, sin1) = (omega.cos(), omega.sin());
        let (cos2, sin2) = ((2.0 * omega).cos(), (2.0 * omega).sin());

        let num_re = self.b0 + self.b1 * cos1 + self.b2 * cos2;
        let num_im = -(self.b1 * sin1 + self.b2 * sin2);
        let den_re = 1.0 + self.a1 * cos1 + self.a2 * cos2;
        let den_im = -(self.a1 * sin1 + self.a2 * sin2);

        let num = (num_re * num_re + num_im * num_im).sqrt();
        let den = (den_re * den_re + den_im * den_im).sqrt().max(1e-12);
        num / den
    }
}

/// Transposed Direct Form II biquad filter with a coefficient-change guard
///
/// `update` skips the trig work when frequency, gain, Q and shape all
/// match the previous call. Pure cost avoidance; the result is identical.
#[derive(Debug, Clone)]
pub struct Biquad {
    coeffs: BiquadCoeffs,
    z1: f64,
    z2: f64,
    sample_rate: f64,
    last_shape: FilterShape,
    last_freq: f64,
    last_gain: f64,
    last_q: f64,
    configured: bool,
}

impl Biquad {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            coeffs: BiquadCoeffs::bypass(),
            z1: 0.0,
            z2: 0.0,
            sample_rate,
            last_shape: FilterShape::Bell,
            last_freq: 0.0,
            last_gain: 0.0,
            last_q: 0.0,
            configured: false,
        }
    }

    #[inline]
    pub fn set_coeffs(&mut self, coeffs: BiquadCoeffs) {
        self.coeffs = coeffs;
        self.configured = false;
    }

    #[inline]
    pub fn coeffs(&self) -> &BiquadCoeffs {
        &self.coeffs
    }

    /// Recompute coefficients for a band shape if the parameters changed.
    ///
    /// Frequency is clamped below Nyquist and Q floored at 0.1 so degenerate
    /// values cannot produce unstable or divide-by-zero coefficients.
    pub fn update(&mut self, shape: FilterShape, freq: f64, gain_db: f64, q: f64) {
        let freq = freq.clamp(10.0, self.sample_rate * 0.49);
        let q = q.max(0.1);
        if self.configured
            && shape == self.last_shape
            && freq == self.last_freq
            && gain_db == self.last_gain
            && q == self.last_q
        {
            return;
        }

        self.coeffs = match shape {
            FilterShape::Bell => BiquadCoeffs::peaking(freq, q, gain_db, self.sample_rate),
            FilterShape::LowShelf => BiquadCoeffs::low_shelf(freq, q, gain_db, self.sample_rate),
            FilterShape::HighShelf => BiquadCoeffs::high_shelf(freq, q, gain_db, self.sample_rate),
            FilterShape::LowPass => BiquadCoeffs::lowpass(freq, q, self.sample_rate),
            FilterShape::HighPass => BiquadCoeffs::highpass(freq, q, self.sample_rate),
            FilterShape::Notch => BiquadCoeffs::notch(freq, q, self.sample_rate),
            FilterShape::BandPass => BiquadCoeffs::bandpass(freq, q, self.sample_rate),
            FilterShape::AllPass => BiquadCoeffs::allpass(freq, q, self.sample_rate),
            // Tilt shapes are cascades of two shelves; a lone biquad carries
            // the low-shelf half, the caller supplies the high-shelf partner.
            FilterShape::Tilt => BiquadCoeffs::low_shelf(freq, q, gain_db * 0.5, self.sample_rate),
            FilterShape::FlatTilt => {
                BiquadCoeffs::low_shelf(freq, 0.5, gain_db * 0.5, self.sample_rate)
            }
        };
        self.last_shape = shape;
        self.last_freq = freq;
        self.last_gain = gain_db;
        self.last_q = q;
        self.configured = true;
    }

    pub fn set_bandpass(&mut self, freq: f64, q: f64) {
        let freq = freq.clamp(10.0, self.sample_rate * 0.49);
        self.coeffs = BiquadCoeffs::bandpass(freq, q.max(0.1), self.sample_rate);
        self.configured = false;
    }

    pub fn set_bypass(&mut self) {
        self.coeffs = BiquadCoeffs::bypass();
        self.configured = false;
    }
}

impl Processor for Biquad {
    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

impl MonoProcessor for Biquad {
    #[inline(always)]
    fn process_sample(&mut self, input: Sample) -> Sample {
        let output = self.coeffs.b0 * input + self.z1;
        self.z1 = self.coeffs.b1 * input - self.coeffs.a1 * output + self.z2;
        self.z2 = self.coeffs.b2 * input - self.coeffs.a2 * output;
        output
    }
}

impl ProcessorConfig for Biquad {
    fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.configured = false;
    }
}

/// One-pole mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnePoleMode {
    LowPass,
    HighPass,
}

/// First-order 6 dB/oct section, chained after biquad stages for
/// odd slope remainders.
#[derive(Debug, Clone)]
pub struct OnePole {
    a: f64,
    mode: OnePoleMode,
    y1: f64,
    x1: f64,
    sample_rate: f64,
    last_freq: f64,
}

impl OnePole {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            a: 0.0,
            mode: OnePoleMode::LowPass,
            y1: 0.0,
            x1: 0.0,
            sample_rate,
            last_freq: 0.0,
        }
    }

    /// Configure as a 6 dB/oct low-pass; recomputes only on cutoff change
    pub fn set_low_pass(&mut self, freq: f64) {
        let freq = freq.clamp(10.0, self.sample_rate * 0.49);
        if self.mode == OnePoleMode::LowPass && freq == self.last_freq {
            return;
        }
        self.mode = OnePoleMode::LowPass;
        self.a = (-2.0 * PI * freq / self.sample_rate).exp();
        self.last_freq = freq;
    }

    /// Configure as a 6 dB/oct high-pass; recomputes only on cutoff change
    pub fn set_high_pass(&mut self, freq: f64) {
        let freq = freq.clamp(10.0, self.sample_rate * 0.49);
        if self.mode == OnePoleMode::HighPass && freq == self.last_freq {
            return;
        }
        self.mode = OnePoleMode::HighPass;
        self.a = (-2.0 * PI * freq / self.sample_rate).exp();
        self.last_freq = freq;
    }
}

impl Processor for OnePole {
    fn reset(&mut self) {
        self.y1 = 0.0;
        self.x1 = 0.0;
    }
}

impl MonoProcessor for OnePole {
    #[inline(always)]
    fn process_sample(&mut self, input: Sample) -> Sample {
        let output = match self.mode {
            OnePoleMode::LowPass => (1.0 - self.a) * input + self.a * self.y1,
            OnePoleMode::HighPass => self.a * (self.y1 + input - self.x1),
        };
        self.x1 = input;
        self.y1 = output;
        output
    }
}

impl ProcessorConfig for OnePole {
    fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        // Force recompute on next set call
        self.last_freq = 0.0;
    }
}
