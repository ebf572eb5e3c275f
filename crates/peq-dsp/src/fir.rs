//! Linear-phase FIR synthesis
//!
//! Builds a symmetric FIR impulse from the analytic magnitude responses
//! of the active bands: per-bin magnitude product (phase discarded),
//! inverse real FFT, center shift, window, truncate to the tap count.
//! All of this runs on the background rebuild worker, never on the
//! audio thread.

use std::f64::consts::PI;
use std::sync::Arc;

use realfft::{ComplexToReal, RealFftPlanner};
use rustfft::num_complex::Complex;

use crate::biquad::FilterShape;
use crate::params::BandParams;

/// Minimum design FFT size
const MIN_DESIGN_FFT_SIZE: usize = 4096;

/// Window applied to the truncated impulse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum FirWindow {
    #[default]
    Hann,
    Blackman,
    Kaiser,
}

/// Kaiser beta for the Kaiser window option
const KAISER_BETA: f64 = 9.0;

/// Zeroth-order modified Bessel function of the first kind
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let half_x = x / 2.0;
    for k in 1..32 {
        term *= (half_x / k as f64) * (half_x / k as f64);
        sum += term;
        if term < sum * 1e-12 {
            break;
        }
    }
    sum
}

impl FirWindow {
    /// Window value at position `i` of `len`
    fn value(self, i: usize, len: usize) -> f64 {
        let t = i as f64 / (len - 1) as f64;
        match self {
            Self::Hann => 0.5 - 0.5 * (2.0 * PI * t).cos(),
            Self::Blackman => {
                0.42 - 0.5 * (2.0 * PI * t).cos() + 0.08 * (4.0 * PI * t).cos()
            }
            Self::Kaiser => {
                let r = 2.0 * t - 1.0;
                bessel_i0(KAISER_BETA * (1.0 - r * r).max(0.0).sqrt()) / bessel_i0(KAISER_BETA)
            }
        }
    }
}

/// Analytic magnitude response of one band at a given frequency.
///
/// These are idealized curves, not the discrete-time biquad responses;
/// the linear-phase path trades exact minimum-phase matching for a
/// clean symmetric impulse.
pub fn band_magnitude(band: &BandParams, freq: f64) -> f64 {
    if !band.enabled || band.bypassed {
        return 1.0;
    }

    let w = freq / band.frequency_hz;

    let raw = match band.shape {
        FilterShape::Bell => {
            if band.gain_db.abs() < 0.01 {
                return 1.0;
            }

            let a = 10.0_f64.powf(band.gain_db / 40.0);
            let w2 = w * w;
            let bw = 1.0 / band.q;

            let num = (w2 - 1.0).powi(2) + (w * bw * a).powi(2);
            let den = (w2 - 1.0).powi(2) + (w * bw / a).powi(2);

            (num / den).sqrt()
        }

        FilterShape::LowShelf => shelf_low(w, band.gain_db),
        FilterShape::HighShelf => shelf_high(w, band.gain_db),

        FilterShape::HighPass => {
            if freq < 1.0 {
                return 0.0;
            }
            let order = (band.slope_db / 6.0).round() as i32;
            1.0 / (1.0 + (band.frequency_hz / freq).powi(2 * order)).sqrt()
        }

        FilterShape::LowPass => {
            if freq < 1.0 {
                return 1.0;
            }
            let order = (band.slope_db / 6.0).round() as i32;
            1.0 / (1.0 + (freq / band.frequency_hz).powi(2 * order)).sqrt()
        }

        FilterShape::Notch => {
            let bw = 1.0 / band.q;
            let w2 = w * w;
            let resonance = (w2 - 1.0).powi(2) + (w * bw).powi(2);
            ((w2 - 1.0).powi(2) / resonance.max(1e-12)).sqrt()
        }

        FilterShape::BandPass => {
            let bw = 1.0 / band.q;
            let w2 = w * w;
            (w * bw) / ((w2 - 1.0).powi(2) + (w * bw).powi(2)).sqrt()
        }

        // Phase is discarded during design, so all-pass is flat here
        FilterShape::AllPass => 1.0,

        // Shelf pair with opposite half gains pivoting at the band frequency
        FilterShape::Tilt | FilterShape::FlatTilt => {
            shelf_low(w, band.gain_db * 0.5) * shelf_high(w, -band.gain_db * 0.5)
        }
    };

    // Per-band mix blends the magnitude toward unity
    1.0 + band.mix * (raw - 1.0)
}

fn shelf_low(w: f64, gain_db: f64) -> f64 {
    let gain_linear = 10.0_f64.powf(gain_db / 20.0);
    if w < 0.5 {
        gain_linear
    } else if w > 2.0 {
        1.0
    } else {
        let t = ((w.log2() + 1.0) / 2.0).clamp(0.0, 1.0);
        gain_linear * (1.0 - t) + t
    }
}

fn shelf_high(w: f64, gain_db: f64) -> f64 {
    let gain_linear = 10.0_f64.powf(gain_db / 20.0);
    if w > 2.0 {
        gain_linear
    } else if w < 0.5 {
        1.0
    } else {
        let t = ((w.log2() + 1.0) / 2.0).clamp(0.0, 1.0);
        (1.0 - t) + gain_linear * t
    }
}

/// Designs symmetric FIR impulses from band magnitude responses
pub struct FirDesigner {
    fft_inverse: Arc<dyn ComplexToReal<f64>>,
    fft_size: usize,
    sample_rate: f64,
}

impl FirDesigner {
    /// `max_taps` sizes the design FFT so truncation stays well inside
    /// the synthesized impulse.
    pub fn new(sample_rate: f64, max_taps: usize) -> Self {
        let fft_size = (max_taps * 4).next_power_of_two().max(MIN_DESIGN_FFT_SIZE);
        let mut planner = RealFftPlanner::<f64>::new();

        Self {
            fft_inverse: planner.plan_fft_inverse(fft_size),
            fft_size,
            sample_rate,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Magnitude product of all contributing bands across the design bins
    pub fn magnitude_response(&self, bands: &[BandParams]) -> Vec<f64> {
        let num_bins = self.fft_size / 2 + 1;
        let mut response = vec![1.0; num_bins];

        for (i, mag) in response.iter_mut().enumerate() {
            let freq = i as f64 * self.sample_rate / self.fft_size as f64;
            for band in bands {
                *mag *= band_magnitude(band, freq);
            }
        }

        response
    }

    /// Design a windowed, centered FIR of `taps` samples
    pub fn design(&self, bands: &[BandParams], taps: usize, window: FirWindow) -> Vec<f64> {
        let taps = taps.min(self.fft_size).max(3);
        let magnitude = self.magnitude_response(bands);

        // Zero-phase spectrum
        let mut spectrum: Vec<Complex<f64>> =
            magnitude.iter().map(|&m| Complex::new(m, 0.0)).collect();

        let mut impulse = vec![0.0; self.fft_size];
        self.fft_inverse.process(&mut spectrum, &mut impulse).ok();

        let norm = 1.0 / self.fft_size as f64;
        for sample in &mut impulse {
            *sample *= norm;
        }

        // Zero-phase IFFT puts the peak at index 0 with the symmetric
        // halves wrapped; rotate so the center lands at fft_size/2
        let half = self.fft_size / 2;
        let mut centered = vec![0.0; self.fft_size];
        for (i, sample) in centered.iter_mut().enumerate() {
            *sample = impulse[(i + half) % self.fft_size];
        }

        // Truncate to the tap count around the center and window
        let start = half - taps / 2;
        let mut fir: Vec<f64> = centered[start..start + taps].to_vec();
        for (i, sample) in fir.iter_mut().enumerate() {
            *sample *= window.value(i, taps);
        }

        fir
    }
}
