//! Parameter smoothing for zipper-free automation
//!
//! Exponential one-pole ramps applied to frequency, gain, Q, mix and
//! dynamic threshold so per-tick parameter steps never become audible.

/// Default smoothing time in milliseconds
pub const DEFAULT_SMOOTH_TIME_MS: f64 = 5.0;

/// Minimum smoothing time in milliseconds
pub const MIN_SMOOTH_TIME_MS: f64 = 0.5;

/// Maximum smoothing time in milliseconds
pub const MAX_SMOOTH_TIME_MS: f64 = 50.0;

/// Threshold for considering smoothing complete (relative to target)
const SMOOTH_THRESHOLD: f64 = 1e-6;

/// Single parameter smoother using exponential smoothing
///
/// Formula: current = current + coeff * (target - current)
/// where coeff = 1 - exp(-1 / (time_constant * sample_rate))
#[derive(Debug, Clone)]
pub struct ParamSmoother {
    current: f64,
    target: f64,
    coeff: f64,
    sample_rate: f64,
    smooth_time_ms: f64,
    is_smoothing: bool,
}

impl ParamSmoother {
    /// Create new smoother with default smoothing time
    pub fn new(sample_rate: f64, initial_value: f64) -> Self {
        Self::with_time(sample_rate, initial_value, DEFAULT_SMOOTH_TIME_MS)
    }

    /// Create smoother with custom smoothing time
    pub fn with_time(sample_rate: f64, initial_value: f64, smooth_time_ms: f64) -> Self {
        let smooth_time_ms = smooth_time_ms.clamp(MIN_SMOOTH_TIME_MS, MAX_SMOOTH_TIME_MS);
        let coeff = Self::calculate_coeff(sample_rate, smooth_time_ms);

        Self {
            current: initial_value,
            target: initial_value,
            coeff,
            sample_rate,
            smooth_time_ms,
            is_smoothing: false,
        }
    }

    #[inline]
    fn calculate_coeff(sample_rate: f64, smooth_time_ms: f64) -> f64 {
        let time_constant_samples = (smooth_time_ms / 1000.0) * sample_rate;
        1.0 - (-1.0 / time_constant_samples).exp()
    }

    /// Set new target value (starts smoothing)
    #[inline]
    pub fn set_target(&mut self, target: f64) {
        if (self.target - target).abs() > SMOOTH_THRESHOLD {
            self.target = target;
            self.is_smoothing = true;
        }
    }

    /// Set value immediately (no smoothing)
    #[inline]
    pub fn snap_to(&mut self, value: f64) {
        self.current = value;
        self.target = value;
        self.is_smoothing = false;
    }

    /// Get next smoothed sample
    #[inline]
    pub fn next_value(&mut self) -> f64 {
        if self.is_smoothing {
            self.current += self.coeff * (self.target - self.current);

            if (self.current - self.target).abs() < SMOOTH_THRESHOLD {
                self.current = self.target;
                self.is_smoothing = false;
            }
        }
        self.current
    }

    /// Advance by one block and return the value at block end.
    ///
    /// Cheaper than per-sample advancement for parameters consumed at
    /// block rate (coefficient updates).
    #[inline]
    pub fn advance_block(&mut self, block_len: usize) -> f64 {
        if self.is_smoothing {
            // (1 - coeff)^n decay toward target over the whole block
            let remain = (1.0 - self.coeff).powi(block_len as i32);
            self.current = self.target + (self.current - self.target) * remain;
            if (self.current - self.target).abs() < SMOOTH_THRESHOLD {
                self.current = self.target;
                self.is_smoothing = false;
            }
        }
        self.current
    }

    /// Get current smoothed value without advancing
    #[inline]
    pub fn current(&self) -> f64 {
        self.current
    }

    #[inline]
    pub fn target(&self) -> f64 {
        self.target
    }

    #[inline]
    pub fn is_smoothing(&self) -> bool {
        self.is_smoothing
    }

    /// Update sample rate (recalculates coefficient)
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.coeff = Self::calculate_coeff(sample_rate, self.smooth_time_ms);
    }
}
