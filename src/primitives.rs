//! Small math helpers shared by every control loop.
//!
//! All functions are pure: every input, including the sample period, is
//! passed explicitly.

use micromath::F32Ext;

/// Clamp `x` into `[min, max]`.
///
/// `min > max` is a caller contract violation; `min` wins in that case.
pub fn saturate(x: f32, min: f32, max: f32) -> f32 {
    if x > max {
        return max;
    }
    if x < min {
        return min;
    }
    x
}

/// Sign of `x` with a deadband of `tol` around zero.
pub fn sign(x: f32, tol: f32) -> f32 {
    if x > tol {
        1.0
    } else if x < -tol {
        -1.0
    } else {
        0.0
    }
}

/// Deadband used by [`rate_limiter`].
pub const SIGN_TOLERANCE: f32 = 1e-3;

/// Move `value` toward `reference` by at most `rate * sample_time`.
///
/// The step never overshoots `reference`. Once the value is within one step
/// or within [`SIGN_TOLERANCE`] of the reference it lands exactly on it.
pub fn rate_limiter(reference: f32, value: f32, rate: f32, sample_time: f32) -> f32 {
    let error = reference - value;
    let step = sample_time * rate;
    if error.abs() <= step {
        return reference;
    }
    match sign(error, SIGN_TOLERANCE) {
        0.0 => reference,
        direction => value + direction * step,
    }
}

/// First order low-pass filter, backward Euler discretization.
#[derive(Debug, Clone)]
pub struct LowPassFilter {
    alpha: f32,
    out: f32,
}

impl LowPassFilter {
    /// `tau` is the time constant in seconds.
    pub fn new(sample_time: f32, tau: f32) -> Self {
        Self {
            alpha: sample_time / (tau + sample_time),
            out: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.out = 0.0;
    }

    pub fn run(&mut self, input: f32) -> f32 {
        self.out += self.alpha * (input - self.out);
        self.out
    }

    pub fn get(&self) -> f32 {
        self.out
    }
}
