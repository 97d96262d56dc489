//! Stationary and rotating reference frames for a single-phase system.
//!
//! A single-phase quantity has no natural second axis, so the beta
//! component comes from the quadrature output of the
//! [`FrequencyLockedTracker`](crate::sogi::FrequencyLockedTracker). The
//! Park transforms follow the usual amplitude-invariant convention: a
//! stationary vector `(A cos phi, A sin phi)` rotated by `theta = phi`
//! lands on `d = A, q = 0`.

use core::f32::consts::{PI, TAU};

use fixed::types::I16F16;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RotatingReferenceFrame {
    pub d: f32,
    pub q: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TwoPhaseStationaryOrthogonalReferenceFrame {
    pub alpha: f32,
    pub beta: f32,
}

/// Wrap an angle into `[-pi, pi)`.
pub fn wrap_angle(angle: f32) -> f32 {
    let mut wrapped = angle % TAU;
    if wrapped >= PI {
        wrapped -= TAU;
    } else if wrapped < -PI {
        wrapped += TAU;
    }
    wrapped
}

/// Sine and cosine of `angle` through CORDIC, returned as `(sin, cos)`.
pub fn sin_cos(angle: f32) -> (f32, f32) {
    let (sin, cos) = cordic::sin_cos(I16F16::from_num(wrap_angle(angle)));
    (sin.to_num(), cos.to_num())
}

/// Park transform
pub fn park(
    cos_angle: f32,
    sin_angle: f32,
    inputs: TwoPhaseStationaryOrthogonalReferenceFrame,
) -> RotatingReferenceFrame {
    RotatingReferenceFrame {
        d: cos_angle * inputs.alpha + sin_angle * inputs.beta,
        q: cos_angle * inputs.beta - sin_angle * inputs.alpha,
    }
}

/// Inverse Park transform
pub fn inverse_park(
    cos_angle: f32,
    sin_angle: f32,
    inputs: RotatingReferenceFrame,
) -> TwoPhaseStationaryOrthogonalReferenceFrame {
    TwoPhaseStationaryOrthogonalReferenceFrame {
        alpha: cos_angle * inputs.d - sin_angle * inputs.q,
        beta: sin_angle * inputs.d + cos_angle * inputs.q,
    }
}
