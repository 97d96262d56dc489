//! Duty cycles of the two inverter legs of the H-bridge.
//!
//! The bridge output voltage is `(d1 - d2) * v_bus`. Both legs share a
//! common offset and carry opposite halves of the differential, which
//! keeps the common-mode voltage at `offset * v_bus`.

use crate::primitives::saturate;

/// Leg duties `[offset + delta, offset - delta]`, each clamped into
/// `[min, max]`.
pub fn leg_duties(offset: f32, delta: f32, min: f32, max: f32) -> [f32; 2] {
    [
        saturate(offset + delta, min, max),
        saturate(offset - delta, min, max),
    ]
}

/// Startup split `[ramp, 1 - ramp]`: zero differential at `ramp = 0.5`.
pub fn startup_duties(ramp: f32, min: f32, max: f32) -> [f32; 2] {
    [saturate(ramp, min, max), saturate(1.0 - ramp, min, max)]
}

/// Largest differential that keeps both legs inside `[min, max]` around a
/// centred offset.
pub fn max_differential(min: f32, max: f32) -> f32 {
    0.5 * (max - min)
}
