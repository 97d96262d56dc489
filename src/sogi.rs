//! Second order generalized integrator with a frequency locked loop (SOGI-FLL).
//!
//! The SOGI is a resonant band-pass tuned to the estimated frequency `omega`.
//! Its two states are the filtered input (in phase) and a copy lagging by 90
//! degrees (quadrature). The FLL adapts `omega` from the product of the
//! filter error and the quadrature output, normalized by the squared
//! amplitude so the loop dynamics do not depend on the signal level.
//!
//! Both integrators use a semi-implicit Euler step, which keeps the
//! resonator on its orbit at a 10 kHz sample rate without the energy drift
//! of a plain forward Euler step.

use crate::park_clarke::TwoPhaseStationaryOrthogonalReferenceFrame;

/// Squared amplitude below which the FLL stops adapting.
const MIN_AMPLITUDE_SQ: f32 = 1e-2;

#[derive(Debug, Clone)]
pub struct FrequencyLockedTracker {
    sample_time: f32,
    k: f32,
    gain: f32,
    omega_nominal: f32,
    in_phase: f32,
    quadrature: f32,
    omega: f32,
}

impl FrequencyLockedTracker {
    /// `gain` sets how fast `omega` settles, `k` is the SOGI damping
    /// (`sqrt(2)` for a critically damped band-pass).
    pub fn new(gain: f32, k: f32, omega_nominal: f32, sample_time: f32) -> Self {
        Self {
            sample_time,
            k,
            gain,
            omega_nominal,
            in_phase: 0.0,
            quadrature: 0.0,
            omega: omega_nominal,
        }
    }

    /// Feed one sample, returns the (in phase, quadrature) pair as a
    /// stationary frame.
    pub fn update(&mut self, sample: f32) -> TwoPhaseStationaryOrthogonalReferenceFrame {
        let error = self.resonate(sample, self.omega);

        let amplitude_sq = self.amplitude_sq();
        if amplitude_sq > MIN_AMPLITUDE_SQ {
            let domega =
                -self.gain * self.k * self.omega * error * self.quadrature / amplitude_sq;
            self.omega += domega * self.sample_time;
            self.omega = crate::primitives::saturate(
                self.omega,
                0.5 * self.omega_nominal,
                1.5 * self.omega_nominal,
            );
        }

        self.output()
    }

    /// Feed one sample with the resonator tuned to `omega`, without
    /// adapting the tracked frequency.
    pub fn update_at(
        &mut self,
        sample: f32,
        omega: f32,
    ) -> TwoPhaseStationaryOrthogonalReferenceFrame {
        self.omega = omega;
        self.resonate(sample, omega);
        self.output()
    }

    /// One semi-implicit Euler step, returns the input error.
    fn resonate(&mut self, sample: f32, omega: f32) -> f32 {
        let error = sample - self.in_phase;
        let w_ts = omega * self.sample_time;
        self.in_phase += w_ts * (self.k * error - self.quadrature);
        self.quadrature += w_ts * self.in_phase;
        error
    }

    pub fn output(&self) -> TwoPhaseStationaryOrthogonalReferenceFrame {
        TwoPhaseStationaryOrthogonalReferenceFrame {
            alpha: self.in_phase,
            beta: self.quadrature,
        }
    }

    /// Estimated angular frequency in rad/s.
    pub fn omega(&self) -> f32 {
        self.omega
    }

    /// Squared peak amplitude of the tracked fundamental.
    pub fn amplitude_sq(&self) -> f32 {
        self.in_phase * self.in_phase + self.quadrature * self.quadrature
    }

    pub fn reset(&mut self) {
        self.in_phase = 0.0;
        self.quadrature = 0.0;
        self.omega = self.omega_nominal;
    }
}
