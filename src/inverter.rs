//! Single-phase grid controller.
//!
//! Each tick the measured grid voltage and current go through their own
//! [`FrequencyLockedTracker`] to get an orthogonal pair, are rotated into
//! the dq frame at the current angle estimate, and the strategy's control
//! law produces a dq voltage that is rotated back and scaled by the bus
//! voltage into a duty-cycle differential.
//!
//! Following regulates Idq with a PI per axis on top of the measured grid
//! voltage, and damps the filter inductor with a proportional term on the
//! instantaneous current error.

use micromath::F32Ext;
use serde::{Deserialize, Serialize};

use crate::{
    config::ControlConfig,
    park_clarke::{
        inverse_park, park, sin_cos, wrap_angle, RotatingReferenceFrame,
        TwoPhaseStationaryOrthogonalReferenceFrame,
    },
    pid::Pid,
    primitives::saturate,
    sogi::FrequencyLockedTracker,
};

/// Below this bus voltage no duty differential is produced.
const MIN_BUS_VOLTAGE: f32 = 1.0;

/// Grid controller strategy, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Voltage source: the converter owns the angle and regulates Vdq.
    Forming,
    /// Current source: the angle follows the external grid, Idq is regulated.
    Following,
}

#[derive(Debug, Clone)]
pub struct GridController {
    strategy: Strategy,
    sample_time: f32,
    omega_nominal: f32,
    pll_gain: f32,
    current_damping: f32,
    max_delta: f32,

    voltage_tracker: FrequencyLockedTracker,
    current_tracker: FrequencyLockedTracker,
    voltage_d_controller: Pid,
    voltage_q_controller: Pid,
    current_d_controller: Pid,
    current_q_controller: Pid,

    theta: f32,
    omega: f32,
    v_bus: f32,
    vdq_ref: RotatingReferenceFrame,
    idq_ref: RotatingReferenceFrame,

    vab: TwoPhaseStationaryOrthogonalReferenceFrame,
    iab: TwoPhaseStationaryOrthogonalReferenceFrame,
    vab_output: TwoPhaseStationaryOrthogonalReferenceFrame,
    vdq: RotatingReferenceFrame,
    idq: RotatingReferenceFrame,
    vdq_output: RotatingReferenceFrame,
    duty_differential: f32,
}

impl GridController {
    pub fn new(config: &ControlConfig) -> Self {
        let ts = config.sample_time;
        let omega_nominal = config.omega_nominal();
        let tracker = FrequencyLockedTracker::new(
            config.fll_gain,
            config.sogi_damping,
            omega_nominal,
            ts,
        );
        let voltage_gains = config.loop_params(config.voltage_gains);
        let current_gains = config.loop_params(config.current_gains);

        Self {
            strategy: config.strategy,
            sample_time: ts,
            omega_nominal,
            pll_gain: config.pll_gain,
            current_damping: config.current_damping,
            max_delta: crate::pwm::max_differential(config.duty_min, config.duty_max),
            voltage_tracker: tracker.clone(),
            current_tracker: tracker,
            voltage_d_controller: Pid::new(ts, voltage_gains),
            voltage_q_controller: Pid::new(ts, voltage_gains),
            current_d_controller: Pid::new(ts, current_gains),
            current_q_controller: Pid::new(ts, current_gains),
            theta: 0.0,
            omega: omega_nominal,
            v_bus: config.bus_voltage,
            vdq_ref: RotatingReferenceFrame::default(),
            idq_ref: RotatingReferenceFrame::default(),
            vab: Default::default(),
            iab: Default::default(),
            vab_output: Default::default(),
            vdq: Default::default(),
            idq: Default::default(),
            vdq_output: Default::default(),
            duty_differential: 0.0,
        }
    }

    /// Track the grid without producing an output: trackers, angle and the
    /// measured dq quantities are updated.
    pub fn observe(&mut self, grid_voltage: f32, grid_current: f32) {
        self.vab = self.voltage_tracker.update(grid_voltage);

        let phase_correction = match self.strategy {
            Strategy::Forming => {
                self.omega = self.omega_nominal;
                0.0
            }
            Strategy::Following => {
                self.omega = self.voltage_tracker.omega();
                // Bounded phase detector: zero only when the voltage vector
                // sits on the +d axis (stable) or the -d axis (unstable).
                let (sin, cos) = sin_cos(self.theta);
                let v = park(cos, sin, self.vab);
                let norm = (v.d * v.d + v.q * v.q).sqrt();
                if norm > 1e-3 {
                    self.pll_gain * v.q / norm
                } else {
                    0.0
                }
            }
        };
        self.theta = wrap_angle(self.theta + (self.omega + phase_correction) * self.sample_time);
        // The current has no frequency of its own worth tracking.
        self.iab = self.current_tracker.update_at(grid_current, self.omega);

        let (sin, cos) = sin_cos(self.theta);
        self.vdq = park(cos, sin, self.vab);
        self.idq = park(cos, sin, self.iab);
    }

    /// Run one full control step and return the duty-cycle differential
    /// applied as `offset +/- differential` on the two inverter legs.
    pub fn calculate_duty(&mut self, grid_voltage: f32, grid_current: f32) -> f32 {
        self.observe(grid_voltage, grid_current);

        self.vdq_output = match self.strategy {
            Strategy::Forming => RotatingReferenceFrame {
                d: self.vdq_ref.d + self.voltage_d_controller.compute(self.vdq_ref.d, self.vdq.d),
                q: self.vdq_ref.q + self.voltage_q_controller.compute(self.vdq_ref.q, self.vdq.q),
            },
            Strategy::Following => RotatingReferenceFrame {
                d: self.vdq.d + self.current_d_controller.compute(self.idq_ref.d, self.idq.d),
                q: self.vdq.q + self.current_q_controller.compute(self.idq_ref.q, self.idq.q),
            },
        };

        let (sin, cos) = sin_cos(self.theta);
        self.vab_output = inverse_park(cos, sin, self.vdq_output);
        if self.strategy == Strategy::Following {
            let current_ref = inverse_park(cos, sin, self.idq_ref);
            self.vab_output.alpha += self.current_damping * (current_ref.alpha - grid_current);
        }

        self.duty_differential = if self.v_bus > MIN_BUS_VOLTAGE {
            saturate(
                self.vab_output.alpha / (2.0 * self.v_bus),
                -self.max_delta,
                self.max_delta,
            )
        } else {
            0.0
        };
        self.duty_differential
    }

    pub fn set_v_bus(&mut self, value: f32) {
        self.v_bus = value;
    }

    pub fn set_vdq_ref(&mut self, reference: RotatingReferenceFrame) {
        self.vdq_ref = reference;
    }

    pub fn set_idq_ref(&mut self, reference: RotatingReferenceFrame) {
        self.idq_ref = reference;
    }

    /// Zero the four dq integrators, the trackers and angle keep running.
    pub fn reset_loops(&mut self) {
        self.voltage_d_controller.reset();
        self.voltage_q_controller.reset();
        self.current_d_controller.reset();
        self.current_q_controller.reset();
    }

    /// Zero every loop, tracker and the angle.
    pub fn reset(&mut self) {
        self.voltage_tracker.reset();
        self.current_tracker.reset();
        self.reset_loops();
        self.theta = 0.0;
        self.omega = self.omega_nominal;
        self.vab = Default::default();
        self.iab = Default::default();
        self.vab_output = Default::default();
        self.vdq = Default::default();
        self.idq = Default::default();
        self.vdq_output = Default::default();
        self.duty_differential = 0.0;
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn theta(&self) -> f32 {
        self.theta
    }

    /// Angular frequency in rad/s: nominal when forming, tracked when following.
    pub fn omega(&self) -> f32 {
        self.omega
    }

    pub fn vab(&self) -> TwoPhaseStationaryOrthogonalReferenceFrame {
        self.vab
    }

    pub fn iab(&self) -> TwoPhaseStationaryOrthogonalReferenceFrame {
        self.iab
    }

    pub fn vab_output(&self) -> TwoPhaseStationaryOrthogonalReferenceFrame {
        self.vab_output
    }

    pub fn vdq(&self) -> RotatingReferenceFrame {
        self.vdq
    }

    pub fn idq(&self) -> RotatingReferenceFrame {
        self.idq
    }

    pub fn vdq_output(&self) -> RotatingReferenceFrame {
        self.vdq_output
    }

    pub fn duty_differential(&self) -> f32 {
        self.duty_differential
    }

    /// Active (d) and reactive (q) power from the peak dq quantities.
    pub fn power(&self) -> RotatingReferenceFrame {
        RotatingReferenceFrame {
            d: 0.5 * (self.vdq.d * self.idq.d + self.vdq.q * self.idq.q),
            q: 0.5 * (self.vdq.q * self.idq.d - self.vdq.d * self.idq.q),
        }
    }
}
