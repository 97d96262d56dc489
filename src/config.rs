use core::f32::consts::{SQRT_2, TAU};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{inverter::Strategy, park_clarke::RotatingReferenceFrame, pid::PidParams};

/// Proportional gain and integral time of one control loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoopGains {
    pub kp: f32,
    pub ti: f32,
}

/// Lower and upper clamp of a dq reference pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceLimits {
    pub min: RotatingReferenceFrame,
    pub max: RotatingReferenceFrame,
}

impl ReferenceLimits {
    pub fn clamp(&self, reference: RotatingReferenceFrame) -> RotatingReferenceFrame {
        RotatingReferenceFrame {
            d: crate::primitives::saturate(reference.d, self.min.d, self.max.d),
            q: crate::primitives::saturate(reference.q, self.min.q, self.max.q),
        }
    }

    fn is_ordered(&self) -> bool {
        self.min.d <= self.max.d && self.min.q <= self.max.q
    }
}

/// Dead time of a power-stage leg, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadTime {
    pub rise_ns: u16,
    pub fall_ns: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("sample time must be positive")]
    SampleTime,
    #[error("nominal frequency must be positive")]
    NominalFrequency,
    #[error("capture decimation must be at least 1")]
    Decimation,
    #[error("bounds of `{0}` are inverted")]
    InvertedBounds(&'static str),
}

/// Every tunable constant of the control core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Control period [s]
    pub sample_time: f32,
    pub strategy: Strategy,
    /// Nominal grid frequency [Hz]
    pub nominal_frequency: f32,
    /// Synchronization band, relative to the nominal angular frequency
    pub sync_tolerance: f32,
    /// In-band ticks `sync_counter` must exceed
    pub sync_threshold: u32,
    /// Out-of-band ticks `desync_counter` must exceed in Power
    pub desync_threshold: u32,
    /// Following: ticks in Power before the inverter legs start
    pub power_settle_ticks: u32,

    /// Overcurrent trip level on both inductor currents [A]
    pub max_current: f32,
    /// Calibration offsets subtracted from ILow1 and ILow2 [A]
    pub current_offsets: [f32; 2],
    /// DC-bus low-pass time constant [s]
    pub bus_filter_tau: f32,
    /// Debug Vq low-pass time constant [s]
    pub vq_filter_tau: f32,
    /// Decay time of the grid voltage peak detector [s]
    pub grid_peak_decay: f32,

    /// Minimum filtered bus voltage to begin Startup [V]
    pub startup_bus_voltage: f32,
    /// Following: minimum grid voltage peak to begin Startup [V]
    pub min_grid_voltage: f32,
    /// Forming startup ramp rate [1/s]
    pub startup_ramp_rate: f32,
    /// Forming: ramp value that completes Startup
    pub startup_ramp_exit: f32,
    /// Duty offset ramp rate toward one half [1/s]
    pub offset_ramp_rate: f32,
    pub duty_min: f32,
    pub duty_max: f32,

    /// DC-bus regulator reference [V]
    pub boost_reference: f32,
    pub boost_gains: PidParams,
    pub boost_dead_time: DeadTime,

    /// Assumed DC supply, bounds the grid loop outputs [V]
    pub bus_voltage: f32,
    pub current_gains: LoopGains,
    /// Proportional gain on the instantaneous grid current error [V/A]
    pub current_damping: f32,
    pub voltage_gains: LoopGains,
    /// Tracker FLL settling gain [1/s]
    pub fll_gain: f32,
    pub sogi_damping: f32,
    /// Phase correction gain of the angle integrator [rad/s]
    pub pll_gain: f32,

    pub voltage_ref_limits: ReferenceLimits,
    pub current_ref_limits: ReferenceLimits,

    /// Hand every Nth tick to the recorder
    pub capture_decimation: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            sample_time: 100e-6,
            strategy: Strategy::Following,
            nominal_frequency: 50.0,
            sync_tolerance: 0.01,
            sync_threshold: 2000,
            desync_threshold: 200,
            power_settle_ticks: 2000,
            max_current: 8.0,
            current_offsets: [0.25, 0.25],
            bus_filter_tau: 0.1,
            vq_filter_tau: 1.0,
            grid_peak_decay: 0.05,
            startup_bus_voltage: 0.0,
            min_grid_voltage: 10.0,
            startup_ramp_rate: 50.0,
            startup_ramp_exit: 0.49,
            offset_ramp_rate: 1.0,
            duty_min: 0.1,
            duty_max: 0.9,
            boost_reference: 33.0,
            boost_gains: PidParams {
                kp: 0.000215,
                ti: 7.5175e-5,
                td: 0.0,
                n: 0.0,
                low: 0.0,
                high: 1.0,
            },
            boost_dead_time: DeadTime {
                rise_ns: 100,
                fall_ns: 100,
            },
            bus_voltage: 63.0,
            current_gains: LoopGains { kp: 1.0, ti: 0.005 },
            // about L * 2000 rad/s for the 2 mH filter
            current_damping: 4.0,
            voltage_gains: LoopGains { kp: 0.01, ti: 0.003 },
            fll_gain: 50.0,
            sogi_damping: SQRT_2,
            pll_gain: 200.0,
            voltage_ref_limits: ReferenceLimits {
                min: RotatingReferenceFrame { d: -0.1, q: -0.1 },
                max: RotatingReferenceFrame { d: 30.0, q: 30.0 },
            },
            current_ref_limits: ReferenceLimits {
                min: RotatingReferenceFrame { d: -0.1, q: -0.1 },
                max: RotatingReferenceFrame { d: 8.0, q: 1.0 },
            },
            capture_decimation: 1,
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_time.is_nan() || self.sample_time <= 0.0 {
            return Err(ConfigError::SampleTime);
        }
        if self.nominal_frequency.is_nan() || self.nominal_frequency <= 0.0 {
            return Err(ConfigError::NominalFrequency);
        }
        if self.capture_decimation == 0 {
            return Err(ConfigError::Decimation);
        }
        if self.duty_min > self.duty_max {
            return Err(ConfigError::InvertedBounds("duty"));
        }
        if self.boost_gains.low > self.boost_gains.high {
            return Err(ConfigError::InvertedBounds("boost_gains"));
        }
        if !self.voltage_ref_limits.is_ordered() {
            return Err(ConfigError::InvertedBounds("voltage_ref_limits"));
        }
        if !self.current_ref_limits.is_ordered() {
            return Err(ConfigError::InvertedBounds("current_ref_limits"));
        }
        Ok(())
    }

    /// Nominal angular frequency w0 [rad/s]
    pub fn omega_nominal(&self) -> f32 {
        TAU * self.nominal_frequency
    }

    /// Half width of the synchronization band [rad/s]
    pub fn sync_band(&self) -> f32 {
        self.sync_tolerance * self.omega_nominal()
    }

    /// Grid loop parameters: no derivative, output bounded by the bus.
    pub fn loop_params(&self, gains: LoopGains) -> PidParams {
        PidParams {
            kp: gains.kp,
            ti: gains.ti,
            td: 0.0,
            n: 1.0,
            low: -self.bus_voltage,
            high: self.bus_voltage,
        }
    }
}
