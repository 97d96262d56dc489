//! Snapshots mirrored to the telemetry link, and the operator command.

use serde::{Deserialize, Serialize};

use crate::{
    mode::Mode,
    park_clarke::{RotatingReferenceFrame, TwoPhaseStationaryOrthogonalReferenceFrame},
};

/// Measurement frame of the latest tick, offsets applied.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Measurements {
    pub v_low: f32,
    pub v_ac: f32,
    pub v_bus: f32,
    pub v_bus_filtered: f32,
    pub i_low1: f32,
    pub i_low2: f32,
    pub i_ac: f32,
    /// `v_low - v_ac`
    pub v_grid: f32,
    /// `(v_low + v_ac) / 2`
    pub v_neutral: f32,
    pub i_grid: f32,
    /// Decaying peak of `|v_grid|`
    pub v_grid_peak: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InverterDebug {
    pub theta: f32,
    /// rad/s
    pub omega: f32,
    pub vab: TwoPhaseStationaryOrthogonalReferenceFrame,
    pub iab: TwoPhaseStationaryOrthogonalReferenceFrame,
    pub vab_output: TwoPhaseStationaryOrthogonalReferenceFrame,
    pub vdq: RotatingReferenceFrame,
    pub idq: RotatingReferenceFrame,
    pub vdq_output: RotatingReferenceFrame,
    pub vq_filtered: f32,
    pub duty_differential: f32,
    pub duty_offset: f32,
    pub duty_legs: [f32; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoostDebug {
    pub duty: [f32; 2],
    pub dead_time_rise_ns: [u16; 2],
    pub dead_time_fall_ns: [u16; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LiveStatus {
    pub mode: Mode,
    pub mode_code: u8,
    pub synchronized: bool,
    pub inverter_enabled: bool,
    /// Tracked grid frequency [Hz]
    pub frequency: f32,
    pub active_power: f32,
    pub reactive_power: f32,
    pub vdq_ref: RotatingReferenceFrame,
    pub idq_ref: RotatingReferenceFrame,
    pub sync_counter: u32,
    pub desync_counter: u32,
    pub power_counter: u32,
}

/// Operator command block. One-shot flags are cleared once consumed, the
/// reference fields are overwritten with their clamped value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Command {
    /// 0 requests Idle, 1 requests Power, other codes are ignored
    pub mode_request: u8,
    pub inverter_enable: bool,
    /// Direct voltage reference, used when forming [V]
    pub vd_ref: f32,
    /// Direct current reference, used when following [A]
    pub id_ref: f32,
    /// Download the capture once the converter is idle
    pub scope_dump: bool,
    /// Force the capture trigger
    pub scope_trigger: bool,
}
