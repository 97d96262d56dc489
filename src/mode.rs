//! Supervisory operating modes.
//!
//! The supervisory transitions are a pure function of the current mode and
//! a snapshot of the inputs. The Error mode is never produced here: only
//! the real-time overcurrent check enters it.

use serde::{Deserialize, Serialize};

use crate::inverter::Strategy;

/// Operating mode, with the numeric codes mirrored to telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Mode {
    #[default]
    Idle = 0,
    Power = 1,
    Error = 3,
    Startup = 4,
}

impl Mode {
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Power-stage legs are allowed to switch.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Startup | Self::Power)
    }
}

/// Mode asked for by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModeRequest {
    #[default]
    Idle,
    Power,
}

impl ModeRequest {
    /// Decode the command code, `None` for codes without a meaning.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Idle),
            1 => Some(Self::Power),
            _ => None,
        }
    }
}

/// Everything the supervisory transition looks at.
#[derive(Debug, Clone, Copy)]
pub struct SupervisoryInputs {
    pub requested: ModeRequest,
    pub strategy: Strategy,
    pub inverter_enabled: bool,
    /// Startup sequence already completed in this power session.
    pub startup_done: bool,
    /// Forming startup duty ramp.
    pub startup_ramp: f32,
    pub startup_ramp_exit: f32,
    pub synchronized: bool,
    pub bus_voltage: f32,
    pub startup_bus_voltage: f32,
    pub grid_peak: f32,
    pub min_grid_voltage: f32,
}

/// Why Startup was left for Power.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupExit {
    /// Forming ramp finished or Following synchronized.
    Completed,
    /// The inverter enable flag dropped mid-startup.
    InverterDisabled,
}

/// Outcome of one supervisory evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: Mode,
    pub startup_exit: Option<StartupExit>,
}

impl Transition {
    const fn to(next: Mode) -> Self {
        Self {
            next,
            startup_exit: None,
        }
    }
}

/// Supervisory transition table. The global Idle override has the highest
/// priority and also releases a latched Error.
pub fn transition(mode: Mode, inputs: &SupervisoryInputs) -> Transition {
    if inputs.requested == ModeRequest::Idle {
        return Transition::to(Mode::Idle);
    }

    match mode {
        Mode::Idle => Transition::to(Mode::Power),
        Mode::Startup => {
            if !inputs.inverter_enabled {
                return Transition {
                    next: Mode::Power,
                    startup_exit: Some(StartupExit::InverterDisabled),
                };
            }
            let completed = match inputs.strategy {
                Strategy::Forming => inputs.startup_ramp > inputs.startup_ramp_exit,
                Strategy::Following => inputs.synchronized,
            };
            if completed {
                Transition {
                    next: Mode::Power,
                    startup_exit: Some(StartupExit::Completed),
                }
            } else {
                Transition::to(Mode::Startup)
            }
        }
        Mode::Power => {
            let bus_ready = inputs.bus_voltage >= inputs.startup_bus_voltage;
            let grid_ready = match inputs.strategy {
                Strategy::Forming => true,
                Strategy::Following => inputs.grid_peak >= inputs.min_grid_voltage,
            };
            if inputs.inverter_enabled && !inputs.startup_done && bus_ready && grid_ready {
                Transition::to(Mode::Startup)
            } else {
                Transition::to(Mode::Power)
            }
        }
        Mode::Error => Transition::to(Mode::Error),
    }
}

/// Debounced synchronization bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct SyncMonitor {
    sync_counter: u32,
    desync_counter: u32,
    synchronized: bool,
}

impl SyncMonitor {
    pub const fn new() -> Self {
        Self {
            sync_counter: 0,
            desync_counter: 0,
            synchronized: false,
        }
    }

    /// Startup check: the flag rises once more than `threshold` consecutive
    /// ticks were in band, and falls on the first tick out of band.
    pub fn track_startup(&mut self, in_band: bool, threshold: u32) {
        if in_band {
            self.sync_counter += 1;
            if self.sync_counter > threshold {
                self.synchronized = true;
                self.sync_counter = 0;
            }
        } else {
            self.sync_counter = 0;
            self.synchronized = false;
        }
    }

    /// Power check. Returns `true` when more than `threshold` consecutive
    /// ticks were out of band; both counters are reset in that case.
    pub fn track_power(&mut self, in_band: bool, threshold: u32) -> bool {
        self.synchronized = in_band;
        if in_band {
            self.desync_counter = 0;
            return false;
        }
        self.desync_counter += 1;
        if self.desync_counter > threshold {
            self.desync_counter = 0;
            self.sync_counter = 0;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    pub fn sync_counter(&self) -> u32 {
        self.sync_counter
    }

    pub fn desync_counter(&self) -> u32 {
        self.desync_counter
    }
}
