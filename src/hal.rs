//! Interfaces to the sensing front end and the power stage.
//!
//! Firmware implements these on top of its ADC and timer drivers, tests and
//! the simulation demo implement them on plain structs.

/// Analog channels sampled once per control period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Inductor current of boost leg 1 [A]
    ILow1,
    /// Low side of the grid filter [V]
    VLow,
    /// AC tap [V]
    VAc,
    /// Inductor current of boost leg 2 [A]
    ILow2,
    /// DC bus [V]
    VDcBus,
    /// AC side current [A]
    IAc,
}

/// Half-bridge legs of the power stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// Boost leg 1
    Leg1Low,
    /// Boost leg 2
    Leg2Low,
    /// Inverter leg 1
    Leg1High,
    /// Inverter leg 2
    Leg2High,
}

impl Leg {
    pub const BOOST: [Leg; 2] = [Leg::Leg1Low, Leg::Leg2Low];
    pub const INVERTER: [Leg; 2] = [Leg::Leg1High, Leg::Leg2High];
}

pub trait Sensing {
    /// Latest converted value of `channel`, `None` while no fresh sample is
    /// available. Must not block.
    fn latest(&mut self, channel: Channel) -> Option<f32>;
}

/// Power-stage driver. Every call must be cheap and non-blocking.
pub trait PowerStage {
    /// `duty` is the high-side on-time fraction in `[0, 1]`.
    fn set_duty_cycle(&mut self, leg: Leg, duty: f32);
    fn set_dead_time(&mut self, leg: Leg, rise_ns: u16, fall_ns: u16);
    fn start(&mut self, leg: Leg);
    fn stop(&mut self, leg: Leg);
}
