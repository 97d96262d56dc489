//! DC-bus regulator of the boost stage.

use crate::{
    config::{ControlConfig, DeadTime},
    pid::Pid,
};

/// PI loop whose output drives both boost legs with a shared duty cycle.
///
/// The integrator survives leg start/stop, only [`BoostRegulator::reset`]
/// clears it.
#[derive(Debug, Clone)]
pub struct BoostRegulator {
    controller: Pid,
    dead_time: DeadTime,
    duty: f32,
}

impl BoostRegulator {
    pub fn new(config: &ControlConfig) -> Self {
        Self {
            controller: Pid::new(config.sample_time, config.boost_gains),
            dead_time: config.boost_dead_time,
            duty: 0.0,
        }
    }

    /// Duty cycle for both boost legs.
    pub fn regulate(&mut self, reference: f32, measured: f32) -> f32 {
        self.duty = self.controller.compute(reference, measured);
        self.duty
    }

    pub fn duty(&self) -> f32 {
        self.duty
    }

    pub fn dead_time(&self) -> DeadTime {
        self.dead_time
    }

    pub fn reset(&mut self) {
        self.controller.reset();
        self.duty = 0.0;
    }
}
