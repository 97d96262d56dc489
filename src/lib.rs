//! Control core of a single-phase, two-stage (boost + H-bridge) grid-tied
//! converter.
//!
//! [`Converter::control_tick`] runs the fixed-period control cycle: sample,
//! protect, regulate the DC bus, synchronize to the grid and drive the
//! inverter legs. [`Converter::supervisory_tick`] runs the slower mode
//! bookkeeping from a background task. Both talk to the hardware only
//! through the [`hal`] and [`capture`] traits.

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod boost;
pub mod capture;
pub mod config;
pub mod converter;
pub mod hal;
pub mod inverter;
pub mod mode;
pub mod park_clarke;
pub mod pid;
pub mod primitives;
pub mod pwm;
pub mod sogi;
pub mod telemetry;

pub use config::{ConfigError, ControlConfig};
pub use converter::Converter;
pub use inverter::Strategy;
pub use mode::{Mode, ModeRequest};
