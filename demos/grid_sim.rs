//! Closed-loop simulation of the converter against a simple plant.
//!
//! The boost stage is a first-order model of `v_in / (1 - d)`, the bridge
//! feeds a 50 Hz grid (following) or a resistive load (forming) through an
//! L filter. Pass `forming` as the first argument to run the forming
//! strategy. The waveforms are written to `grid_sim.mcap`.

use std::{collections::BTreeMap, f32::consts::TAU, fs::File, io::BufWriter, sync::Arc};

use gridtie::{
    capture::Scope,
    hal::{Channel, Leg, PowerStage, Sensing},
    telemetry::Command,
    ControlConfig, Converter, Strategy,
};
use serde::Serialize;

const SOURCE_VOLTAGE: f32 = 20.0;
const BUS_TAU: f32 = 0.05;
const GRID_PEAK: f32 = 20.0;
const GRID_FREQUENCY: f32 = 50.0;
const FILTER_INDUCTANCE: f32 = 2e-3;
const FILTER_RESISTANCE: f32 = 0.2;
const LOAD_RESISTANCE: f32 = 10.0;
const SUPERVISORY_DIVIDER: u64 = 100;
const RECORD_DIVIDER: u64 = 10;

#[derive(Serialize)]
struct Values {
    time_ns: u64,
    mode: u8,
    synchronized: bool,
    v_grid: f32,
    i_grid: f32,
    v_bus: f32,
    duty_boost: f32,
    duty_legs: [f32; 2],
    theta: f32,
    frequency: f32,
    id: f32,
    iq: f32,
    active_power: f32,
    reactive_power: f32,
}

struct Plant {
    strategy: Strategy,
    time: f32,
    v_bus: f32,
    i_grid: f32,
}

/// Gate drivers of the four legs.
#[derive(Default)]
struct Bridge {
    time: f32,
    duty: [f32; 4],
    running: [bool; 4],
}

fn index(leg: Leg) -> usize {
    match leg {
        Leg::Leg1Low => 0,
        Leg::Leg2Low => 1,
        Leg::Leg1High => 2,
        Leg::Leg2High => 3,
    }
}

impl Plant {
    fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            time: 0.0,
            v_bus: SOURCE_VOLTAGE,
            i_grid: 0.0,
        }
    }

    fn v_grid(&self) -> f32 {
        match self.strategy {
            Strategy::Following => GRID_PEAK * (TAU * GRID_FREQUENCY * self.time).sin(),
            Strategy::Forming => LOAD_RESISTANCE * self.i_grid,
        }
    }

    fn step(&mut self, bridge: &Bridge, dt: f32) {
        let boost_duty = if bridge.running[0] {
            bridge.duty[0].min(0.9)
        } else {
            0.0
        };
        let target = SOURCE_VOLTAGE / (1.0 - boost_duty);
        self.v_bus += (target - self.v_bus) * dt / BUS_TAU;

        if bridge.running[2] && bridge.running[3] {
            let v_bridge = (bridge.duty[2] - bridge.duty[3]) * self.v_bus;
            let v_opposing = match self.strategy {
                Strategy::Following => self.v_grid(),
                Strategy::Forming => 0.0,
            };
            let resistance = match self.strategy {
                Strategy::Following => FILTER_RESISTANCE,
                Strategy::Forming => FILTER_RESISTANCE + LOAD_RESISTANCE,
            };
            self.i_grid +=
                (v_bridge - v_opposing - resistance * self.i_grid) * dt / FILTER_INDUCTANCE;
        } else {
            self.i_grid = 0.0;
        }
        self.time += dt;
    }
}

impl Sensing for Plant {
    fn latest(&mut self, channel: Channel) -> Option<f32> {
        let v_neutral = 0.5 * self.v_bus;
        let v_grid = self.v_grid();
        Some(match channel {
            Channel::ILow1 => self.i_grid + 0.25,
            Channel::ILow2 => 0.25,
            Channel::VLow => v_neutral + 0.5 * v_grid,
            Channel::VAc => v_neutral - 0.5 * v_grid,
            Channel::VDcBus => self.v_bus,
            Channel::IAc => self.i_grid,
        })
    }
}

impl PowerStage for Bridge {
    fn set_duty_cycle(&mut self, leg: Leg, duty: f32) {
        self.duty[index(leg)] = duty;
    }

    fn set_dead_time(&mut self, leg: Leg, rise_ns: u16, fall_ns: u16) {
        log::debug!("{leg:?} dead time {rise_ns}/{fall_ns} ns");
    }

    fn start(&mut self, leg: Leg) {
        log::info!("{leg:?} started at {:.3} s", self.time);
        self.running[index(leg)] = true;
    }

    fn stop(&mut self, leg: Leg) {
        log::info!("{leg:?} stopped at {:.3} s", self.time);
        self.running[index(leg)] = false;
    }
}

/// Operator writes applied at fixed times.
fn schedule(time_ns: u64) -> Option<Command> {
    let base = Command {
        mode_request: 1,
        inverter_enable: true,
        vd_ref: 15.0,
        ..Command::default()
    };
    match time_ns {
        0 => Some(base),
        1_000_000_000 => Some(Command {
            id_ref: 2.0,
            ..base
        }),
        1_800_000_000 => Some(Command {
            mode_request: 0,
            scope_dump: true,
            ..base
        }),
        _ => None,
    }
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let strategy = match std::env::args().nth(1).as_deref() {
        Some("forming") => Strategy::Forming,
        _ => Strategy::Following,
    };
    let config = ControlConfig {
        strategy,
        ..ControlConfig::default()
    };
    let dt = config.sample_time;
    let dt_ns = (f64::from(dt) * 1e9).round() as u64;
    let mut converter = Converter::new(config)?;
    let mut plant = Plant::new(strategy);
    let mut bridge = Bridge::default();
    let mut scope = Scope::<512>::new(0.5);

    let mut writer = mcap::Writer::new(BufWriter::new(File::create("grid_sim.mcap")?))?;
    let channel = mcap::Channel {
        topic: String::from("converter"),
        schema: Some(Arc::new(mcap::Schema {
            name: "".to_owned(),
            encoding: "".to_owned(),
            data: std::borrow::Cow::default(),
        })),
        message_encoding: "cbor".to_owned(),
        metadata: BTreeMap::default(),
    };
    let channel_id = writer.add_channel(&channel)?;

    let mut tick: u64 = 0;
    let mut time_ns: u64 = 0;
    let mut buffer: Vec<u8> = Vec::with_capacity(256);
    while time_ns <= 2_000_000_000 {
        if let Some(mut command) = schedule(time_ns) {
            converter.apply_command(&mut command);
            log::info!("command {command:?}");
        }

        bridge.time = plant.time;
        converter.control_tick(&mut plant, &mut bridge, &mut scope);
        if tick % SUPERVISORY_DIVIDER == 0 {
            converter.supervisory_tick(&mut scope);
        }

        if tick % RECORD_DIVIDER == 0 {
            let status = converter.live_status();
            let debug = converter.inverter_debug();
            let measurements = converter.measurements();
            buffer.clear();
            ciborium::into_writer(
                &Values {
                    time_ns,
                    mode: status.mode_code,
                    synchronized: status.synchronized,
                    v_grid: measurements.v_grid,
                    i_grid: measurements.i_grid,
                    v_bus: measurements.v_bus,
                    duty_boost: converter.boost_debug().duty[0],
                    duty_legs: debug.duty_legs,
                    theta: debug.theta,
                    frequency: status.frequency,
                    id: debug.idq.d,
                    iq: debug.idq.q,
                    active_power: status.active_power,
                    reactive_power: status.reactive_power,
                },
                &mut buffer,
            )?;
            writer.write_to_known_channel(
                &mcap::records::MessageHeader {
                    channel_id,
                    sequence: 0,
                    log_time: time_ns,
                    publish_time: time_ns,
                },
                &buffer,
            )?;
        }

        plant.step(&bridge, dt);
        tick += 1;
        time_ns += dt_ns;
    }

    writer.finish()?;
    Ok(())
}
