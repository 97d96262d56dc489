//! Converter context: the real-time control cycle, the supervisory tick and
//! operator command handling.
//!
//! All state lives in [`Converter`] and every entry point takes `&mut self`,
//! so there is exactly one writer at a time. Firmware keeps the converter in
//! a shared resource locked by both the control interrupt and the
//! supervisory task; the control interrupt has the higher priority, so the
//! supervisory task never observes a half-finished tick.

use core::f32::consts::TAU;

use micromath::F32Ext;

use crate::{
    boost::BoostRegulator,
    capture::{CaptureFrame, Recorder},
    config::{ConfigError, ControlConfig},
    hal::{Channel, Leg, PowerStage, Sensing},
    inverter::{GridController, Strategy},
    mode::{transition, Mode, ModeRequest, StartupExit, SupervisoryInputs, SyncMonitor},
    park_clarke::RotatingReferenceFrame,
    primitives::{rate_limiter, saturate, LowPassFilter},
    pwm::{leg_duties, startup_duties},
    telemetry::{BoostDebug, Command, InverterDebug, LiveStatus, Measurements},
};

/// Below this filtered bus voltage the neutral-point offset is held.
const MIN_OFFSET_BUS_VOLTAGE: f32 = 1.0;

/// Centre of the inverter duty range.
const DUTY_CENTRE: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct Converter {
    config: ControlConfig,

    mode: Mode,
    requested: ModeRequest,
    inverter_enabled: bool,
    startup_done: bool,

    grid: GridController,
    boost: BoostRegulator,
    sync: SyncMonitor,
    power_counter: u32,
    vdq_ref: RotatingReferenceFrame,
    idq_ref: RotatingReferenceFrame,

    measurements: Measurements,
    bus_filter: LowPassFilter,
    vq_filter: LowPassFilter,

    startup_ramp: f32,
    duty_offset: f32,
    duty_differential: f32,
    duty_legs: [f32; 2],
    boost_running: bool,
    inverter_running: bool,

    capture_counter: u32,
    capture_trigger: bool,
    capture_arm_pending: bool,
    capture_download: bool,
}

impl Converter {
    pub fn new(config: ControlConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let ts = config.sample_time;
        Ok(Self {
            mode: Mode::Idle,
            requested: ModeRequest::Idle,
            inverter_enabled: false,
            startup_done: false,
            grid: GridController::new(&config),
            boost: BoostRegulator::new(&config),
            sync: SyncMonitor::new(),
            power_counter: 0,
            vdq_ref: config.voltage_ref_limits.clamp(RotatingReferenceFrame::default()),
            idq_ref: config.current_ref_limits.clamp(RotatingReferenceFrame::default()),
            measurements: Measurements::default(),
            bus_filter: LowPassFilter::new(ts, config.bus_filter_tau),
            vq_filter: LowPassFilter::new(ts, config.vq_filter_tau),
            startup_ramp: 0.0,
            duty_offset: 0.0,
            duty_differential: 0.0,
            duty_legs: [0.0; 2],
            boost_running: false,
            inverter_running: false,
            capture_counter: 0,
            capture_trigger: false,
            capture_arm_pending: false,
            capture_download: false,
            config,
        })
    }

    /// One period of the real-time control cycle. Never blocks.
    pub fn control_tick(
        &mut self,
        sensing: &mut impl Sensing,
        stage: &mut impl PowerStage,
        recorder: &mut impl Recorder,
    ) {
        self.sample(sensing);

        let max_current = self.config.max_current;
        if self.measurements.i_low1.abs() > max_current
            || self.measurements.i_low2.abs() > max_current
        {
            self.trip(max_current);
        }

        if !self.mode.is_active() {
            self.stop_boost(stage);
            self.stop_inverter(stage);
        } else {
            self.run_boost(stage);
        }

        if !self.inverter_enabled {
            self.stop_inverter(stage);
            self.startup_done = false;
            self.power_counter = 0;
        }

        match self.mode {
            Mode::Startup if self.inverter_enabled => self.run_startup(stage),
            Mode::Power if self.inverter_enabled && self.startup_done => self.run_power(stage),
            _ => {}
        }

        self.vq_filter.run(self.grid.vdq().q);
        self.capture(recorder);
    }

    fn sample(&mut self, sensing: &mut impl Sensing) {
        let [offset1, offset2] = self.config.current_offsets;
        let m = &mut self.measurements;
        refresh(&mut m.v_low, sensing.latest(Channel::VLow), 0.0);
        refresh(&mut m.v_ac, sensing.latest(Channel::VAc), 0.0);
        refresh(&mut m.v_bus, sensing.latest(Channel::VDcBus), 0.0);
        refresh(&mut m.i_low1, sensing.latest(Channel::ILow1), offset1);
        refresh(&mut m.i_low2, sensing.latest(Channel::ILow2), offset2);
        refresh(&mut m.i_ac, sensing.latest(Channel::IAc), 0.0);

        m.v_grid = m.v_low - m.v_ac;
        m.v_neutral = 0.5 * (m.v_low + m.v_ac);
        m.i_grid = m.i_low1;
        m.v_bus_filtered = self.bus_filter.run(m.v_bus);

        let decayed = m.v_grid_peak
            - m.v_grid_peak * self.config.sample_time / self.config.grid_peak_decay;
        m.v_grid_peak = m.v_grid.abs().max(decayed);
    }

    fn trip(&mut self, max_current: f32) {
        if self.mode != Mode::Error {
            log::error!(
                "overcurrent: i_low1 {} A, i_low2 {} A, limit {} A",
                self.measurements.i_low1,
                self.measurements.i_low2,
                max_current
            );
            self.capture_trigger = true;
        }
        self.mode = Mode::Error;
        self.startup_done = false;
    }

    fn run_boost(&mut self, stage: &mut impl PowerStage) {
        let duty = self
            .boost
            .regulate(self.config.boost_reference, self.measurements.v_bus_filtered);
        for leg in Leg::BOOST {
            stage.set_duty_cycle(leg, duty);
        }
        if !self.boost_running {
            let dead_time = self.boost.dead_time();
            for leg in Leg::BOOST {
                stage.set_dead_time(leg, dead_time.rise_ns, dead_time.fall_ns);
                stage.start(leg);
            }
            self.boost_running = true;
        }
    }

    fn run_startup(&mut self, stage: &mut impl PowerStage) {
        match self.grid.strategy() {
            Strategy::Forming => {
                let ramp = rate_limiter(
                    DUTY_CENTRE,
                    self.startup_ramp,
                    self.config.startup_ramp_rate,
                    self.config.sample_time,
                );
                self.startup_ramp = ramp.min(DUTY_CENTRE);
                self.duty_offset = DUTY_CENTRE;
                self.duty_differential = self.startup_ramp - DUTY_CENTRE;
                self.duty_legs =
                    startup_duties(self.startup_ramp, self.config.duty_min, self.config.duty_max);
                self.apply_inverter_duties(stage);
                if self.inverter_enabled {
                    self.start_inverter(stage);
                }
            }
            Strategy::Following => {
                self.grid
                    .observe(self.measurements.v_grid, self.measurements.i_grid);
                let in_band = self.in_band();
                self.sync.track_startup(in_band, self.config.sync_threshold);
            }
        }
    }

    fn run_power(&mut self, stage: &mut impl PowerStage) {
        self.grid.set_v_bus(self.measurements.v_bus_filtered);
        match self.grid.strategy() {
            Strategy::Forming => self.grid.set_vdq_ref(self.vdq_ref),
            Strategy::Following => self.grid.set_idq_ref(self.idq_ref),
        }
        self.duty_differential = self
            .grid
            .calculate_duty(self.measurements.v_grid, self.measurements.i_grid);
        if !self.inverter_running {
            // nothing flows yet, the integrators would only wind up
            self.grid.reset_loops();
        }

        let in_band = self.in_band();
        if self.sync.track_power(in_band, self.config.desync_threshold) {
            log::warn!(
                "no longer synchronized: {} Hz, returning to idle",
                self.grid.omega() / TAU
            );
            self.enter_idle();
            self.requested = ModeRequest::Idle;
            self.stop_boost(stage);
            self.stop_inverter(stage);
            return;
        }

        if self.inverter_running {
            self.duty_offset = rate_limiter(
                DUTY_CENTRE,
                self.duty_offset,
                self.config.offset_ramp_rate,
                self.config.sample_time,
            );
        } else if self.measurements.v_bus_filtered >= MIN_OFFSET_BUS_VOLTAGE {
            self.duty_offset = saturate(
                self.measurements.v_neutral / self.measurements.v_bus_filtered,
                0.0,
                1.0,
            );
        }

        self.duty_legs = leg_duties(
            self.duty_offset,
            self.duty_differential,
            self.config.duty_min,
            self.config.duty_max,
        );
        self.apply_inverter_duties(stage);

        match self.grid.strategy() {
            Strategy::Forming => self.start_inverter(stage),
            Strategy::Following => {
                self.power_counter = self.power_counter.saturating_add(1);
                if self.power_counter > self.config.power_settle_ticks {
                    self.start_inverter(stage);
                }
            }
        }
    }

    fn in_band(&self) -> bool {
        (self.grid.omega() - self.config.omega_nominal()).abs() < self.config.sync_band()
    }

    fn apply_inverter_duties(&self, stage: &mut impl PowerStage) {
        for (leg, duty) in Leg::INVERTER.into_iter().zip(self.duty_legs) {
            stage.set_duty_cycle(leg, duty);
        }
    }

    fn start_inverter(&mut self, stage: &mut impl PowerStage) {
        if !self.inverter_running {
            for leg in Leg::INVERTER {
                stage.start(leg);
            }
            self.inverter_running = true;
        }
    }

    fn stop_inverter(&mut self, stage: &mut impl PowerStage) {
        if self.inverter_running {
            for leg in Leg::INVERTER {
                stage.stop(leg);
            }
            self.inverter_running = false;
        }
    }

    fn stop_boost(&mut self, stage: &mut impl PowerStage) {
        if self.boost_running {
            for leg in Leg::BOOST {
                stage.stop(leg);
            }
            self.boost_running = false;
        }
    }

    fn capture(&mut self, recorder: &mut impl Recorder) {
        self.capture_counter += 1;
        if self.capture_counter >= self.config.capture_decimation {
            self.capture_counter = 0;
            recorder.acquire(&self.capture_frame(), self.capture_trigger);
            self.capture_trigger = false;
        }
    }

    pub fn capture_frame(&self) -> CaptureFrame {
        let m = &self.measurements;
        let grid = &self.grid;
        CaptureFrame {
            i_low1: m.i_low1,
            i_ac: m.i_ac,
            v_grid: m.v_grid,
            v_bus: m.v_bus,
            duty_leg1: self.duty_legs[0],
            duty_leg2: self.duty_legs[1],
            id: grid.idq().d,
            iq: grid.idq().q,
            id_ref: self.idq_ref.d,
            i_alpha: grid.iab().alpha,
            i_beta: grid.iab().beta,
            vd: grid.vdq().d,
            vq: grid.vdq().q,
            vd_out: grid.vdq_output().d,
            vq_out: grid.vdq_output().q,
            v_alpha: grid.vab().alpha,
            v_beta: grid.vab().beta,
            v_alpha_out: grid.vab_output().alpha,
            v_beta_out: grid.vab_output().beta,
        }
    }

    /// Slow mode bookkeeping, run from the background task.
    pub fn supervisory_tick(&mut self, recorder: &mut impl Recorder) {
        let inputs = SupervisoryInputs {
            requested: self.requested,
            strategy: self.grid.strategy(),
            inverter_enabled: self.inverter_enabled,
            startup_done: self.startup_done,
            startup_ramp: self.startup_ramp,
            startup_ramp_exit: self.config.startup_ramp_exit,
            synchronized: self.sync.is_synchronized(),
            bus_voltage: self.measurements.v_bus_filtered,
            startup_bus_voltage: self.config.startup_bus_voltage,
            grid_peak: self.measurements.v_grid_peak,
            min_grid_voltage: self.config.min_grid_voltage,
        };
        let outcome = transition(self.mode, &inputs);

        if outcome.startup_exit == Some(StartupExit::Completed) {
            self.startup_done = true;
        }
        if outcome.next != self.mode {
            log::info!("mode {:?} -> {:?}", self.mode, outcome.next);
            match outcome.next {
                Mode::Idle => self.enter_idle(),
                Mode::Startup => {
                    self.sync.reset();
                    self.startup_ramp = 0.0;
                    self.power_counter = 0;
                    self.mode = Mode::Startup;
                }
                next => self.mode = next,
            }
        }

        if self.capture_arm_pending {
            recorder.arm();
            self.capture_arm_pending = false;
        }
        if self.capture_download && self.mode == Mode::Idle {
            recorder.dump();
            self.capture_download = false;
        }
    }

    /// Idle entry: every controller restarts from scratch on the next
    /// Power request. The legs are stopped by the next control tick.
    fn enter_idle(&mut self) {
        self.mode = Mode::Idle;
        self.startup_done = false;
        self.boost.reset();
        self.grid.reset();
        self.sync.reset();
        self.power_counter = 0;
        self.startup_ramp = 0.0;
        self.duty_offset = 0.0;
        self.duty_differential = 0.0;
        self.vq_filter.reset();
    }

    /// Apply one operator write. References are saturated and the accepted
    /// values written back, the one-shot capture flags are cleared.
    pub fn apply_command(&mut self, command: &mut Command) {
        if let Some(request) = ModeRequest::from_code(command.mode_request) {
            if request == ModeRequest::Power
                && self.requested != ModeRequest::Power
                && !self.capture_download
            {
                self.capture_arm_pending = true;
            }
            self.requested = request;
        }
        self.inverter_enabled = command.inverter_enable;

        match self.grid.strategy() {
            Strategy::Forming => {
                let reference = self.set_vdq_ref(RotatingReferenceFrame {
                    d: command.vd_ref,
                    ..self.vdq_ref
                });
                command.vd_ref = reference.d;
            }
            Strategy::Following => {
                let reference = self.set_idq_ref(RotatingReferenceFrame {
                    d: command.id_ref,
                    ..self.idq_ref
                });
                command.id_ref = reference.d;
            }
        }

        if command.scope_dump {
            self.capture_download = true;
            self.capture_trigger = false;
            command.scope_dump = false;
        }
        if command.scope_trigger {
            self.capture_trigger = true;
            command.scope_trigger = false;
        }
    }

    pub fn request(&mut self, request: ModeRequest) {
        self.requested = request;
    }

    pub fn set_inverter_enabled(&mut self, enabled: bool) {
        self.inverter_enabled = enabled;
    }

    /// Saturate and store the voltage reference, returns the accepted value.
    pub fn set_vdq_ref(&mut self, reference: RotatingReferenceFrame) -> RotatingReferenceFrame {
        self.vdq_ref = self.config.voltage_ref_limits.clamp(reference);
        self.vdq_ref
    }

    /// Saturate and store the current reference, returns the accepted value.
    pub fn set_idq_ref(&mut self, reference: RotatingReferenceFrame) -> RotatingReferenceFrame {
        self.idq_ref = self.config.current_ref_limits.clamp(reference);
        self.idq_ref
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn requested(&self) -> ModeRequest {
        self.requested
    }

    pub fn is_synchronized(&self) -> bool {
        self.sync.is_synchronized()
    }

    pub fn startup_done(&self) -> bool {
        self.startup_done
    }

    pub fn sync_counter(&self) -> u32 {
        self.sync.sync_counter()
    }

    pub fn desync_counter(&self) -> u32 {
        self.sync.desync_counter()
    }

    pub fn power_counter(&self) -> u32 {
        self.power_counter
    }

    pub fn grid(&self) -> &GridController {
        &self.grid
    }

    pub fn measurements(&self) -> Measurements {
        self.measurements
    }

    pub fn inverter_debug(&self) -> InverterDebug {
        InverterDebug {
            theta: self.grid.theta(),
            omega: self.grid.omega(),
            vab: self.grid.vab(),
            iab: self.grid.iab(),
            vab_output: self.grid.vab_output(),
            vdq: self.grid.vdq(),
            idq: self.grid.idq(),
            vdq_output: self.grid.vdq_output(),
            vq_filtered: self.vq_filter.get(),
            duty_differential: self.duty_differential,
            duty_offset: self.duty_offset,
            duty_legs: self.duty_legs,
        }
    }

    pub fn boost_debug(&self) -> BoostDebug {
        let dead_time = self.boost.dead_time();
        BoostDebug {
            duty: [self.boost.duty(); 2],
            dead_time_rise_ns: [dead_time.rise_ns; 2],
            dead_time_fall_ns: [dead_time.fall_ns; 2],
        }
    }

    pub fn live_status(&self) -> LiveStatus {
        let power = self.grid.power();
        LiveStatus {
            mode: self.mode,
            mode_code: self.mode.code(),
            synchronized: self.sync.is_synchronized(),
            inverter_enabled: self.inverter_enabled,
            frequency: self.grid.omega() / TAU,
            active_power: power.d,
            reactive_power: power.q,
            vdq_ref: self.vdq_ref,
            idq_ref: self.idq_ref,
            sync_counter: self.sync.sync_counter(),
            desync_counter: self.sync.desync_counter(),
            power_counter: self.power_counter,
        }
    }
}

/// Store a fresh sample minus `offset`, keep the previous value otherwise.
fn refresh(slot: &mut f32, sample: Option<f32>, offset: f32) {
    if let Some(value) = sample {
        *slot = value - offset;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Scope;

    const FILTER_INDUCTANCE: f32 = 2e-3;
    const FILTER_RESISTANCE: f32 = 0.2;

    /// What the bridge drives through the L filter.
    #[derive(Clone, Copy)]
    enum Load {
        /// The bench sine as a stiff grid.
        Grid,
        /// A resistor, its voltage is reported as the grid voltage.
        Resistive(f32),
    }

    /// Synthetic grid: `v_grid = amplitude * sin(2 pi f t)` around a bus
    /// split evenly between the two filter nodes. With a `load` the bridge
    /// output drives a filter current, otherwise no current flows.
    struct GridBench {
        time: f32,
        frequency: f32,
        amplitude: f32,
        v_bus: f32,
        i_low: [f32; 2],
        silent: bool,
        load: Option<Load>,
        i_grid: f32,
    }

    impl GridBench {
        fn new(frequency: f32) -> Self {
            Self {
                time: 0.0,
                frequency,
                amplitude: 20.0,
                v_bus: 40.0,
                // raw readings that land on zero once calibrated
                i_low: [0.25, 0.25],
                silent: false,
                load: None,
                i_grid: 0.0,
            }
        }

        fn v_grid(&self) -> f32 {
            match self.load {
                Some(Load::Resistive(resistance)) => resistance * self.i_grid,
                _ => self.amplitude * (TAU * self.frequency * self.time).sin(),
            }
        }

        /// Integrate the filter current over one period of the legs as
        /// `stage` left them, then move time forward.
        fn advance(&mut self, stage: &RecordingStage, dt: f32) {
            let bridge_on = stage.is_running(Leg::Leg1High) && stage.is_running(Leg::Leg2High);
            match self.load {
                Some(load) if bridge_on => {
                    let v_bridge = (stage.duty[2] - stage.duty[3]) * self.v_bus;
                    let (v_opposing, resistance) = match load {
                        Load::Grid => (self.v_grid(), FILTER_RESISTANCE),
                        Load::Resistive(r) => (0.0, FILTER_RESISTANCE + r),
                    };
                    self.i_grid +=
                        (v_bridge - v_opposing - resistance * self.i_grid) * dt / FILTER_INDUCTANCE;
                }
                _ => self.i_grid = 0.0,
            }
            self.time += dt;
        }
    }

    impl Sensing for GridBench {
        fn latest(&mut self, channel: Channel) -> Option<f32> {
            if self.silent {
                return None;
            }
            let v_grid = self.v_grid();
            Some(match channel {
                Channel::ILow1 => self.i_low[0] + self.i_grid,
                Channel::ILow2 => self.i_low[1],
                Channel::VLow => 0.5 * (self.v_bus + v_grid),
                Channel::VAc => 0.5 * (self.v_bus - v_grid),
                Channel::VDcBus => self.v_bus,
                Channel::IAc => 0.0,
            })
        }
    }

    #[derive(Default)]
    struct RecordingStage {
        duty: [f32; 4],
        dead_time: [(u16, u16); 4],
        running: [bool; 4],
        starts: usize,
        stops: usize,
    }

    fn index(leg: Leg) -> usize {
        match leg {
            Leg::Leg1Low => 0,
            Leg::Leg2Low => 1,
            Leg::Leg1High => 2,
            Leg::Leg2High => 3,
        }
    }

    impl RecordingStage {
        fn is_running(&self, leg: Leg) -> bool {
            self.running[index(leg)]
        }

        fn any_running(&self) -> bool {
            self.running.iter().any(|&running| running)
        }
    }

    impl PowerStage for RecordingStage {
        fn set_duty_cycle(&mut self, leg: Leg, duty: f32) {
            self.duty[index(leg)] = duty;
        }

        fn set_dead_time(&mut self, leg: Leg, rise_ns: u16, fall_ns: u16) {
            self.dead_time[index(leg)] = (rise_ns, fall_ns);
        }

        fn start(&mut self, leg: Leg) {
            assert!(!self.is_running(leg), "{leg:?} started twice");
            self.running[index(leg)] = true;
            self.starts += 1;
        }

        fn stop(&mut self, leg: Leg) {
            assert!(self.is_running(leg), "{leg:?} stopped while idle");
            self.running[index(leg)] = false;
            self.stops += 1;
        }
    }

    #[derive(Default)]
    struct CountingRecorder {
        arms: usize,
        frames: usize,
        triggers: usize,
        dumps: usize,
    }

    impl Recorder for CountingRecorder {
        fn arm(&mut self) {
            self.arms += 1;
        }

        fn acquire(&mut self, _frame: &CaptureFrame, trigger: bool) {
            self.frames += 1;
            if trigger {
                self.triggers += 1;
            }
        }

        fn dump(&mut self) {
            self.dumps += 1;
        }
    }

    struct Rig {
        converter: Converter,
        bench: GridBench,
        stage: RecordingStage,
        recorder: CountingRecorder,
        ticks: usize,
    }

    impl Rig {
        fn new(strategy: Strategy, frequency: f32) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let config = ControlConfig {
                strategy,
                ..ControlConfig::default()
            };
            Self {
                converter: Converter::new(config).unwrap(),
                bench: GridBench::new(frequency),
                stage: RecordingStage::default(),
                recorder: CountingRecorder::default(),
                ticks: 0,
            }
        }

        fn command(&mut self, mut command: Command) -> Command {
            self.converter.apply_command(&mut command);
            command
        }

        fn power_on(&mut self) {
            self.command(Command {
                mode_request: 1,
                inverter_enable: true,
                vd_ref: 20.0,
                ..Command::default()
            });
        }

        /// One control period; the supervisory task runs every tenth period.
        fn tick(&mut self) {
            self.converter
                .control_tick(&mut self.bench, &mut self.stage, &mut self.recorder);
            self.bench
                .advance(&self.stage, self.converter.config().sample_time);
            self.ticks += 1;
            if self.ticks % 10 == 0 {
                self.converter.supervisory_tick(&mut self.recorder);
            }
        }

        /// Run until `done` holds, returns the number of ticks it took.
        #[track_caller]
        fn run_until(&mut self, limit: usize, done: impl Fn(&Converter) -> bool) -> usize {
            for n in 0..limit {
                if done(&self.converter) {
                    return n;
                }
                self.tick();
            }
            if done(&self.converter) {
                return limit;
            }
            panic!(
                "condition not met within {limit} ticks, mode {:?}",
                self.converter.mode()
            );
        }
    }

    #[test]
    fn rejects_invalid_config() {
        let config = ControlConfig {
            sample_time: -1.0,
            ..ControlConfig::default()
        };
        assert_eq!(Converter::new(config).err(), Some(ConfigError::SampleTime));
    }

    #[test]
    fn idle_keeps_every_leg_stopped() {
        let mut rig = Rig::new(Strategy::Forming, 50.0);
        for _ in 0..100 {
            rig.tick();
        }
        assert_eq!(rig.converter.mode(), Mode::Idle);
        assert_eq!(rig.stage.starts, 0);
    }

    #[test]
    fn forming_reaches_power_through_startup() {
        let mut rig = Rig::new(Strategy::Forming, 50.0);
        rig.power_on();

        rig.run_until(20, |c| c.mode() == Mode::Startup);
        assert!(rig.stage.is_running(Leg::Leg1Low));
        assert!(rig.stage.is_running(Leg::Leg2Low));
        assert_eq!(rig.stage.dead_time[0], (100, 100));

        // 0.5 / (50/s * 100 us) = 100 ticks of ramp
        let ticks = rig.run_until(200, |c| c.mode() == Mode::Power && c.startup_done());
        assert!(ticks >= 99, "{ticks}");
        assert!(rig.stage.is_running(Leg::Leg1High));
        assert!(rig.stage.is_running(Leg::Leg2High));

        // The closed loop keeps both legs inside the duty clamp.
        for _ in 0..2_000 {
            rig.tick();
            for leg in Leg::INVERTER {
                assert!((0.1..=0.9).contains(&rig.stage.duty[index(leg)]));
            }
        }
        assert_eq!(rig.converter.mode(), Mode::Power);
        assert_eq!(rig.converter.inverter_debug().duty_offset, 0.5);
    }

    #[test]
    fn forming_startup_ramp_splits_legs() {
        let mut rig = Rig::new(Strategy::Forming, 50.0);
        rig.power_on();
        rig.run_until(20, |c| c.mode() == Mode::Startup);
        rig.tick();
        let [d1, d2] = [rig.stage.duty[2], rig.stage.duty[3]];
        assert_eq!(d1, 0.1);
        assert_eq!(d2, 0.9);
        rig.run_until(200, |c| c.mode() == Mode::Power);
        assert_eq!(rig.stage.duty[2], 0.5);
        assert_eq!(rig.stage.duty[3], 0.5);
    }

    #[test]
    fn overcurrent_trips_within_the_tick() {
        let mut rig = Rig::new(Strategy::Forming, 50.0);
        rig.power_on();
        rig.run_until(400, |c| c.mode() == Mode::Power && c.startup_done());
        assert!(rig.stage.any_running());

        rig.bench.i_low[1] = -9.0;
        rig.converter
            .control_tick(&mut rig.bench, &mut rig.stage, &mut rig.recorder);
        assert_eq!(rig.converter.mode(), Mode::Error);
        assert!(!rig.stage.any_running());
        assert!(!rig.converter.startup_done());
        assert_eq!(rig.recorder.triggers, 1);

        // Latched, even once the current is back to normal.
        rig.bench.i_low[1] = 0.25;
        for _ in 0..100 {
            rig.tick();
        }
        assert_eq!(rig.converter.mode(), Mode::Error);
        assert!(!rig.stage.any_running());

        rig.command(Command::default());
        rig.converter.supervisory_tick(&mut rig.recorder);
        assert_eq!(rig.converter.mode(), Mode::Idle);
    }

    #[test]
    fn overcurrent_trips_from_idle() {
        let mut rig = Rig::new(Strategy::Following, 50.0);
        rig.bench.i_low[0] = 8.5;
        rig.tick();
        assert_eq!(rig.converter.mode(), Mode::Error);
    }

    #[test]
    fn limit_is_exclusive() {
        let mut rig = Rig::new(Strategy::Following, 50.0);
        // 8.25 A raw is exactly 8 A once calibrated
        rig.bench.i_low[0] = 8.25;
        rig.tick();
        assert_eq!(rig.converter.mode(), Mode::Idle);
    }

    #[test]
    fn following_synchronizes_then_powers() {
        let mut rig = Rig::new(Strategy::Following, 50.0);
        rig.power_on();

        rig.run_until(500, |c| c.mode() == Mode::Startup);
        assert!(!rig.stage.is_running(Leg::Leg1High));

        rig.run_until(20_000, |c| c.is_synchronized());
        rig.run_until(20, |c| c.mode() == Mode::Power);
        assert!(rig.converter.startup_done());
        // No output before the settle delay.
        assert!(!rig.stage.is_running(Leg::Leg1High));

        rig.run_until(2_100, |c| c.power_counter() > 2_000);
        rig.tick();
        assert!(rig.stage.is_running(Leg::Leg1High));
        assert!(rig.stage.is_running(Leg::Leg2High));
        assert_eq!(rig.converter.mode(), Mode::Power);

        let frequency = rig.converter.live_status().frequency;
        assert!((frequency - 50.0).abs() < 0.5, "{frequency}");
    }

    #[test]
    fn following_current_tracks_reference_into_grid() {
        let mut rig = Rig::new(Strategy::Following, 50.0);
        rig.bench.load = Some(Load::Grid);
        // let the bus filter settle on the bench voltage
        for _ in 0..5_000 {
            rig.tick();
        }
        rig.power_on();
        rig.run_until(20_000, |c| c.mode() == Mode::Power && c.startup_done());
        rig.run_until(2_100, |c| c.power_counter() > 2_000);
        rig.tick();
        assert!(rig.stage.is_running(Leg::Leg1High));

        let mut peak = 0.0f32;
        for _ in 0..5_000 {
            rig.tick();
            peak = peak.max(rig.bench.i_grid.abs());
        }
        assert_eq!(rig.converter.mode(), Mode::Power);
        assert!(peak < 1.0, "{peak}");

        rig.command(Command {
            mode_request: 1,
            inverter_enable: true,
            id_ref: 2.0,
            ..Command::default()
        });
        for _ in 0..10_000 {
            rig.tick();
            peak = peak.max(rig.bench.i_grid.abs());
        }
        assert_eq!(rig.converter.mode(), Mode::Power);
        assert!(peak < 4.0, "{peak}");
        let idq = rig.converter.inverter_debug().idq;
        assert!((idq.d - 2.0).abs() < 0.15, "{idq:?}");
        assert!(idq.q.abs() < 0.15, "{idq:?}");
        let status = rig.converter.live_status();
        assert!(status.active_power > 15.0, "{status:?}");
    }

    #[test]
    fn forming_voltage_tracks_reference_on_load() {
        let mut rig = Rig::new(Strategy::Forming, 50.0);
        rig.bench.load = Some(Load::Resistive(10.0));
        for _ in 0..5_000 {
            rig.tick();
        }
        rig.power_on();
        rig.run_until(400, |c| c.mode() == Mode::Power && c.startup_done());

        let mut peak = 0.0f32;
        for _ in 0..20_000 {
            rig.tick();
            peak = peak.max(rig.bench.i_grid.abs());
        }
        assert_eq!(rig.converter.mode(), Mode::Power);
        // 20 V across 10 ohm
        assert!(peak < 2.5, "{peak}");
        let vdq = rig.converter.inverter_debug().vdq;
        assert!((vdq.d - 20.0).abs() < 0.5, "{vdq:?}");
        assert!(vdq.q.abs() < 0.5, "{vdq:?}");
    }

    #[test]
    fn following_waits_for_grid_voltage() {
        let mut rig = Rig::new(Strategy::Following, 50.0);
        rig.bench.amplitude = 5.0;
        rig.power_on();
        for _ in 0..1_000 {
            rig.tick();
        }
        assert_eq!(rig.converter.mode(), Mode::Power);
        assert!(!rig.converter.startup_done());
        assert!(!rig.stage.is_running(Leg::Leg1High));
    }

    #[test]
    fn desynchronization_returns_to_idle() {
        let mut rig = Rig::new(Strategy::Following, 50.0);
        rig.power_on();
        rig.run_until(20_000, |c| c.mode() == Mode::Power && c.startup_done());

        rig.bench.frequency = 55.0;
        rig.run_until(20_000, |c| c.mode() == Mode::Idle);
        assert_eq!(rig.converter.requested(), ModeRequest::Idle);
        assert_eq!(rig.converter.sync_counter(), 0);
        assert_eq!(rig.converter.desync_counter(), 0);
        assert_eq!(rig.converter.power_counter(), 0);
        assert!(!rig.stage.any_running());

        // Stays idle until asked again.
        for _ in 0..100 {
            rig.tick();
        }
        assert_eq!(rig.converter.mode(), Mode::Idle);
    }

    #[test]
    fn dropping_enable_during_startup_moves_to_power() {
        let mut rig = Rig::new(Strategy::Forming, 50.0);
        rig.power_on();
        rig.run_until(20, |c| c.mode() == Mode::Startup);
        for _ in 0..20 {
            rig.tick();
        }
        assert!(rig.stage.is_running(Leg::Leg1High));

        let duties = [rig.stage.duty[2], rig.stage.duty[3]];

        rig.command(Command {
            mode_request: 1,
            inverter_enable: false,
            ..Command::default()
        });
        rig.tick();
        assert!(!rig.stage.is_running(Leg::Leg1High));
        assert!(rig.stage.is_running(Leg::Leg1Low));
        // The ramp no longer writes the stopped legs.
        assert_eq!([rig.stage.duty[2], rig.stage.duty[3]], duties);
        assert_eq!(rig.converter.inverter_debug().duty_legs, duties);

        rig.converter.supervisory_tick(&mut rig.recorder);
        assert_eq!(rig.converter.mode(), Mode::Power);
        assert!(!rig.converter.startup_done());
    }

    #[test]
    fn commands_are_clamped_and_written_back() {
        let mut rig = Rig::new(Strategy::Following, 50.0);
        let command = rig.command(Command {
            id_ref: 12.0,
            ..Command::default()
        });
        assert_eq!(command.id_ref, 8.0);
        assert_eq!(rig.converter.live_status().idq_ref.d, 8.0);

        let command = rig.command(Command {
            id_ref: -3.0,
            ..Command::default()
        });
        assert_eq!(command.id_ref, -0.1);

        let mut rig = Rig::new(Strategy::Forming, 50.0);
        let command = rig.command(Command {
            vd_ref: 50.0,
            ..Command::default()
        });
        assert_eq!(command.vd_ref, 30.0);
        assert_eq!(rig.converter.live_status().vdq_ref.d, 30.0);
    }

    #[test]
    fn unknown_mode_code_is_ignored() {
        let mut rig = Rig::new(Strategy::Forming, 50.0);
        rig.power_on();
        rig.command(Command {
            mode_request: 7,
            inverter_enable: true,
            ..Command::default()
        });
        assert_eq!(rig.converter.requested(), ModeRequest::Power);
    }

    #[test]
    fn missing_samples_keep_previous_values() {
        let mut rig = Rig::new(Strategy::Following, 50.0);
        rig.bench.time = 0.005;
        rig.tick();
        let before = rig.converter.measurements();
        assert!((before.v_grid - 20.0).abs() < 1e-3);

        rig.bench.silent = true;
        rig.bench.time = 0.0;
        rig.tick();
        let after = rig.converter.measurements();
        assert_eq!(after.v_low, before.v_low);
        assert_eq!(after.v_grid, before.v_grid);
        assert_eq!(after.i_low1, before.i_low1);
        assert_eq!(after.i_low1, 0.0);
    }

    #[test]
    fn measurements_are_derived() {
        let mut rig = Rig::new(Strategy::Following, 50.0);
        rig.bench.i_low = [1.25, 2.25];
        rig.tick();
        let m = rig.converter.measurements();
        assert_eq!(m.i_low1, 1.0);
        assert_eq!(m.i_low2, 2.0);
        assert_eq!(m.i_grid, 1.0);
        assert!((m.v_neutral - 20.0).abs() < 1e-4);
        assert!(m.v_bus_filtered > 0.0 && m.v_bus_filtered < 40.0);
    }

    #[test]
    fn capture_respects_decimation() {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = ControlConfig {
            capture_decimation: 4,
            ..ControlConfig::default()
        };
        let mut converter = Converter::new(config).unwrap();
        let mut bench = GridBench::new(50.0);
        let mut stage = RecordingStage::default();
        let mut recorder = CountingRecorder::default();

        for _ in 0..40 {
            converter.control_tick(&mut bench, &mut stage, &mut recorder);
        }
        assert_eq!(recorder.frames, 10);

        converter.apply_command(&mut Command {
            scope_trigger: true,
            ..Command::default()
        });
        for _ in 0..40 {
            converter.control_tick(&mut bench, &mut stage, &mut recorder);
        }
        assert_eq!(recorder.triggers, 1);
    }

    #[test]
    fn scope_is_armed_on_power_and_dumped_when_idle() {
        let mut rig = Rig::new(Strategy::Forming, 50.0);
        rig.power_on();
        rig.converter.supervisory_tick(&mut rig.recorder);
        assert_eq!(rig.recorder.arms, 1);

        // repeated power requests do not re-arm
        rig.power_on();
        rig.converter.supervisory_tick(&mut rig.recorder);
        assert_eq!(rig.recorder.arms, 1);

        let mut command = Command {
            mode_request: 1,
            inverter_enable: true,
            scope_dump: true,
            ..Command::default()
        };
        rig.converter.apply_command(&mut command);
        assert!(!command.scope_dump);
        rig.converter.supervisory_tick(&mut rig.recorder);
        assert_eq!(rig.recorder.dumps, 0);

        rig.command(Command::default());
        rig.converter.supervisory_tick(&mut rig.recorder);
        assert_eq!(rig.converter.mode(), Mode::Idle);
        assert_eq!(rig.recorder.dumps, 1);
    }

    #[test]
    fn scope_records_through_converter() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut converter = Converter::new(ControlConfig::default()).unwrap();
        let mut bench = GridBench::new(50.0);
        let mut stage = RecordingStage::default();
        let mut scope = Scope::<16>::new(0.5);

        converter.apply_command(&mut Command {
            mode_request: 1,
            ..Command::default()
        });
        converter.supervisory_tick(&mut scope);
        assert!(scope.is_armed());
        for _ in 0..32 {
            converter.control_tick(&mut bench, &mut stage, &mut scope);
            bench.time += 100e-6;
        }
        assert_eq!(scope.len(), 16);
        let last = scope.samples().last().copied().unwrap_or(CaptureFrame::ZERO);
        assert_eq!(last.v_grid, converter.measurements().v_grid);
    }

    #[test]
    fn idle_entry_resets_controllers() {
        let mut rig = Rig::new(Strategy::Forming, 50.0);
        rig.power_on();
        rig.run_until(400, |c| c.mode() == Mode::Power && c.startup_done());
        assert!(rig.converter.boost_debug().duty[0] > 0.0);

        rig.command(Command::default());
        rig.converter.supervisory_tick(&mut rig.recorder);
        assert_eq!(rig.converter.mode(), Mode::Idle);
        assert_eq!(rig.converter.boost_debug().duty, [0.0, 0.0]);
        assert_eq!(rig.converter.grid().theta(), 0.0);
        rig.tick();
        assert!(!rig.stage.any_running());
    }
}
