use serde::{Deserialize, Serialize};

/// Gains of a [`Pid`] in ISA form:
/// `u = kp * (e + 1/ti * integral(e) + td * de/dt)`.
///
/// A non-positive `ti` disables integral action, a zero `td` disables the
/// derivative term. `n` bounds the derivative filter bandwidth to `n / td`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidParams {
    pub kp: f32,
    pub ti: f32,
    pub td: f32,
    pub n: f32,
    pub low: f32,
    pub high: f32,
}

/// Bounded PID controller with clamp-and-hold anti-windup.
#[derive(Debug, Clone)]
pub struct Pid {
    k_p: f32,
    low: f32,
    high: f32,
    integral: IntegralComponent,
    derivative: DerivativeComponent,
}

impl Pid {
    pub fn new(sample_time: f32, params: PidParams) -> Self {
        Self {
            k_p: params.kp,
            low: params.low,
            high: params.high,
            integral: IntegralComponent::new(sample_time, params.kp, params.ti),
            derivative: DerivativeComponent::new(sample_time, params.kp, params.td, params.n),
        }
    }

    /// Run one step and return the output, always within `[low, high]`.
    pub fn compute(&mut self, reference: f32, measurement: f32) -> f32 {
        let error = reference - measurement;
        let p = self.k_p * error;
        let d = self.derivative.update(measurement);

        let held = self.integral.value();
        let candidate = self.integral.peek(error);
        let unclamped = p + candidate + d;

        // The integral may only grow up to the headroom left by P and D.
        if unclamped > self.high && error > 0.0 {
            let headroom = self.high - p - d;
            self.integral.commit(held.max(headroom.min(candidate)));
            return self.high;
        }
        if unclamped < self.low && error < 0.0 {
            let headroom = self.low - p - d;
            self.integral.commit(held.min(headroom.max(candidate)));
            return self.low;
        }
        self.integral.commit(candidate);

        crate::primitives::saturate(unclamped, self.low, self.high)
    }

    /// Zero the accumulators, keep the configuration.
    pub fn reset(&mut self) {
        self.integral.reset();
        self.derivative.reset();
    }
}

#[derive(Debug, Clone)]
struct IntegralComponent {
    k_i_ts: f32,
    integral: f32,
}

impl IntegralComponent {
    fn new(sample_time: f32, k_p: f32, t_i: f32) -> Self {
        let k_i_ts = if t_i > 0.0 { k_p * sample_time / t_i } else { 0.0 };
        Self {
            k_i_ts,
            integral: 0.0,
        }
    }

    fn peek(&self, error: f32) -> f32 {
        self.integral + self.k_i_ts * error
    }

    fn commit(&mut self, value: f32) {
        self.integral = value;
    }

    fn value(&self) -> f32 {
        self.integral
    }

    fn reset(&mut self) {
        self.integral = 0.0;
    }
}

/// Filtered derivative on the measurement, so reference steps do not kick.
#[derive(Debug, Clone)]
struct DerivativeComponent {
    a: f32,
    b: f32,
    state: f32,
    last_measurement: Option<f32>,
}

impl DerivativeComponent {
    fn new(sample_time: f32, k_p: f32, t_d: f32, n: f32) -> Self {
        let (a, b) = if t_d > 0.0 && n > 0.0 {
            let den = t_d + n * sample_time;
            (t_d / den, k_p * t_d * n / den)
        } else {
            (0.0, 0.0)
        };
        Self {
            a,
            b,
            state: 0.0,
            last_measurement: None,
        }
    }

    fn update(&mut self, measurement: f32) -> f32 {
        let delta = self
            .last_measurement
            .map(|last| measurement - last)
            .unwrap_or(0.0);
        self.last_measurement = Some(measurement);

        self.state = self.a * self.state - self.b * delta;
        self.state
    }

    fn reset(&mut self) {
        self.state = 0.0;
        self.last_measurement = None;
    }
}
