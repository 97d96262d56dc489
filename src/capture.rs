//! Triggered waveform capture.
//!
//! The control cycle hands a [`CaptureFrame`] to a [`Recorder`] every Nth
//! tick. [`Scope`] is a fixed-depth ring buffer implementation: once armed
//! it records continuously, and after a trigger it keeps a pre-trigger
//! share of the history and fills the rest before freezing.

use serde::{Deserialize, Serialize};

/// One captured sample of every recorded channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CaptureFrame {
    pub i_low1: f32,
    pub i_ac: f32,
    pub v_grid: f32,
    pub v_bus: f32,
    pub duty_leg1: f32,
    pub duty_leg2: f32,
    pub id: f32,
    pub iq: f32,
    pub id_ref: f32,
    pub i_alpha: f32,
    pub i_beta: f32,
    pub vd: f32,
    pub vq: f32,
    pub vd_out: f32,
    pub vq_out: f32,
    pub v_alpha: f32,
    pub v_beta: f32,
    pub v_alpha_out: f32,
    pub v_beta_out: f32,
}

impl CaptureFrame {
    pub const CHANNELS: usize = 19;

    pub const ZERO: Self = Self {
        i_low1: 0.0,
        i_ac: 0.0,
        v_grid: 0.0,
        v_bus: 0.0,
        duty_leg1: 0.0,
        duty_leg2: 0.0,
        id: 0.0,
        iq: 0.0,
        id_ref: 0.0,
        i_alpha: 0.0,
        i_beta: 0.0,
        vd: 0.0,
        vq: 0.0,
        vd_out: 0.0,
        vq_out: 0.0,
        v_alpha: 0.0,
        v_beta: 0.0,
        v_alpha_out: 0.0,
        v_beta_out: 0.0,
    };

    pub fn channels(&self) -> [f32; Self::CHANNELS] {
        [
            self.i_low1,
            self.i_ac,
            self.v_grid,
            self.v_bus,
            self.duty_leg1,
            self.duty_leg2,
            self.id,
            self.iq,
            self.id_ref,
            self.i_alpha,
            self.i_beta,
            self.vd,
            self.vq,
            self.vd_out,
            self.vq_out,
            self.v_alpha,
            self.v_beta,
            self.v_alpha_out,
            self.v_beta_out,
        ]
    }
}

/// Sink for captured frames.
pub trait Recorder {
    /// Start a fresh acquisition, dropping what was recorded.
    fn arm(&mut self);
    /// Offer one frame. `trigger` forces the trigger point on this frame.
    fn acquire(&mut self, frame: &CaptureFrame, trigger: bool);
    /// Emit the recorded frames.
    fn dump(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeState {
    Disarmed,
    Armed,
    Triggered { remaining: usize },
    Complete,
}

#[derive(Debug, Clone)]
pub struct Scope<const DEPTH: usize> {
    buffer: [CaptureFrame; DEPTH],
    /// Next write position
    head: usize,
    len: usize,
    pretrigger: usize,
    state: ScopeState,
}

impl<const DEPTH: usize> Scope<DEPTH> {
    /// `pretrigger` is the share of the buffer kept from before the trigger,
    /// saturated into `[0, 1]`.
    pub fn new(pretrigger: f32) -> Self {
        let share = crate::primitives::saturate(pretrigger, 0.0, 1.0);
        Self {
            buffer: [CaptureFrame::ZERO; DEPTH],
            head: 0,
            len: 0,
            pretrigger: (share * DEPTH as f32) as usize,
            state: ScopeState::Disarmed,
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, ScopeState::Armed | ScopeState::Triggered { .. })
    }

    pub fn is_complete(&self) -> bool {
        self.state == ScopeState::Complete
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push(&mut self, frame: &CaptureFrame) {
        if DEPTH == 0 {
            return;
        }
        self.buffer[self.head] = *frame;
        self.head = (self.head + 1) % DEPTH;
        if self.len < DEPTH {
            self.len += 1;
        }
    }

    /// Recorded frames, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = &CaptureFrame> + '_ {
        let start = if self.len < DEPTH { 0 } else { self.head };
        (0..self.len).map(move |n| &self.buffer[(start + n) % DEPTH])
    }
}

impl<const DEPTH: usize> Recorder for Scope<DEPTH> {
    fn arm(&mut self) {
        self.head = 0;
        self.len = 0;
        self.state = ScopeState::Armed;
    }

    fn acquire(&mut self, frame: &CaptureFrame, trigger: bool) {
        match self.state {
            ScopeState::Disarmed | ScopeState::Complete => {}
            ScopeState::Armed => {
                self.push(frame);
                if trigger {
                    let remaining = DEPTH.saturating_sub(self.pretrigger.min(self.len));
                    self.state = if remaining == 0 {
                        ScopeState::Complete
                    } else {
                        ScopeState::Triggered { remaining }
                    };
                }
            }
            ScopeState::Triggered { remaining } => {
                self.push(frame);
                self.state = if remaining <= 1 {
                    ScopeState::Complete
                } else {
                    ScopeState::Triggered {
                        remaining: remaining - 1,
                    }
                };
            }
        }
    }

    fn dump(&mut self) {
        log::info!("begin record");
        for frame in self.samples() {
            log::info!("{:?}", frame.channels());
        }
        log::info!("end record");
        self.state = ScopeState::Disarmed;
    }
}
