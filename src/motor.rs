//! Shutter motor state machine.
//!
//! The motor runs through two relays: one switches power, the other selects
//! the direction (released = up, engaged = down). The direction relay must
//! never switch under load, so every entry and exit sequence first drops
//! power, waits a settle delay, changes the direction relay, waits again,
//! and only then powers the motor. The interlock is enforced by the
//! transition order alone - no external trigger sequence can break it.
//!
//! Up and down runs hold for the full travel time plus margin; the limit
//! switches in the motor itself define the endpoints.

use tracing::{info, trace};

/// Convert milliseconds to 10 ms scheduler ticks.
#[must_use]
pub const fn millis(ms: u32) -> u16 {
    (ms / 10) as u16
}

/// Relay settle delay between power and direction changes.
pub const SETTLE_TICKS: u16 = millis(200);
/// Full travel duration before a run parks.
pub const TRAVEL_TICKS: u16 = millis(25_000);

/// Status byte exposed on the bus: bit 7 running, bit 6 direction up,
/// bit 5 value valid, bits 3..0 percent closed (0 = open, 15 = closed).
pub const STATUS_RUNNING_UP: u8 = 0b1100_0000;
pub const STATUS_RUNNING_DOWN: u8 = 0b1000_0000;
pub const STATUS_OPEN: u8 = 0b0010_0000;
pub const STATUS_CLOSED: u8 = 0b0010_1111;
const STATUS_IDLE_MASK: u8 = 0b0011_1111;

/// Relay and indicator outputs consumed by the state machine.
pub trait MotorDriver {
    fn set_power(&mut self, on: bool);
    fn set_direction_down(&mut self, down: bool);
    fn set_activity_led(&mut self, on: bool);
}

/// Driver that reports relay changes through the tracing subscriber; used
/// where no physical relays exist.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceDriver;

impl MotorDriver for TraceDriver {
    fn set_power(&mut self, on: bool) {
        info!(on, "motor power relay");
    }

    fn set_direction_down(&mut self, down: bool) {
        info!(down, "direction relay");
    }

    fn set_activity_led(&mut self, on: bool) {
        trace!(on, "activity led");
    }
}

/// Motor sequencing states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorState {
    Off,
    PreOff,
    PreOff2,
    PreOff3,
    PreUp,
    PreUp2,
    Up,
    UpReady,
    PreDown,
    PreDown2,
    Down,
    DownReady,
}

/// Trigger inputs. The key variants implement the manual buttons' toggle
/// behavior; the plain variants come from the bus and the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Up,
    Down,
    UpKey,
    DownKey,
}

/// Side effect of entering a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEffect {
    /// Resting state, nothing to do.
    Hold,
    /// Motor power relay off.
    PowerOff,
    /// Direction relay change; only ever emitted with the power off.
    Direction { down: bool },
    /// Motor power relay on, with the new running status.
    PowerOn { status: u8 },
    /// Record the travel result in the status byte.
    Park { status: u8 },
    /// End of the off sequence: clear the activity LED and the run bits.
    Idle,
}

/// The sequence a resolved target enters through.
fn entry_state(target: Action) -> MotorState {
    match target {
        Action::Up => MotorState::PreUp,
        Action::Down => MotorState::PreDown,
        _ => MotorState::PreOff,
    }
}

/// The pure transition table: next state, ticks to wait before the next
/// step, and the side effect of leaving the given state.
#[must_use]
pub fn transition(state: MotorState) -> (MotorState, u16, StepEffect) {
    use MotorState::{
        Down, DownReady, Off, PreDown, PreDown2, PreOff, PreOff2, PreOff3, PreUp, PreUp2, Up,
        UpReady,
    };
    match state {
        Off => (Off, 0, StepEffect::Hold),

        PreOff => (PreOff2, SETTLE_TICKS, StepEffect::PowerOff),
        PreOff2 => (PreOff3, SETTLE_TICKS, StepEffect::Direction { down: false }),
        PreOff3 => (Off, 0, StepEffect::Idle),

        PreUp => (PreUp2, SETTLE_TICKS, StepEffect::PowerOff),
        PreUp2 => (Up, SETTLE_TICKS, StepEffect::Direction { down: false }),
        Up => (
            UpReady,
            TRAVEL_TICKS,
            StepEffect::PowerOn {
                status: STATUS_RUNNING_UP,
            },
        ),
        UpReady => (
            PreOff,
            0,
            StepEffect::Park {
                status: STATUS_OPEN,
            },
        ),

        PreDown => (PreDown2, SETTLE_TICKS, StepEffect::PowerOff),
        PreDown2 => (Down, SETTLE_TICKS, StepEffect::Direction { down: true }),
        Down => (
            DownReady,
            TRAVEL_TICKS,
            StepEffect::PowerOn {
                status: STATUS_RUNNING_DOWN,
            },
        ),
        DownReady => (
            PreOff,
            0,
            StepEffect::Park {
                status: STATUS_CLOSED,
            },
        ),
    }
}

/// The shutter motor controller.
#[derive(Debug)]
pub struct Motor {
    state: MotorState,
    last_action: Action,
    pending: Option<Action>,
    status: u8,
}

impl Default for Motor {
    fn default() -> Self {
        Self::new()
    }
}

impl Motor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: MotorState::Off,
            last_action: Action::None,
            pending: None,
            status: 0,
        }
    }

    /// Resolve and latch a new target.
    ///
    /// Key variants toggle against the last committed action: repeating it
    /// resolves to a stop. A new trigger overwrites the pending target
    /// rather than queuing. A run already under way is never cut short: the
    /// target is held back until the run parks in its ready state, then the
    /// machine heads for the new target.
    ///
    /// Returns the tick delay to arm when the machine needs a step, or
    /// `None` when the target was parked behind a running sequence and the
    /// armed delay must stay untouched.
    pub fn trigger(&mut self, action: Action) -> Option<u16> {
        let resolved = match action {
            Action::UpKey => {
                if self.last_action == Action::Up {
                    Action::None
                } else {
                    Action::Up
                }
            }
            Action::DownKey => {
                if self.last_action == Action::Down {
                    Action::None
                } else {
                    Action::Down
                }
            }
            plain => plain,
        };
        self.last_action = resolved;

        if self.run_in_progress() {
            self.pending = Some(resolved);
            return None;
        }
        self.pending = None;
        self.state = entry_state(resolved);
        Some(1)
    }

    /// True while the motor is powered and travelling. The machine rests in
    /// the ready state for the whole travel time; everywhere else the power
    /// relay is off and a new target may take over at once.
    fn run_in_progress(&self) -> bool {
        matches!(self.state, MotorState::UpReady | MotorState::DownReady)
    }

    /// Run the transition table until it parks in a delay-bearing state.
    /// Returns the number of ticks before the next step (0 once off).
    pub fn step<D: MotorDriver>(&mut self, driver: &mut D) -> u16 {
        loop {
            let (next, delay, effect) = transition(self.state);
            let at_ready = matches!(
                self.state,
                MotorState::UpReady | MotorState::DownReady
            );
            self.apply(effect, driver);
            // A target held back during the run takes over once parked.
            self.state = match self.pending.take() {
                Some(target) if at_ready => entry_state(target),
                other => {
                    self.pending = other;
                    next
                }
            };
            if delay != 0 || self.state == MotorState::Off {
                return delay;
            }
        }
    }

    fn apply<D: MotorDriver>(&mut self, effect: StepEffect, driver: &mut D) {
        match effect {
            StepEffect::Hold => {}
            StepEffect::PowerOff => driver.set_power(false),
            StepEffect::Direction { down } => driver.set_direction_down(down),
            StepEffect::PowerOn { status } => {
                driver.set_power(true);
                self.status = status;
            }
            StepEffect::Park { status } => self.status = status,
            StepEffect::Idle => {
                driver.set_activity_led(false);
                self.status &= STATUS_IDLE_MASK;
            }
        }
    }

    /// The bus-visible status byte.
    #[must_use]
    pub fn status(&self) -> u8 {
        self.status
    }

    #[must_use]
    pub fn state(&self) -> MotorState {
        self.state
    }

    /// True while the machine is anywhere but `Off`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state != MotorState::Off
    }
}
