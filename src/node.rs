//! The shutter node: configuration, the cooperative main loop, message
//! dispatch and the command handlers.
//!
//! Two entry points drive the node. `on_tick` is the 10 ms tick source: it
//! advances the clock, feeds the key debouncers and counts down the delay
//! timers, touching nothing but counters and event flags. `poll` is the
//! main loop body: it drains the pending events in a fixed order - down
//! key, up key, motor step, sensor read-out, once-a-second housekeeping -
//! and then processes at most one inbound message before re-arming the
//! receiver.

use std::sync::Arc;

use arrayvec::ArrayString;
use tracing::{debug, warn};

use crate::clock::{WeeklyClock, TICKS_PER_SECOND};
use crate::link::{Link, LinkStats};
use crate::motor::{Action, Motor, MotorDriver};
use crate::protocol::{
    self, Message, NodeId, BUSCTL_QRY_DEBUG, BUSCTL_QRY_TIME, BUSCTL_QRY_VERSION,
    BUSCTL_SET_DEBUG, BUSCTL_TIME, CMD_SENSOR, CMD_SHUTTER, DRIVE_DOWN, DRIVE_UP,
    PROTOCOL_BUSCTL, PROTOCOL_DEBUG, PROTOCOL_SHUTTER, RESPONSE_BIT, SENSOR_TEMPERATURE,
    SHUTTER_DRIVE, SHUTTER_QRY_SCHEDULE, SHUTTER_QRY_TIMINGS, SHUTTER_QUERY,
    SHUTTER_UPD_SCHEDULE, SHUTTER_UPD_TIMINGS,
};
use crate::schedule::{Schedule, ScheduleAction, ACTION_DOWN, ACTION_NOP, ACTION_UP};
use crate::sensor::{OneWireBus, SensorOutcome, SensorTask};
use crate::storage::{NvStore, SCHEDULE_SLOTS};
use crate::wire::Wire;

/// Node type stored with the node-specific data; a mismatch at startup
/// wipes that region.
pub const NODE_TYPE_SHUTTER: u8 = 0x02;

/// Text capacity of an on-bus debug message.
const DEBUG_TEXT_LEN: usize = 13;

/// Raw key levels sampled by the tick source.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeySample {
    pub down_key: bool,
    pub up_key: bool,
}

/// Shift-register key debouncer: reports one edge after ten consecutive
/// pressed samples (100 ms at the tick rate), which rides out contact
/// bounce and the occasional induced spike on the key lines.
#[derive(Debug, Default)]
pub struct Debouncer {
    state: u16,
}

impl Debouncer {
    /// Feed one sample; true exactly once per debounced press.
    pub fn sample(&mut self, pressed: bool) -> bool {
        self.state = self.state << 1 | u16::from(!pressed) | 0xF800;
        self.state == 0xFC00
    }
}

/// Event flags and delay counters shared between the tick source and the
/// main loop.
#[derive(Debug, Default)]
struct Events {
    wake: bool,
    one_second: bool,
    down_key: bool,
    up_key: bool,
    motor: bool,
    sensor: bool,
    motor_delay: u16,
    sensor_delay: u16,
}

/// Persisted configuration mirrored into RAM at startup.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub debug_flags: u8,
    pub name: ArrayString<8>,
    pub node_type: u8,
    pub reset_flags: u8,
}

/// One bus node controlling a shutter.
pub struct ShutterNode<W: Wire, S: NvStore, D: MotorDriver, B: OneWireBus> {
    config: NodeConfig,
    clock: Arc<WeeklyClock>,
    link: Link<W>,
    store: S,
    driver: D,
    onewire: B,
    motor: Motor,
    sensor: SensorTask,
    schedule: Schedule,
    events: Events,
    down_debounce: Debouncer,
    up_debounce: Debouncer,
    ten_seconds: u8,
    led_on: bool,
}

impl<W: Wire, S: NvStore, D: MotorDriver, B: OneWireBus> ShutterNode<W, S, D, B> {
    /// Bring the node up: validate the store, install the factory schedule
    /// on first start and load the configuration.
    pub fn new(mut store: S, wire: W, driver: D, onewire: B) -> Self {
        if store.node_type() != NODE_TYPE_SHUTTER {
            store.erase_node_data();
            store.set_node_type(NODE_TYPE_SHUTTER);
        }
        if store.schedule_slot(0) == 0 {
            Schedule::write_defaults(&mut store);
        }

        let mut name = ArrayString::new();
        for &octet in store.name().iter().filter(|&&o| o != 0) {
            let _ = name.try_push(char::from(octet));
        }
        let config = NodeConfig {
            node_id: store.node_id(),
            debug_flags: store.debug_flags(),
            name,
            node_type: NODE_TYPE_SHUTTER,
            reset_flags: 0,
        };
        let seed = config.node_id.0;

        Self {
            config,
            clock: Arc::new(WeeklyClock::new()),
            link: Link::new(wire, seed),
            store,
            driver,
            onewire,
            motor: Motor::new(),
            sensor: SensorTask::new(),
            schedule: Schedule::new(),
            events: Events::default(),
            down_debounce: Debouncer::default(),
            up_debounce: Debouncer::default(),
            ten_seconds: 0,
            led_on: false,
        }
    }

    /// A shareable handle on the node's clock.
    #[must_use]
    pub fn clock(&self) -> Arc<WeeklyClock> {
        Arc::clone(&self.clock)
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    #[must_use]
    pub fn link_stats(&self) -> &LinkStats {
        self.link.stats()
    }

    /// The bus-visible shutter status byte.
    #[must_use]
    pub fn shutter_status(&self) -> u8 {
        self.motor.status()
    }

    /// The 10 ms tick source. Touches only counters and event flags, the
    /// way a ticker interrupt would.
    pub fn on_tick(&mut self, keys: KeySample) {
        let ticks = self.clock.tick();
        if ticks % TICKS_PER_SECOND == 0 {
            self.events.one_second = true;
            self.events.wake = true;
        }
        if !self.events.down_key && self.down_debounce.sample(keys.down_key) {
            self.events.down_key = true;
            self.events.wake = true;
        }
        if !self.events.up_key && self.up_debounce.sample(keys.up_key) {
            self.events.up_key = true;
            self.events.wake = true;
        }
        if self.events.motor_delay > 0 {
            self.events.motor_delay -= 1;
            if self.events.motor_delay == 0 {
                self.events.motor = true;
                self.events.wake = true;
            }
        }
        if self.events.sensor_delay > 0 {
            self.events.sensor_delay -= 1;
            if self.events.sensor_delay == 0 {
                self.events.sensor = true;
                self.events.wake = true;
            }
        }
    }

    /// True when an event is pending, letting the embedding loop idle
    /// cheaply between ticks.
    #[must_use]
    pub fn wake_pending(&self) -> bool {
        self.events.wake
    }

    /// Drain pending events in fixed order, then inbound messages.
    pub fn poll(&mut self) {
        self.events.wake = false;

        if self.events.down_key {
            self.debug_text("key-act down");
            self.trigger_motor(Action::DownKey);
            // The keys are interlocked; a simultaneous up press is dropped.
            self.events.down_key = false;
            self.events.up_key = false;
        }

        if self.events.up_key {
            self.debug_text("key-act up");
            self.trigger_motor(Action::UpKey);
            self.events.up_key = false;
        }

        if self.events.motor {
            self.events.motor = false;
            self.events.motor_delay = self.motor.step(&mut self.driver);
        }

        if self.events.sensor {
            self.events.sensor = false;
            self.sensor_readout();
        }

        if self.events.one_second {
            self.events.one_second = false;
            self.once_per_second();
        }

        self.pump_messages();
    }

    fn once_per_second(&mut self) {
        // Blink the activity LED while the motor machine is busy.
        if self.motor.is_running() {
            self.led_on = !self.led_on;
            self.driver.set_activity_led(self.led_on);
        }

        self.ten_seconds += 1;
        if self.ten_seconds == 10 {
            self.ten_seconds = 0;
            let time = self.clock.time();
            if time % 6 == 0 {
                // A whole minute: run the schedule.
                self.run_schedule(time, 0);
            }
        }
    }

    fn run_schedule(&mut self, time: u16, forced_low: u16) {
        let due = self
            .schedule
            .evaluate(&self.store, time, forced_low, self.clock.is_set());
        match due {
            Some(ScheduleAction::Up) => {
                self.debug_text("sch-act up");
                self.trigger_motor(Action::Up);
            }
            Some(ScheduleAction::Down) => {
                self.debug_text("sch-act dn");
                self.trigger_motor(Action::Down);
            }
            None => {}
        }
    }

    /// Hand a target to the motor; a deferred target leaves the armed step
    /// timer alone so the running sequence finishes undisturbed.
    fn trigger_motor(&mut self, action: Action) {
        if let Some(delay) = self.motor.trigger(action) {
            self.events.motor_delay = delay;
        }
    }

    fn sensor_readout(&mut self) {
        match self.sensor.read_out(&mut self.onewire) {
            SensorOutcome::Idle => {}
            SensorOutcome::Retry(delay) => {
                self.debug_text("sens retry");
                self.events.sensor_delay = delay;
            }
            SensorOutcome::Report { to, temperature } => {
                let mut msg = Message::new(PROTOCOL_SHUTTER);
                msg.set_dest(to);
                msg.set_src(self.config.node_id);
                let raw = msg.octets_mut();
                raw[5] = CMD_SENSOR | RESPONSE_BIT;
                raw[6] = SENSOR_TEMPERATURE;
                raw[7] = 1 << 4 | 1; // group 1 of 1
                raw[8] = (temperature >> 8) as u8; // sensor 0
                raw[9] = temperature as u8;
                raw[10] = 0x80; // sensors 1..3 not fitted
                raw[12] = 0x80;
                raw[14] = 0x80;
                self.send(&msg);
            }
        }
    }

    fn send(&mut self, msg: &Message) {
        if let Err(err) = self.link.send(msg) {
            warn!(%err, "transmit failed");
        }
    }

    fn pump_messages(&mut self) {
        self.link.poll();
        if let Some(msg) = self.link.receive().copied() {
            match msg.protocol() {
                PROTOCOL_BUSCTL => self.handle_busctl(&msg),
                PROTOCOL_SHUTTER => self.handle_shutter(&msg),
                _ => {} // other protocols share the bus
            }
            // Re-enable the receiver.
            self.link.release();
        }
    }

    fn handle_busctl(&mut self, msg: &Message) {
        if msg.is_response() {
            return;
        }
        if !protocol::valid_source(msg) {
            return;
        }
        if !protocol::busctl_match(msg, self.config.node_id) {
            return;
        }

        match msg.command() {
            BUSCTL_TIME => {
                let old = self.clock.time();
                let raw = msg.octets();
                let new_time = u16::from(raw[7]) << 8 | u16::from(raw[8]);
                let deci = if raw[6] & 0x02 == 0 { 0 } else { raw[9] };
                self.clock.set_full_time(new_time, deci);
                if new_time > old {
                    // Catch up on anything between the old and new time.
                    self.run_schedule(new_time, old);
                }
            }

            BUSCTL_QRY_TIME => {
                let (time, deci) = self.clock.full_time();
                let mut reply = msg.reply_from(self.config.node_id);
                let raw = reply.octets_mut();
                raw[6] = 0;
                raw[7] = (time >> 8) as u8;
                raw[8] = time as u8;
                raw[9] = deci;
                self.send(&reply);
            }

            BUSCTL_QRY_VERSION => {
                let mut reply = msg.reply_from(self.config.node_id);
                let raw = reply.octets_mut();
                raw[6] = self.config.node_type;
                raw[7] = 0;
                raw[8..15].copy_from_slice(&version_octets());
                raw[15] = 0;
                self.send(&reply);
            }

            BUSCTL_SET_DEBUG => {
                let flags = msg.octets()[6];
                self.store.set_debug_flags(flags);
                self.config.debug_flags = flags;
            }

            BUSCTL_QRY_DEBUG => {
                let mut reply = msg.reply_from(self.config.node_id);
                let raw = reply.octets_mut();
                raw[6] = self.config.debug_flags;
                raw[7] = self.config.reset_flags;
                self.send(&reply);
            }

            _ => {} // unknown commands draw no response
        }
    }

    fn handle_shutter(&mut self, msg: &Message) {
        if !protocol::unicast_match(msg, self.config.node_id) {
            return;
        }
        if msg.is_response() {
            return;
        }
        match msg.command() {
            CMD_SHUTTER => self.shutter_command(msg),
            CMD_SENSOR => self.sensor_command(msg),
            _ => {}
        }
    }

    fn shutter_command(&mut self, msg: &Message) {
        match msg.subcommand() {
            SHUTTER_QUERY => {
                let mut reply = msg.reply_from(self.config.node_id);
                let raw = reply.octets_mut();
                raw[7] = 0; // no error
                raw[8] = self.motor.status();
                self.send(&reply);
            }

            SHUTTER_DRIVE => {
                let raw = msg.octets();
                let mut err = 0u8;
                if raw[7] > 1 // only all shutters or shutter 1 exist
                    || raw[9..16].iter().any(|&octet| octet != 0)
                    || raw[8] & 0x10 != 0 // reserved bit
                    || raw[8] & 0x20 != 0 // percent drive not supported
                {
                    err = 1;
                } else if raw[8] & 0xC0 == DRIVE_UP {
                    self.debug_text("bus-act up");
                    self.trigger_motor(Action::Up);
                } else if raw[8] & 0xC0 == DRIVE_DOWN {
                    self.debug_text("bus-act dn");
                    self.trigger_motor(Action::Down);
                } else {
                    err = 1;
                }

                let mut reply = msg.reply_from(self.config.node_id);
                let out = reply.octets_mut();
                out[7] = err;
                out[8] = self.motor.status();
                self.send(&reply);
            }

            SHUTTER_QRY_TIMINGS | SHUTTER_UPD_TIMINGS => {} // reserved

            SHUTTER_QRY_SCHEDULE => self.query_schedule(msg),
            SHUTTER_UPD_SCHEDULE => self.update_schedule(msg),

            _ => {}
        }
    }

    fn query_schedule(&mut self, msg: &Message) {
        // One response message per slot; the table is small.
        for slot in 0..SCHEDULE_SLOTS {
            let entry = self.store.schedule_slot(slot);
            let mut reply = msg.reply_from(self.config.node_id);
            let raw = reply.octets_mut();
            raw[7] = 0; // the schedule is global to the node
            raw[8] = 0; // no error
            raw[9] = SCHEDULE_SLOTS as u8;
            raw[10] = slot as u8;
            let rounded = entry / 6 * 6;
            raw[11] = (rounded >> 8) as u8;
            raw[12] = rounded as u8;
            raw[13] = match entry % 6 {
                ACTION_UP => DRIVE_UP,
                ACTION_DOWN => DRIVE_DOWN,
                _ => 0,
            };
            self.send(&reply);
        }
    }

    fn update_schedule(&mut self, msg: &Message) {
        let raw = msg.octets();
        let bad = raw[8] != 0
            || raw[14] != 0
            || raw[15] != 0
            || raw[9] != 1
            || usize::from(raw[10]) >= SCHEDULE_SLOTS;
        if bad {
            // A fixed sentinel pattern restores the factory schedule.
            if raw[7] == 0xF0
                && raw[9] == 16
                && raw[10] == 0xF0
                && raw[11] == 0xF0
                && raw[12] == 0xF0
                && raw[13] == 0xF0
            {
                debug!("factory schedule reset");
                Schedule::write_defaults(&mut self.store);
            }
            return;
        }

        let mut entry = (u16::from(raw[11]) << 8 | u16::from(raw[12])) / 6 * 6;
        entry += match raw[13] {
            DRIVE_UP => ACTION_UP,
            DRIVE_DOWN => ACTION_DOWN,
            _ => ACTION_NOP,
        };
        self.store.set_schedule_slot(usize::from(raw[10]), entry);
    }

    fn sensor_command(&mut self, msg: &Message) {
        if msg.subcommand() != SENSOR_TEMPERATURE {
            return;
        }
        if let Some(delay) = self.sensor.request(&mut self.onewire, msg.src()) {
            self.events.sensor_delay = delay;
            self.events.sensor = false;
        }
    }

    /// Emit a short on-bus debug message when debugging is enabled.
    fn debug_text(&mut self, text: &str) {
        debug!("{text}");
        if self.config.debug_flags == 0 {
            return;
        }
        let mut msg = Message::new(PROTOCOL_DEBUG);
        let raw = msg.octets_mut();
        raw[1] = self.config.node_id.hi();
        raw[2] = self.config.node_id.lo();
        for (dst, src) in raw[3..3 + DEBUG_TEXT_LEN].iter_mut().zip(text.bytes()) {
            *dst = src;
        }
        self.send(&msg);
    }
}

/// The firmware version reported by the version query, padded to 7 octets.
fn version_octets() -> [u8; 7] {
    let mut version = [0u8; 7];
    for (dst, src) in version.iter_mut().zip(env!("CARGO_PKG_VERSION").bytes()) {
        *dst = src;
    }
    version
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debouncer_fires_once_per_press() {
        let mut debounce = Debouncer::default();
        for _ in 0..20 {
            assert!(!debounce.sample(false));
        }
        let mut edges = 0;
        for _ in 0..30 {
            if debounce.sample(true) {
                edges += 1;
            }
        }
        assert_eq!(edges, 1);
        // Release and press again: another single edge.
        for _ in 0..20 {
            assert!(!debounce.sample(false));
        }
        let mut edges = 0;
        for _ in 0..15 {
            if debounce.sample(true) {
                edges += 1;
            }
        }
        assert_eq!(edges, 1);
    }

    #[test]
    fn test_short_glitches_do_not_trigger() {
        let mut debounce = Debouncer::default();
        for _ in 0..5 {
            // Nine pressed samples, one released: never ten in a row.
            for _ in 0..9 {
                assert!(!debounce.sample(true));
            }
            assert!(!debounce.sample(false));
        }
    }

    #[test]
    fn test_version_octets_padded() {
        let version = version_octets();
        assert_eq!(version.len(), 7);
        assert!(version[0].is_ascii_digit());
    }
}
