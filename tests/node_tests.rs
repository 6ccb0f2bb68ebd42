use std::sync::{Arc, Mutex};

use shutterbus::frame::{self, FrameDecoder};
use shutterbus::motor::{MotorDriver, STATUS_CLOSED, STATUS_RUNNING_DOWN, STATUS_RUNNING_UP};
use shutterbus::node::{KeySample, ShutterNode};
use shutterbus::protocol::{
    Message, NodeId, BUSCTL_QRY_DEBUG, BUSCTL_QRY_TIME, BUSCTL_QRY_VERSION, BUSCTL_SET_DEBUG,
    BUSCTL_TIME, CMD_SENSOR, CMD_SHUTTER, DRIVE_DOWN, DRIVE_UP, PROTOCOL_BUSCTL, PROTOCOL_DEBUG,
    PROTOCOL_SHUTTER, SENSOR_TEMPERATURE, SHUTTER_DRIVE, SHUTTER_QRY_SCHEDULE, SHUTTER_QUERY,
    SHUTTER_UPD_SCHEDULE,
};
use shutterbus::sensor::{scratchpad_crc, OneWireBus};
use shutterbus::storage::{MemStore, NvStore, SCHEDULE_SLOTS};
use shutterbus::wire::{BusTap, SimBus, Wire};

const NODE: NodeId = NodeId(0x0101);
const CLIENT: NodeId = NodeId(0x0203);
const OTHER_CLIENT: NodeId = NodeId(0x0404);

/// Relay state observed from the outside, with interlock accounting.
#[derive(Debug, Default)]
struct PinState {
    power: bool,
    down: bool,
    violations: u32,
}

#[derive(Debug, Clone, Default)]
struct SharedPins(Arc<Mutex<PinState>>);

impl SharedPins {
    fn snapshot(&self) -> (bool, bool, u32) {
        let pins = self.0.lock().unwrap();
        (pins.power, pins.down, pins.violations)
    }
}

impl MotorDriver for SharedPins {
    fn set_power(&mut self, on: bool) {
        self.0.lock().unwrap().power = on;
    }

    fn set_direction_down(&mut self, down: bool) {
        let mut pins = self.0.lock().unwrap();
        if pins.power && down != pins.down {
            pins.violations += 1;
        }
        pins.down = down;
    }

    fn set_activity_led(&mut self, _on: bool) {}
}

/// A healthy temperature part reporting 25.0 degrees.
#[derive(Debug)]
struct GoodSensor {
    scratchpad: [u8; 9],
    cursor: usize,
}

impl Default for GoodSensor {
    fn default() -> Self {
        let mut scratchpad = [0x32, 0x00, 0x4B, 0x46, 0xFF, 0xFF, 0x0C, 0x10, 0];
        scratchpad[8] = scratchpad_crc(&scratchpad[..8]);
        Self {
            scratchpad,
            cursor: 0,
        }
    }
}

impl OneWireBus for GoodSensor {
    fn enable(&mut self) {
        self.cursor = 0;
    }
    fn write_octet(&mut self, _octet: u8) {}
    fn read_octet(&mut self) -> u8 {
        let octet = self.scratchpad[self.cursor % 9];
        self.cursor += 1;
        octet
    }
    fn disable(&mut self) {}
}

/// A raw bus attachment standing in for another node or a control tool.
struct Peer {
    tap: BusTap,
    decoder: FrameDecoder,
}

impl Peer {
    fn send(&mut self, msg: &Message) {
        let stream = frame::encode(msg);
        self.tap.begin_tx();
        for &octet in &stream {
            self.tap.write(octet);
        }
        self.tap.end_tx();
    }

    fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(octet) = self.tap.read() {
            if let Ok(Some(msg)) = self.decoder.feed(octet) {
                out.push(msg);
            }
        }
        out
    }
}

struct Rig {
    node: ShutterNode<BusTap, MemStore, SharedPins, GoodSensor>,
    peer: Peer,
    pins: SharedPins,
}

impl Rig {
    fn new() -> Self {
        let bus = SimBus::new();
        let mut store = MemStore::new();
        store.set_node_id(NODE);
        store.set_name(b"shutter1");

        let pins = SharedPins::default();
        let node = ShutterNode::new(store, bus.tap(), pins.clone(), GoodSensor::default());
        let peer = Peer {
            tap: bus.tap(),
            decoder: FrameDecoder::new(),
        };
        Rig { node, peer, pins }
    }

    /// Advance the node by `n` 10 ms ticks with idle keys.
    fn tick(&mut self, n: u32) {
        for _ in 0..n {
            self.node.on_tick(KeySample::default());
            self.node.poll();
        }
    }

    fn tick_keys(&mut self, n: u32, keys: KeySample) {
        for _ in 0..n {
            self.node.on_tick(keys);
            self.node.poll();
        }
    }

    fn request(&self, protocol: u8, command: u8, sub: u8) -> Message {
        let mut msg = Message::new(protocol);
        msg.set_dest(NODE);
        msg.set_src(CLIENT);
        msg.set_command(command);
        msg.set_subcommand(sub);
        msg
    }
}

#[test]
fn test_status_response_follows_the_addressing_convention() {
    let mut rig = Rig::new();
    let query = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, SHUTTER_QUERY);
    rig.peer.send(&query);
    rig.tick(1);

    let responses = rig.peer.drain();
    assert_eq!(responses.len(), 1);
    let reply = &responses[0];
    assert_eq!(reply.dest(), CLIENT);
    assert_eq!(reply.src(), NODE);
    assert!(reply.is_response());
    assert_eq!(reply.command(), CMD_SHUTTER);
    assert_eq!(reply.subcommand(), SHUTTER_QUERY);
    assert_eq!(reply.octets()[7], 0); // no error
    assert_eq!(reply.octets()[8], 0); // position unknown at power-up
}

#[test]
fn test_queries_for_other_nodes_draw_no_response() {
    let mut rig = Rig::new();

    let mut query = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, SHUTTER_QUERY);
    query.set_dest(NodeId(0x0505));
    rig.peer.send(&query);
    rig.tick(1);
    assert!(rig.peer.drain().is_empty());

    // The device protocol wants exact unicast; broadcast is not enough.
    let mut query = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, SHUTTER_QUERY);
    query.set_dest(NodeId::BROADCAST);
    rig.peer.send(&query);
    rig.tick(1);
    assert!(rig.peer.drain().is_empty());
}

#[test]
fn test_unknown_protocols_and_commands_are_ignored() {
    let mut rig = Rig::new();

    let mut alien = rig.request(0x55, 0x01, 0x01);
    alien.set_dest(NODE);
    rig.peer.send(&alien);
    rig.tick(1);
    assert!(rig.peer.drain().is_empty());

    let unknown = rig.request(PROTOCOL_BUSCTL, 0x60, 0);
    rig.peer.send(&unknown);
    rig.tick(1);
    assert!(rig.peer.drain().is_empty());

    let unknown = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, 0x7F);
    rig.peer.send(&unknown);
    rig.tick(1);
    assert!(rig.peer.drain().is_empty());
}

#[test]
fn test_busctl_rejects_invalid_sources() {
    let mut rig = Rig::new();
    let mut query = rig.request(PROTOCOL_BUSCTL, BUSCTL_QRY_TIME, 0);
    query.set_src(NodeId::BROADCAST);
    rig.peer.send(&query);
    rig.tick(1);
    assert!(rig.peer.drain().is_empty());
}

#[test]
fn test_drive_up_runs_the_motor_through_both_settles() {
    let mut rig = Rig::new();
    let mut drive = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, SHUTTER_DRIVE);
    drive.octets_mut()[7] = 0; // all shutters
    drive.octets_mut()[8] = DRIVE_UP;
    rig.peer.send(&drive);
    rig.tick(1);

    let responses = rig.peer.drain();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].octets()[7], 0); // accepted

    // Through the power-off and direction settles into the travel phase.
    rig.tick(50);
    let (power, down, violations) = rig.pins.snapshot();
    assert!(power);
    assert!(!down);
    assert_eq!(violations, 0);
    assert_eq!(rig.node.shutter_status(), STATUS_RUNNING_UP);

    // Let the travel time and the off sequence run out.
    rig.tick(2600);
    let (power, _, violations) = rig.pins.snapshot();
    assert!(!power);
    assert_eq!(violations, 0);
    assert_eq!(rig.node.shutter_status() & 0x80, 0); // not running
    assert_eq!(rig.node.shutter_status(), 0b0010_0000); // open, value valid
}

#[test]
fn test_drive_down_reports_closed_when_parked() {
    let mut rig = Rig::new();
    let mut drive = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, SHUTTER_DRIVE);
    drive.octets_mut()[8] = DRIVE_DOWN;
    rig.peer.send(&drive);
    rig.tick(50);
    assert_eq!(rig.node.shutter_status(), STATUS_RUNNING_DOWN);
    let (_, down, _) = rig.pins.snapshot();
    assert!(down);

    rig.tick(2600);
    assert_eq!(rig.node.shutter_status(), STATUS_CLOSED);
    let (_, _, violations) = rig.pins.snapshot();
    assert_eq!(violations, 0);
}

#[test]
fn test_malformed_drive_answers_in_band_error() {
    let mut rig = Rig::new();

    // Reserved octet set.
    let mut drive = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, SHUTTER_DRIVE);
    drive.octets_mut()[8] = DRIVE_UP;
    drive.octets_mut()[12] = 0x01;
    rig.peer.send(&drive);
    rig.tick(1);
    let responses = rig.peer.drain();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].octets()[7], 1);

    // Shutter index out of range.
    let mut drive = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, SHUTTER_DRIVE);
    drive.octets_mut()[7] = 2;
    drive.octets_mut()[8] = DRIVE_UP;
    rig.peer.send(&drive);
    rig.tick(1);
    assert_eq!(rig.peer.drain()[0].octets()[7], 1);

    // Direction field neither up nor down.
    let mut drive = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, SHUTTER_DRIVE);
    drive.octets_mut()[8] = 0x40;
    rig.peer.send(&drive);
    rig.tick(1);
    assert_eq!(rig.peer.drain()[0].octets()[7], 1);

    // The motor never moved.
    rig.tick(50);
    let (power, _, _) = rig.pins.snapshot();
    assert!(!power);
    assert_eq!(rig.node.shutter_status(), 0);
}

#[test]
fn test_time_sync_catches_up_a_missed_schedule_action() {
    let mut rig = Rig::new();

    // 07:29:54 on Monday, down to 10-second units.
    let before = (7 * 60 + 29) * 6 + 5;
    let mut time_msg = rig.request(PROTOCOL_BUSCTL, BUSCTL_TIME, 0);
    time_msg.set_dest(NodeId::BROADCAST);
    time_msg.octets_mut()[7] = (before >> 8) as u8;
    time_msg.octets_mut()[8] = before as u8;
    rig.peer.send(&time_msg);
    rig.tick(1);

    // Nothing due yet; the factory pull-up sits at 07:30.
    rig.tick(10);
    assert_eq!(rig.node.shutter_status(), 0);

    // The clock jumps past the entry: 07:30:05.
    let after = (7 * 60 + 30) * 6;
    let mut time_msg = rig.request(PROTOCOL_BUSCTL, BUSCTL_TIME, 0);
    time_msg.set_dest(NodeId::BROADCAST);
    time_msg.octets_mut()[7] = (after >> 8) as u8;
    time_msg.octets_mut()[8] = after as u8;
    rig.peer.send(&time_msg);
    rig.tick(1);

    // The catch-up evaluation fired the pull-up exactly once.
    rig.tick(50);
    assert_eq!(rig.node.shutter_status(), STATUS_RUNNING_UP);

    // And the clock answers with the distributed time.
    let query = rig.request(PROTOCOL_BUSCTL, BUSCTL_QRY_TIME, 0);
    rig.peer.send(&query);
    rig.tick(1);
    let responses = rig.peer.drain();
    let reply = responses.last().unwrap();
    let time = u16::from(reply.octets()[7]) << 8 | u16::from(reply.octets()[8]);
    assert_eq!(time, after);
}

#[test]
fn test_schedule_stays_quiet_until_time_is_set() {
    let mut rig = Rig::new();
    // A whole simulated minute without any time sync: no action fires even
    // though the table is populated.
    rig.tick(6100);
    assert_eq!(rig.node.shutter_status(), 0);
    let (power, _, _) = rig.pins.snapshot();
    assert!(!power);
}

#[test]
fn test_sensor_conversation_reports_temperature() {
    let mut rig = Rig::new();
    let request = rig.request(PROTOCOL_SHUTTER, CMD_SENSOR, SENSOR_TEMPERATURE);
    rig.peer.send(&request);
    rig.tick(1);

    // The conversion needs its settle time first.
    assert!(rig.peer.drain().is_empty());
    rig.tick(95);

    let responses = rig.peer.drain();
    assert_eq!(responses.len(), 1);
    let reply = &responses[0];
    assert_eq!(reply.dest(), CLIENT);
    assert!(reply.is_response());
    assert_eq!(reply.subcommand(), SENSOR_TEMPERATURE);
    assert_eq!(reply.octets()[7], 0x11); // group 1 of 1
    let value = (u16::from(reply.octets()[8]) << 8 | u16::from(reply.octets()[9])) as i16;
    assert_eq!(value, 250); // 25.0 degrees
    assert_eq!(reply.octets()[10], 0x80); // no second sensor
}

#[test]
fn test_second_sensor_requester_gets_a_broadcast() {
    let mut rig = Rig::new();
    let request = rig.request(PROTOCOL_SHUTTER, CMD_SENSOR, SENSOR_TEMPERATURE);
    rig.peer.send(&request);
    rig.tick(2);

    let mut second = rig.request(PROTOCOL_SHUTTER, CMD_SENSOR, SENSOR_TEMPERATURE);
    second.set_src(OTHER_CLIENT);
    rig.peer.send(&second);
    rig.tick(95);

    let responses = rig.peer.drain();
    assert_eq!(responses.len(), 1); // still a single conversion
    assert_eq!(responses[0].dest(), NodeId::BROADCAST);
}

#[test]
fn test_schedule_query_lists_the_factory_table() {
    let mut rig = Rig::new();
    let query = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, SHUTTER_QRY_SCHEDULE);
    rig.peer.send(&query);
    rig.tick(1);

    let responses = rig.peer.drain();
    assert_eq!(responses.len(), SCHEDULE_SLOTS);

    // Slot 0: Monday pull-up 07:30.
    let first = &responses[0];
    assert_eq!(first.octets()[9], SCHEDULE_SLOTS as u8);
    assert_eq!(first.octets()[10], 0);
    let time = u16::from(first.octets()[11]) << 8 | u16::from(first.octets()[12]);
    assert_eq!(time, (7 * 60 + 30) * 6);
    assert_eq!(first.octets()[13], DRIVE_UP);

    // Slot 1: the matching pull-down.
    assert_eq!(responses[1].octets()[13], DRIVE_DOWN);

    // The spare slots at the end are empty.
    let last = &responses[SCHEDULE_SLOTS - 1];
    let time = u16::from(last.octets()[11]) << 8 | u16::from(last.octets()[12]);
    assert_eq!(time, 0);
    assert_eq!(last.octets()[13], 0);
}

#[test]
fn test_schedule_update_and_factory_reset() {
    let mut rig = Rig::new();

    // Rewrite slot 0: Tuesday 08:00 pull-down.
    let tuesday = (1440 + 8 * 60) * 6u16;
    let mut update = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, SHUTTER_UPD_SCHEDULE);
    update.octets_mut()[9] = 1;
    update.octets_mut()[10] = 0;
    update.octets_mut()[11] = (tuesday >> 8) as u8;
    update.octets_mut()[12] = tuesday as u8;
    update.octets_mut()[13] = DRIVE_DOWN;
    rig.peer.send(&update);
    rig.tick(1);
    assert!(rig.peer.drain().is_empty()); // updates are not acknowledged

    let query = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, SHUTTER_QRY_SCHEDULE);
    rig.peer.send(&query);
    rig.tick(1);
    let responses = rig.peer.drain();
    let time = u16::from(responses[0].octets()[11]) << 8 | u16::from(responses[0].octets()[12]);
    assert_eq!(time, tuesday);
    assert_eq!(responses[0].octets()[13], DRIVE_DOWN);

    // An out-of-range slot is refused.
    let mut bad = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, SHUTTER_UPD_SCHEDULE);
    bad.octets_mut()[9] = 1;
    bad.octets_mut()[10] = SCHEDULE_SLOTS as u8;
    bad.octets_mut()[11] = 0x01;
    rig.peer.send(&bad);
    rig.tick(1);

    // The sentinel pattern restores the factory table.
    let mut reset = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, SHUTTER_UPD_SCHEDULE);
    reset.octets_mut()[7] = 0xF0;
    reset.octets_mut()[9] = 16;
    reset.octets_mut()[10] = 0xF0;
    reset.octets_mut()[11] = 0xF0;
    reset.octets_mut()[12] = 0xF0;
    reset.octets_mut()[13] = 0xF0;
    rig.peer.send(&reset);
    rig.tick(1);

    rig.peer.send(&query);
    rig.tick(1);
    let responses = rig.peer.drain();
    let time = u16::from(responses[0].octets()[11]) << 8 | u16::from(responses[0].octets()[12]);
    assert_eq!(time, (7 * 60 + 30) * 6);
    assert_eq!(responses[0].octets()[13], DRIVE_UP);
}

#[test]
fn test_debug_flags_and_version_queries() {
    let mut rig = Rig::new();

    let mut set = rig.request(PROTOCOL_BUSCTL, BUSCTL_SET_DEBUG, 0);
    set.octets_mut()[6] = 0x01;
    rig.peer.send(&set);
    rig.tick(1);
    assert!(rig.peer.drain().is_empty()); // setting draws no response

    let query = rig.request(PROTOCOL_BUSCTL, BUSCTL_QRY_DEBUG, 0);
    rig.peer.send(&query);
    rig.tick(1);
    let responses = rig.peer.drain();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].octets()[6], 0x01);

    let version = rig.request(PROTOCOL_BUSCTL, BUSCTL_QRY_VERSION, 0);
    rig.peer.send(&version);
    rig.tick(1);
    let responses = rig.peer.drain();
    assert_eq!(responses.len(), 1);
    assert_eq!(&responses[0].octets()[8..13], b"0.1.0");

    // With debugging on, bus actions produce on-bus debug text.
    let mut drive = rig.request(PROTOCOL_SHUTTER, CMD_SHUTTER, SHUTTER_DRIVE);
    drive.octets_mut()[8] = DRIVE_UP;
    rig.peer.send(&drive);
    rig.tick(1);
    let responses = rig.peer.drain();
    assert!(responses.iter().any(|m| m.protocol() == PROTOCOL_DEBUG));
}

#[test]
fn test_manual_key_runs_and_toggles() {
    let mut rig = Rig::new();

    // A few released samples first: the debouncer wants a leading edge.
    rig.tick(5);

    // Ten clean samples debounce into one edge.
    rig.tick_keys(
        12,
        KeySample {
            down_key: true,
            up_key: false,
        },
    );
    rig.tick(50);
    assert_eq!(rig.node.shutter_status(), STATUS_RUNNING_DOWN);

    // Release, then press the same key again: resolves to a stop, taking
    // effect once the running sequence has parked.
    rig.tick(20);
    rig.tick_keys(
        12,
        KeySample {
            down_key: true,
            up_key: false,
        },
    );
    rig.tick(2700);
    assert_eq!(rig.node.shutter_status(), STATUS_CLOSED);
    let (power, _, violations) = rig.pins.snapshot();
    assert!(!power);
    assert_eq!(violations, 0);
}
