//! Application message layout and the protocol constant tables.
//!
//! Every message is a fixed 16-octet unit carried in one wire frame:
//!
//! | offset | field                          |
//! |--------|--------------------------------|
//! | 0      | protocol id                    |
//! | 1-2    | destination (hi, lo)           |
//! | 3-4    | source (hi, lo)                |
//! | 5      | command, bit 7 = response      |
//! | 6      | sub-command                    |
//! | 7-15   | command-specific data          |
//!
//! A response always has source/destination swapped relative to the request
//! and the response bit set.

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

/// Logical size of every application message in octets.
pub const MSG_SIZE: usize = 16;

const_assert_eq!(MSG_SIZE, 16);

/// Bus-control protocol: time distribution and node management.
pub const PROTOCOL_BUSCTL: u8 = 0x81;
/// Shutter/device protocol: actuator and sensor commands.
pub const PROTOCOL_SHUTTER: u8 = 0x61;
/// On-bus debug text messages.
pub const PROTOCOL_DEBUG: u8 = 0xC1;

/// Response marker bit in the command octet.
pub const RESPONSE_BIT: u8 = 0x80;

/// Bus-control command: distribute the wall time.
pub const BUSCTL_TIME: u8 = 0x01;
/// Bus-control command: query the wall time.
pub const BUSCTL_QRY_TIME: u8 = 0x02;
/// Bus-control command: query node type and firmware version.
pub const BUSCTL_QRY_VERSION: u8 = 0x03;
/// Bus-control command: persist a new debug-flag byte.
pub const BUSCTL_SET_DEBUG: u8 = 0x04;
/// Bus-control command: query debug and reset flags.
pub const BUSCTL_QRY_DEBUG: u8 = 0x05;

/// Device command group: shutter control.
pub const CMD_SHUTTER: u8 = 0x10;
/// Device command group: sensor read-out.
pub const CMD_SENSOR: u8 = 0x20;

/// Shutter sub-command: query the status byte.
pub const SHUTTER_QUERY: u8 = 0x01;
/// Shutter sub-command: drive up or down.
pub const SHUTTER_DRIVE: u8 = 0x02;
/// Shutter sub-command: query travel timings (reserved).
pub const SHUTTER_QRY_TIMINGS: u8 = 0x03;
/// Shutter sub-command: update travel timings (reserved).
pub const SHUTTER_UPD_TIMINGS: u8 = 0x04;
/// Shutter sub-command: read the schedule table.
pub const SHUTTER_QRY_SCHEDULE: u8 = 0x05;
/// Shutter sub-command: write one schedule slot.
pub const SHUTTER_UPD_SCHEDULE: u8 = 0x06;

/// Sensor sub-command: temperature conversion and read-out.
pub const SENSOR_TEMPERATURE: u8 = 0x01;

/// Drive/schedule direction field: pull the shutter up.
pub const DRIVE_UP: u8 = 0xC0;
/// Drive/schedule direction field: pull the shutter down.
pub const DRIVE_DOWN: u8 = 0x80;

/// A node address as carried on the wire (hi, lo octet pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeId(pub u16);

impl NodeId {
    /// The all-nodes address.
    pub const BROADCAST: NodeId = NodeId(0xFFFF);

    #[must_use]
    pub fn from_octets(hi: u8, lo: u8) -> Self {
        Self(u16::from(hi) << 8 | u16::from(lo))
    }

    #[must_use]
    pub fn hi(self) -> u8 {
        (self.0 >> 8) as u8
    }

    #[must_use]
    pub fn lo(self) -> u8 {
        self.0 as u8
    }
}

/// One 16-octet application message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    raw: [u8; MSG_SIZE],
}

impl Message {
    /// A zeroed message carrying the given protocol id.
    #[must_use]
    pub fn new(protocol: u8) -> Self {
        let mut raw = [0u8; MSG_SIZE];
        raw[0] = protocol;
        Self { raw }
    }

    #[must_use]
    pub fn from_octets(raw: [u8; MSG_SIZE]) -> Self {
        Self { raw }
    }

    #[must_use]
    pub fn octets(&self) -> &[u8; MSG_SIZE] {
        &self.raw
    }

    pub fn octets_mut(&mut self) -> &mut [u8; MSG_SIZE] {
        &mut self.raw
    }

    #[must_use]
    pub fn protocol(&self) -> u8 {
        self.raw[0]
    }

    #[must_use]
    pub fn dest(&self) -> NodeId {
        NodeId::from_octets(self.raw[1], self.raw[2])
    }

    pub fn set_dest(&mut self, id: NodeId) {
        self.raw[1] = id.hi();
        self.raw[2] = id.lo();
    }

    #[must_use]
    pub fn src(&self) -> NodeId {
        NodeId::from_octets(self.raw[3], self.raw[4])
    }

    pub fn set_src(&mut self, id: NodeId) {
        self.raw[3] = id.hi();
        self.raw[4] = id.lo();
    }

    /// The command code without the response marker.
    #[must_use]
    pub fn command(&self) -> u8 {
        self.raw[5] & !RESPONSE_BIT
    }

    pub fn set_command(&mut self, command: u8) {
        self.raw[5] = command;
    }

    #[must_use]
    pub fn is_response(&self) -> bool {
        self.raw[5] & RESPONSE_BIT != 0
    }

    #[must_use]
    pub fn subcommand(&self) -> u8 {
        self.raw[6]
    }

    pub fn set_subcommand(&mut self, sub: u8) {
        self.raw[6] = sub;
    }

    /// Build the response skeleton for this request: addresses swapped, the
    /// response bit set, the sub-command preserved and the data tail cleared.
    /// Handlers fill in octets 6.. as their command requires.
    #[must_use]
    pub fn reply_from(&self, own: NodeId) -> Message {
        let mut reply = *self;
        reply.set_dest(self.src());
        reply.set_src(own);
        reply.raw[5] |= RESPONSE_BIT;
        for octet in &mut reply.raw[7..] {
            *octet = 0;
        }
        reply
    }
}

/// True when the destination names this node exactly.
#[must_use]
pub fn unicast_match(msg: &Message, own: NodeId) -> bool {
    msg.dest() == own
}

/// Bus-control acceptance: exact unicast, or one of the broadcast forms
/// (destination hi equal to the own hi octet or 0xFF, lo octet 0xFF).
#[must_use]
pub fn busctl_match(msg: &Message, own: NodeId) -> bool {
    if msg.dest() == own {
        return true;
    }
    (msg.raw[1] == own.hi() || msg.raw[1] == 0xFF) && msg.raw[2] == 0xFF
}

/// Sender sanity check: broadcast or null source addresses never originate
/// valid requests.
#[must_use]
pub fn valid_source(msg: &Message) -> bool {
    !(msg.raw[3] == 0xFF || msg.raw[4] == 0xFF || msg.raw[4] == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_swaps_addresses_and_sets_marker() {
        let mut req = Message::new(PROTOCOL_BUSCTL);
        req.set_dest(NodeId(0x0101));
        req.set_src(NodeId(0x0203));
        req.set_command(BUSCTL_QRY_TIME);
        req.octets_mut()[9] = 0x55;

        let reply = req.reply_from(NodeId(0x0101));
        assert_eq!(reply.dest(), NodeId(0x0203));
        assert_eq!(reply.src(), NodeId(0x0101));
        assert!(reply.is_response());
        assert_eq!(reply.command(), BUSCTL_QRY_TIME);
        assert!(reply.octets()[7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_busctl_addressing_forms() {
        let own = NodeId(0x0105);
        let mut msg = Message::new(PROTOCOL_BUSCTL);

        msg.set_dest(own);
        assert!(busctl_match(&msg, own));

        msg.set_dest(NodeId::BROADCAST);
        assert!(busctl_match(&msg, own));

        // Segment broadcast: own hi octet, lo 0xFF.
        msg.set_dest(NodeId::from_octets(0x01, 0xFF));
        assert!(busctl_match(&msg, own));

        msg.set_dest(NodeId(0x0206));
        assert!(!busctl_match(&msg, own));
    }

    #[test]
    fn test_source_validity() {
        let mut msg = Message::new(PROTOCOL_BUSCTL);
        msg.set_src(NodeId(0x0203));
        assert!(valid_source(&msg));

        msg.set_src(NodeId::BROADCAST);
        assert!(!valid_source(&msg));

        msg.set_src(NodeId(0x0200));
        assert!(!valid_source(&msg));
    }
}
