//! One-wire temperature read-out.
//!
//! A conversion is started on request and read back after a settle delay of
//! 900 ms (the part needs at least 750 ms). The scratchpad carries its own
//! CRC; a failed check re-issues the conversion a bounded number of times
//! before the error sentinel is reported. Exactly one conversion is ever in
//! flight; a second distinct requester arriving mid-conversion widens the
//! eventual report to broadcast so both see the answer.

use tracing::debug;

use crate::motor::millis;
use crate::protocol::NodeId;

/// Settle delay before the scratchpad is read, in ticks.
pub const CONVERT_TICKS: u16 = millis(900);
/// Delay before a retried conversion is read back, in ticks.
pub const RETRY_TICKS: u16 = millis(1100);
/// Read-out attempts before the error sentinel is reported.
pub const MAX_TRIES: u8 = 5;
/// Reported when every read-out attempt failed the scratchpad CRC.
pub const TEMP_ERROR: i16 = 0x7FFF;

// ROM and function commands of the temperature part.
const SKIP_ROM: u8 = 0xCC;
const CONVERT_T: u8 = 0x44;
const READ_SCRATCHPAD: u8 = 0xBE;

/// Transport primitives of the external one-wire bus master.
pub trait OneWireBus {
    /// Reset/presence pulse, powering the bus.
    fn enable(&mut self);
    fn write_octet(&mut self, octet: u8);
    fn read_octet(&mut self) -> u8;
    fn disable(&mut self);
}

/// A bus with no sensor fitted: reads float to 0xFF and never pass the
/// scratchpad CRC, so requests end in the error sentinel.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSensor;

impl OneWireBus for NoSensor {
    fn enable(&mut self) {}
    fn write_octet(&mut self, _octet: u8) {}
    fn read_octet(&mut self) -> u8 {
        0xFF
    }
    fn disable(&mut self) {}
}

/// Outcome of one read-out attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorOutcome {
    /// No conversation active.
    Idle,
    /// Scratchpad CRC failed; the conversion was re-issued and should be
    /// read back after the returned tick delay.
    Retry(u16),
    /// Final result to report (the sentinel after exhausted retries).
    Report { to: NodeId, temperature: i16 },
}

/// The read-out task. At most one conversion is in flight.
#[derive(Debug)]
pub struct SensorTask {
    tries_left: u8,
    requester: NodeId,
}

impl Default for SensorTask {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorTask {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tries_left: 0,
            requester: NodeId::BROADCAST,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.tries_left > 0
    }

    /// Handle a temperature request from `from`.
    ///
    /// Starts a conversion when idle and returns the settle delay to arm.
    /// When a conversion is already active only the response target is
    /// adjusted: a different requester turns the report into a broadcast.
    pub fn request<B: OneWireBus>(&mut self, bus: &mut B, from: NodeId) -> Option<u16> {
        if self.is_active() {
            if self.requester != from {
                self.requester = NodeId::BROADCAST;
            }
            return None;
        }
        self.tries_left = MAX_TRIES;
        self.requester = from;
        start_conversion(bus);
        Some(CONVERT_TICKS)
    }

    /// Read the scratchpad; call after the armed delay elapsed.
    pub fn read_out<B: OneWireBus>(&mut self, bus: &mut B) -> SensorOutcome {
        if !self.is_active() {
            return SensorOutcome::Idle;
        }

        bus.enable();
        bus.write_octet(SKIP_ROM);
        bus.write_octet(READ_SCRATCHPAD);
        let mut scratchpad = [0u8; 9];
        for octet in &mut scratchpad {
            *octet = bus.read_octet();
        }

        let temperature = if scratchpad_crc(&scratchpad[..8]) == scratchpad[8] {
            convert(&scratchpad)
        } else {
            TEMP_ERROR
        };

        if temperature != TEMP_ERROR {
            self.tries_left = 0;
            bus.disable();
            return SensorOutcome::Report {
                to: self.requester,
                temperature,
            };
        }
        self.tries_left -= 1;
        if self.tries_left == 0 {
            bus.disable();
            return SensorOutcome::Report {
                to: self.requester,
                temperature: TEMP_ERROR,
            };
        }
        debug!(tries_left = self.tries_left, "scratchpad crc failed, converting again");
        start_conversion(bus);
        SensorOutcome::Retry(RETRY_TICKS)
    }
}

fn start_conversion<B: OneWireBus>(bus: &mut B) {
    bus.enable();
    bus.write_octet(SKIP_ROM);
    bus.write_octet(CONVERT_T);
}

/// Dallas/Maxim CRC-8 (polynomial 0x8C, reflected) over scratchpad octets.
#[must_use]
pub fn scratchpad_crc(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &octet in data {
        let mut octet = octet;
        for _ in 0..8 {
            let mix = (crc ^ octet) & 1;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            octet >>= 1;
        }
    }
    crc
}

/// High-resolution temperature from the scratchpad, in tenths of a degree.
/// The raw reading counts half degrees; the count-remain octet refines it.
fn convert(scratchpad: &[u8; 9]) -> i16 {
    let raw = i32::from(i16::from_le_bytes([scratchpad[0], scratchpad[1]]));
    let count_remain = i32::from(scratchpad[6]);
    ((raw * 100 - 25 + (16 - count_remain) * 100 / 16) / 20) as i16
}
