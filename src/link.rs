//! CSMA/CD link-layer engine.
//!
//! Transmit side: sense the carrier before driving the line, compare every
//! driven octet against its readback, abort the frame on the first mismatch
//! and retry after a randomized backoff seeded from the node's own id,
//! bounded to a small number of attempts. There is no transmit queue: the
//! engine accepts exactly one outstanding message per `send` call.
//!
//! Receive side: a single in-flight buffer. A validated message parks in
//! the slot until the caller releases it; frames completing while the slot
//! is held are dropped and counted. Collisions never corrupt accepted
//! messages - anything failing the CRC simply never surfaces.

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::frame::{self, FrameDecoder, FrameError};
use crate::protocol::Message;
use crate::wire::Wire;

/// Upper bound on transmission attempts for one message.
pub const MAX_SEND_ATTEMPTS: u32 = 8;
/// Backoff slot width, in receiver polls.
const SLOT_POLLS: u32 = 32;
/// Largest backoff window, in slots.
const MAX_BACKOFF_SLOTS: u32 = 32;

/// Link-layer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    /// A busy bus or persistent collisions exhausted the retry budget.
    #[error("bus arbitration failed after {0} attempts")]
    Arbitration(u32),
}

/// Running link-layer counters.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct LinkStats {
    pub frames_sent: u32,
    pub frames_received: u32,
    pub collisions: u32,
    pub deferrals: u32,
    pub crc_errors: u32,
    pub overruns: u32,
}

/// Small pseudo-random source for backoff spacing, seeded from the node id
/// so neighbouring nodes fall into different slots.
#[derive(Debug)]
struct XorShift(u32);

impl XorShift {
    fn new(seed: u16) -> Self {
        Self(u32::from(seed).wrapping_mul(0x9E37_79B9) | 1)
    }

    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

/// The CSMA/CD engine bound to one transceiver.
#[derive(Debug)]
pub struct Link<W: Wire> {
    wire: W,
    decoder: FrameDecoder,
    rx_slot: Option<Message>,
    rng: XorShift,
    stats: LinkStats,
}

impl<W: Wire> Link<W> {
    /// Attach the engine to a transceiver. `seed` is the node's own id.
    pub fn new(wire: W, seed: u16) -> Self {
        Self {
            wire,
            decoder: FrameDecoder::new(),
            rx_slot: None,
            rng: XorShift::new(seed),
            stats: LinkStats::default(),
        }
    }

    /// Transmit one message.
    ///
    /// The caller owns exactly one outstanding message and must not reuse
    /// its buffer until this call returns; there is no internal queue.
    ///
    /// # Errors
    ///
    /// [`LinkError::Arbitration`] when the retry budget runs out.
    pub fn send(&mut self, msg: &Message) -> Result<(), LinkError> {
        let stream = frame::encode(msg);
        for attempt in 0..MAX_SEND_ATTEMPTS {
            if !self.wire.idle() {
                self.stats.deferrals += 1;
                self.backoff(attempt);
                continue;
            }
            if self.transmit(&stream) {
                self.stats.frames_sent += 1;
                return Ok(());
            }
            self.stats.collisions += 1;
            debug!(attempt, "collision on the line, backing off");
            self.backoff(attempt);
        }
        Err(LinkError::Arbitration(MAX_SEND_ATTEMPTS))
    }

    fn transmit(&mut self, stream: &[u8]) -> bool {
        self.wire.begin_tx();
        for &octet in stream {
            if self.wire.write(octet) != octet {
                // Mid-frame collision: stop driving the line immediately.
                self.wire.end_tx();
                return false;
            }
        }
        self.wire.end_tx();
        true
    }

    /// Wait a pseudo-random number of slots, doubling the window with every
    /// attempt. The receiver stays drained so inbound frames are not lost
    /// while deferring.
    fn backoff(&mut self, attempt: u32) {
        let window = (1u32 << (attempt + 1)).min(MAX_BACKOFF_SLOTS);
        let slots = 1 + self.rng.next() % window;
        for _ in 0..slots * SLOT_POLLS {
            if let Some(octet) = self.wire.read() {
                self.feed(octet);
            }
        }
    }

    fn feed(&mut self, octet: u8) {
        match self.decoder.feed(octet) {
            Ok(Some(msg)) => {
                if self.rx_slot.is_none() {
                    self.rx_slot = Some(msg);
                    self.stats.frames_received += 1;
                } else {
                    // The slot is still held by the application.
                    self.stats.overruns += 1;
                }
            }
            Ok(None) => {}
            Err(FrameError::InvalidCrc) => {
                // Dropped silently: no NACK exists at this layer.
                self.stats.crc_errors += 1;
            }
        }
    }

    /// Drain the receiver into the decoder; call once per main-loop pass.
    pub fn poll(&mut self) {
        while let Some(octet) = self.wire.read() {
            self.feed(octet);
        }
    }

    /// The most recently validated message, if one is pending. The receiver
    /// does not accept another frame until [`Link::release`] is called.
    #[must_use]
    pub fn receive(&self) -> Option<&Message> {
        self.rx_slot.as_ref()
    }

    /// Release the receive slot, re-arming the receiver.
    pub fn release(&mut self) {
        self.rx_slot = None;
    }

    #[must_use]
    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }
}
