//! Physical-layer abstraction and the in-process bus medium.
//!
//! [`Wire`] captures the half-duplex transceiver contract of an RS-485
//! style driver: a driver-enable window brackets every transmission, each
//! octet driven can be read back from the line, and the local receiver is
//! muted while the driver is enabled.
//!
//! [`SimBus`] is the host-side stand-in for the physical medium: a shared
//! multi-drop line where every octet driven by one tap is seen by all other
//! attached taps and overlapping transmissions garble the line.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Half-duplex bus transceiver contract.
pub trait Wire {
    /// Carrier sense: true when no other transmitter holds the bus.
    fn idle(&self) -> bool;
    /// Assert the line driver; the local receiver is muted until `end_tx`.
    fn begin_tx(&mut self);
    /// Drive one octet and return the octet observed on the line.
    fn write(&mut self, octet: u8) -> u8;
    /// Release the line driver.
    fn end_tx(&mut self);
    /// Next octet captured by the receiver, if any.
    fn read(&mut self) -> Option<u8>;
}

#[derive(Debug, Default)]
struct TapState {
    rx: VecDeque<u8>,
    transmitting: bool,
}

#[derive(Debug, Default)]
struct BusInner {
    taps: Vec<TapState>,
}

/// A shared multi-drop serial medium for simulation and tests.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    inner: Arc<Mutex<BusInner>>,
}

impl SimBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new transceiver to the medium.
    #[must_use]
    pub fn tap(&self) -> BusTap {
        let mut inner = lock(&self.inner);
        inner.taps.push(TapState::default());
        BusTap {
            id: inner.taps.len() - 1,
            inner: Arc::clone(&self.inner),
        }
    }
}

/// One attachment point on a [`SimBus`].
#[derive(Debug)]
pub struct BusTap {
    id: usize,
    inner: Arc<Mutex<BusInner>>,
}

fn lock(inner: &Arc<Mutex<BusInner>>) -> MutexGuard<'_, BusInner> {
    // A poisoned medium still carries bytes; recover the guard.
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Wire for BusTap {
    fn idle(&self) -> bool {
        let inner = lock(&self.inner);
        inner
            .taps
            .iter()
            .enumerate()
            .all(|(i, tap)| i == self.id || !tap.transmitting)
    }

    fn begin_tx(&mut self) {
        lock(&self.inner).taps[self.id].transmitting = true;
    }

    fn write(&mut self, octet: u8) -> u8 {
        let mut inner = lock(&self.inner);
        let clash = inner
            .taps
            .iter()
            .enumerate()
            .any(|(i, tap)| i != self.id && tap.transmitting);
        // Two drivers on the line at once garble the octet for everyone.
        let line = if clash { octet ^ 0xFF } else { octet };
        for (i, tap) in inner.taps.iter_mut().enumerate() {
            if i != self.id && !tap.transmitting {
                tap.rx.push_back(line);
            }
        }
        line
    }

    fn end_tx(&mut self) {
        lock(&self.inner).taps[self.id].transmitting = false;
    }

    fn read(&mut self) -> Option<u8> {
        lock(&self.inner).taps[self.id].rx.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_octets_fan_out_to_other_taps() {
        let bus = SimBus::new();
        let mut a = bus.tap();
        let mut b = bus.tap();
        let mut c = bus.tap();

        a.begin_tx();
        assert_eq!(a.write(0x42), 0x42);
        a.end_tx();

        assert_eq!(b.read(), Some(0x42));
        assert_eq!(c.read(), Some(0x42));
        assert_eq!(a.read(), None); // own receiver muted during tx
    }

    #[test]
    fn test_carrier_sense_and_collision() {
        let bus = SimBus::new();
        let mut a = bus.tap();
        let mut b = bus.tap();

        assert!(a.idle());
        assert!(b.idle());

        a.begin_tx();
        assert!(!b.idle());
        assert!(a.idle()); // own driver does not count as foreign carrier

        b.begin_tx();
        // Overlapping drivers: readback no longer matches.
        assert_ne!(a.write(0x55), 0x55);
        a.end_tx();
        b.end_tx();
    }
}
