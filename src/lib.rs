//! # Shutter Bus Node
//!
//! An embedded-style controller for a motorized shutter sitting on a shared,
//! multi-drop serial bus, providing a CSMA/CD link layer with framed,
//! CRC-protected messages and a cooperative real-time control application.
//!
//! ## Features
//!
//! - **CSMA/CD link layer**: carrier sense, collision detection via line
//!   readback, seeded randomized backoff, single in-flight receive buffer
//! - **Weekly wall clock**: 10 ms tick, 10-second resolution, 7-day wrap,
//!   synchronized over the bus
//! - **Schedule engine**: persisted time-of-week action table with missed-
//!   event recovery after clock corrections
//! - **Shutter state machine**: relay interlock enforced structurally by the
//!   transition order, settle delays, toggle-style manual keys
//! - **One-wire temperature read-out**: bounded retries, broadcast fan-out
//!   for concurrent requesters
//! - **Embedded-friendly**: no heap allocations in the core data path,
//!   bounded memory usage
//!
//! ## Quick Start
//!
//! ```rust
//! use shutterbus::node::{KeySample, ShutterNode};
//! use shutterbus::motor::TraceDriver;
//! use shutterbus::sensor::NoSensor;
//! use shutterbus::storage::MemStore;
//! use shutterbus::wire::SimBus;
//!
//! let bus = SimBus::new();
//! let mut node = ShutterNode::new(MemStore::new(), bus.tap(), TraceDriver, NoSensor);
//!
//! // Drive the node: one tick every 10 ms, then drain pending events.
//! node.on_tick(KeySample::default());
//! node.poll();
//! ```
//!
//! ## Architecture
//!
//! - [`frame`] - wire framing: sync marker, byte stuffing, CRC-16
//! - [`link`] - CSMA/CD engine over the [`wire::Wire`] transceiver contract
//! - [`clock`] - tick-driven weekly wall clock
//! - [`schedule`] - persisted action schedule evaluation
//! - [`motor`] - shutter motor state machine and relay interlock
//! - [`sensor`] - one-wire temperature conversation
//! - [`storage`] - word-granularity persistent store
//! - [`node`] - the cooperative main loop tying everything together

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod clock;
pub mod frame;
pub mod link;
pub mod motor;
pub mod node;
pub mod protocol;
pub mod schedule;
pub mod sensor;
pub mod storage;
pub mod wire;

// Re-export main public types for convenience
pub use link::Link;
pub use node::ShutterNode;
pub use protocol::{Message, NodeId};
