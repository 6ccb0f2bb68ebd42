//! Bus simulator: runs a shutter node on an in-process multi-drop bus and
//! bridges the bus to TCP so control tools can join as peer nodes.
//!
//! Every connected TCP client gets its own tap on the simulated line and
//! exchanges raw framed octets - exactly what it would see on the wire,
//! collisions included.

use shutterbus::motor::TraceDriver;
use shutterbus::node::{KeySample, ShutterNode};
use shutterbus::sensor::{scratchpad_crc, OneWireBus};
use shutterbus::storage::{FileStore, NvStore};
use shutterbus::wire::{BusTap, SimBus, Wire};
use shutterbus::NodeId;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{error, info, warn};

const TCP_PORT: u16 = 7340;
const DEFAULT_NODE_ID: u16 = 0x0101;
const DEFAULT_STORE: &str = "shutterbus-store.json";

/// A temperature part on the simulated one-wire bus, reporting a fixed
/// 21.5 degrees with a valid scratchpad CRC.
struct SimSensor {
    scratchpad: [u8; 9],
    cursor: usize,
}

impl SimSensor {
    fn new() -> Self {
        let mut scratchpad = [0x2B, 0x00, 0x4B, 0x46, 0xFF, 0xFF, 0x0C, 0x10, 0];
        scratchpad[8] = scratchpad_crc(&scratchpad[..8]);
        Self {
            scratchpad,
            cursor: 0,
        }
    }
}

impl OneWireBus for SimSensor {
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let store_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_STORE.to_string());

    println!("🪟  Shutter Bus Simulator");
    println!("========================");

    let mut store = FileStore::open(&store_path)?;
    if store.node_id().0 == 0 {
        // Fresh store: give the node an identity.
        store.set_node_id(NodeId(DEFAULT_NODE_ID));
        store.set_name(b"shutter1");
    }

    let bus = SimBus::new();
    let mut node = ShutterNode::new(store, bus.tap(), TraceDriver, SimSensor::new());
    info!(
        "shutter node {:04x} on the bus, store at {}",
        node.config().node_id.0,
        store_path
    );

    let listener = TcpListener::bind(("127.0.0.1", TCP_PORT)).await?;
    info!(port = TCP_PORT, "bus bridge listening");
    println!("📡 Bus bridge ready on TCP port {TCP_PORT}");

    let accept_bus = bus.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!(%addr, "client joined the bus");
                    let tap = accept_bus.tap();
                    tokio::spawn(async move {
                        if let Err(e) = bridge_client(stream, tap).await {
                            warn!(error = %e, "bridge client ended");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
    });

    // The 10 ms ticker drives the node; no manual keys are fitted here.
    let mut ticker = time::interval(Duration::from_millis(10));
    loop {
        ticker.tick().await;
        node.on_tick(KeySample::default());
        node.poll();
    }
}

/// Shovel octets between one TCP client and its bus tap.
async fn bridge_client(
    stream: TcpStream,
    mut tap: BusTap,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = [0u8; 256];
    let mut poll = time::interval(Duration::from_millis(5));

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => return Ok(()), // client disconnected
                    Ok(n) => {
                        tap.begin_tx();
                        for &octet in &buf[..n] {
                            let _ = tap.write(octet);
                        }
                        tap.end_tx();
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = poll.tick() => {
                let mut out = Vec::new();
                while let Some(octet) = tap.read() {
                    out.push(octet);
                }
                if !out.is_empty() {
                    writer.write_all(&out).await?;
                }
            }
        }
    }
}
