//! Control tool for shutter nodes: joins the simulated bus over TCP as a
//! peer node and speaks the framed wire protocol.

use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use shutterbus::clock::{format_weektime, parse_weektime, UNITS_PER_WEEK};
use shutterbus::frame::{encode, FrameDecoder};
use shutterbus::protocol::{
    Message, NodeId, BUSCTL_QRY_DEBUG, BUSCTL_QRY_TIME, BUSCTL_QRY_VERSION,
    BUSCTL_SET_DEBUG, BUSCTL_TIME, CMD_SENSOR, CMD_SHUTTER, DRIVE_DOWN, DRIVE_UP,
    PROTOCOL_BUSCTL, PROTOCOL_DEBUG, PROTOCOL_SHUTTER, SENSOR_TEMPERATURE, SHUTTER_DRIVE,
    SHUTTER_QRY_SCHEDULE, SHUTTER_QUERY, SHUTTER_UPD_SCHEDULE,
};
use shutterbus::storage::SCHEDULE_SLOTS;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "7340";
const DEFAULT_NODE: &str = "0101";
const DEFAULT_OWN: &str = "0001";

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
const SENSOR_TIMEOUT: Duration = Duration::from_secs(8);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("shutterctl")
        .version("0.1.0")
        .author("Home Control Engineering Team")
        .about("🪟  Shutter bus control tool - drive and inspect nodes on the bus")
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("Bus bridge host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Bus bridge port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("node")
                .short("n")
                .long("node")
                .value_name("ID")
                .help("Target node id, hex")
                .takes_value(true)
                .default_value(DEFAULT_NODE)
                .global(true),
        )
        .arg(
            Arg::with_name("own")
                .long("own")
                .value_name("ID")
                .help("Our own node id on the bus, hex")
                .takes_value(true)
                .default_value(DEFAULT_OWN)
                .global(true),
        )
        .subcommand(SubCommand::with_name("status").about("Query the shutter status byte"))
        .subcommand(
            SubCommand::with_name("drive")
                .about("Drive the shutter")
                .arg(
                    Arg::with_name("direction")
                        .help("Travel direction")
                        .required(true)
                        .possible_values(&["up", "down"]),
                ),
        )
        .subcommand(SubCommand::with_name("time").about("Query the node's wall time"))
        .subcommand(
            SubCommand::with_name("set-time")
                .about("Broadcast the wall time to the bus")
                .arg(
                    Arg::with_name("when")
                        .help("Quoted weekday time like 'mon 07:30:40', or 'now' (UTC)")
                        .required(true),
                ),
        )
        .subcommand(SubCommand::with_name("version").about("Query node type and version"))
        .subcommand(
            SubCommand::with_name("debug")
                .about("Query or set the node's debug flags")
                .arg(Arg::with_name("flags").help("New flags value (omit to query)")),
        )
        .subcommand(
            SubCommand::with_name("temperature").about("Read the node's temperature sensor"),
        )
        .subcommand(SubCommand::with_name("schedule").about("List the node's schedule table"))
        .subcommand(
            SubCommand::with_name("schedule-set")
                .about("Write one schedule slot")
                .arg(Arg::with_name("slot").help("Slot index").required(true))
                .arg(
                    Arg::with_name("when")
                        .help("Quoted weekday time like 'mon 07:30'")
                        .required(true),
                )
                .arg(
                    Arg::with_name("action")
                        .help("Action")
                        .required(true)
                        .possible_values(&["up", "down", "nop"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("schedule-reset")
                .about("Restore the node's factory schedule"),
        )
        .subcommand(SubCommand::with_name("monitor").about("Print every frame on the bus"))
        .get_matches();

    let mut client = BusClient::connect(&matches).await?;

    match matches.subcommand() {
        ("status", Some(_)) => client.status().await?,
        ("drive", Some(sub)) => client.drive(sub.value_of("direction") == Some("up")).await?,
        ("time", Some(_)) => client.query_time().await?,
        ("set-time", Some(sub)) => {
            client.set_time(sub.value_of("when").unwrap_or("now")).await?;
        }
        ("version", Some(_)) => client.query_version().await?,
        ("debug", Some(sub)) => match sub.value_of("flags") {
            Some(flags) => client.set_debug(flags.parse()?).await?,
            None => client.query_debug().await?,
        },
        ("temperature", Some(_)) => client.temperature().await?,
        ("schedule", Some(_)) => client.schedule().await?,
        ("schedule-set", Some(sub)) => {
            let slot: u8 = sub.value_of("slot").unwrap_or("0").parse()?;
            let when = sub.value_of("when").unwrap_or_default();
            let action = sub.value_of("action").unwrap_or("nop");
            client.schedule_set(slot, when, action).await?;
        }
        ("schedule-reset", Some(_)) => client.schedule_reset().await?,
        ("monitor", Some(_)) => client.monitor().await?,
        _ => {
            eprintln!("no command given; see {} for the list", "shutterctl --help".bold());
            std::process::exit(1);
        }
    }

    Ok(())
}

struct BusClient {
    stream: TcpStream,
    decoder: FrameDecoder,
    node: NodeId,
    own: NodeId,
}

impl BusClient {
    async fn connect(matches: &ArgMatches<'_>) -> Result<Self, Box<dyn std::error::Error>> {
        let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
        let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
        let node = parse_node_id(matches.value_of("node").unwrap_or(DEFAULT_NODE))?;
        let own = parse_node_id(matches.value_of("own").unwrap_or(DEFAULT_OWN))?;
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            node,
            own,
        })
    }

    fn request(&self, protocol: u8, command: u8) -> Message {
        let mut msg = Message::new(protocol);
        msg.set_dest(self.node);
        msg.set_src(self.own);
        msg.set_command(command);
        msg
    }

    async fn transmit(&mut self, msg: &Message) -> Result<(), Box<dyn std::error::Error>> {
        self.stream.write_all(&encode(msg)).await?;
        Ok(())
    }

    /// Wait for the first inbound message matching the predicate.
    async fn await_response<F>(
        &mut self,
        timeout: Duration,
        mut accept: F,
    ) -> Option<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let read = tokio::time::timeout(remaining, self.stream.read(&mut buf)).await;
            let n = match read {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return None,
                Ok(Ok(n)) => n,
            };
            for &octet in &buf[..n] {
                if let Ok(Some(msg)) = self.decoder.feed(octet) {
                    if accept(&msg) {
                        return Some(msg);
                    }
                }
            }
        }
    }

    async fn status(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut msg = self.request(PROTOCOL_SHUTTER, CMD_SHUTTER);
        msg.set_subcommand(SHUTTER_QUERY);
        self.transmit(&msg).await?;

        let own = self.own;
        let reply = self
            .await_response(RESPONSE_TIMEOUT, move |m| {
                m.dest() == own && m.protocol() == PROTOCOL_SHUTTER && m.subcommand() == SHUTTER_QUERY
            })
            .await;
        match reply {
            Some(reply) => {
                let raw = reply.octets();
                println!("{} {}", "shutter:".bold(), describe_status(raw[8]));
            }
            None => fail_timeout(),
        }
        Ok(())
    }

    async fn drive(&mut self, up: bool) -> Result<(), Box<dyn std::error::Error>> {
        let mut msg = self.request(PROTOCOL_SHUTTER, CMD_SHUTTER);
        msg.set_subcommand(SHUTTER_DRIVE);
        msg.octets_mut()[7] = 0; // all shutters
        msg.octets_mut()[8] = if up { DRIVE_UP } else { DRIVE_DOWN };
        self.transmit(&msg).await?;

        let reply = self
            .await_response(RESPONSE_TIMEOUT, |m| {
                m.protocol() == PROTOCOL_SHUTTER && m.subcommand() == SHUTTER_DRIVE
            })
            .await;
        match reply {
            Some(reply) if reply.octets()[7] == 0 => {
                println!(
                    "{} {}",
                    "✓ driving".green(),
                    if up { "up" } else { "down" }
                );
                println!("{} {}", "shutter:".bold(), describe_status(reply.octets()[8]));
            }
            Some(reply) => {
                println!(
                    "{} error code {}",
                    "✗ node rejected the command:".red(),
                    reply.octets()[7]
                );
            }
            None => fail_timeout(),
        }
        Ok(())
    }

    async fn query_time(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let msg = self.request(PROTOCOL_BUSCTL, BUSCTL_QRY_TIME);
        self.transmit(&msg).await?;

        let reply = self
            .await_response(RESPONSE_TIMEOUT, |m| {
                m.protocol() == PROTOCOL_BUSCTL && m.command() == BUSCTL_QRY_TIME
            })
            .await;
        match reply {
            Some(reply) => {
                let raw = reply.octets();
                let time = u16::from(raw[7]) << 8 | u16::from(raw[8]);
                println!(
                    "{} {} (unit {}, deci {})",
                    "node time:".bold(),
                    format_weektime(time).cyan(),
                    time,
                    raw[9]
                );
            }
            None => fail_timeout(),
        }
        Ok(())
    }

    async fn set_time(&mut self, when: &str) -> Result<(), Box<dyn std::error::Error>> {
        let units = if when.eq_ignore_ascii_case("now") {
            utc_weektime()
        } else {
            match parse_weektime(when) {
                Some(units) => units,
                None => {
                    eprintln!("{} '{}'", "unparseable weekday time".red(), when);
                    std::process::exit(1);
                }
            }
        };

        let mut msg = self.request(PROTOCOL_BUSCTL, BUSCTL_TIME);
        msg.set_dest(NodeId::BROADCAST);
        msg.octets_mut()[6] = 0x02; // decisecond field present
        msg.octets_mut()[7] = (units >> 8) as u8;
        msg.octets_mut()[8] = units as u8;
        msg.octets_mut()[9] = 0;
        self.transmit(&msg).await?;
        println!(
            "{} {}",
            "✓ time broadcast:".green(),
            format_weektime(units).cyan()
        );
        Ok(())
    }

    async fn query_version(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let msg = self.request(PROTOCOL_BUSCTL, BUSCTL_QRY_VERSION);
        self.transmit(&msg).await?;

        let reply = self
            .await_response(RESPONSE_TIMEOUT, |m| {
                m.protocol() == PROTOCOL_BUSCTL && m.command() == BUSCTL_QRY_VERSION
            })
            .await;
        match reply {
            Some(reply) => {
                let raw = reply.octets();
                let version: String = raw[8..15]
                    .iter()
                    .take_while(|&&o| o != 0)
                    .map(|&o| char::from(o))
                    .collect();
                println!("{} type {:#04x}", "node:".bold(), raw[6]);
                println!("{} {}", "version:".bold(), version.cyan());
            }
            None => fail_timeout(),
        }
        Ok(())
    }

    async fn set_debug(&mut self, flags: u8) -> Result<(), Box<dyn std::error::Error>> {
        let mut msg = self.request(PROTOCOL_BUSCTL, BUSCTL_SET_DEBUG);
        msg.octets_mut()[6] = flags;
        self.transmit(&msg).await?;
        println!("{} {:#04x}", "✓ debug flags set to".green(), flags);
        Ok(())
    }

    async fn query_debug(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let msg = self.request(PROTOCOL_BUSCTL, BUSCTL_QRY_DEBUG);
        self.transmit(&msg).await?;

        let reply = self
            .await_response(RESPONSE_TIMEOUT, |m| {
                m.protocol() == PROTOCOL_BUSCTL && m.command() == BUSCTL_QRY_DEBUG
            })
            .await;
        match reply {
            Some(reply) => {
                let raw = reply.octets();
                println!("{} {:#04x}", "debug flags:".bold(), raw[6]);
                println!("{} {:#04x}", "reset flags:".bold(), raw[7]);
            }
            None => fail_timeout(),
        }
        Ok(())
    }

    async fn temperature(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut msg = self.request(PROTOCOL_SHUTTER, CMD_SENSOR);
        msg.set_subcommand(SENSOR_TEMPERATURE);
        self.transmit(&msg).await?;

        // The conversion itself takes the best part of a second.
        let reply = self
            .await_response(SENSOR_TIMEOUT, |m| {
                m.protocol() == PROTOCOL_SHUTTER && m.subcommand() == SENSOR_TEMPERATURE
            })
            .await;
        match reply {
            Some(reply) => {
                let raw = reply.octets();
                let value = (u16::from(raw[8]) << 8 | u16::from(raw[9])) as i16;
                if value == shutterbus::sensor::TEMP_ERROR {
                    println!("{}", "✗ sensor read error".red());
                } else {
                    println!(
                        "{} {}.{} °C",
                        "temperature:".bold(),
                        value / 10,
                        (value % 10).abs()
                    );
                }
            }
            None => fail_timeout(),
        }
        Ok(())
    }

    async fn schedule(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut msg = self.request(PROTOCOL_SHUTTER, CMD_SHUTTER);
        msg.set_subcommand(SHUTTER_QRY_SCHEDULE);
        self.transmit(&msg).await?;

        println!("{}", "slot  time           action".bold());
        let mut seen = 0usize;
        while seen < SCHEDULE_SLOTS {
            let reply = self
                .await_response(RESPONSE_TIMEOUT, |m| {
                    m.protocol() == PROTOCOL_SHUTTER && m.subcommand() == SHUTTER_QRY_SCHEDULE
                })
                .await;
            let Some(reply) = reply else { break };
            let raw = reply.octets();
            let slot = raw[10];
            let time = u16::from(raw[11]) << 8 | u16::from(raw[12]);
            let action = match raw[13] {
                DRIVE_UP => "up".green(),
                DRIVE_DOWN => "down".blue(),
                _ => "-".normal(),
            };
            if time == 0 {
                println!("{slot:>4}  {:<13} {action}", "(empty)");
            } else {
                println!("{slot:>4}  {:<13} {action}", format_weektime(time));
            }
            seen += 1;
        }
        if seen == 0 {
            fail_timeout();
        }
        Ok(())
    }

    async fn schedule_set(
        &mut self,
        slot: u8,
        when: &str,
        action: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let Some(units) = parse_weektime(when) else {
            eprintln!("{} '{}'", "unparseable weekday time".red(), when);
            std::process::exit(1);
        };

        let mut msg = self.request(PROTOCOL_SHUTTER, CMD_SHUTTER);
        msg.set_subcommand(SHUTTER_UPD_SCHEDULE);
        let raw = msg.octets_mut();
        raw[9] = 1; // one entry
        raw[10] = slot;
        raw[11] = (units >> 8) as u8;
        raw[12] = units as u8;
        raw[13] = match action {
            "up" => DRIVE_UP,
            "down" => DRIVE_DOWN,
            _ => 0,
        };
        self.transmit(&msg).await?;
        println!(
            "{} slot {} = {} {}",
            "✓ schedule updated:".green(),
            slot,
            format_weektime(units),
            action
        );
        Ok(())
    }

    async fn schedule_reset(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut msg = self.request(PROTOCOL_SHUTTER, CMD_SHUTTER);
        msg.set_subcommand(SHUTTER_UPD_SCHEDULE);
        let raw = msg.octets_mut();
        raw[7] = 0xF0;
        raw[9] = 16;
        raw[10] = 0xF0;
        raw[11] = 0xF0;
        raw[12] = 0xF0;
        raw[13] = 0xF0;
        self.transmit(&msg).await?;
        println!("{}", "✓ factory schedule restored".green());
        Ok(())
    }

    async fn monitor(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", "monitoring the bus, ^C to stop".bold());
        let mut buf = [0u8; 256];
        loop {
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            for &octet in &buf[..n] {
                if let Ok(Some(msg)) = self.decoder.feed(octet) {
                    print_frame(&msg);
                }
            }
        }
    }
}

fn parse_node_id(text: &str) -> Result<NodeId, std::num::ParseIntError> {
    u16::from_str_radix(text.trim_start_matches("0x"), 16).map(NodeId)
}

/// UTC time of week in 10-second units; the epoch fell on a Thursday.
fn utc_weektime() -> u16 {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let weekday = (secs / 86_400 + 3) % 7;
    let in_day = secs % 86_400;
    ((weekday * 86_400 + in_day) / 10 % u64::from(UNITS_PER_WEEK)) as u16
}

fn describe_status(status: u8) -> String {
    if status & 0x80 != 0 {
        let direction = if status & 0x40 != 0 { "up" } else { "down" };
        return format!("running, direction {direction}");
    }
    if status & 0x20 != 0 {
        let percent = u32::from(status & 0x0F) * 100 / 15;
        return format!("at rest, {percent}% closed");
    }
    "at rest, position unknown".to_string()
}

fn print_frame(msg: &Message) {
    let raw = msg.octets();
    let proto = match msg.protocol() {
        PROTOCOL_BUSCTL => "busctl".cyan(),
        PROTOCOL_SHUTTER => "shutter".green(),
        PROTOCOL_DEBUG => "debug".yellow(),
        _ => "other".normal(),
    };
    if msg.protocol() == PROTOCOL_DEBUG {
        let text: String = raw[3..]
            .iter()
            .take_while(|&&o| o != 0)
            .map(|&o| char::from(o))
            .collect();
        println!(
            "{proto} {:02x}{:02x} {}",
            raw[1],
            raw[2],
            text.italic()
        );
        return;
    }
    let hex: String = raw.iter().map(|o| format!("{o:02x} ")).collect();
    println!(
        "{proto} {:04x} <- {:04x} cmd {:02x}{} {}",
        msg.dest().0,
        msg.src().0,
        msg.command(),
        if msg.is_response() { " resp" } else { "" },
        hex.trim_end()
    );
}

fn fail_timeout() {
    eprintln!("{}", "✗ no response from the node".red());
    std::process::exit(1);
}
