#![cfg_attr(not(target_os = "linux"), allow(dead_code, unused_imports))]

use std::io::{self, Write as _};
use std::path::PathBuf;

use anyhow::{Context, Result};
use bms_dfu::{
    Adapter, Client, ClientConfig, CrcKind, DataAck, Firmware, PacketLen, Progress, Station,
    UpdateOptions, Updater,
};
use clap::{Parser, ValueEnum};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Update the firmware of a BMS station over CAN.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Station address
    #[arg(short, long, default_value_t = 0, env = "CAN_UPDATE_ADDRESS")]
    address: u8,

    /// Packet length in bytes: 8, 16, 32, 64, 128, 256 or 512
    #[arg(
        short,
        long,
        default_value_t = PacketLen::DEFAULT,
        value_parser = parse_packet_len,
        env = "CAN_UPDATE_PACKET_LEN"
    )]
    packet_len: PacketLen,

    /// Stations installing the image
    #[arg(short, long, value_enum, default_value_t = Mode::Current, env = "CAN_UPDATE_MODE")]
    mode: Mode,

    /// Checksum of the whole image
    #[arg(short, long, value_enum, default_value_t = Crc::Crc16, env = "CAN_UPDATE_CRC")]
    crc: Crc,

    /// Firmware image
    #[arg(short, long, env = "CAN_UPDATE_FILE")]
    file: PathBuf,

    /// Network interface prefix, channel n opens <prefix><n>
    #[arg(long, default_value = "can", env = "CAN_UPDATE_PREFIX")]
    prefix: String,

    /// Adapter channel
    #[arg(long, default_value_t = 0, env = "CAN_UPDATE_CHANNEL")]
    channel: u8,

    /// Bus speed in bit/s
    #[arg(long, default_value_t = 500_000, env = "CAN_UPDATE_BITRATE")]
    bitrate: u32,

    /// Pacing of packet data frames
    #[arg(long, value_enum, default_value_t = Ack::Delay, env = "CAN_UPDATE_DATA_ACK")]
    data_ack: Ack,

    /// Log protocol frames
    #[arg(short, long, env = "CAN_UPDATE_VERBOSE")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Only the addressed station
    Current,
    /// Every station on the bus
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Crc {
    Crc16,
    Crc32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Ack {
    /// Fixed delay after every frame
    Delay,
    /// Wait for the station to acknowledge every frame
    Ack,
}

impl From<Mode> for Station {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Current => Station::Current,
            Mode::All => Station::All,
        }
    }
}

impl From<Crc> for CrcKind {
    fn from(crc: Crc) -> Self {
        match crc {
            Crc::Crc16 => CrcKind::Crc16,
            Crc::Crc32 => CrcKind::Crc32,
        }
    }
}

impl From<Ack> for DataAck {
    fn from(ack: Ack) -> Self {
        match ack {
            Ack::Delay => DataAck::FixedDelay,
            Ack::Ack => DataAck::WaitForAck,
        }
    }
}

fn parse_packet_len(s: &str) -> Result<PacketLen, String> {
    let len: u32 = s.parse().map_err(|e| format!("{e}"))?;
    PacketLen::new(len).map_err(|e| e.to_string())
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}

#[cfg(target_os = "linux")]
fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let firmware = Firmware::load(&args.file, args.packet_len)
        .with_context(|| format!("failed to load {}", args.file.display()))?;
    println!(
        "{}: {} bytes, padded to {} ({} packets of {} bytes)",
        args.file.display(),
        firmware.original_len(),
        firmware.len(),
        firmware.packet_count(),
        args.packet_len
    );

    let config = ClientConfig {
        data_ack: args.data_ack.into(),
        ..ClientConfig::default()
    };
    let adapter = bms_dfu_socketcan::Interface::with_prefix(args.prefix.as_str());
    let mut client = Client::new(adapter, config);
    client
        .connect(args.channel, args.bitrate)
        .context("failed to open the CAN adapter")?;

    let result = update(&mut client, &args, &firmware);
    if let Err(e) = client.disconnect() {
        warn!("failed to close the CAN adapter: {e}");
    }
    result
}

#[cfg(not(target_os = "linux"))]
fn main() -> Result<()> {
    let _ = Args::parse();
    anyhow::bail!("can-update needs a Linux SocketCAN interface")
}

fn update<A: Adapter>(client: &mut Client<A>, args: &Args, firmware: &Firmware) -> Result<()> {
    let address = args.address;

    println!("adapter: {}", client.device_info()?);
    let bootloader = client
        .bootloader_version(address)
        .context("failed to read the bootloader version")?;
    println!("bootloader version: {bootloader}");
    let application = client
        .application_version(address)
        .context("failed to read the application version")?;
    println!("application version: {application}");
    let hardware = client
        .hardware_type(address)
        .context("failed to read the hardware type")?;
    println!("hardware type: {hardware}");

    let options = UpdateOptions {
        address,
        station: args.mode.into(),
        crc: args.crc.into(),
    };
    let report = Updater::new(client, options)
        .run(firmware, print_progress)
        .with_context(|| format!("update of station {address} failed"))?;

    println!(
        "update finished: {} packets, {} bytes, {}, {} cells, {:.1?}",
        report.packets, report.bytes, report.crc, report.cells, report.elapsed
    );
    Ok(())
}

fn print_progress(progress: Progress) {
    match progress {
        Progress::Packet { seq, total } => {
            print!("\rpacket {seq}/{total}");
            if seq == total {
                println!();
            }
            let _ = io::stdout().flush();
        }
        Progress::Status(status) => println!("update status: {status}"),
        Progress::State(_) => {}
    }
}
