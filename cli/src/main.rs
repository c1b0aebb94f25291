use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use parse_size::parse_size;

use daq::{DaqDevice, DeviceProfile, find_daq_devices};
use error::CliError;
use info::*;
use list::*;
use mem::*;
use stream::*;

mod error;
mod info;
mod list;
mod mem;
mod stream;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// list DAQ devices
    List {
        /// vendor ID (ex: "09db")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
        /// product ID (ex: "00ea")
        #[clap(short, long, value_parser=hex_u16)]
        product: Option<u16>,
    },
    /// show calibration info
    Info {
        /// vendor ID (ex: "09db")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
        /// product ID (ex: "00ea")
        #[clap(short, long, value_parser=hex_u16)]
        product: Option<u16>,
    },
    /// read device memory
    ReadMem {
        /// memory region
        #[clap(value_enum)]
        region: Region,
        /// start address (ex: 0x3000)
        #[clap(value_parser=maybe_hex::<u32>)]
        address: u32,
        /// length (ex: 64, 1K)
        #[clap(value_parser=parse_length)]
        length: u32,
        /// write raw bytes to file instead of hex dump
        #[clap(short, long)]
        file: Option<PathBuf>,
        /// vendor ID (ex: "09db")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
        /// product ID (ex: "00ea")
        #[clap(short, long, value_parser=hex_u16)]
        product: Option<u16>,
    },
    /// write device memory
    WriteMem {
        /// memory region
        #[clap(value_enum)]
        region: Region,
        /// start address (ex: 0x3400)
        #[clap(value_parser=maybe_hex::<u32>)]
        address: u32,
        /// file with raw bytes to write
        file: PathBuf,
        /// vendor ID (ex: "09db")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
        /// product ID (ex: "00ea")
        #[clap(short, long, value_parser=hex_u16)]
        product: Option<u16>,
    },
    /// run an input scan
    Stream {
        /// channels in the scan
        #[clap(short, long, default_value_t = 1)]
        channels: usize,
        /// per-channel sample rate in Hz
        #[clap(short, long, default_value_t = 1000.0)]
        rate: f64,
        /// samples per channel (host buffer length)
        #[clap(short, long, default_value_t = 10000)]
        samples: usize,
        /// run continuously for this many seconds instead of one buffer
        #[clap(long)]
        seconds: Option<f64>,
        /// write scans to a CSV file
        #[clap(short, long)]
        file: Option<PathBuf>,
        /// vendor ID (ex: "09db")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
        /// product ID (ex: "00ea")
        #[clap(short, long, value_parser=hex_u16)]
        product: Option<u16>,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List {
            vendor: None,
            product: None,
        }
    }
}

fn hex_u16(s: &str) -> Result<u16, String> {
    <u16>::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}

fn parse_length(s: &str) -> Result<u32, String> {
    let len = parse_size(s).map_err(|e| format!("{e}"))?;
    len.try_into().map_err(|e| format!("{e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::init();

    if let Err(err) = match &cli.command.unwrap_or_default() {
        Commands::List { vendor, product } => list_daq_devices(*vendor, *product),
        Commands::Info { vendor, product } => {
            get_daq_device(vendor, product).and_then(|dev| show_info(&dev))
        }
        Commands::ReadMem {
            region,
            address,
            length,
            file,
            vendor,
            product,
        } => get_daq_device(vendor, product)
            .and_then(|dev| read_mem(&dev, *region, *address, *length, file)),
        Commands::WriteMem {
            region,
            address,
            file,
            vendor,
            product,
        } => get_daq_device(vendor, product)
            .and_then(|dev| write_mem(&dev, *region, *address, file)),
        Commands::Stream {
            channels,
            rate,
            samples,
            seconds,
            file,
            vendor,
            product,
        } => get_daq_device(vendor, product).and_then(|mut dev| {
            stream_scan(&mut dev, *channels, *rate, *samples, *seconds, file)
        }),
    } {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn get_daq_device(vid: &Option<u16>, pid: &Option<u16>) -> Result<DaqDevice, CliError> {
    let profile = DeviceProfile::generic_usb();
    let vid = vid.unwrap_or(profile.vendor_id);
    let devices = find_daq_devices(Some(vid), *pid)?;
    if devices.is_empty() {
        return Err(CliError::NoDevice);
    }
    if devices.len() > 1 {
        return Err(CliError::ManyDevices);
    }
    Ok(DaqDevice::open(&devices[0], profile)?)
}
