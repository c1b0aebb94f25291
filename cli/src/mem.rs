use std::{fs, path::PathBuf};

use clap::ValueEnum;
use daq::{DaqDevice, MemRegion};

use crate::CliError;

#[derive(Clone, Copy, ValueEnum)]
pub(crate) enum Region {
    Cal,
    User,
    Settings,
}

impl From<Region> for MemRegion {
    fn from(value: Region) -> Self {
        match value {
            Region::Cal => MemRegion::Calibration,
            Region::User => MemRegion::User,
            Region::Settings => MemRegion::Settings,
        }
    }
}

pub(crate) fn read_mem(
    device: &DaqDevice,
    region: Region,
    address: u32,
    length: u32,
    file: &Option<PathBuf>,
) -> Result<(), CliError> {
    let data = device
        .memory()
        .mem_read(region.into(), address, length as usize)?;
    match file {
        Some(path) => {
            fs::write(path, &data)?;
            println!("Read {} bytes to {}", data.len(), path.display());
        }
        None => hex_dump(address, &data),
    }
    Ok(())
}

pub(crate) fn write_mem(
    device: &DaqDevice,
    region: Region,
    address: u32,
    file: &PathBuf,
) -> Result<(), CliError> {
    let data = fs::read(file)?;
    let written = device.memory().mem_write(region.into(), address, &data)?;
    println!("Wrote {written} bytes @ 0x{address:04x}");
    Ok(())
}

fn hex_dump(base: u32, data: &[u8]) {
    for (i, row) in data.chunks(16).enumerate() {
        print!("0x{:04x}: ", base as usize + i * 16);
        for byte in row {
            print!("{byte:02x} ");
        }
        println!();
    }
}
