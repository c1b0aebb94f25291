use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
    time::{Duration, Instant},
};

use daq::{DaqDevice, ScanFlag, ScanOption, ScanRequest, ScanState};

use crate::CliError;

pub(crate) fn stream_scan(
    device: &mut DaqDevice,
    channels: usize,
    rate: f64,
    samples: usize,
    seconds: Option<f64>,
    file: &Option<PathBuf>,
) -> Result<(), CliError> {
    let continuous = seconds.is_some();
    let request = ScanRequest {
        channels,
        samples_per_channel: samples,
        rate_hz: rate,
        options: if continuous {
            ScanOption::CONTINUOUS
        } else {
            ScanOption::BLOCKIO
        },
        flags: ScanFlag::empty(),
        custom_scales: None,
    };
    device.start_input_scan(&request)?;

    if let Some(seconds) = seconds {
        run_continuous(device, seconds)?;
    } else {
        run_finite(device, (channels * samples) as u64)?;
    }

    if let Some(path) = file {
        dump_csv(device, channels, path)?;
    }
    Ok(())
}

fn run_continuous(device: &mut DaqDevice, seconds: f64) -> Result<(), CliError> {
    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    while Instant::now() < deadline {
        let (_, status) = device.input_status()?;
        print!("\r  {:10} samples", status.current_total_count);
        let _ = io::stdout().flush();
        std::thread::sleep(Duration::from_millis(200));
    }
    device.stop_input_scan();
    let (_, status) = device.input_status()?;
    println!("\nStopped after {} samples", status.current_total_count);
    Ok(())
}

fn run_finite(device: &mut DaqDevice, total: u64) -> Result<(), CliError> {
    loop {
        let (state, status) = device.input_status()?;
        let percentage = (100 * status.current_total_count) / total;
        let filled = ((60 * status.current_total_count) / total) as usize;
        print!(
            "\r  Scanning {:3}% [{}]",
            percentage,
            "#".repeat(filled) + &" ".repeat(60 - filled)
        );
        let _ = io::stdout().flush();
        if state == ScanState::Idle {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    println!();
    device.stop_input_scan();
    Ok(())
}

fn dump_csv(device: &DaqDevice, channels: usize, path: &PathBuf) -> Result<(), CliError> {
    let Some(session) = device.input_session() else {
        return Ok(());
    };
    let session = session.lock();
    let mut out = String::new();
    for scan in session.data().chunks(channels) {
        let row: Vec<String> = scan.iter().map(|v| format!("{v:.6}")).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    let scans = session.data().len() / channels;
    drop(session);
    fs::write(path, out)?;
    println!("Wrote {} scans to {}", scans, path.display());
    Ok(())
}
