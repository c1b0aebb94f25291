use daq::DaqDevice;

use crate::CliError;

pub(crate) fn show_info(device: &DaqDevice) -> Result<(), CliError> {
    let profile = device.profile();
    println!("Profile: {}", profile.name);
    println!(
        "  ADC: {} channels, {} bit",
        profile.max_scan_channels, profile.adc_resolution
    );
    println!("  DAC: {} bit", profile.dac_resolution);

    let memory = device.memory();
    match memory.read_cal_date(profile.cal_date_addr) {
        Ok(date) => println!("Calibrated: {date}"),
        Err(e) => println!("Calibrated: unknown ({e})"),
    }

    println!("Calibration coefficients:");
    let coefs = device.load_cal_coefs(profile.cal_coef_count)?;
    for (channel, coef) in coefs.iter().enumerate() {
        println!(
            "  ch{channel}: slope {:>12.6}  offset {:>12.6}",
            coef.slope, coef.offset
        );
    }
    Ok(())
}
