use daq::find_daq_devices;

use crate::CliError;

pub(crate) fn list_daq_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<(), CliError> {
    let devices = find_daq_devices(vid, pid)?;
    if devices.is_empty() {
        println!("No DAQ device found");
    } else {
        for device in &devices {
            println!(
                "Bus {} Device {:03}: ID {:04x}:{:04x} {}",
                device.bus_id(),
                device.device_address(),
                device.vendor_id(),
                device.product_id(),
                device.product_string().unwrap_or_default(),
            );
        }
    }
    Ok(())
}
