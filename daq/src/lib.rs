//! Hardware abstraction for USB and TCP/IP data-acquisition devices, based on [`nusb`]
//!
//! Provides the device-independent core shared by multi-channel analog and
//! digital I/O boards: the command transport used for configuration
//! round trips, paged access to the on-device non-volatile memory holding
//! calibration constants and user data, and the asynchronous bulk-streaming
//! engine that moves clocked scan data between the device FIFO and a
//! host-resident circular buffer.
//!
//! Per-model details (opcodes, endpoint addresses, memory maps, channel
//! tables) are data, not code: they are collected in a [`DeviceProfile`] and
//! handed to the shared engine.
//!
//! # Example
//!
//! The following example shows how to enumerate attached devices:
//! ```no_run
//! use daq::{DeviceProfile, find_daq_devices};
//!
//! let profile = DeviceProfile::generic_usb();
//! match find_daq_devices(Some(profile.vendor_id), None) {
//!     Ok(devices) => println!("Found {} devices", devices.len()),
//!     Err(e) => println!("Error: {e}"),
//! }
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

use std::time::Duration;

/// Default deadline for one command round trip.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000u64);

mod calibration;
mod device;
mod endian;
mod error;
mod memory;
mod monitor;
mod net;
mod profile;
mod session;
mod stream;
mod stream_in;
mod stream_out;
mod transport;

// Re-exports
pub use calibration::{CalCoef, CalDate, CustomScale, calibrate, uncalibrate};
pub use device::{DaqDevice, ScanRequest, find_daq_devices};
pub use endian::{
    read_f32_le, read_f64_le, read_sample_le, read_u16_le, read_u32_le, read_u64_le,
    write_f32_le, write_f64_le, write_sample_le, write_u16_le, write_u32_le, write_u64_le,
};
pub use error::DaqError;
pub use memory::{DeviceMemory, MemRegion, MemoryLayout, RegionSpec};
pub use monitor::{DeviceStatus, ScanMonitor, StatusPoll};
pub use net::NetTransport;
pub use profile::{DeviceProfile, EndpointSpec, OpcodeTable};
pub use session::{
    ScanDirection, ScanFlag, ScanOption, ScanSession, ScanState, SharedSession, TransferStatus,
};
pub use stream::{MAX_STAGE_SIZE, MAX_XFER_COUNT, StopHandle, stage_size};
pub use stream_in::StreamIn;
pub use stream_out::StreamOut;
pub use transport::{CommandTransport, UsbTransport};
