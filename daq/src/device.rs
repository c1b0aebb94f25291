//! Device handle and scan entry points.
//!
//! [`DaqDevice`] ties the pieces together for one attached board: the claimed
//! USB interface, the command transport, paged memory, and one streaming
//! engine plus scan monitor per direction. Model-specific board classes
//! build on this by supplying their own [`DeviceProfile`].

use std::sync::Arc;
use std::time::Duration;

use nusb::{
    self, MaybeFuture,
    transfer::{Bulk, In, Out},
};

use crate::DEFAULT_TIMEOUT;
use crate::calibration::{CalCoef, CustomScale};
use crate::endian;
use crate::error::DaqError;
use crate::memory::DeviceMemory;
use crate::monitor::{DeviceStatus, ScanMonitor};
use crate::profile::DeviceProfile;
use crate::session::{
    ScanDirection, ScanFlag, ScanOption, ScanSession, ScanState, SharedSession, TransferStatus,
};
use crate::stream_in::StreamIn;
use crate::stream_out::StreamOut;
use crate::transport::{CommandTransport, UsbTransport};

/// Everything the caller specifies for one scan.
#[derive(Clone, Debug)]
pub struct ScanRequest {
    pub channels: usize,
    pub samples_per_channel: usize,
    /// Per-channel sample rate in hertz.
    pub rate_hz: f64,
    pub options: ScanOption,
    pub flags: ScanFlag,
    /// Per-channel user scales; identity when `None`.
    pub custom_scales: Option<Vec<CustomScale>>,
}

struct InputUnit {
    engine: StreamIn,
    monitor: ScanMonitor,
}

struct OutputUnit {
    engine: StreamOut,
    monitor: ScanMonitor,
}

/// One open DAQ board.
pub struct DaqDevice {
    transport: Arc<UsbTransport>,
    profile: DeviceProfile,
    input: Option<InputUnit>,
    output: Option<OutputUnit>,
}

impl DaqDevice {
    /// Open the device and claim its control/streaming interface.
    pub fn open(info: &nusb::DeviceInfo, profile: DeviceProfile) -> Result<Self, DaqError> {
        let device = info.open().wait()?;
        let interface = device.claim_interface(0).wait()?;
        let transport = Arc::new(UsbTransport::new(interface, profile.max_command_len));
        Ok(DaqDevice {
            transport,
            profile,
            input: None,
            output: None,
        })
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn transport(&self) -> Arc<dyn CommandTransport> {
        self.transport.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Paged access to the device's non-volatile memory.
    pub fn memory(&self) -> DeviceMemory {
        DeviceMemory::new(self.transport.clone(), self.profile.memory.clone())
    }

    /// Read factory calibration coefficients for the first `channels`
    /// channels.
    pub fn load_cal_coefs(&self, channels: usize) -> Result<Vec<CalCoef>, DaqError> {
        if channels > self.profile.cal_coef_count {
            return Err(DaqError::ConfigNotSupported);
        }
        self.memory()
            .read_cal_coefs(self.profile.cal_coef_addr, channels)
    }

    /// Query the device status word for one scan direction.
    pub fn read_status(&self, direction: ScanDirection) -> Result<DeviceStatus, DaqError> {
        read_status(&self.transport, &self.profile, direction)
    }

    /// Configure and start an input scan. The scan runs in the background;
    /// progress and the host ring are reachable through
    /// [`DaqDevice::input_session`].
    pub fn start_input_scan(&mut self, request: &ScanRequest) -> Result<(), DaqError> {
        if let Some(unit) = &self.input {
            if unit.engine.session().status().0 == ScanState::Running {
                return Err(DaqError::AlreadyActive);
            }
        }
        self.input = None;

        let session = self.build_session(request, ScanDirection::Input)?;
        let byte_rate = self.byte_rate(request)?;

        let endpoint = self
            .transport
            .interface()
            .endpoint::<Bulk, In>(self.profile.endpoints.scan_in)
            .map_err(|_| DaqError::ConfigNotSupported)?;

        self.start_scan_command(request, ScanDirection::Input)?;

        let shared = SharedSession::new(session);
        let mut engine = StreamIn::new(shared.clone());
        if let Err(error) = engine.arm(endpoint, byte_rate) {
            self.stop_scan_command(ScanDirection::Input);
            return Err(error);
        }

        let monitor = self.spawn_monitor(
            shared,
            engine.stop_handle(),
            ScanDirection::Input,
            byte_rate,
        )?;
        self.input = Some(InputUnit { engine, monitor });
        Ok(())
    }

    /// Configure and start an output scan. `data` pre-fills the host ring
    /// and must be exactly `channels * samples_per_channel` values.
    pub fn start_output_scan(
        &mut self,
        request: &ScanRequest,
        data: &[f64],
    ) -> Result<(), DaqError> {
        if let Some(unit) = &self.output {
            if unit.engine.session().status().0 == ScanState::Running {
                return Err(DaqError::AlreadyActive);
            }
        }
        self.output = None;

        let mut session = self.build_session(request, ScanDirection::Output)?;
        if data.len() != session.buffer_size() {
            return Err(DaqError::BadBufferSize);
        }
        session.data_mut().copy_from_slice(data);
        let byte_rate = self.byte_rate(request)?;

        let endpoint = self
            .transport
            .interface()
            .endpoint::<Bulk, Out>(self.profile.endpoints.scan_out)
            .map_err(|_| DaqError::ConfigNotSupported)?;

        self.start_scan_command(request, ScanDirection::Output)?;

        let shared = SharedSession::new(session);
        let mut engine = StreamOut::new(shared.clone());
        if let Err(error) = engine.arm(endpoint, byte_rate) {
            self.stop_scan_command(ScanDirection::Output);
            return Err(error);
        }

        let monitor = self.spawn_monitor(
            shared,
            engine.stop_handle(),
            ScanDirection::Output,
            byte_rate,
        )?;
        self.output = Some(OutputUnit { engine, monitor });
        Ok(())
    }

    /// Progress snapshot for the input direction. The scan's terminal error
    /// is delivered here exactly once.
    pub fn input_status(&self) -> Result<(ScanState, TransferStatus), DaqError> {
        Self::unit_status(self.input.as_ref().map(|u| u.engine.session()))
    }

    pub fn output_status(&self) -> Result<(ScanState, TransferStatus), DaqError> {
        Self::unit_status(self.output.as_ref().map(|u| u.engine.session()))
    }

    fn unit_status(
        session: Option<&SharedSession>,
    ) -> Result<(ScanState, TransferStatus), DaqError> {
        let Some(session) = session else {
            return Ok((ScanState::Idle, TransferStatus::default()));
        };
        if let Some(error) = session.take_error() {
            return Err(error);
        }
        Ok(session.status())
    }

    /// The live session for the input direction, if a scan was started.
    pub fn input_session(&self) -> Option<SharedSession> {
        self.input.as_ref().map(|u| u.engine.session().clone())
    }

    pub fn output_session(&self) -> Option<SharedSession> {
        self.output.as_ref().map(|u| u.engine.session().clone())
    }

    /// Block until the input scan leaves `Running`.
    pub fn wait_input_done(&self, timeout: Duration) -> bool {
        match &self.input {
            Some(unit) => unit.engine.wait_until_done(timeout),
            None => true,
        }
    }

    pub fn wait_output_done(&self, timeout: Duration) -> bool {
        match &self.output {
            Some(unit) => unit.engine.wait_until_done(timeout),
            None => true,
        }
    }

    /// Stop the input scan: pacer halt on the device, then pool drain and
    /// monitor join. Stop-command failures are folded into the scan's
    /// terminal status; stopping an already-broken scan returns cleanly.
    pub fn stop_input_scan(&mut self) {
        if self.input.is_none() {
            return;
        }
        self.stop_scan_command(ScanDirection::Input);
        if let Some(unit) = self.input.as_mut() {
            unit.engine.terminate();
            unit.monitor.shutdown();
        }
    }

    pub fn stop_output_scan(&mut self) {
        if self.output.is_none() {
            return;
        }
        self.stop_scan_command(ScanDirection::Output);
        if let Some(unit) = self.output.as_mut() {
            unit.engine.terminate();
            unit.monitor.shutdown();
        }
    }

    fn build_session(
        &self,
        request: &ScanRequest,
        direction: ScanDirection,
    ) -> Result<ScanSession, DaqError> {
        if request.channels == 0 || request.channels > self.profile.max_scan_channels {
            return Err(DaqError::ConfigNotSupported);
        }

        let cal_coefs = if request.flags.contains(ScanFlag::NOCALIBRATEDATA) {
            vec![CalCoef::IDENTITY; request.channels]
        } else {
            self.load_cal_coefs(request.channels)?
        };
        let custom_scales = match &request.custom_scales {
            Some(scales) => scales.clone(),
            None => vec![CustomScale::default(); request.channels],
        };

        let resolution = match direction {
            ScanDirection::Input => self.profile.adc_resolution,
            ScanDirection::Output => self.profile.dac_resolution,
        };
        ScanSession::new(
            direction,
            request.channels,
            request.samples_per_channel,
            self.profile.sample_size,
            resolution,
            request.options,
            request.flags,
            cal_coefs,
            custom_scales,
            self.profile.full_scale_out(),
        )
    }

    fn byte_rate(&self, request: &ScanRequest) -> Result<f64, DaqError> {
        let byte_rate =
            request.rate_hz * request.channels as f64 * self.profile.sample_size as f64;
        if !(byte_rate > 0.0) || byte_rate > self.profile.max_byte_rate {
            return Err(DaqError::ConfigNotSupported);
        }
        Ok(byte_rate)
    }

    /// Write the scan configuration and start the pacer:
    /// `{divisor: u32, samples_per_channel: u32, options: u16, channels: u8}`,
    /// all little endian. A zero sample count means continuous.
    fn start_scan_command(
        &self,
        request: &ScanRequest,
        direction: ScanDirection,
    ) -> Result<(), DaqError> {
        let divisor = self.profile.pacer_divisor(request.rate_hz);
        let finite = !request.options.contains(ScanOption::CONTINUOUS);
        let count = if finite { request.samples_per_channel as u32 } else { 0 };

        let mut payload = [0u8; 11];
        endian::write_u32_le(&mut payload, 0, divisor);
        endian::write_u32_le(&mut payload, 4, count);
        endian::write_u16_le(&mut payload, 8, request.options.bits());
        payload[10] = request.channels as u8;

        self.transport.send(
            self.profile.opcodes.fifo_clear,
            0,
            direction_index(direction),
            &[],
            DEFAULT_TIMEOUT,
        )?;
        self.transport.send(
            self.profile.opcodes.scan_start,
            0,
            direction_index(direction),
            &payload,
            DEFAULT_TIMEOUT,
        )
    }

    fn stop_scan_command(&self, direction: ScanDirection) {
        let result = self.transport.send(
            self.profile.opcodes.scan_stop,
            0,
            direction_index(direction),
            &[],
            DEFAULT_TIMEOUT,
        );
        if let Err(error) = result {
            log::debug!("scan stop command failed: {error}");
            let session = match direction {
                ScanDirection::Input => self.input_session(),
                ScanDirection::Output => self.output_session(),
            };
            if let Some(session) = session {
                session.lock().set_error_if_empty(error);
            }
        }
    }

    fn spawn_monitor(
        &self,
        session: SharedSession,
        stop: crate::stream::StopHandle,
        direction: ScanDirection,
        byte_rate: f64,
    ) -> Result<ScanMonitor, DaqError> {
        let transport = self.transport.clone();
        let profile = self.profile.clone();
        let poll = Box::new(move || read_status(&transport, &profile, direction));

        // one stage of data takes stage/byte_rate seconds; give the device a
        // generous first window for triggers and FIFO priming, then follow
        // the data cadence
        let stage_secs = crate::stream::MAX_STAGE_SIZE as f64 / byte_rate;
        let wait = Duration::from_secs_f64(stage_secs.clamp(0.1, 1.0));
        let first_wait = 4 * wait.max(Duration::from_millis(250));
        ScanMonitor::spawn(session, poll, stop, first_wait, wait)
    }
}

impl Drop for DaqDevice {
    fn drop(&mut self) {
        self.stop_input_scan();
        self.stop_output_scan();
    }
}

fn direction_index(direction: ScanDirection) -> u16 {
    match direction {
        ScanDirection::Input => 0,
        ScanDirection::Output => 1,
    }
}

fn read_status(
    transport: &Arc<UsbTransport>,
    profile: &DeviceProfile,
    direction: ScanDirection,
) -> Result<DeviceStatus, DaqError> {
    let mut word = [0u8; 2];
    transport.query_exact(
        profile.opcodes.status,
        0,
        direction_index(direction),
        &mut word,
        DEFAULT_TIMEOUT,
    )?;
    Ok(DeviceStatus::from_word(endian::read_u16_le(&word, 0)))
}

fn is_daq_device(dev: &nusb::DeviceInfo, vid: Option<u16>, pid: Option<u16>) -> bool {
    vid.is_none_or(|id| dev.vendor_id() == id) && pid.is_none_or(|id| dev.product_id() == id)
}

/// Enumerate attached devices matching the optional vendor/product filter.
pub fn find_daq_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<nusb::DeviceInfo>, DaqError> {
    Ok(nusb::list_devices()
        .wait()?
        .filter(|dev| is_daq_device(dev, vid, pid))
        .collect())
}
