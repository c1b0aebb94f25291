//! Shared state for one streaming scan.
//!
//! A [`ScanSession`] describes one active or idle scan on one direction of a
//! device: the host ring buffer, the per-channel coefficients, and the
//! running indices. All mutation happens under the single lock inside
//! [`SharedSession`]; the bulk-transfer worker, the scan monitor and the
//! application thread all go through it, so a status snapshot never observes
//! a half-updated index pair.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::calibration::{CalCoef, CustomScale, calibrate, uncalibrate};
use crate::endian;
use crate::error::DaqError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Running,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanDirection {
    Input,
    Output,
}

bitflags::bitflags! {
    /// Pacing and transfer-granularity options for a scan.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ScanOption: u16 {
        /// One sample set per transfer, lowest latency.
        const SINGLEIO   = 1 << 0;
        /// Large block transfers, highest throughput.
        const BLOCKIO    = 1 << 1;
        /// Burst through the device FIFO without a pacer.
        const BURSTIO    = 1 << 2;
        /// Recycle the host buffer and run until stopped.
        const CONTINUOUS = 1 << 3;
        const EXTCLOCK   = 1 << 4;
        const EXTTRIGGER = 1 << 5;
        const RETRIGGER  = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Per-sample processing bypass flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ScanFlag: u16 {
        /// Leave data in counts instead of engineering units.
        const NOSCALEDATA     = 1 << 0;
        /// Skip the factory calibration correction.
        const NOCALIBRATEDATA = 1 << 1;
    }
}

/// Consistent snapshot of a scan's progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferStatus {
    /// Complete sample sets transferred per channel.
    pub current_scan_count: u64,
    /// Samples transferred across all channels.
    pub current_total_count: u64,
    /// Host buffer index of the next sample.
    pub current_index: usize,
}

/// The mutable record of one scan. One instance per direction per device.
#[derive(Debug)]
pub struct ScanSession {
    direction: ScanDirection,
    channel_count: usize,
    sample_size: usize,
    resolution: u32,
    options: ScanOption,
    flags: ScanFlag,
    cal_coefs: Vec<CalCoef>,
    custom_scales: Vec<CustomScale>,
    /// Host ring buffer, `samples_per_channel * channel_count` long. Fixed
    /// allocation for the scan's lifetime.
    data: Vec<f64>,
    buffer_size: usize,
    current_index: usize,
    current_cal_index: usize,
    total_transferred: u64,
    recycle: bool,
    all_transferred: bool,
    state: ScanState,
    /// Bytes the device still owes us (or we owe it) in finite mode.
    bytes_owed: Option<u64>,
    /// Bytes already granted to in-flight transfers.
    reserved: u64,
    full_scale: f64,
    error: Option<DaqError>,
    idle_published: bool,
}

impl ScanSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        direction: ScanDirection,
        channel_count: usize,
        samples_per_channel: usize,
        sample_size: usize,
        resolution: u32,
        options: ScanOption,
        flags: ScanFlag,
        cal_coefs: Vec<CalCoef>,
        custom_scales: Vec<CustomScale>,
        full_scale: f64,
    ) -> Result<ScanSession, DaqError> {
        if channel_count == 0 || samples_per_channel == 0 {
            return Err(DaqError::BadBufferSize);
        }
        if !(1..=4).contains(&sample_size) {
            return Err(DaqError::ConfigNotSupported);
        }
        if cal_coefs.len() != channel_count || custom_scales.len() != channel_count {
            return Err(DaqError::ConfigNotSupported);
        }
        if options.contains(ScanOption::BURSTIO) && options.contains(ScanOption::CONTINUOUS) {
            return Err(DaqError::ConfigNotSupported);
        }

        let buffer_size = samples_per_channel * channel_count;
        // A retriggered finite scan keeps recycling the host ring between
        // trigger bursts; completion comes from the device status word, not
        // from the byte budget.
        let recycle =
            options.contains(ScanOption::CONTINUOUS) || options.contains(ScanOption::RETRIGGER);
        let bytes_owed = (!recycle).then_some((buffer_size * sample_size) as u64);

        Ok(ScanSession {
            direction,
            channel_count,
            sample_size,
            resolution,
            options,
            flags,
            cal_coefs,
            custom_scales,
            data: vec![0.0; buffer_size],
            buffer_size,
            current_index: 0,
            current_cal_index: 0,
            total_transferred: 0,
            recycle,
            all_transferred: false,
            state: ScanState::Idle,
            bytes_owed,
            reserved: 0,
            full_scale,
            error: None,
            idle_published: true,
        })
    }

    pub fn direction(&self) -> ScanDirection {
        self.direction
    }
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }
    pub fn sample_size(&self) -> usize {
        self.sample_size
    }
    pub fn resolution(&self) -> u32 {
        self.resolution
    }
    pub fn options(&self) -> ScanOption {
        self.options
    }
    pub fn flags(&self) -> ScanFlag {
        self.flags
    }
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
    pub fn recycle(&self) -> bool {
        self.recycle
    }
    pub fn all_transferred(&self) -> bool {
        self.all_transferred
    }
    pub fn state(&self) -> ScanState {
        self.state
    }
    pub fn total_transferred(&self) -> u64 {
        self.total_transferred
    }
    pub fn current_cal_index(&self) -> usize {
        self.current_cal_index
    }
    pub(crate) fn bytes_owed(&self) -> Option<u64> {
        self.bytes_owed
    }

    /// The host buffer. For input scans the application drains processed
    /// samples from here; for output scans it refills pending regions.
    pub fn data(&self) -> &[f64] {
        &self.data
    }
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn status(&self) -> (ScanState, TransferStatus) {
        (
            self.state,
            TransferStatus {
                current_scan_count: self.total_transferred / self.channel_count as u64,
                current_total_count: self.total_transferred,
                current_index: self.current_index,
            },
        )
    }

    /// Deliver the scan's terminal error, once.
    pub fn take_error(&mut self) -> Option<DaqError> {
        self.error.take()
    }

    pub(crate) fn set_error_if_empty(&mut self, error: DaqError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// `Idle -> Running`. Called once the transfer pool has armed at least
    /// one transfer.
    pub(crate) fn mark_running(&mut self) {
        self.state = ScanState::Running;
        self.idle_published = false;
    }

    /// `Running -> Idle`, published exactly once per scan. A racing "last
    /// transfer completed" and "monitor detected an error" cannot both claim
    /// the transition.
    pub(crate) fn try_publish_idle(&mut self, error: Option<DaqError>) -> bool {
        if self.idle_published {
            return false;
        }
        self.idle_published = true;
        self.state = ScanState::Idle;
        if self.error.is_none() {
            self.error = error;
        }
        true
    }

    /// Grant bytes to the next in-flight input request, bounded by what the
    /// device still owes in finite mode so the last stage never over-requests.
    pub(crate) fn reserve_in(&mut self, stage: usize) -> usize {
        if self.all_transferred && !self.recycle {
            return 0;
        }
        match self.bytes_owed {
            None => stage,
            Some(owed) => {
                let remaining = owed.saturating_sub(self.reserved) as usize;
                let granted = stage.min(remaining);
                self.reserved += granted as u64;
                granted
            }
        }
    }

    /// Return unused grant from a failed or truncated transfer.
    pub(crate) fn unreserve_in(&mut self, bytes: usize) {
        self.reserved = self.reserved.saturating_sub(bytes as u64);
    }

    /// Decode one completed input transfer into the ring.
    ///
    /// The calibration index advances once per sample and wraps at
    /// `channel_count`, independent of ring wraparound; that is what keeps
    /// each sample paired with its channel's coefficients over arbitrarily
    /// long scans. When the ring fills and `recycle` is off, the remainder of
    /// the batch is discarded and `all_transferred` is set.
    pub(crate) fn feed_in(&mut self, bytes: &[u8]) {
        let mut offset = 0;
        while offset + self.sample_size <= bytes.len() {
            if self.all_transferred && !self.recycle {
                return;
            }
            let raw = endian::read_sample_le(bytes, offset, self.sample_size);
            let value = calibrate(
                raw as f64,
                &self.cal_coefs[self.current_cal_index],
                &self.custom_scales[self.current_cal_index],
                self.flags,
            );
            self.data[self.current_index] = value;
            self.advance(1);
            offset += self.sample_size;
        }
    }

    /// Encode host samples into one outgoing transfer buffer. Returns the
    /// number of bytes produced; zero means the scan has drained
    /// (`all_transferred && !recycle`).
    pub(crate) fn feed_out(&mut self, out: &mut [u8]) -> usize {
        let mut offset = 0;
        while offset + self.sample_size <= out.len() {
            if self.all_transferred && !self.recycle {
                break;
            }
            let raw = uncalibrate(
                self.data[self.current_index],
                &self.cal_coefs[self.current_cal_index],
                &self.custom_scales[self.current_cal_index],
                self.flags,
                self.full_scale,
            );
            endian::write_sample_le(out, offset, self.sample_size, raw);
            self.advance(1);
            offset += self.sample_size;
        }
        offset
    }

    fn advance(&mut self, samples: usize) {
        debug_assert!(self.current_cal_index < self.channel_count);
        for _ in 0..samples {
            self.current_index += 1;
            self.current_cal_index += 1;
            if self.current_cal_index == self.channel_count {
                self.current_cal_index = 0;
            }
            self.total_transferred += 1;
            if self.current_index == self.buffer_size {
                self.current_index = 0;
                if !self.recycle {
                    self.all_transferred = true;
                    return;
                }
            }
        }
    }
}

/// A [`ScanSession`] behind its lock and completion condvar.
///
/// Clones are cheap handles to the same session.
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<SessionCell>,
}

struct SessionCell {
    session: Mutex<ScanSession>,
    done: Condvar,
}

impl SharedSession {
    pub fn new(session: ScanSession) -> Self {
        SharedSession {
            inner: Arc::new(SessionCell {
                session: Mutex::new(session),
                done: Condvar::new(),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ScanSession> {
        self.inner.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> (ScanState, TransferStatus) {
        self.lock().status()
    }

    pub fn take_error(&self) -> Option<DaqError> {
        self.lock().take_error()
    }

    /// Publish `Running -> Idle` (at most once) and wake all waiters.
    /// Returns whether this caller claimed the transition.
    pub(crate) fn publish_idle(&self, error: Option<DaqError>) -> bool {
        let claimed = self.lock().try_publish_idle(error);
        self.inner.done.notify_all();
        claimed
    }

    pub(crate) fn notify_all(&self) {
        self.inner.done.notify_all();
    }

    /// Block until the session goes `Idle`. Returns `false` on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, result) = self
            .inner
            .done
            .wait_timeout_while(guard, timeout, |s| s.state == ScanState::Running)
            .unwrap_or_else(PoisonError::into_inner);
        drop(guard);
        !result.timed_out()
    }

    /// Timed wait used by the scan monitor; wakes early on any session
    /// activity. Returns `true` when the wait timed out with the scan still
    /// running (the data path has gone silent).
    pub(crate) fn wait_silence(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        if guard.state != ScanState::Running {
            return false;
        }
        let (guard, result) = self
            .inner
            .done
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        let still_running = guard.state == ScanState::Running;
        drop(guard);
        result.timed_out() && still_running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn input_session(
        channels: usize,
        samples_per_channel: usize,
        options: ScanOption,
    ) -> ScanSession {
        ScanSession::new(
            ScanDirection::Input,
            channels,
            samples_per_channel,
            2,
            16,
            options,
            ScanFlag::empty(),
            vec![CalCoef::IDENTITY; channels],
            vec![CustomScale::default(); channels],
            65535.0,
        )
        .unwrap()
    }

    fn raw_stream(samples: &[u16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_cal_index_cycles_per_channel_count() {
        let mut s = input_session(4, 100, ScanOption::CONTINUOUS);
        // k * channel_count samples always land back on channel 0
        for k in 1..=5u16 {
            s.feed_in(&raw_stream(&[0u16; 4]));
            assert_eq!(s.current_cal_index(), 0, "after {k} full cycles");
        }
        s.feed_in(&raw_stream(&[0u16; 3]));
        assert_eq!(s.current_cal_index(), 3);
    }

    #[test]
    fn test_interleaved_channels_use_their_own_coefs() {
        let coefs: Vec<CalCoef> = (0..4)
            .map(|c| CalCoef {
                slope: 1.0,
                offset: 1000.0 * c as f64,
            })
            .collect();
        let mut s = ScanSession::new(
            ScanDirection::Input,
            4,
            1000,
            2,
            16,
            ScanOption::CONTINUOUS,
            ScanFlag::empty(),
            coefs,
            vec![CustomScale::default(); 4],
            65535.0,
        )
        .unwrap();

        let samples: Vec<u16> = (0..4000u32).map(|i| (i % 4) as u16).collect();
        s.feed_in(&raw_stream(&samples));

        assert_eq!(s.total_transferred(), 4000);
        for (i, value) in s.data().iter().enumerate() {
            let channel = i % 4;
            assert_relative_eq!(*value, channel as f64 + 1000.0 * channel as f64);
        }
    }

    #[test]
    fn test_wrap_without_recycle_stops_at_buffer_size() {
        let mut s = input_session(2, 8, ScanOption::empty());
        // 16-sample buffer, 24 samples delivered: the overflow is discarded
        let samples: Vec<u16> = (0..24).collect();
        s.feed_in(&raw_stream(&samples));
        assert!(s.all_transferred());
        assert_eq!(s.total_transferred(), 16);
        assert_eq!(s.data()[15], 15.0);
        // a later batch is ignored outright
        s.feed_in(&raw_stream(&[99u16; 4]));
        assert_eq!(s.total_transferred(), 16);
    }

    #[test]
    fn test_finite_scan_completes_on_exact_byte_count() {
        // 16 samples x 2 bytes fills the buffer exactly; completion comes
        // from the byte count alone, with no short transfer needed
        let mut s = input_session(2, 8, ScanOption::empty());
        let owed = s.reserve_in(usize::MAX);
        assert_eq!(owed, 32);
        let samples: Vec<u16> = (0..16).collect();
        s.feed_in(&raw_stream(&samples));
        assert!(s.all_transferred());
        assert_eq!(s.total_transferred(), 16);
        assert_eq!(s.reserve_in(512), 0);
    }

    #[test]
    fn test_wrap_with_recycle_continues() {
        let mut s = input_session(2, 8, ScanOption::CONTINUOUS);
        let samples: Vec<u16> = (0..40).collect();
        s.feed_in(&raw_stream(&samples));
        assert!(!s.all_transferred());
        assert_eq!(s.total_transferred(), 40);
        // 40 % 16 == 8, ring overwritten with the newest data
        let (_, status) = s.status();
        assert_eq!(status.current_index, 8);
        assert_eq!(s.data()[0], 32.0);
        assert_eq!(s.data()[7], 39.0);
        assert_eq!(s.data()[8], 24.0);
    }

    #[test]
    fn test_feed_out_drains_and_clamps() {
        let mut s = ScanSession::new(
            ScanDirection::Output,
            1,
            4,
            2,
            12,
            ScanOption::empty(),
            ScanFlag::empty(),
            vec![CalCoef::IDENTITY],
            vec![CustomScale::default()],
            4095.0,
        )
        .unwrap();
        s.data_mut().copy_from_slice(&[0.0, 5000.0, 4095.0, 17.0]);

        let mut out = [0u8; 16];
        let produced = s.feed_out(&mut out);
        assert_eq!(produced, 8);
        assert!(s.all_transferred());
        let codes: Vec<u16> = out[..8]
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(codes, vec![0, 4095, 4095, 17]);

        // drained: nothing more is produced
        assert_eq!(s.feed_out(&mut out), 0);
    }

    #[test]
    fn test_reserve_in_caps_finite_scans() {
        let mut s = input_session(2, 8, ScanOption::empty()); // 32 bytes owed
        assert_eq!(s.reserve_in(24), 24);
        assert_eq!(s.reserve_in(24), 8);
        assert_eq!(s.reserve_in(24), 0);
        s.unreserve_in(8);
        assert_eq!(s.reserve_in(24), 8);
    }

    #[test]
    fn test_reserve_in_unbounded_when_recycling() {
        let mut s = input_session(2, 8, ScanOption::CONTINUOUS);
        for _ in 0..100 {
            assert_eq!(s.reserve_in(512), 512);
        }
    }

    #[test]
    fn test_idle_published_exactly_once() {
        let mut s = input_session(1, 4, ScanOption::CONTINUOUS);
        s.mark_running();
        assert_eq!(s.state(), ScanState::Running);
        assert!(s.try_publish_idle(Some(DaqError::Overrun)));
        assert!(!s.try_publish_idle(None));
        assert!(!s.try_publish_idle(Some(DaqError::Underrun)));
        assert_eq!(s.state(), ScanState::Idle);
        // terminal error delivered once, then gone
        assert!(matches!(s.take_error(), Some(DaqError::Overrun)));
        assert!(s.take_error().is_none());
    }

    #[test]
    fn test_concurrent_publish_has_one_winner() {
        for _ in 0..50 {
            let shared = SharedSession::new(input_session(1, 4, ScanOption::CONTINUOUS));
            shared.lock().mark_running();
            let racers: Vec<_> = (0..2)
                .map(|_| {
                    let shared = shared.clone();
                    std::thread::spawn(move || shared.publish_idle(Some(DaqError::Overrun)))
                })
                .collect();
            let wins: usize = racers
                .into_iter()
                .map(|t| t.join().unwrap() as usize)
                .sum();
            assert_eq!(wins, 1);
        }
    }

    #[test]
    fn test_shared_session_wait_idle() {
        let shared = SharedSession::new(input_session(1, 4, ScanOption::CONTINUOUS));
        shared.lock().mark_running();
        let waiter = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.wait_idle(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(shared.publish_idle(None));
        assert!(waiter.join().unwrap());
        assert_eq!(shared.status().0, ScanState::Idle);
    }

    #[test]
    fn test_burstio_with_continuous_rejected() {
        let err = ScanSession::new(
            ScanDirection::Input,
            1,
            4,
            2,
            16,
            ScanOption::BURSTIO | ScanOption::CONTINUOUS,
            ScanFlag::empty(),
            vec![CalCoef::IDENTITY],
            vec![CustomScale::default()],
            65535.0,
        )
        .unwrap_err();
        assert!(matches!(err, DaqError::ConfigNotSupported));
    }
}
