//! Background scan-state monitor.
//!
//! While a scan runs, the data path itself reports nothing about device-side
//! trouble: an input FIFO that overran or an output FIFO that starved shows
//! up only in the device's status word. The monitor is a scan-local thread
//! that waits for data-path activity and, when the path goes silent, polls
//! the status channel. Terminal conditions stop the transfer engine and are
//! stored as the scan's terminal error.
//!
//! The status round trip happens with no session lock held; the command
//! transport may block on I/O for its full timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::DaqError;
use crate::session::{ScanState, SharedSession};
use crate::stream::StopHandle;

/// Decoded device status word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub running: bool,
    pub overrun: bool,
    pub underrun: bool,
    pub done: bool,
}

impl DeviceStatus {
    const BIT_RUNNING: u16 = 1 << 0;
    const BIT_OVERRUN: u16 = 1 << 1;
    const BIT_UNDERRUN: u16 = 1 << 2;
    const BIT_DONE: u16 = 1 << 3;

    pub fn from_word(word: u16) -> Self {
        DeviceStatus {
            running: word & Self::BIT_RUNNING != 0,
            overrun: word & Self::BIT_OVERRUN != 0,
            underrun: word & Self::BIT_UNDERRUN != 0,
            done: word & Self::BIT_DONE != 0,
        }
    }
}

/// Status round trip supplied by the device facade.
pub type StatusPoll = Box<dyn Fn() -> Result<DeviceStatus, DaqError> + Send>;

/// One monitor thread per active scan.
pub struct ScanMonitor {
    session: SharedSession,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ScanMonitor {
    /// Start monitoring. `first_wait` covers scan startup (trigger arming,
    /// FIFO priming); `wait` matches the expected data cadence afterwards.
    pub fn spawn(
        session: SharedSession,
        poll: StatusPoll,
        stop: StopHandle,
        first_wait: Duration,
        wait: Duration,
    ) -> Result<ScanMonitor, DaqError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread = {
            let session = session.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("daq-scan-monitor".into())
                .spawn(move || monitor_loop(session, poll, stop, shutdown, first_wait, wait))
                .map_err(DaqError::Io)?
        };
        Ok(ScanMonitor {
            session,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Stop and join the monitor thread. The scan buffer must not be
    /// repurposed before this returns.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.session.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ScanMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn monitor_loop(
    session: SharedSession,
    poll: StatusPoll,
    stop: StopHandle,
    shutdown: Arc<AtomicBool>,
    first_wait: Duration,
    wait: Duration,
) {
    let mut timeout = first_wait;
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let silent = session.wait_silence(timeout);
        timeout = wait;
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        if session.status().0 != ScanState::Running {
            break;
        }
        if !silent {
            continue;
        }

        // the data path is quiet; ask the device why (no lock held here)
        let terminal = match poll() {
            Ok(status) if status.overrun => Some(Some(DaqError::Overrun)),
            Ok(status) if status.underrun => Some(Some(DaqError::Underrun)),
            Ok(status) if status.done => Some(None),
            Ok(_) => None,
            Err(error) => Some(Some(error)),
        };

        if let Some(error) = terminal {
            if let Some(error) = error {
                log::debug!("scan terminal condition: {error}");
                session.lock().set_error_if_empty(error);
            }
            stop.request_stop();
            break;
        }
    }

    // every exit path publishes Idle at most once and wakes waiters; a
    // no-op when the engine's drain already claimed the transition
    session.publish_idle(None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalCoef, CustomScale};
    use crate::session::{ScanDirection, ScanFlag, ScanOption, ScanSession};
    use std::sync::atomic::AtomicUsize;

    fn running_session() -> SharedSession {
        let mut session = ScanSession::new(
            ScanDirection::Input,
            1,
            16,
            2,
            16,
            ScanOption::CONTINUOUS,
            ScanFlag::empty(),
            vec![CalCoef::IDENTITY],
            vec![CustomScale::default()],
            65535.0,
        )
        .unwrap();
        session.mark_running();
        SharedSession::new(session)
    }

    fn stop_handle(session: &SharedSession) -> (Arc<AtomicBool>, StopHandle) {
        let halt = Arc::new(AtomicBool::new(false));
        (
            halt.clone(),
            StopHandle {
                halt,
                session: session.clone(),
            },
        )
    }

    #[test]
    fn test_overrun_terminates_scan() {
        let session = running_session();
        let (halt, stop) = stop_handle(&session);
        let polls = Arc::new(AtomicUsize::new(0));
        let poll: StatusPoll = {
            let polls = polls.clone();
            Box::new(move || {
                let n = polls.fetch_add(1, Ordering::SeqCst);
                Ok(DeviceStatus::from_word(if n < 2 { 0x1 } else { 0x3 }))
            })
        };

        let mut monitor = ScanMonitor::spawn(
            session.clone(),
            poll,
            stop,
            Duration::from_millis(5),
            Duration::from_millis(5),
        )
        .unwrap();
        assert!(session.wait_idle(Duration::from_secs(5)));
        monitor.shutdown();

        assert!(halt.load(Ordering::Acquire));
        assert!(polls.load(Ordering::SeqCst) >= 3);
        assert!(matches!(session.take_error(), Some(DaqError::Overrun)));
    }

    #[test]
    fn test_natural_completion_has_no_error() {
        let session = running_session();
        let (_, stop) = stop_handle(&session);
        let poll: StatusPoll = Box::new(|| Ok(DeviceStatus::from_word(0x8)));

        let mut monitor = ScanMonitor::spawn(
            session.clone(),
            poll,
            stop,
            Duration::from_millis(5),
            Duration::from_millis(5),
        )
        .unwrap();
        assert!(session.wait_idle(Duration::from_secs(5)));
        monitor.shutdown();
        assert_eq!(session.status().0, ScanState::Idle);
        assert!(session.take_error().is_none());
    }

    #[test]
    fn test_monitor_exits_when_engine_publishes() {
        let session = running_session();
        let (_, stop) = stop_handle(&session);
        let poll: StatusPoll = Box::new(|| Ok(DeviceStatus::from_word(0x1)));

        let mut monitor = ScanMonitor::spawn(
            session.clone(),
            poll,
            stop,
            Duration::from_millis(5),
            Duration::from_millis(5),
        )
        .unwrap();
        // the engine side finishes the scan
        assert!(session.publish_idle(None));
        // monitor notices and winds down without being told
        monitor.shutdown();
        assert_eq!(session.status().0, ScanState::Idle);
    }

    #[test]
    fn test_status_poll_error_becomes_terminal() {
        let session = running_session();
        let (_, stop) = stop_handle(&session);
        let poll: StatusPoll = Box::new(|| Err(DaqError::NotConnected));

        let mut monitor = ScanMonitor::spawn(
            session.clone(),
            poll,
            stop,
            Duration::from_millis(5),
            Duration::from_millis(5),
        )
        .unwrap();
        assert!(session.wait_idle(Duration::from_secs(5)));
        monitor.shutdown();
        assert!(matches!(session.take_error(), Some(DaqError::NotConnected)));
    }

    #[test]
    fn test_status_word_decoding() {
        let status = DeviceStatus::from_word(0b1011);
        assert!(status.running && status.overrun && status.done);
        assert!(!status.underrun);
        assert_eq!(DeviceStatus::from_word(0), DeviceStatus::default());
    }
}
