//! Bulk input streaming engine.
//!
//! Owns a fixed pool of in-flight read transfers against one streaming
//! endpoint and drives completed bytes into the session ring. Completions are
//! consumed on a dedicated worker thread; the application thread only ever
//! touches the session through its lock.
//!
//! Lifecycle: `Idle -> Arming -> Running -> Draining -> Idle`. The only way
//! back to `Idle` is the drain path at the bottom of the worker loop, which
//! publishes the session transition exactly once regardless of who requested
//! the stop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;

use nusb::Endpoint;
use nusb::transfer::{Bulk, In, TransferError};

use crate::error::DaqError;
use crate::session::SharedSession;
use crate::stream::{
    COMPLETION_WAIT, DRAIN_TIMEOUT, MAX_XFER_COUNT, PoolState, StopHandle, stage_size,
};

pub struct StreamIn {
    session: SharedSession,
    halt: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    worker: Option<JoinHandle<()>>,
}

impl StreamIn {
    pub fn new(session: SharedSession) -> Self {
        StreamIn {
            session,
            halt: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(PoolState::Idle as u8)),
            worker: None,
        }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Stop trigger usable without borrowing the engine.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            halt: self.halt.clone(),
            session: self.session.clone(),
        }
    }

    /// Submit the initial transfer pool and start the completion worker.
    ///
    /// The session moves to `Running` only if at least one transfer was
    /// armed. `byte_rate` is the scan's aggregate data rate, used to size
    /// each stage.
    pub fn arm(&mut self, mut endpoint: Endpoint<Bulk, In>, byte_rate: f64) -> Result<(), DaqError> {
        if self.worker.is_some()
            || PoolState::from_u8(self.state.load(Ordering::Acquire)) != PoolState::Idle
        {
            return Err(DaqError::AlreadyActive);
        }
        self.halt.store(false, Ordering::Release);
        self.state.store(PoolState::Arming as u8, Ordering::Release);

        let packet = endpoint.max_packet_size();
        let stage = {
            let session = self.session.lock();
            stage_size(byte_rate, packet, session.bytes_owed())
        };
        log::debug!("input scan: stage {stage} bytes, packet {packet} bytes");

        let mut requested = VecDeque::with_capacity(MAX_XFER_COUNT);
        for _ in 0..MAX_XFER_COUNT {
            let wanted = self.session.lock().reserve_in(stage);
            if wanted == 0 {
                break;
            }
            let buffer = endpoint.allocate(wanted);
            endpoint.submit(buffer);
            requested.push_back(wanted);
        }

        if requested.is_empty() {
            self.state.store(PoolState::Idle as u8, Ordering::Release);
            return Err(DaqError::ConfigNotSupported);
        }

        self.session.lock().mark_running();
        self.state.store(PoolState::Running as u8, Ordering::Release);

        let session = self.session.clone();
        let halt = self.halt.clone();
        let state = self.state.clone();
        let worker = std::thread::Builder::new()
            .name("daq-stream-in".into())
            .spawn(move || worker_loop(endpoint, session, halt, state, requested, stage));
        match worker {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(error) => {
                // the endpoint died with the closure; its transfers cancel
                self.state.store(PoolState::Idle as u8, Ordering::Release);
                self.session.publish_idle(None);
                Err(DaqError::Io(error))
            }
        }
    }

    /// Stop the scan: disable resubmission, cancel outstanding transfers and
    /// wait (bounded) for the pool to drain. Safe to call from any thread and
    /// safe to call twice; the `Idle` publication happens exactly once, on
    /// the worker.
    pub fn terminate(&mut self) {
        self.stop_handle().request_stop();
        let drained = self.session.wait_idle(DRAIN_TIMEOUT);
        match self.worker.take() {
            Some(worker) if drained => {
                let _ = worker.join();
            }
            Some(_) => {
                // Leave the wedged worker to finish draining on its own; its
                // pool slots stay owned by the endpoint until then.
                log::warn!("input pool did not drain within {DRAIN_TIMEOUT:?}");
            }
            None => {}
        }
    }

    /// Block until the scan publishes `Idle`. Returns `false` on timeout.
    pub fn wait_until_done(&self, timeout: std::time::Duration) -> bool {
        self.session.wait_idle(timeout)
    }
}

impl Drop for StreamIn {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.terminate();
        }
    }
}

fn worker_loop(
    mut endpoint: Endpoint<Bulk, In>,
    session: SharedSession,
    halt: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    mut requested: VecDeque<usize>,
    stage: usize,
) {
    let mut outstanding = requested.len();
    let mut terminal: Option<DaqError> = None;
    let mut pool_cancelled = false;

    while outstanding > 0 {
        if halt.load(Ordering::Acquire) && !pool_cancelled {
            state.store(PoolState::Draining as u8, Ordering::Release);
            endpoint.cancel_all();
            pool_cancelled = true;
        }

        let Some(completion) = endpoint.wait_next_complete(COMPLETION_WAIT) else {
            continue;
        };
        outstanding -= 1;
        let requested_len = requested.pop_front().unwrap_or(stage);

        match completion.status {
            Ok(()) => {
                if halt.load(Ordering::Acquire) {
                    // resubmission disabled: the slot drains without feeding
                    continue;
                }
                let data = &completion.buffer[..];
                // a short or zero-length transfer is the device's end-of-scan
                let short = data.len() < requested_len;

                let mut s = session.lock();
                s.feed_in(data);
                if short {
                    s.unreserve_in(requested_len - data.len());
                }
                let satisfied = s.all_transferred() && !s.recycle();
                let resubmit = !short && !satisfied && !halt.load(Ordering::Acquire);
                let wanted = if resubmit { s.reserve_in(stage) } else { 0 };
                drop(s);
                session.notify_all();

                if wanted > 0 {
                    let buffer = endpoint.allocate(wanted);
                    endpoint.submit(buffer);
                    requested.push_back(wanted);
                    outstanding += 1;
                } else if !pool_cancelled {
                    state.store(PoolState::Draining as u8, Ordering::Release);
                    endpoint.cancel_all();
                    pool_cancelled = true;
                }
            }
            Err(TransferError::Cancelled) => {}
            Err(error) => {
                log::debug!("input transfer failed: {error}");
                if terminal.is_none() {
                    terminal = Some(match error {
                        TransferError::Disconnected => DaqError::DeadDevice,
                        other => DaqError::Transfer(other),
                    });
                }
                if !pool_cancelled {
                    state.store(PoolState::Draining as u8, Ordering::Release);
                    endpoint.cancel_all();
                    pool_cancelled = true;
                }
            }
        }
    }

    // Outstanding count is zero: every pool slot is back with the engine and
    // may be released with the endpoint.
    state.store(PoolState::Idle as u8, Ordering::Release);
    session.publish_idle(terminal);
}
