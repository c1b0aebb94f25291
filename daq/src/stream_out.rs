//! Bulk output streaming engine.
//!
//! Mirror of [`crate::stream_in`] with the direction reversed: before each
//! transfer is (re)submitted, samples are drained from the session ring,
//! converted to raw output codes and encoded into the transfer buffer. The
//! scan stops feeding when the ring is exhausted (`all_transferred` without
//! recycling) or a stop is requested.
//!
//! A finite stream whose byte total is an exact multiple of the endpoint's
//! packet size is closed with one zero-length transfer so the device sees
//! end-of-stream instead of waiting for more data.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;

use nusb::Endpoint;
use nusb::transfer::{Bulk, Out, TransferError};

use crate::error::DaqError;
use crate::session::SharedSession;
use crate::stream::{
    COMPLETION_WAIT, DRAIN_TIMEOUT, MAX_XFER_COUNT, PoolState, StopHandle, stage_size,
};

pub struct StreamOut {
    session: SharedSession,
    halt: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    worker: Option<JoinHandle<()>>,
}

impl StreamOut {
    pub fn new(session: SharedSession) -> Self {
        StreamOut {
            session,
            halt: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(PoolState::Idle as u8)),
            worker: None,
        }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            halt: self.halt.clone(),
            session: self.session.clone(),
        }
    }

    /// Encode the initial transfer pool out of the (caller pre-filled) ring
    /// and start the completion worker.
    pub fn arm(
        &mut self,
        mut endpoint: Endpoint<Bulk, Out>,
        byte_rate: f64,
    ) -> Result<(), DaqError> {
        if self.worker.is_some()
            || PoolState::from_u8(self.state.load(Ordering::Acquire)) != PoolState::Idle
        {
            return Err(DaqError::AlreadyActive);
        }
        self.halt.store(false, Ordering::Release);
        self.state.store(PoolState::Arming as u8, Ordering::Release);

        let packet = endpoint.max_packet_size();
        let (stage, finite) = {
            let session = self.session.lock();
            (
                stage_size(byte_rate, packet, session.bytes_owed()),
                session.bytes_owed().is_some(),
            )
        };
        log::debug!("output scan: stage {stage} bytes, packet {packet} bytes");

        let mut staging = vec![0u8; stage];
        let mut produced: u64 = 0;
        let mut outstanding = 0usize;
        for _ in 0..MAX_XFER_COUNT {
            match fill_and_submit(&mut endpoint, &self.session, &mut staging) {
                Some(bytes) => {
                    produced += bytes as u64;
                    outstanding += 1;
                }
                None => break,
            }
        }

        if outstanding == 0 {
            self.state.store(PoolState::Idle as u8, Ordering::Release);
            return Err(DaqError::ConfigNotSupported);
        }

        let mut zlp_sent = false;
        if finite && drained(&self.session) && produced % packet as u64 == 0 {
            let zlp = endpoint.allocate(0);
            endpoint.submit(zlp);
            outstanding += 1;
            zlp_sent = true;
        }

        self.session.lock().mark_running();
        self.state.store(PoolState::Running as u8, Ordering::Release);

        let session = self.session.clone();
        let halt = self.halt.clone();
        let state = self.state.clone();
        let worker = std::thread::Builder::new()
            .name("daq-stream-out".into())
            .spawn(move || {
                worker_loop(
                    endpoint, session, halt, state, staging, outstanding, produced, packet,
                    finite, zlp_sent,
                )
            });
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

    /// Stop the scan; see [`crate::StreamIn::terminate`] for the contract.
    pub fn terminate(&mut self) {
        self.stop_handle().request_stop();
        let drained = self.session.wait_idle(DRAIN_TIMEOUT);
        match self.worker.take() {
            Some(worker) if drained => {
                let _ = worker.join();
            }
            Some(_) => {
                log::warn!("output pool did not drain within {DRAIN_TIMEOUT:?}");
            }
            None => {}
        }
    }

    pub fn wait_until_done(&self, timeout: std::time::Duration) -> bool {
        self.session.wait_idle(timeout)
    }
}

impl Drop for StreamOut {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.terminate();
        }
    }
}

fn drained(session: &SharedSession) -> bool {
    let s = session.lock();
    s.all_transferred() && !s.recycle()
}

/// Produce the next stage from the ring and submit it. `None` when the scan
/// has no more data to send.
fn fill_and_submit(
    endpoint: &mut Endpoint<Bulk, Out>,
    session: &SharedSession,
    staging: &mut [u8],
) -> Option<usize> {
    let bytes = session.lock().feed_out(staging);
    if bytes == 0 {
        return None;
    }
    let mut buffer = endpoint.allocate(bytes);
    buffer.extend_from_slice(&staging[..bytes]);
    endpoint.submit(buffer);
    Some(bytes)
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    mut endpoint: Endpoint<Bulk, Out>,
    session: SharedSession,
    halt: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    mut staging: Vec<u8>,
    mut outstanding: usize,
    mut produced: u64,
    packet: usize,
    finite: bool,
    mut zlp_sent: bool,
) {
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

        match completion.status {
            Ok(()) => {
                session.notify_all();
                if halt.load(Ordering::Acquire) {
                    continue;
                }
                if let Some(bytes) = fill_and_submit(&mut endpoint, &session, &mut staging) {
                    produced += bytes as u64;
                    outstanding += 1;
                } else if finite && !zlp_sent && produced % packet as u64 == 0 {
                    let zlp = endpoint.allocate(0);
                    endpoint.submit(zlp);
                    outstanding += 1;
                    zlp_sent = true;
                }
            }
            Err(TransferError::Cancelled) => {}
            Err(error) => {
                log::debug!("output transfer failed: {error}");
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

    state.store(PoolState::Idle as u8, Ordering::Release);
    session.publish_idle(terminal);
}
