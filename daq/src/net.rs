//! Command transport for TCP/IP-attached devices.
//!
//! Network members of the device families speak the same opcode + two
//! parameter words + payload exchange as the USB boards, wrapped in a small
//! frame:
//!
//! ```text
//! 0       magic (0x44)
//! 1       frame id, echoed by the device
//! 2       opcode
//! 3       status (0 in requests; nonzero reply status is a command error)
//! 4..6    value, little endian
//! 6..8    index, little endian
//! 8..10   payload length, little endian
//! 10..    payload
//! last    additive checksum over header and payload
//! ```

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::endian;
use crate::error::DaqError;
use crate::transport::CommandTransport;

const FRAME_MAGIC: u8 = 0x44;
const HEADER_LEN: usize = 10;

/// Payload bound for one framed command.
const NET_MAX_COMMAND_LEN: usize = 1024;

struct NetLink {
    stream: TcpStream,
    frame_id: u8,
}

/// [`CommandTransport`] over a TCP connection.
pub struct NetTransport {
    link: Mutex<NetLink>,
    connected: AtomicBool,
}

impl NetTransport {
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, DaqError> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        Ok(NetTransport {
            link: Mutex::new(NetLink {
                stream,
                frame_id: 0,
            }),
            connected: AtomicBool::new(true),
        })
    }

    fn map_io(&self, err: std::io::Error) -> DaqError {
        use std::io::ErrorKind::*;
        match err.kind() {
            TimedOut | WouldBlock => DaqError::Timeout,
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof => {
                self.connected.store(false, Ordering::Release);
                DaqError::NotConnected
            }
            _ => DaqError::Io(err),
        }
    }

    /// One framed round trip. Returns the reply payload.
    fn round_trip(
        &self,
        opcode: u8,
        value: u16,
        index: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, DaqError> {
        if payload.len() > NET_MAX_COMMAND_LEN {
            return Err(DaqError::ConfigNotSupported);
        }
        if !self.is_connected() {
            return Err(DaqError::NotConnected);
        }

        let mut link = self.link.lock().unwrap_or_else(|e| e.into_inner());
        link.frame_id = link.frame_id.wrapping_add(1);
        let id = link.frame_id;

        let mut frame = vec![0u8; HEADER_LEN + payload.len() + 1];
        frame[0] = FRAME_MAGIC;
        frame[1] = id;
        frame[2] = opcode;
        frame[3] = 0;
        endian::write_u16_le(&mut frame, 4, value);
        endian::write_u16_le(&mut frame, 6, index);
        endian::write_u16_le(&mut frame, 8, payload.len() as u16);
        frame[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
        let len = frame.len();
        frame[len - 1] = checksum(&frame[..len - 1]);

        let result = (|| {
            link.stream.set_read_timeout(Some(timeout))?;
            link.stream.write_all(&frame)?;

            let mut header = [0u8; HEADER_LEN];
            link.stream.read_exact(&mut header)?;
            let reply_len = endian::read_u16_le(&header, 8) as usize;
            let mut rest = vec![0u8; reply_len + 1];
            link.stream.read_exact(&mut rest)?;
            Ok::<_, std::io::Error>((header, rest))
        })()
        .map_err(|e| self.map_io(e))?;
        drop(link);

        let (header, mut rest) = result;
        let reply_sum = rest.pop().unwrap_or(0);
        let mut summed = header.to_vec();
        summed.extend_from_slice(&rest);
        if header[0] != FRAME_MAGIC || reply_sum != checksum(&summed) {
            return Err(DaqError::Unhandled("corrupt reply frame".into()));
        }
        if header[1] != id {
            return Err(DaqError::Unhandled(format!(
                "frame id mismatch: sent {id}, received {}",
                header[1]
            )));
        }
        if header[3] != 0 {
            return Err(DaqError::Status(header[3]));
        }
        Ok(rest)
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

impl CommandTransport for NetTransport {
    fn send(
        &self,
        opcode: u8,
        value: u16,
        index: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), DaqError> {
        self.round_trip(opcode, value, index, payload, timeout)?;
        Ok(())
    }

    fn query(
        &self,
        opcode: u8,
        value: u16,
        index: u16,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, DaqError> {
        let reply = self.round_trip(opcode, value, index, &[], timeout)?;
        let received = reply.len().min(out.len());
        out[..received].copy_from_slice(&reply[..received]);
        Ok(received)
    }

    fn max_command_len(&self) -> usize {
        NET_MAX_COMMAND_LEN
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    const OP_ECHO_VALUE: u8 = 0x10;
    const OP_FAIL: u8 = 0x20;
    const OP_SHORT: u8 = 0x30;

    /// Minimal device stand-in: echoes the value word back as a 2-byte
    /// payload, fails opcode 0x20 with status 5, replies short to 0x30.
    fn spawn_fake_device() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            loop {
                let mut header = [0u8; HEADER_LEN];
                if stream.read_exact(&mut header).is_err() {
                    return;
                }
                let len = endian::read_u16_le(&header, 8) as usize;
                let mut rest = vec![0u8; len + 1];
                stream.read_exact(&mut rest).unwrap();

                let payload: Vec<u8> = match header[2] {
                    OP_ECHO_VALUE => header[4..6].to_vec(),
                    OP_SHORT => vec![header[4]],
                    _ => Vec::new(),
                };
                let mut reply = vec![0u8; HEADER_LEN + payload.len() + 1];
                reply[0] = FRAME_MAGIC;
                reply[1] = header[1];
                reply[2] = header[2];
                reply[3] = if header[2] == OP_FAIL { 5 } else { 0 };
                endian::write_u16_le(&mut reply, 8, payload.len() as u16);
                reply[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(&payload);
                let n = reply.len();
                reply[n - 1] = checksum(&reply[..n - 1]);
                stream.write_all(&reply).unwrap();
            }
        });
        addr
    }

    #[test]
    fn test_query_round_trip() {
        let addr = spawn_fake_device();
        let transport = NetTransport::connect(addr, Duration::from_secs(1)).unwrap();
        let mut out = [0u8; 2];
        transport
            .query_exact(OP_ECHO_VALUE, 0xBEEF, 0, &mut out, Duration::from_secs(1))
            .unwrap();
        assert_eq!(endian::read_u16_le(&out, 0), 0xBEEF);
        assert!(transport.is_connected());
    }

    #[test]
    fn test_device_status_error_surfaces() {
        let addr = spawn_fake_device();
        let transport = NetTransport::connect(addr, Duration::from_secs(1)).unwrap();
        let err = transport
            .send(OP_FAIL, 0, 0, &[], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, DaqError::Status(5)));
    }

    #[test]
    fn test_short_reply_detected() {
        let addr = spawn_fake_device();
        let transport = NetTransport::connect(addr, Duration::from_secs(1)).unwrap();
        let mut out = [0u8; 4];
        let err = transport
            .query_exact(OP_SHORT, 0x42, 0, &mut out, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(
            err,
            DaqError::ShortReply {
                expected: 4,
                received: 1
            }
        ));
        // variable-length callers opt out of the check
        let n = transport
            .query(OP_SHORT, 0x42, 0, &mut out, Duration::from_secs(1))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(out[0], 0x42);
    }

    #[test]
    fn test_frame_checksum() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[1, 2, 3]), 6);
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
    }
}
