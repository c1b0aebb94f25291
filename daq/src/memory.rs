//! Paged access to on-device non-volatile memory.
//!
//! Calibration constants, user data and settings live in an addressed
//! non-volatile region behind the command transport. Reads and writes are
//! split into pages bounded by the smaller of the device's page size and the
//! transport's maximum single-command payload; each page is one round trip.
//! Writes to a protected region are bracketed by an unlock code and a
//! re-lock sentinel at a device-specific address.

use std::sync::Arc;
use std::time::Duration;

use crate::DEFAULT_TIMEOUT;
use crate::calibration::{CalCoef, CalDate};
use crate::error::DaqError;
use crate::transport::CommandTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemRegion {
    Calibration,
    User,
    Settings,
    Reserved,
}

/// One addressable window of the non-volatile memory map.
#[derive(Clone, Copy, Debug)]
pub struct RegionSpec {
    pub region: MemRegion,
    pub start: u32,
    pub len: u32,
    pub protected: bool,
}

/// Per-model memory map, supplied as data by the device profile.
#[derive(Clone, Debug)]
pub struct MemoryLayout {
    pub read_opcode: u8,
    pub write_opcode: u8,
    /// Largest page the device accepts in one command.
    pub page_size: usize,
    pub unlock_addr: u32,
    pub unlock_code: u16,
    pub relock_code: u16,
    pub regions: Vec<RegionSpec>,
}

impl MemoryLayout {
    fn region(&self, region: MemRegion) -> Option<&RegionSpec> {
        self.regions.iter().find(|r| r.region == region)
    }
}

/// Paged memory reader/writer bound to one transport.
pub struct DeviceMemory {
    transport: Arc<dyn CommandTransport>,
    layout: MemoryLayout,
    timeout: Duration,
}

impl DeviceMemory {
    pub fn new(transport: Arc<dyn CommandTransport>, layout: MemoryLayout) -> Self {
        DeviceMemory {
            transport,
            layout,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    fn page_size(&self) -> usize {
        self.layout.page_size.min(self.transport.max_command_len())
    }

    fn check_range(
        &self,
        region: MemRegion,
        address: u32,
        count: usize,
    ) -> Result<&RegionSpec, DaqError> {
        let spec = self
            .layout
            .region(region)
            .ok_or(DaqError::ConfigNotSupported)?;
        let end = address as u64 + count as u64;
        if address < spec.start || end > spec.start as u64 + spec.len as u64 {
            return Err(DaqError::ConfigNotSupported);
        }
        Ok(spec)
    }

    pub fn mem_read(
        &self,
        region: MemRegion,
        address: u32,
        count: usize,
    ) -> Result<Vec<u8>, DaqError> {
        self.check_range(region, address, count)?;
        let page = self.page_size();
        let mut data = vec![0u8; count];
        let mut offset = 0;
        while offset < count {
            let chunk = page.min(count - offset);
            let addr = address + offset as u32;
            self.transport.query_exact(
                self.layout.read_opcode,
                addr as u16,
                (addr >> 16) as u16,
                &mut data[offset..offset + chunk],
                self.timeout,
            )?;
            offset += chunk;
        }
        Ok(data)
    }

    /// Write `data` starting at `address`. Returns the number of bytes
    /// written.
    ///
    /// For a protected region the unlock code is written first and the
    /// re-lock sentinel after the transfer. A failed re-lock leaves the
    /// memory possibly unlocked; that is unrecoverable for this handle and
    /// surfaces as [`DaqError::DeadDevice`].
    pub fn mem_write(
        &self,
        region: MemRegion,
        address: u32,
        data: &[u8],
    ) -> Result<usize, DaqError> {
        let spec = self.check_range(region, address, data.len())?;
        let protected = spec.protected;

        if protected {
            self.write_lock_code(self.layout.unlock_code)?;
        }

        let page = self.page_size();
        let mut offset = 0;
        let result = loop {
            if offset >= data.len() {
                break Ok(data.len());
            }
            let chunk = page.min(data.len() - offset);
            let addr = address + offset as u32;
            if let Err(e) = self.transport.send(
                self.layout.write_opcode,
                addr as u16,
                (addr >> 16) as u16,
                &data[offset..offset + chunk],
                self.timeout,
            ) {
                break Err(e);
            }
            offset += chunk;
        };

        if protected && self.write_lock_code(self.layout.relock_code).is_err() {
            log::warn!("memory re-lock failed; treating handle as dead");
            return Err(DaqError::DeadDevice);
        }
        result
    }

    fn write_lock_code(&self, code: u16) -> Result<(), DaqError> {
        let addr = self.layout.unlock_addr;
        self.transport.send(
            self.layout.write_opcode,
            addr as u16,
            (addr >> 16) as u16,
            &code.to_le_bytes(),
            self.timeout,
        )
    }

    /// Read `count` packed calibration coefficient pairs starting at `address`.
    pub fn read_cal_coefs(&self, address: u32, count: usize) -> Result<Vec<CalCoef>, DaqError> {
        let raw = self.mem_read(MemRegion::Calibration, address, count * CalCoef::WIRE_LEN)?;
        Ok(raw.chunks(CalCoef::WIRE_LEN).map(CalCoef::from_wire).collect())
    }

    pub fn read_cal_date(&self, address: u32) -> Result<CalDate, DaqError> {
        let raw = self.mem_read(MemRegion::Calibration, address, CalDate::WIRE_LEN)?;
        CalDate::from_wire(&raw)
            .ok_or_else(|| DaqError::Unhandled("invalid calibration date record".into()))
    }

    pub fn read_user_data(&self, address: u32, count: usize) -> Result<Vec<u8>, DaqError> {
        self.mem_read(MemRegion::User, address, count)
    }

    pub fn write_user_data(&self, address: u32, data: &[u8]) -> Result<usize, DaqError> {
        self.mem_write(MemRegion::User, address, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const RD: u8 = 0x30;
    const WR: u8 = 0x31;
    const UNLOCK_ADDR: u32 = 0x8000;

    struct MockTransport {
        mem: Mutex<Vec<u8>>,
        calls: Mutex<Vec<(u8, u32, usize)>>,
        fail_relock: bool,
    }

    impl MockTransport {
        fn new() -> Self {
            MockTransport {
                mem: Mutex::new(vec![0u8; 0x10000]),
                calls: Mutex::new(Vec::new()),
                fail_relock: false,
            }
        }

        fn addr(value: u16, index: u16) -> u32 {
            value as u32 | (index as u32) << 16
        }
    }

    impl CommandTransport for MockTransport {
        fn send(
            &self,
            opcode: u8,
            value: u16,
            index: u16,
            payload: &[u8],
            _timeout: Duration,
        ) -> Result<(), DaqError> {
            let addr = Self::addr(value, index);
            self.calls.lock().unwrap().push((opcode, addr, payload.len()));
            if self.fail_relock && addr == UNLOCK_ADDR && payload == &[0u8, 0u8][..] {
                return Err(DaqError::Timeout);
            }
            let mut mem = self.mem.lock().unwrap();
            mem[addr as usize..addr as usize + payload.len()].copy_from_slice(payload);
            Ok(())
        }

        fn query(
            &self,
            opcode: u8,
            value: u16,
            index: u16,
            out: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize, DaqError> {
            let addr = Self::addr(value, index);
            self.calls.lock().unwrap().push((opcode, addr, out.len()));
            let mem = self.mem.lock().unwrap();
            out.copy_from_slice(&mem[addr as usize..addr as usize + out.len()]);
            Ok(out.len())
        }

        fn max_command_len(&self) -> usize {
            64
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn layout() -> MemoryLayout {
        MemoryLayout {
            read_opcode: RD,
            write_opcode: WR,
            page_size: 16,
            unlock_addr: UNLOCK_ADDR,
            unlock_code: 0xAA55,
            relock_code: 0x0000,
            regions: vec![
                RegionSpec {
                    region: MemRegion::Calibration,
                    start: 0x0000,
                    len: 0x1000,
                    protected: true,
                },
                RegionSpec {
                    region: MemRegion::User,
                    start: 0x1000,
                    len: 0x1000,
                    protected: false,
                },
            ],
        }
    }

    fn memory(transport: MockTransport) -> (Arc<MockTransport>, DeviceMemory) {
        let transport = Arc::new(transport);
        let memory = DeviceMemory::new(transport.clone(), layout());
        (transport, memory)
    }

    #[test]
    fn test_read_splits_into_pages() {
        let (transport, memory) = memory(MockTransport::new());
        transport.mem.lock().unwrap()[0x100..0x128].copy_from_slice(&[7u8; 40]);

        let data = memory.mem_read(MemRegion::Calibration, 0x100, 40).unwrap();
        assert_eq!(data, vec![7u8; 40]);
        // page_size 16 < transport max 64: 16 + 16 + 8
        let calls = transport.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![(RD, 0x100, 16), (RD, 0x110, 16), (RD, 0x120, 8)]
        );
    }

    #[test]
    fn test_protected_write_brackets_with_lock_codes() {
        let (transport, memory) = memory(MockTransport::new());
        let written = memory
            .mem_write(MemRegion::Calibration, 0x20, &[3u8; 20])
            .unwrap();
        assert_eq!(written, 20);

        let calls = transport.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![
                (WR, UNLOCK_ADDR, 2),
                (WR, 0x20, 16),
                (WR, 0x30, 4),
                (WR, UNLOCK_ADDR, 2),
            ]
        );
        let mem = transport.mem.lock().unwrap();
        assert_eq!(&mem[0x20..0x34], &[3u8; 20]);
        // re-locked: the sentinel is what remains at the unlock address
        assert_eq!(&mem[UNLOCK_ADDR as usize..UNLOCK_ADDR as usize + 2], &[0, 0]);
    }

    #[test]
    fn test_unprotected_write_skips_lock_codes() {
        let (transport, memory) = memory(MockTransport::new());
        memory.mem_write(MemRegion::User, 0x1000, &[1u8; 8]).unwrap();
        let calls = transport.calls.lock().unwrap();
        assert_eq!(*calls, vec![(WR, 0x1000, 8)]);
    }

    #[test]
    fn test_failed_relock_is_dead_device() {
        let mut transport = MockTransport::new();
        transport.fail_relock = true;
        let (_, memory) = memory(transport);
        let err = memory
            .mem_write(MemRegion::Calibration, 0x0, &[9u8; 4])
            .unwrap_err();
        assert!(matches!(err, DaqError::DeadDevice));
    }

    #[test]
    fn test_out_of_region_rejected() {
        let (_, memory) = memory(MockTransport::new());
        let err = memory.mem_read(MemRegion::Calibration, 0xFFC, 8).unwrap_err();
        assert!(matches!(err, DaqError::ConfigNotSupported));
        let err = memory.mem_read(MemRegion::Settings, 0, 1).unwrap_err();
        assert!(matches!(err, DaqError::ConfigNotSupported));
    }

    #[test]
    fn test_read_cal_coefs_and_date() {
        let (transport, memory) = memory(MockTransport::new());
        {
            let mut mem = transport.mem.lock().unwrap();
            let coef = CalCoef {
                slope: 1.5,
                offset: -2.0,
            };
            mem[0x200..0x208].copy_from_slice(&coef.to_wire());
            mem[0x208..0x210].copy_from_slice(&CalCoef::IDENTITY.to_wire());
            mem[0x2F0..0x2F6].copy_from_slice(&[25, 1, 31, 8, 0, 0]);
        }

        let coefs = memory.read_cal_coefs(0x200, 2).unwrap();
        assert_eq!(coefs[0], CalCoef { slope: 1.5, offset: -2.0 });
        assert_eq!(coefs[1], CalCoef::IDENTITY);

        let date = memory.read_cal_date(0x2F0).unwrap();
        assert_eq!(date.year, 2025);
        assert_eq!(date.month, 1);
        assert_eq!(date.day, 31);
    }
}
