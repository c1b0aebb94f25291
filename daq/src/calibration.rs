//! Factory calibration and user scaling.
//!
//! Every sample moving through a scan passes a per-channel linear correction
//! loaded from the device's calibration memory, followed by an optional
//! user-supplied linear scale. The coefficients live in non-volatile memory
//! as packed little-endian `{f32 slope, f32 offset}` pairs next to a 6-byte
//! packed calibration date.

use crate::endian;
use crate::session::ScanFlag;

/// Factory calibration coefficients for one channel on one range.
///
/// Immutable once read from device memory; refreshed only by an explicit
/// reload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalCoef {
    pub slope: f64,
    pub offset: f64,
}

impl CalCoef {
    pub const IDENTITY: CalCoef = CalCoef {
        slope: 1.0,
        offset: 0.0,
    };

    pub(crate) const WIRE_LEN: usize = 8;

    /// Decode one packed `{f32 slope, f32 offset}` pair.
    pub fn from_wire(data: &[u8]) -> Self {
        CalCoef {
            slope: endian::read_f32_le(data, 0) as f64,
            offset: endian::read_f32_le(data, 4) as f64,
        }
    }

    pub fn to_wire(&self) -> [u8; Self::WIRE_LEN] {
        let mut data = [0u8; Self::WIRE_LEN];
        endian::write_f32_le(&mut data, 0, self.slope as f32);
        endian::write_f32_le(&mut data, 4, self.offset as f32);
        data
    }
}

/// User-settable linear post-scale, independent of factory calibration.
///
/// Defaults to identity, so it is always safe to apply.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CustomScale {
    pub slope: f64,
    pub offset: f64,
}

impl Default for CustomScale {
    fn default() -> Self {
        CustomScale {
            slope: 1.0,
            offset: 0.0,
        }
    }
}

/// Calibration date, packed on the wire as
/// `{year - 2000, month, day, hour, minute, second}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CalDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl CalDate {
    pub(crate) const WIRE_LEN: usize = 6;

    /// Decode the packed date record. Returns `None` when the fields are out
    /// of range (typically an uncalibrated device with erased memory).
    pub fn from_wire(data: &[u8]) -> Option<Self> {
        let date = CalDate {
            year: 2000 + data[0] as u16,
            month: data[1],
            day: data[2],
            hour: data[3],
            minute: data[4],
            second: data[5],
        };
        let valid = (1..=12).contains(&date.month)
            && (1..=31).contains(&date.day)
            && date.hour < 24
            && date.minute < 60
            && date.second < 60;
        valid.then_some(date)
    }

    pub fn to_wire(&self) -> [u8; Self::WIRE_LEN] {
        [
            (self.year - 2000) as u8,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
        ]
    }
}

impl std::fmt::Display for CalDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Apply calibration and custom scale to one raw input sample.
///
/// With both `NOSCALEDATA` and `NOCALIBRATEDATA` set the raw count passes
/// through untouched. The custom scale is applied unconditionally (identity
/// by default). Calibrated input data is intentionally not clamped to the
/// converter's range.
pub fn calibrate(raw: f64, coef: &CalCoef, custom: &CustomScale, flags: ScanFlag) -> f64 {
    let value = if flags.contains(ScanFlag::NOSCALEDATA | ScanFlag::NOCALIBRATEDATA) {
        raw
    } else {
        coef.slope * raw + coef.offset
    };
    custom.slope * value + custom.offset
}

/// Convert one host value to a raw output code.
///
/// The custom scale is applied first, then the output coefficients
/// (`raw = slope * value + offset`), and the result is clamped to
/// `[0, full_scale]` rather than wrapped. Output codes, unlike calibrated
/// input data, must never leave the DAC's range.
pub fn uncalibrate(
    value: f64,
    coef: &CalCoef,
    custom: &CustomScale,
    flags: ScanFlag,
    full_scale: f64,
) -> u32 {
    let value = custom.slope * value + custom.offset;
    let raw = if flags.contains(ScanFlag::NOSCALEDATA | ScanFlag::NOCALIBRATEDATA) {
        value
    } else {
        coef.slope * value + coef.offset
    };
    raw.round().clamp(0.0, full_scale) as u32
}
