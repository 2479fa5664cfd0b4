//! Heart Rate GATT service definition and measurement codec
//!
//! UUIDs are the Bluetooth SIG assigned numbers expanded onto the base UUID.
//! The measurement format is the SIG Heart Rate Measurement characteristic:
//! a flags byte followed by an 8- or 16-bit bpm field and optional fields.

use thiserror::Error;
use uuid::Uuid;

/// Heart Rate service (0x180D).
pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Heart Rate Measurement characteristic (0x2A37).
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// 16-bit short form of the heart rate service.
pub const HEART_RATE_SERVICE_SHORT: u16 = 0x180D;

const FLAG_RATE_U16: u8 = 0x01;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;
const FLAG_ENERGY_EXPENDED: u8 = 0x08;
const FLAG_RR_INTERVALS: u8 = 0x10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malformed heart rate payload ({len} bytes, need {needed})")]
    MalformedPayload { len: usize, needed: usize },
}

/// Decode the bpm value of a Heart Rate Measurement notification.
///
/// Bit 0 of the flags byte selects a little-endian u16 at offset 1,
/// otherwise the bpm is the single byte at offset 1.
pub fn parse_heart_rate(payload: &[u8]) -> Result<u16, ParseError> {
    let flags = *payload.first().ok_or(ParseError::MalformedPayload {
        len: 0,
        needed: 2,
    })?;

    if flags & FLAG_RATE_U16 != 0 {
        match payload.get(1..3) {
            Some(bytes) => Ok(u16::from_le_bytes([bytes[0], bytes[1]])),
            None => Err(ParseError::MalformedPayload {
                len: payload.len(),
                needed: 3,
            }),
        }
    } else {
        payload
            .get(1)
            .map(|b| u16::from(*b))
            .ok_or(ParseError::MalformedPayload {
                len: payload.len(),
                needed: 2,
            })
    }
}

/// Sensor contact as reported by the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorContact {
    NotSupported,
    NotDetected,
    Detected,
}

/// A fully decoded Heart Rate Measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartRateMeasurement {
    pub bpm: u16,
    pub contact: SensorContact,
    /// Cumulative energy expended in kilojoules.
    pub energy_expended: Option<u16>,
    /// RR intervals in seconds.
    pub rr_intervals: Vec<f32>,
}

impl HeartRateMeasurement {
    /// Decode every field present in the payload.
    ///
    /// Only the bpm field is mandatory. Optional fields that are cut short
    /// are dropped rather than failing the whole measurement.
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let bpm = parse_heart_rate(payload)?;
        let flags = payload[0];

        let contact = if flags & FLAG_CONTACT_SUPPORTED == 0 {
            SensorContact::NotSupported
        } else if flags & FLAG_CONTACT_DETECTED != 0 {
            SensorContact::Detected
        } else {
            SensorContact::NotDetected
        };

        let mut offset = if flags & FLAG_RATE_U16 != 0 { 3 } else { 2 };

        let mut energy_expended = None;
        if flags & FLAG_ENERGY_EXPENDED != 0 {
            if let Some(bytes) = payload.get(offset..offset + 2) {
                energy_expended = Some(u16::from_le_bytes([bytes[0], bytes[1]]));
            }
            offset += 2;
        }

        let mut rr_intervals = Vec::new();
        if flags & FLAG_RR_INTERVALS != 0 {
            if let Some(rest) = payload.get(offset..) {
                for chunk in rest.chunks_exact(2) {
                    let raw = u16::from_le_bytes([chunk[0], chunk[1]]);
                    rr_intervals.push(f32::from(raw) / 1024.0);
                }
            }
        }

        Ok(Self {
            bpm,
            contact,
            energy_expended,
            rr_intervals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eight_bit_format_returns_byte() {
        for flags in [0x00u8, 0x02, 0x04, 0x06, 0x10, 0xFE] {
            for bpm in [0u8, 1, 60, 127, 200, 255] {
                assert_eq!(parse_heart_rate(&[flags & 0xFE, bpm]), Ok(u16::from(bpm)));
            }
        }
    }

    #[test]
    fn test_sixteen_bit_format_is_little_endian() {
        for flags in [0x01u8, 0x07, 0x11, 0xFF] {
            for (low, high) in [(0x48u8, 0x00u8), (0x2C, 0x01), (0xFF, 0xFF), (0x00, 0x01)] {
                let expected = u16::from(low) + 256 * u16::from(high);
                assert_eq!(parse_heart_rate(&[flags | 0x01, low, high]), Ok(expected));
            }
        }
    }

    #[test]
    fn test_malformed_payloads() {
        assert_eq!(
            parse_heart_rate(&[]),
            Err(ParseError::MalformedPayload { len: 0, needed: 2 })
        );
        assert_eq!(
            parse_heart_rate(&[0x01, 0x05]),
            Err(ParseError::MalformedPayload { len: 2, needed: 3 })
        );
        assert_eq!(
            parse_heart_rate(&[0x00]),
            Err(ParseError::MalformedPayload { len: 1, needed: 2 })
        );
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        assert_eq!(parse_heart_rate(&[0x00, 72, 0xAA, 0xBB]), Ok(72));
    }

    #[test]
    fn test_full_measurement_with_rr_intervals() {
        // 8-bit bpm, contact supported + detected, RR present: 1024 and 512.
        let payload = [0x16, 65, 0x00, 0x04, 0x00, 0x02];
        let m = HeartRateMeasurement::parse(&payload).unwrap();
        assert_eq!(m.bpm, 65);
        assert_eq!(m.contact, SensorContact::Detected);
        assert_eq!(m.energy_expended, None);
        assert_eq!(m.rr_intervals, vec![1.0, 0.5]);
    }

    #[test]
    fn test_full_measurement_with_energy() {
        // 16-bit bpm, contact supported but not detected, energy = 300 kJ.
        let payload = [0x0D, 0x50, 0x00, 0x2C, 0x01];
        let m = HeartRateMeasurement::parse(&payload).unwrap();
        assert_eq!(m.bpm, 80);
        assert_eq!(m.contact, SensorContact::NotDetected);
        assert_eq!(m.energy_expended, Some(300));
        assert!(m.rr_intervals.is_empty());
    }

    #[test]
    fn test_truncated_optional_fields_are_dropped() {
        // Energy flag set but only one byte follows.
        let m = HeartRateMeasurement::parse(&[0x08, 90, 0x01]).unwrap();
        assert_eq!(m.bpm, 90);
        assert_eq!(m.energy_expended, None);
        assert_eq!(m.contact, SensorContact::NotSupported);
    }

    #[test]
    fn test_uuid_constants() {
        assert_eq!(
            HEART_RATE_SERVICE_UUID.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            HEART_RATE_MEASUREMENT_UUID.to_string(),
            "00002a37-0000-1000-8000-00805f9b34fb"
        );
    }
}
