//! Advertisement parsing and heart-rate device recognition
//!
//! Raw advertisement data is a sequence of AD structures, each
//! `length (1) || type (1) || value (length - 1)`. Receivers split it into
//! typed records and decide from the service lists and the device name
//! whether the peripheral is worth connecting to.

use super::gatt::HEART_RATE_SERVICE_SHORT;

/// Name fragments that mark a heart-rate peripheral (matched lowercase).
pub const HEART_RATE_NAME_KEYWORDS: &[&str] = &["heart", "hr", "pulse", "cardiac", "cardio", "心率"];

/// AD structure types we care about. Everything else is kept as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdType {
    Flags,
    Uuids16Incomplete,
    Uuids16Complete,
    Uuids128Incomplete,
    Uuids128Complete,
    ShortName,
    CompleteName,
    TxPower,
    ServiceData16,
    ManufacturerData,
    Other(u8),
}

impl AdType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => AdType::Flags,
            0x02 => AdType::Uuids16Incomplete,
            0x03 => AdType::Uuids16Complete,
            0x06 => AdType::Uuids128Incomplete,
            0x07 => AdType::Uuids128Complete,
            0x08 => AdType::ShortName,
            0x09 => AdType::CompleteName,
            0x0A => AdType::TxPower,
            0x16 => AdType::ServiceData16,
            0xFF => AdType::ManufacturerData,
            other => AdType::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            AdType::Flags => 0x01,
            AdType::Uuids16Incomplete => 0x02,
            AdType::Uuids16Complete => 0x03,
            AdType::Uuids128Incomplete => 0x06,
            AdType::Uuids128Complete => 0x07,
            AdType::ShortName => 0x08,
            AdType::CompleteName => 0x09,
            AdType::TxPower => 0x0A,
            AdType::ServiceData16 => 0x16,
            AdType::ManufacturerData => 0xFF,
            AdType::Other(other) => other,
        }
    }

    fn is_uuid16_list(self) -> bool {
        matches!(self, AdType::Uuids16Complete | AdType::Uuids16Incomplete)
    }

    fn is_uuid128_list(self) -> bool {
        matches!(self, AdType::Uuids128Complete | AdType::Uuids128Incomplete)
    }
}

/// One AD structure from an advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementRecord {
    pub kind: AdType,
    pub data: Vec<u8>,
}

impl AdvertisementRecord {
    pub fn new(kind: AdType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// A complete 16-bit service list.
    pub fn uuids16(uuids: &[u16]) -> Self {
        let data = uuids.iter().flat_map(|u| u.to_le_bytes()).collect::<Vec<_>>();
        Self::new(AdType::Uuids16Complete, data)
    }

    /// A complete local name.
    pub fn complete_name(name: &str) -> Self {
        Self::new(AdType::CompleteName, name.as_bytes())
    }
}

/// Split raw advertisement bytes into records.
///
/// A zero length byte ends the significant part of the data. A structure
/// whose declared length runs past the end of the buffer is dropped.
pub fn parse_records(raw: &[u8]) -> Vec<AdvertisementRecord> {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < raw.len() {
        let len = raw[offset] as usize;
        if len == 0 {
            break;
        }
        let end = offset + 1 + len;
        if end > raw.len() {
            break;
        }
        let kind = AdType::from_u8(raw[offset + 1]);
        records.push(AdvertisementRecord::new(kind, &raw[offset + 2..end]));
        offset = end;
    }

    records
}

/// Encode records back into raw advertisement bytes.
///
/// Values longer than 254 bytes cannot be represented and are truncated.
pub fn encode_records(records: &[AdvertisementRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    for record in records {
        let data = &record.data[..record.data.len().min(254)];
        buf.push(data.len() as u8 + 1);
        buf.push(record.kind.to_u8());
        buf.extend_from_slice(data);
    }
    buf
}

/// The advertised local name, preferring the complete name.
pub fn local_name(records: &[AdvertisementRecord]) -> Option<String> {
    let find = |kind: AdType| {
        records
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| String::from_utf8_lossy(&r.data).into_owned())
    };
    find(AdType::CompleteName).or_else(|| find(AdType::ShortName))
}

/// Manufacturer-specific data of the first such record, if any.
pub fn manufacturer_data(records: &[AdvertisementRecord]) -> Option<&[u8]> {
    records
        .iter()
        .find(|r| r.kind == AdType::ManufacturerData)
        .map(|r| r.data.as_slice())
}

/// Whether the heart-rate service short UUID occurs as an adjacent byte
/// pair, in either byte order.
fn contains_heart_rate_uuid(data: &[u8]) -> bool {
    let [hi, lo] = HEART_RATE_SERVICE_SHORT.to_be_bytes();
    data.windows(2)
        .any(|w| (w[0] == hi && w[1] == lo) || (w[0] == lo && w[1] == hi))
}

/// Decide whether an advertising peripheral looks like a heart-rate sensor.
///
/// Matches on the heart rate service in any 16-bit or 128-bit service list,
/// or on a keyword in the device name.
pub fn is_heart_rate_capable(records: &[AdvertisementRecord], name: Option<&str>) -> bool {
    let advertises_service = records
        .iter()
        .filter(|r| r.kind.is_uuid16_list() || r.kind.is_uuid128_list())
        .any(|r| contains_heart_rate_uuid(&r.data));
    if advertises_service {
        return true;
    }

    match name {
        Some(name) if !name.is_empty() => {
            let lowered = name.to_lowercase();
            HEART_RATE_NAME_KEYWORDS
                .iter()
                .any(|keyword| lowered.contains(keyword))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::HEART_RATE_SERVICE_UUID;

    #[test]
    fn test_name_heuristic() {
        assert!(is_heart_rate_capable(&[], Some("CardioBand Pro")));
        assert!(!is_heart_rate_capable(&[], Some("Generic Speaker")));
        assert!(is_heart_rate_capable(&[], Some("Polar H10 HR")));
        assert!(is_heart_rate_capable(&[], Some("PULSE-OX")));
        assert!(is_heart_rate_capable(&[], Some("智能心率带")));
        assert!(!is_heart_rate_capable(&[], None));
        assert!(!is_heart_rate_capable(&[], Some("")));
    }

    #[test]
    fn test_uuid16_list_in_either_byte_order() {
        let little_endian = AdvertisementRecord::uuids16(&[0x180F, 0x180D]);
        assert_eq!(little_endian.data, vec![0x0F, 0x18, 0x0D, 0x18]);
        assert!(is_heart_rate_capable(&[little_endian], Some("Generic Speaker")));

        let big_endian = AdvertisementRecord::new(AdType::Uuids16Incomplete, vec![0x18, 0x0D]);
        assert!(is_heart_rate_capable(&[big_endian], None));

        let other = AdvertisementRecord::uuids16(&[0x180F]);
        assert!(!is_heart_rate_capable(&[other], Some("Generic Speaker")));
    }

    #[test]
    fn test_uuid128_list() {
        let mut le = HEART_RATE_SERVICE_UUID.as_bytes().to_vec();
        le.reverse();
        let record = AdvertisementRecord::new(AdType::Uuids128Complete, le);
        assert!(is_heart_rate_capable(&[record], None));

        let be = AdvertisementRecord::new(
            AdType::Uuids128Incomplete,
            HEART_RATE_SERVICE_UUID.as_bytes().to_vec(),
        );
        assert!(is_heart_rate_capable(&[be], None));
    }

    #[test]
    fn test_service_data_does_not_count() {
        let record = AdvertisementRecord::new(AdType::ServiceData16, vec![0x0D, 0x18, 0x48]);
        assert!(!is_heart_rate_capable(&[record], Some("Speaker")));
    }

    #[test]
    fn test_parse_and_encode_records() {
        let records = vec![
            AdvertisementRecord::new(AdType::Flags, vec![0x06]),
            AdvertisementRecord::uuids16(&[0x180D]),
            AdvertisementRecord::complete_name("HRM-Dual"),
            AdvertisementRecord::new(AdType::Other(0x2A), vec![0x01]),
        ];
        let raw = encode_records(&records);
        assert_eq!(&raw[..3], &[0x02, 0x01, 0x06]);
        assert_eq!(parse_records(&raw), records);
        assert_eq!(local_name(&records).as_deref(), Some("HRM-Dual"));
    }

    #[test]
    fn test_parse_stops_at_zero_length_and_truncation() {
        let raw = [0x02, 0x01, 0x06, 0x00, 0x03, 0x03, 0x0D, 0x18];
        let records = parse_records(&raw);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, AdType::Flags);

        let truncated = [0x02, 0x01, 0x06, 0x05, 0x09, b'a', b'b'];
        let records = parse_records(&truncated);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_short_name_fallback_and_manufacturer_data() {
        let records = vec![
            AdvertisementRecord::new(AdType::ShortName, b"HR".to_vec()),
            AdvertisementRecord::new(AdType::ManufacturerData, vec![0x6B, 0x00, 0x48]),
        ];
        assert_eq!(local_name(&records).as_deref(), Some("HR"));
        assert_eq!(manufacturer_data(&records), Some(&[0x6B, 0x00, 0x48][..]));
    }
}
