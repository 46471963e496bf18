//! Binary codec for characteristic payloads
//! Payloads are little-endian, length-prefix free. Every decoder checks the
//! payload is long enough; every encoder checks the value fits its wire type.

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use thiserror::Error;

/// The raw value read from or written to a characteristic.
pub type Payload = Vec<u8>;

/// Sentinel meaning "unset" in 32-bit tag id fields
pub const UINT32_SENTINEL_MAX: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload is empty")]
    Absent,
    #[error("payload too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("payload is not valid base64")]
    InvalidTextEncoding,
    #[error("unexpected {field} value: {value:#04x}")]
    UnexpectedValue { field: &'static str, value: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("value {value} is out of range for {ty}")]
    OutOfRange { value: i64, ty: &'static str },
}

fn take<const N: usize>(payload: &[u8]) -> Result<[u8; N], DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Absent);
    }
    payload
        .get(..N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(DecodeError::TooShort {
            expected: N,
            actual: payload.len(),
        })
}

pub fn decode_u8(payload: &[u8]) -> Result<u8, DecodeError> {
    take::<1>(payload).map(|[b]| b)
}

pub fn decode_i16_le(payload: &[u8]) -> Result<i16, DecodeError> {
    take::<2>(payload).map(i16::from_le_bytes)
}

pub fn decode_i32_le(payload: &[u8]) -> Result<i32, DecodeError> {
    take::<4>(payload).map(i32::from_le_bytes)
}

pub fn decode_u32_le(payload: &[u8]) -> Result<u32, DecodeError> {
    take::<4>(payload).map(u32::from_le_bytes)
}

/// Decodes a UTF-8 string, dropping any trailing NUL padding.
pub fn decode_utf8_string(payload: &[u8]) -> Result<String, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Absent);
    }
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8)?;
    Ok(text.trim_end_matches('\0').to_string())
}

/// Decodes a one-byte boolean flag. Any non-zero byte is `true`.
pub fn decode_bool(payload: &[u8]) -> Result<bool, DecodeError> {
    decode_u8(payload).map(|b| b != 0)
}

pub fn encode_u8(value: i64) -> Result<Payload, EncodeError> {
    u8::try_from(value)
        .map(|v| vec![v])
        .map_err(|_| EncodeError::OutOfRange { value, ty: "u8" })
}

pub fn encode_i16_le(value: i64) -> Result<Payload, EncodeError> {
    i16::try_from(value)
        .map(|v| v.to_le_bytes().to_vec())
        .map_err(|_| EncodeError::OutOfRange { value, ty: "i16" })
}

pub fn encode_i32_le(value: i64) -> Result<Payload, EncodeError> {
    i32::try_from(value)
        .map(|v| v.to_le_bytes().to_vec())
        .map_err(|_| EncodeError::OutOfRange { value, ty: "i32" })
}

pub fn encode_u32_le(value: i64) -> Result<Payload, EncodeError> {
    u32::try_from(value)
        .map(|v| v.to_le_bytes().to_vec())
        .map_err(|_| EncodeError::OutOfRange { value, ty: "u32" })
}

pub fn encode_bool(value: bool) -> Payload {
    vec![u8::from(value)]
}

/// True iff the payload decodes to 0xFFFFFFFF.
pub fn is_u32_sentinel_max(payload: &[u8]) -> bool {
    matches!(decode_u32_le(payload), Ok(UINT32_SENTINEL_MAX))
}

/// Decodes a tag id, mapping the sentinel to `-1`.
pub fn decode_tag_id(payload: &[u8]) -> Result<i64, DecodeError> {
    let raw = decode_u32_le(payload)?;
    if raw == UINT32_SENTINEL_MAX {
        Ok(crate::core::bluetooth::constants::NO_TAG_ID)
    } else {
        Ok(i64::from(raw))
    }
}

/// Encodes a tag id; `-1` becomes the sentinel.
pub fn encode_tag_id(tag_id: i64) -> Result<Payload, EncodeError> {
    if tag_id == crate::core::bluetooth::constants::NO_TAG_ID {
        return Ok(UINT32_SENTINEL_MAX.to_le_bytes().to_vec());
    }
    if tag_id == i64::from(UINT32_SENTINEL_MAX) {
        // the raw sentinel is not a valid tag id
        return Err(EncodeError::OutOfRange { value: tag_id, ty: "tag id" });
    }
    encode_u32_le(tag_id)
}

/// Pretty prints a payload as `0x.. 0x..` for logs.
pub fn to_hex_string(payload: &[u8]) -> String {
    payload
        .iter()
        .map(|b| format!("0x{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text-safe (base64) form of a payload, for JSON and command lines.
pub fn encode_text_safe(payload: &[u8]) -> String {
    BASE64_STANDARD.encode(payload)
}

pub fn decode_text_safe(text: &str) -> Result<Payload, DecodeError> {
    BASE64_STANDARD
        .decode(text.trim())
        .map_err(|_| DecodeError::InvalidTextEncoding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_safe_form_carries_raw_payloads() {
        // firmware string with NUL padding, as read from the device
        let payload = b"fw 1.4.2\0".to_vec();
        let text = encode_text_safe(&payload);
        assert_eq!(text, "ZncgMS40LjIA");
        assert_eq!(decode_text_safe(&text).unwrap(), payload);
        assert_eq!(decode_text_safe(" AQ== ").unwrap(), vec![0x01]);
        assert_eq!(decode_text_safe("").unwrap(), Vec::<u8>::new());
        assert_eq!(decode_text_safe("not base64!"), Err(DecodeError::InvalidTextEncoding));
    }

    #[test]
    fn dim_led_payload_decodes_to_on_mild() {
        assert_eq!(decode_u8(&[0x02]).unwrap(), 2);
    }

    #[test]
    fn temperature_payload_decodes_little_endian() {
        assert_eq!(decode_i32_le(&[0xE8, 0x03, 0x00, 0x00]).unwrap(), 1000);
        assert_eq!(decode_i32_le(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap(), -1);
    }

    #[test]
    fn paired_tag_sentinel_maps_to_minus_one() {
        assert_eq!(decode_tag_id(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap(), -1);
        assert_eq!(decode_tag_id(&[0x2A, 0x00, 0x00, 0x00]).unwrap(), 42);
        assert_eq!(decode_tag_id(&[0xFE, 0xFF, 0xFF, 0xFF]).unwrap(), 0xFFFF_FFFE);
    }

    #[test]
    fn sentinel_detection_is_exact() {
        assert!(is_u32_sentinel_max(&[0xFF, 0xFF, 0xFF, 0xFF]));
        assert!(!is_u32_sentinel_max(&[0x00, 0x00, 0x00, 0x00]));
        assert!(!is_u32_sentinel_max(&[0xFE, 0xFF, 0xFF, 0xFF]));
        assert!(!is_u32_sentinel_max(&[0xFF, 0xFF]));
    }

    #[test]
    fn short_or_absent_payloads_fail() {
        assert_eq!(decode_u8(&[]), Err(DecodeError::Absent));
        assert_eq!(
            decode_i16_le(&[0x01]),
            Err(DecodeError::TooShort { expected: 2, actual: 1 })
        );
        assert_eq!(
            decode_u32_le(&[0x01, 0x02, 0x03]),
            Err(DecodeError::TooShort { expected: 4, actual: 3 })
        );
        assert_eq!(decode_utf8_string(&[]), Err(DecodeError::Absent));
    }

    #[test]
    fn longer_payloads_decode_the_prefix() {
        // battery payloads carry a level byte followed by a voltage
        assert_eq!(decode_u8(&[0x03, 0x10, 0x0E]).unwrap(), 3);
        assert_eq!(decode_i16_le(&[0x10, 0x0E, 0x99]).unwrap(), 0x0E10);
    }

    #[test]
    fn encoders_reject_out_of_range_values() {
        assert!(encode_u8(256).is_err());
        assert!(encode_u8(-1).is_err());
        assert!(encode_u32_le(-2).is_err());
        assert!(encode_u32_le(i64::from(u32::MAX) + 1).is_err());
        assert!(encode_i16_le(i64::from(i16::MAX) + 1).is_err());
        assert_eq!(encode_u32_le(1).unwrap(), vec![0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn round_trips_hold_at_the_edges() {
        for x in [i32::MIN, -1, 0, 1000, i32::MAX] {
            assert_eq!(decode_i32_le(&encode_i32_le(x.into()).unwrap()).unwrap(), x);
        }
        for x in [i16::MIN, -1, 0, i16::MAX] {
            assert_eq!(decode_i16_le(&encode_i16_le(x.into()).unwrap()).unwrap(), x);
        }
        for x in [0u32, 1, 0xFFFF_FFFE, u32::MAX] {
            assert_eq!(decode_u32_le(&encode_u32_le(x.into()).unwrap()).unwrap(), x);
        }
        for x in [0u8, 4, 0xFF] {
            assert_eq!(decode_u8(&encode_u8(x.into()).unwrap()).unwrap(), x);
        }
    }

    #[test]
    fn tag_id_encoding_maps_minus_one_to_sentinel() {
        assert_eq!(encode_tag_id(-1).unwrap(), vec![0xFF; 4]);
        assert_eq!(encode_tag_id(7).unwrap(), vec![0x07, 0x00, 0x00, 0x00]);
        assert!(encode_tag_id(i64::from(u32::MAX)).is_err());
        assert!(encode_tag_id(-5).is_err());
    }

    #[test]
    fn version_string_drops_nul_padding() {
        assert_eq!(decode_utf8_string(b"1.2.0/B\0\0").unwrap(), "1.2.0/B");
        assert_eq!(decode_utf8_string(&[0xC3, 0x28]), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn hex_string_is_readable() {
        assert_eq!(to_hex_string(&[0x01, 0xAB]), "0x01 0xab");
        assert_eq!(to_hex_string(&[]), "");
    }
}
