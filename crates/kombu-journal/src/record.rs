//! Journal record format.
//!
//! Framed record layout:
//! - len: u32 LE, the byte length of everything after this prefix
//! - tag: u8 (1=Store, 2=Remove, 3=Touch, 4=Clear)
//! - event_id: varint
//! - variant fields (varint lengths, flag byte for snapshot/expiry bits,
//!   expiry as unix milliseconds)
//! - crc32c: u32 LE over tag..fields
//!
//! The CRC separates "corrupt" from "truncated": a partial tail decodes as
//! `Incomplete` and ends replay cleanly, while a bit flip fails the checksum.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kombu_events::{Notification, StoreOperation};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const TAG_STORE: u8 = 1;
const TAG_REMOVE: u8 = 2;
const TAG_TOUCH: u8 = 3;
const TAG_CLEAR: u8 = 4;

const META_SNAPSHOT: u8 = 0b0000_0001;
const META_EXPIRY: u8 = 0b0000_0010;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("incomplete record")]
    Incomplete,
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("invalid record tag: {0}")]
    InvalidTag(u8),
    #[error("invalid store operation: {0}")]
    InvalidOperation(u8),
    #[error("key is not valid UTF-8")]
    InvalidKey,
    #[error("malformed record: {0}")]
    Malformed(&'static str),
}

fn operation_to_byte(op: StoreOperation) -> u8 {
    match op {
        StoreOperation::Set => 0,
        StoreOperation::Add => 1,
        StoreOperation::Replace => 2,
        StoreOperation::Append => 3,
        StoreOperation::Prepend => 4,
    }
}

fn operation_from_byte(b: u8) -> Result<StoreOperation, RecordError> {
    match b {
        0 => Ok(StoreOperation::Set),
        1 => Ok(StoreOperation::Add),
        2 => Ok(StoreOperation::Replace),
        3 => Ok(StoreOperation::Append),
        4 => Ok(StoreOperation::Prepend),
        other => Err(RecordError::InvalidOperation(other)),
    }
}

fn expiry_to_millis(expiry: SystemTime) -> u64 {
    expiry
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Encodes one notification as a framed journal record.
pub fn encode_record(note: &Notification) -> Bytes {
    let mut payload = BytesMut::new();

    match note {
        Notification::Store {
            event_id,
            key,
            data,
            operation,
            flags,
            expiry,
            is_snapshot,
        } => {
            payload.put_u8(TAG_STORE);
            encode_varint(&mut payload, *event_id);

            let mut meta = 0u8;
            if *is_snapshot {
                meta |= META_SNAPSHOT;
            }
            if expiry.is_some() {
                meta |= META_EXPIRY;
            }
            payload.put_u8(meta);
            payload.put_u8(operation_to_byte(*operation));
            encode_varint(&mut payload, *flags);
            if let Some(at) = expiry {
                encode_varint(&mut payload, expiry_to_millis(*at));
            }
            encode_varint(&mut payload, key.len() as u64);
            encode_varint(&mut payload, data.len() as u64);
            payload.put_slice(key.as_bytes());
            payload.put_slice(data);
        }
        Notification::Remove { event_id, key } => {
            payload.put_u8(TAG_REMOVE);
            encode_varint(&mut payload, *event_id);
            encode_varint(&mut payload, key.len() as u64);
            payload.put_slice(key.as_bytes());
        }
        Notification::Touch {
            event_id,
            key,
            expiry,
        } => {
            payload.put_u8(TAG_TOUCH);
            encode_varint(&mut payload, *event_id);
            let meta = if expiry.is_some() { META_EXPIRY } else { 0 };
            payload.put_u8(meta);
            if let Some(at) = expiry {
                encode_varint(&mut payload, expiry_to_millis(*at));
            }
            encode_varint(&mut payload, key.len() as u64);
            payload.put_slice(key.as_bytes());
        }
        Notification::Clear { event_id } => {
            payload.put_u8(TAG_CLEAR);
            encode_varint(&mut payload, *event_id);
        }
    }

    let crc = crc32c::crc32c(&payload);
    let mut framed = BytesMut::with_capacity(payload.len() + 8);
    framed.put_u32_le(payload.len() as u32 + 4);
    framed.put_slice(&payload);
    framed.put_u32_le(crc);
    framed.freeze()
}

/// Decodes one framed record from the front of `data`, returning the
/// notification and the total bytes consumed (prefix included).
pub fn decode_record(data: &[u8]) -> Result<(Notification, usize), RecordError> {
    if data.len() < 4 {
        return Err(RecordError::Incomplete);
    }
    let mut cursor = data;
    let len = cursor.get_u32_le() as usize;
    if cursor.len() < len || len < 5 {
        return Err(RecordError::Incomplete);
    }

    let payload = &cursor[..len - 4];
    let stored_crc = (&cursor[len - 4..len]).get_u32_le();
    let actual_crc = crc32c::crc32c(payload);
    if stored_crc != actual_crc {
        return Err(RecordError::CrcMismatch {
            expected: stored_crc,
            actual: actual_crc,
        });
    }

    let mut body = payload;
    let tag = body.get_u8();
    let event_id = decode_varint(&mut body)?;

    let note = match tag {
        TAG_STORE => {
            if body.len() < 2 {
                return Err(RecordError::Malformed("store header"));
            }
            let meta = body.get_u8();
            let operation = operation_from_byte(body.get_u8())?;
            let flags = decode_varint(&mut body)?;
            let expiry = decode_expiry(&mut body, meta)?;
            let klen = decode_varint(&mut body)? as usize;
            let dlen = decode_varint(&mut body)? as usize;
            let key = take_key(&mut body, klen)?;
            let data = take_bytes(&mut body, dlen)?;
            Notification::Store {
                event_id,
                key,
                data,
                operation,
                flags,
                expiry,
                is_snapshot: meta & META_SNAPSHOT != 0,
            }
        }
        TAG_REMOVE => {
            let klen = decode_varint(&mut body)? as usize;
            let key = take_key(&mut body, klen)?;
            Notification::Remove { event_id, key }
        }
        TAG_TOUCH => {
            if body.is_empty() {
                return Err(RecordError::Malformed("touch header"));
            }
            let meta = body.get_u8();
            let expiry = decode_expiry(&mut body, meta)?;
            let klen = decode_varint(&mut body)? as usize;
            let key = take_key(&mut body, klen)?;
            Notification::Touch {
                event_id,
                key,
                expiry,
            }
        }
        TAG_CLEAR => Notification::Clear { event_id },
        other => return Err(RecordError::InvalidTag(other)),
    };

    Ok((note, 4 + len))
}

fn decode_expiry(body: &mut &[u8], meta: u8) -> Result<Option<SystemTime>, RecordError> {
    if meta & META_EXPIRY == 0 {
        return Ok(None);
    }
    let millis = decode_varint(body)?;
    Ok(Some(UNIX_EPOCH + Duration::from_millis(millis)))
}

fn take_bytes(body: &mut &[u8], len: usize) -> Result<Bytes, RecordError> {
    if body.len() < len {
        return Err(RecordError::Malformed("field length past payload end"));
    }
    let bytes = Bytes::copy_from_slice(&body[..len]);
    body.advance(len);
    Ok(bytes)
}

fn take_key(body: &mut &[u8], len: usize) -> Result<String, RecordError> {
    let raw = take_bytes(body, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| RecordError::InvalidKey)
}

/// Encodes a u64 as a varint (LEB128).
fn encode_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a varint (LEB128).
fn decode_varint(data: &mut &[u8]) -> Result<u64, RecordError> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        if data.is_empty() {
            return Err(RecordError::Malformed("varint past payload end"));
        }
        let byte = data[0];
        data.advance(1);

        if shift >= 64 {
            return Err(RecordError::Malformed("varint overflow"));
        }
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(note: Notification) {
        let encoded = encode_record(&note);
        let (decoded, consumed) = decode_record(&encoded).unwrap();
        assert_eq!(decoded, note);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_store_roundtrip() {
        roundtrip(Notification::Store {
            event_id: 12,
            key: "my_key".to_string(),
            data: Bytes::from_static(b"Payload"),
            operation: StoreOperation::Set,
            flags: 911,
            expiry: Some(UNIX_EPOCH + Duration::from_millis(1_366_934_400_000)),
            is_snapshot: false,
        });
    }

    #[test]
    fn test_snapshot_flag_survives() {
        let note = Notification::Store {
            event_id: 3,
            key: "k".to_string(),
            data: Bytes::new(),
            operation: StoreOperation::Replace,
            flags: 0,
            expiry: None,
            is_snapshot: true,
        };
        let (decoded, _) = decode_record(&encode_record(&note)).unwrap();
        assert!(matches!(
            decoded,
            Notification::Store { is_snapshot: true, .. }
        ));
    }

    #[test]
    fn test_remove_touch_clear_roundtrip() {
        roundtrip(Notification::Remove {
            event_id: u64::MAX,
            key: "gone".to_string(),
        });
        roundtrip(Notification::Touch {
            event_id: 9,
            key: "t".to_string(),
            expiry: Some(UNIX_EPOCH + Duration::from_millis(5000)),
        });
        roundtrip(Notification::Touch {
            event_id: 10,
            key: "forever".to_string(),
            expiry: None,
        });
        roundtrip(Notification::Clear { event_id: 1 });
    }

    #[test]
    fn test_truncated_record_is_incomplete() {
        let encoded = encode_record(&Notification::Clear { event_id: 5 });
        for cut in 0..encoded.len() {
            match decode_record(&encoded[..cut]) {
                Err(RecordError::Incomplete) => {}
                other => panic!("cut at {} gave {:?}", cut, other),
            }
        }
    }

    #[test]
    fn test_corruption_fails_crc() {
        let encoded = encode_record(&Notification::Remove {
            event_id: 2,
            key: "key".to_string(),
        });
        let mut corrupted = encoded.to_vec();
        corrupted[6] ^= 0xFF;
        assert!(matches!(
            decode_record(&corrupted),
            Err(RecordError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_consumes_one_record_from_stream() {
        let first = encode_record(&Notification::Clear { event_id: 1 });
        let second = encode_record(&Notification::Remove {
            event_id: 2,
            key: "k".to_string(),
        });
        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);

        let (note, consumed) = decode_record(&stream).unwrap();
        assert_eq!(note.event_id(), 1);
        let (note, _) = decode_record(&stream[consumed..]).unwrap();
        assert_eq!(note.event_id(), 2);
    }
}
