//! Binary layout of log records
//!
//! Record = RecordHeader (16 bytes) + payload
//! Payload = db_id(u16 LE) + key_len(u16 LE) + value_len(u32 LE) + key + value
//!
//! The checksum covers the operation byte and the payload, so a flipped
//! operation is caught as well as a damaged key or value.

use std::path::PathBuf;

use crate::error::{KvError, KvResult};

/// Magic bytes opening every log record: "NSKV"
pub const MAGIC_ARRAY: [u8; 4] = *b"NSKV";

/// Record header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Fixed part of the payload ahead of the key bytes
pub const PAYLOAD_PREFIX_SIZE: usize = 8;

/// Logged operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or replace a value
    Put = 1,
    /// Remove a key
    Delete = 2,
    /// Register a named database; key = name, value empty
    CreateDatabase = 3,
}

impl Operation {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Operation::Put),
            2 => Some(Operation::Delete),
            3 => Some(Operation::CreateDatabase),
            _ => None,
        }
    }
}

/// Fixed-size record header
///
/// ```text
/// 0..4    magic       "NSKV"
/// 4..8    length      u32 LE, payload bytes
/// 8..12   checksum    u32 LE, CRC32C of op byte then payload
/// 12      operation
/// 13..16  zero
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub operation: u8,
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(word)
}

impl RecordHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let fields = [self.magic, self.length.to_le_bytes(), self.checksum.to_le_bytes()];
        for (slot, field) in out.chunks_exact_mut(4).zip(fields.iter()) {
            slot.copy_from_slice(field);
        }
        out[12] = self.operation;
        out
    }

    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&raw[..4]);
        RecordHeader { magic, length: le_u32(&raw[4..]), checksum: le_u32(&raw[8..]), operation: raw[12] }
    }
}

/// A decoded log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub db: u16,
    pub operation: Operation,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

fn record_checksum(op: u8, payload: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(&[op]), payload)
}

/// Encode one record. Keys longer than `u16::MAX` cannot be framed.
pub fn encode_record(db: u16, key: &[u8], value: &[u8], op: Operation) -> KvResult<Vec<u8>> {
    if key.len() > u16::MAX as usize {
        return Err(KvError::TooLarge {
            len: key.len() as u64,
            limit: u16::MAX as u64,
            what: "key",
        });
    }
    if value.len() > u32::MAX as usize - PAYLOAD_PREFIX_SIZE - u16::MAX as usize {
        return Err(KvError::TooLarge {
            len: value.len() as u64,
            limit: (u32::MAX as usize - PAYLOAD_PREFIX_SIZE - u16::MAX as usize) as u64,
            what: "value",
        });
    }

    let payload_size = PAYLOAD_PREFIX_SIZE + key.len() + value.len();
    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload_size);
    buffer.extend_from_slice(&[0u8; HEADER_SIZE]);
    buffer.extend_from_slice(&db.to_le_bytes());
    buffer.extend_from_slice(&(key.len() as u16).to_le_bytes());
    buffer.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buffer.extend_from_slice(key);
    buffer.extend_from_slice(value);

    let header = RecordHeader {
        magic: MAGIC_ARRAY,
        length: payload_size as u32,
        checksum: record_checksum(op as u8, &buffer[HEADER_SIZE..]),
        operation: op as u8,
    };
    buffer[..HEADER_SIZE].copy_from_slice(&header.encode());

    Ok(buffer)
}

/// Decode one record from the start of `data`.
///
/// `data` may extend past the record; the consumed length is
/// `HEADER_SIZE + header.length`.
pub fn decode_record(data: &[u8]) -> KvResult<(RecordHeader, LogRecord)> {
    let here = || PathBuf::from("<buffer>");

    if data.len() < HEADER_SIZE {
        return Err(KvError::Truncated {
            path: here(),
            needed: HEADER_SIZE as u64,
            have: data.len() as u64,
            offset: 0,
        });
    }

    let mut raw = [0u8; HEADER_SIZE];
    raw.copy_from_slice(&data[..HEADER_SIZE]);
    let header = RecordHeader::decode(&raw);

    if header.magic != MAGIC_ARRAY {
        return Err(KvError::BadMagic {
            path: here(),
            offset: 0,
            found: header.magic,
        });
    }

    let payload_end = HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(KvError::Truncated {
            path: here(),
            needed: header.length as u64,
            have: (data.len() - HEADER_SIZE) as u64,
            offset: HEADER_SIZE as u64,
        });
    }

    let payload = &data[HEADER_SIZE..payload_end];
    let computed = record_checksum(header.operation, payload);
    if computed != header.checksum {
        return Err(KvError::ChecksumMismatch {
            path: here(),
            stored: header.checksum,
            computed,
            offset: HEADER_SIZE as u64,
        });
    }

    let operation = Operation::from_byte(header.operation).ok_or_else(|| KvError::Corrupted {
        path: here(),
        offset: 12,
        reason: format!("invalid operation type: {}", header.operation),
    })?;

    if payload.len() < PAYLOAD_PREFIX_SIZE {
        return Err(KvError::Corrupted {
            path: here(),
            offset: HEADER_SIZE as u64,
            reason: "payload too short for length fields".to_string(),
        });
    }

    let db = u16::from_le_bytes([payload[0], payload[1]]);
    let key_len = u16::from_le_bytes([payload[2], payload[3]]) as usize;
    let value_len = le_u32(&payload[4..]) as usize;
    let key_end = PAYLOAD_PREFIX_SIZE + key_len;
    let record_end = key_end + value_len;

    if payload.len() != record_end {
        return Err(KvError::Corrupted {
            path: here(),
            offset: HEADER_SIZE as u64,
            reason: format!(
                "payload is {} bytes, key({}) + value({}) need {}",
                payload.len(), key_len, value_len, record_end
            ),
        });
    }

    Ok((
        header,
        LogRecord {
            db,
            operation,
            key: payload[PAYLOAD_PREFIX_SIZE..key_end].to_vec(),
            value: payload[key_end..].to_vec(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_record_roundtrip() {
        let bytes = encode_record(7, b"node-key", b"bundle-bytes", Operation::Put).unwrap();
        let (header, record) = decode_record(&bytes).unwrap();

        assert_eq!(header.magic, MAGIC_ARRAY);
        assert_eq!(header.length as usize + HEADER_SIZE, bytes.len());
        assert_eq!(record.db, 7);
        assert_eq!(record.key, b"node-key");
        assert_eq!(record.value, b"bundle-bytes");
        assert_eq!(record.operation, Operation::Put);
    }

    #[test]
    fn test_create_database_record() {
        let bytes = encode_record(3, b"bundles", b"", Operation::CreateDatabase).unwrap();
        let (_, record) = decode_record(&bytes).unwrap();
        assert_eq!(record.operation, Operation::CreateDatabase);
        assert_eq!(record.key, b"bundles");
        assert!(record.value.is_empty());
    }

    #[test]
    fn test_key_longer_than_u16_cannot_be_framed() {
        let key = vec![0u8; u16::MAX as usize + 1];
        let result = encode_record(0, &key, b"v", Operation::Put);
        assert!(matches!(result, Err(KvError::TooLarge { what: "key", .. })));
    }

    #[test]
    fn test_wrong_magic_reports_found_bytes() {
        let mut data = encode_record(1, b"k", b"v", Operation::Delete).unwrap();
        data[1] = b'X';
        match decode_record(&data) {
            Err(KvError::BadMagic { found, .. }) => assert_eq!(&found, b"NXKV"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_flipped_value_bit_fails_checksum() {
        let mut data = encode_record(0, b"key", b"value", Operation::Put).unwrap();
        *data.last_mut().unwrap() ^= 0x01;
        assert!(matches!(decode_record(&data), Err(KvError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_flipped_operation_detected() {
        let mut data = encode_record(0, b"key", b"value", Operation::Put).unwrap();
        data[12] = Operation::Delete as u8;
        assert!(matches!(decode_record(&data), Err(KvError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_record_is_torn() {
        let data = encode_record(0, b"key", b"value", Operation::Put).unwrap();
        let cut = &data[..data.len() - 2];
        assert!(matches!(decode_record(cut), Err(KvError::Truncated { .. })));
    }
}
