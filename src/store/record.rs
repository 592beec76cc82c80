//! Log record format of the secondary store.
//!
//! ```text
//! +------------+-------+--------------+--------------+-------+-----------+----------+
//! | len: u32   | flags | rid addr u64 | rid ver u32  | n: u8 | n x slot  | crc: u64 |
//! +------------+-------+--------------+--------------+-------+-----------+----------+
//! slot = ordinal: u8 | null: u8 | previous_address: u64 | key_len: u16 | key
//! ```
//!
//! All integers are big-endian. `len` covers the whole record including
//! itself and the trailing CRC-64, which is computed over every preceding byte.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::psf::{CompositeKey, KeyPointer, RecordId};
use crate::{Error, Hasher};

const FLAG_TOMBSTONE: u8 = 0x01;

/// Bytes before the slots: len + flags + address + version + slot count.
const FIXED_PREFIX: usize = 4 + 1 + 8 + 4 + 1;
const CHECKSUM_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub record_id: RecordId,
    pub tombstone: bool,
    pub key: CompositeKey,
}

impl LogRecord {
    pub fn new(record_id: RecordId, key: CompositeKey, tombstone: bool) -> Self {
        Self {
            record_id,
            tombstone,
            key,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let slots: usize = self
            .key
            .pointers
            .iter()
            .map(|kp| 1 + 1 + 8 + 2 + kp.key.as_ref().map_or(0, |k| k.len()))
            .sum();
        FIXED_PREFIX + slots + CHECKSUM_SIZE
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let len = self.encoded_len();
        let mut buf = Vec::with_capacity(len);

        buf.write_u32::<BigEndian>(len as u32)?;
        buf.write_u8(if self.tombstone { FLAG_TOMBSTONE } else { 0 })?;
        buf.write_u64::<BigEndian>(self.record_id.address)?;
        buf.write_u32::<BigEndian>(self.record_id.version)?;
        buf.write_u8(self.key.pointers.len() as u8)?;

        for kp in &self.key.pointers {
            buf.write_u8(kp.ordinal)?;
            buf.write_u8(kp.is_null() as u8)?;
            buf.write_u64::<BigEndian>(kp.previous_address)?;
            let key = kp.key.as_deref().unwrap_or(&[]);
            buf.write_u16::<BigEndian>(key.len() as u16)?;
            buf.write_all(key)?;
        }

        let checksum = Hasher::checksum_of(&buf);
        buf.write_u64::<BigEndian>(checksum)?;
        Ok(buf)
    }

    /// Reads the length prefix of an encoded record.
    pub fn peek_len(bytes: &[u8]) -> Result<usize> {
        if bytes.len() < 4 {
            return Err(Error::CorruptedRecord("truncated length prefix".to_string()));
        }
        let len = Cursor::new(bytes).read_u32::<BigEndian>()? as usize;
        if len < FIXED_PREFIX + CHECKSUM_SIZE {
            return Err(Error::CorruptedRecord(format!("invalid record length {}", len)));
        }
        Ok(len)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let len = Self::peek_len(bytes)?;
        if bytes.len() < len {
            return Err(Error::CorruptedRecord(format!(
                "record needs {} bytes, have {}",
                len,
                bytes.len()
            )));
        }

        let body = &bytes[..len - CHECKSUM_SIZE];
        let stored = Cursor::new(&bytes[len - CHECKSUM_SIZE..len]).read_u64::<BigEndian>()?;
        if Hasher::checksum_of(body) != stored {
            return Err(Error::ChecksumMismatch);
        }

        let mut reader = Cursor::new(body);
        reader.read_u32::<BigEndian>()?;
        let flags = reader.read_u8()?;
        let address = reader.read_u64::<BigEndian>()?;
        let version = reader.read_u32::<BigEndian>()?;
        let count = reader.read_u8()? as usize;

        let mut pointers = Vec::with_capacity(count);
        for _ in 0..count {
            let ordinal = reader.read_u8()?;
            let is_null = reader.read_u8()? != 0;
            let previous_address = reader.read_u64::<BigEndian>()?;
            let key_len = reader.read_u16::<BigEndian>()? as usize;
            let mut key = vec![0u8; key_len];
            reader.read_exact(&mut key)?;

            let mut kp = KeyPointer::new(ordinal, (!is_null).then_some(key));
            kp.previous_address = previous_address;
            pointers.push(kp);
        }

        Ok(Self {
            record_id: RecordId::new(address, version),
            tombstone: flags & FLAG_TOMBSTONE != 0,
            key: CompositeKey { pointers },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogRecord {
        let mut key = CompositeKey::from_outputs(vec![Some(vec![2, 0, 7]), None]);
        key.pointers[0].previous_address = 1234;
        LogRecord::new(RecordId::new(99, 3), key, true)
    }

    #[test]
    fn test_encode_decode() {
        let record = sample();
        let bytes = record.encode().unwrap();

        assert_eq!(bytes.len(), record.encoded_len());
        assert_eq!(LogRecord::peek_len(&bytes).unwrap(), bytes.len());

        let decoded = LogRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.key.pointers[0].previous_address, 1234);
        assert!(decoded.key.pointers[1].is_null());
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let record = sample();
        let mut bytes = record.encode().unwrap();
        bytes.extend_from_slice(&[0xAA; 16]);
        assert_eq!(LogRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_corruption_detected() {
        let mut bytes = sample().encode().unwrap();
        bytes[6] ^= 0x01;
        assert!(matches!(
            LogRecord::decode(&bytes),
            Err(Error::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_truncated() {
        let bytes = sample().encode().unwrap();
        assert!(matches!(
            LogRecord::decode(&bytes[..bytes.len() - 1]),
            Err(Error::CorruptedRecord(_))
        ));
        assert!(LogRecord::peek_len(&[0, 0]).is_err());
    }
}
