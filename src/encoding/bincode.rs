use super::EncodingError;
use crate::error::Result;
use crate::{Error, Hasher};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Serialize a value using bincode
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| EncodingError::InvalidFormat(format!("Serialization failed: {}", e)).into())
}

/// Deserialize a value from a byte slice using bincode
pub fn deserialize<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| EncodingError::InvalidFormat(format!("Deserialization failed: {}", e)).into())
}

/// Write `value` as `u32 length | payload | u64 checksum`.
pub fn serialize_framed<T: Serialize, W: Write>(mut writer: W, value: &T) -> Result<()> {
    let payload = serialize(value)?;
    let mut hasher = Hasher::new();
    hasher.write(&payload);

    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(&payload)?;
    writer.write_u64::<BigEndian>(hasher.checksum())?;
    Ok(())
}

/// Read a value written by [`serialize_framed`], verifying its checksum.
pub fn deserialize_framed<T: for<'a> Deserialize<'a>, R: Read>(mut reader: R) -> Result<T> {
    let len = reader.read_u32::<BigEndian>().map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => EncodingError::TruncatedData.into(),
        _ => Error::IoError(e),
    })? as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    let stored = reader.read_u64::<BigEndian>()?;

    let mut hasher = Hasher::new();
    hasher.write(&payload);
    if hasher.checksum() != stored {
        return Err(Error::ChecksumMismatch);
    }
    deserialize(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestStruct {
        id: u32,
        name: String,
        active: bool,
    }

    #[test]
    fn test_serialize_deserialize() {
        let original = TestStruct {
            id: 42,
            name: "test".to_string(),
            active: true,
        };

        let serialized = serialize(&original).unwrap();
        let deserialized: TestStruct = deserialize(&serialized).unwrap();

        assert_eq!(original, deserialized);
    }

    #[test]
    fn test_framed_detects_corruption() {
        let original = TestStruct {
            id: 7,
            name: "framed".to_string(),
            active: false,
        };

        let mut buffer = Vec::new();
        serialize_framed(&mut buffer, &original).unwrap();
        let decoded: TestStruct = deserialize_framed(buffer.as_slice()).unwrap();
        assert_eq!(decoded, original);

        // Flip a payload byte
        buffer[6] ^= 0xFF;
        let result: Result<TestStruct> = deserialize_framed(buffer.as_slice());
        assert!(matches!(result, Err(Error::ChecksumMismatch)));
    }

    #[test]
    fn test_framed_truncated() {
        let empty: &[u8] = &[];
        let result: Result<TestStruct> = deserialize_framed(empty);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_data() {
        let invalid_data = vec![0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<String> = deserialize(&invalid_data);
        assert!(result.is_err());
    }
}
