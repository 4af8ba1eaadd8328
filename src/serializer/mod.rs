//! # Binary Serializer Registry
//!
//! Typed values stored inside index pages are encoded through serializers
//! identified by a stable one-byte id. The id is part of the durable format:
//! bonsai buckets record the key and value serializer ids in their headers so
//! a tree can be re-opened with the right codecs, and an unknown id on open
//! is reported as corruption rather than misread data.
//!
//! Serializers are stateless singletons. Keys additionally pass through
//! [`BinarySerializer::preprocess`] before comparison so that every key type
//! is byte-comparable once encoded.

use eyre::{ensure, Result};

/// Stable serializer ids. Part of the on-disk format; never renumber.
pub const U32_SERIALIZER_ID: u8 = 8;
pub const U64_SERIALIZER_ID: u8 = 10;
pub const STRING_SERIALIZER_ID: u8 = 13;
pub const BYTES_SERIALIZER_ID: u8 = 17;

/// Returns the human-readable name for a serializer id, or `None` if the id
/// is not registered. Used to turn an unknown id on open into a corruption
/// error that names what was expected.
pub fn serializer_name(id: u8) -> Option<&'static str> {
    match id {
        U32_SERIALIZER_ID => Some("u32"),
        U64_SERIALIZER_ID => Some("u64"),
        STRING_SERIALIZER_ID => Some("string"),
        BYTES_SERIALIZER_ID => Some("bytes"),
        _ => None,
    }
}

/// Encoding of a single value type into page bytes.
///
/// `serialize` must write exactly `object_size(obj)` bytes and `stored_size`
/// must report the same count when pointed at the serialized form, so that
/// bucket layouts can walk entries without a separate length prefix where the
/// type is fixed-size.
pub trait BinarySerializer<T>: Send + Sync {
    /// Stable format id recorded in bucket headers.
    fn id(&self) -> u8;

    /// Serialized size of `obj` in bytes.
    fn object_size(&self, obj: &T) -> usize;

    /// Size of the serialized object starting at `buf[offset..]`.
    fn stored_size(&self, buf: &[u8], offset: usize) -> Result<usize>;

    /// Writes `obj` at `buf[offset..]`.
    fn serialize(&self, obj: &T, buf: &mut [u8], offset: usize);

    /// Reads an object from `buf[offset..]`.
    fn deserialize(&self, buf: &[u8], offset: usize) -> Result<T>;

    /// Normalises a key before comparison and storage. Identity for types
    /// whose natural encoding is already byte-comparable.
    fn preprocess(&self, obj: T) -> T {
        obj
    }
}

/// Fixed four-byte little-endian unsigned integer.
#[derive(Debug, Clone, Copy, Default)]
pub struct U32Serializer;

impl BinarySerializer<u32> for U32Serializer {
    fn id(&self) -> u8 {
        U32_SERIALIZER_ID
    }

    fn object_size(&self, _obj: &u32) -> usize {
        4
    }

    fn stored_size(&self, buf: &[u8], offset: usize) -> Result<usize> {
        ensure!(offset + 4 <= buf.len(), "u32 extends past buffer end");
        Ok(4)
    }

    fn serialize(&self, obj: &u32, buf: &mut [u8], offset: usize) {
        buf[offset..offset + 4].copy_from_slice(&obj.to_le_bytes());
    }

    fn deserialize(&self, buf: &[u8], offset: usize) -> Result<u32> {
        ensure!(offset + 4 <= buf.len(), "u32 extends past buffer end");
        let bytes: [u8; 4] = buf[offset..offset + 4].try_into().unwrap(); // INVARIANT: length validated by ensure above
        Ok(u32::from_le_bytes(bytes))
    }
}

/// Fixed eight-byte little-endian unsigned integer.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Serializer;

impl BinarySerializer<u64> for U64Serializer {
    fn id(&self) -> u8 {
        U64_SERIALIZER_ID
    }

    fn object_size(&self, _obj: &u64) -> usize {
        8
    }

    fn stored_size(&self, buf: &[u8], offset: usize) -> Result<usize> {
        ensure!(offset + 8 <= buf.len(), "u64 extends past buffer end");
        Ok(8)
    }

    fn serialize(&self, obj: &u64, buf: &mut [u8], offset: usize) {
        buf[offset..offset + 8].copy_from_slice(&obj.to_le_bytes());
    }

    fn deserialize(&self, buf: &[u8], offset: usize) -> Result<u64> {
        ensure!(offset + 8 <= buf.len(), "u64 extends past buffer end");
        let bytes: [u8; 8] = buf[offset..offset + 8].try_into().unwrap(); // INVARIANT: length validated by ensure above
        Ok(u64::from_le_bytes(bytes))
    }
}

/// UTF-8 string with a u16 length prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl BinarySerializer<String> for StringSerializer {
    fn id(&self) -> u8 {
        STRING_SERIALIZER_ID
    }

    fn object_size(&self, obj: &String) -> usize {
        2 + obj.len()
    }

    fn stored_size(&self, buf: &[u8], offset: usize) -> Result<usize> {
        ensure!(offset + 2 <= buf.len(), "string length extends past buffer end");
        let len = u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap()) as usize; // INVARIANT: length validated by ensure above
        ensure!(
            offset + 2 + len <= buf.len(),
            "string body extends past buffer end"
        );
        Ok(2 + len)
    }

    fn serialize(&self, obj: &String, buf: &mut [u8], offset: usize) {
        let len = obj.len() as u16;
        buf[offset..offset + 2].copy_from_slice(&len.to_le_bytes());
        buf[offset + 2..offset + 2 + obj.len()].copy_from_slice(obj.as_bytes());
    }

    fn deserialize(&self, buf: &[u8], offset: usize) -> Result<String> {
        let total = self.stored_size(buf, offset)?;
        let body = &buf[offset + 2..offset + total];
        String::from_utf8(body.to_vec()).map_err(|e| eyre::eyre!("invalid utf-8 in stored string: {}", e))
    }
}

/// Raw byte payload with a u16 length prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl BinarySerializer<Vec<u8>> for BytesSerializer {
    fn id(&self) -> u8 {
        BYTES_SERIALIZER_ID
    }

    fn object_size(&self, obj: &Vec<u8>) -> usize {
        2 + obj.len()
    }

    fn stored_size(&self, buf: &[u8], offset: usize) -> Result<usize> {
        ensure!(offset + 2 <= buf.len(), "bytes length extends past buffer end");
        let len = u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap()) as usize; // INVARIANT: length validated by ensure above
        ensure!(
            offset + 2 + len <= buf.len(),
            "bytes body extends past buffer end"
        );
        Ok(2 + len)
    }

    fn serialize(&self, obj: &Vec<u8>, buf: &mut [u8], offset: usize) {
        let len = obj.len() as u16;
        buf[offset..offset + 2].copy_from_slice(&len.to_le_bytes());
        buf[offset + 2..offset + 2 + obj.len()].copy_from_slice(obj);
    }

    fn deserialize(&self, buf: &[u8], offset: usize) -> Result<Vec<u8>> {
        let total = self.stored_size(buf, offset)?;
        Ok(buf[offset + 2..offset + total].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_roundtrip() {
        let ser = U64Serializer;
        let mut buf = vec![0u8; 16];
        ser.serialize(&0xDEAD_BEEF_CAFE_0042, &mut buf, 3);
        assert_eq!(ser.stored_size(&buf, 3).unwrap(), 8);
        assert_eq!(ser.deserialize(&buf, 3).unwrap(), 0xDEAD_BEEF_CAFE_0042);
    }

    #[test]
    fn string_roundtrip() {
        let ser = StringSerializer;
        let value = "bucket prefix".to_string();
        let mut buf = vec![0u8; ser.object_size(&value) + 4];
        ser.serialize(&value, &mut buf, 4);
        assert_eq!(ser.stored_size(&buf, 4).unwrap(), 2 + value.len());
        assert_eq!(ser.deserialize(&buf, 4).unwrap(), value);
    }

    #[test]
    fn bytes_roundtrip() {
        let ser = BytesSerializer;
        let value = vec![1u8, 2, 3, 4, 5];
        let mut buf = vec![0u8; 16];
        ser.serialize(&value, &mut buf, 0);
        assert_eq!(ser.deserialize(&buf, 0).unwrap(), value);
    }

    #[test]
    fn truncated_string_fails() {
        let ser = StringSerializer;
        let value = "hello".to_string();
        let mut buf = vec![0u8; 16];
        ser.serialize(&value, &mut buf, 0);
        assert!(ser.stored_size(&buf[..4], 0).is_err());
    }

    #[test]
    fn registry_knows_all_ids() {
        for id in [
            U32_SERIALIZER_ID,
            U64_SERIALIZER_ID,
            STRING_SERIALIZER_ID,
            BYTES_SERIALIZER_ID,
        ] {
            assert!(serializer_name(id).is_some());
        }
        assert!(serializer_name(99).is_none());
    }
}
