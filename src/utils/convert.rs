use crate::Result;
use crate::StorageError;

/// Converts a `u64` to an 8-byte array in big-endian byte order so that
/// persisted keys sort numerically.
pub const fn safe_kv(num: u64) -> [u8; 8] {
    num.to_be_bytes()
}

pub fn safe_vk<K: AsRef<[u8]>>(bytes: K) -> Result<u64> {
    let bytes = bytes.as_ref();
    let array: [u8; 8] = bytes.try_into().map_err(|_| StorageError::DataCorruption {
        location: format!("expected 8 key bytes, found {}", bytes.len()),
    })?;
    Ok(u64::from_be_bytes(array))
}

/// Maps a signed id onto an order-preserving big-endian key.
pub const fn signed_kv(num: i64) -> [u8; 8] {
    ((num as u64) ^ (1 << 63)).to_be_bytes()
}

pub fn signed_vk<K: AsRef<[u8]>>(bytes: K) -> Result<i64> {
    let raw = safe_vk(bytes)?;
    Ok((raw ^ (1 << 63)) as i64)
}

/// Serialize a persisted record.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Deserialize a persisted record.
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
