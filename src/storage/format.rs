//! Persisted value encoding
//!
//! The transaction core fixes only the cell header layout (a varlong
//! transaction id and a one-byte presence flag); the value body is
//! delegated to a type descriptor supplied by the storage layer. The
//! descriptor for plain `Value` payloads serializes with bincode.

use crate::{DbError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Byte marking an absent value in the persisted layout
pub const FLAG_ABSENT: u8 = 0;
/// Byte marking a present value in the persisted layout
pub const FLAG_PRESENT: u8 = 1;

/// Write an unsigned integer as LEB128 (7 bits per byte, high bit = more).
pub fn write_varlong(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Read a LEB128-encoded unsigned integer, advancing the slice.
pub fn read_varlong(buf: &mut &[u8]) -> Result<u64> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .first()
            .ok_or_else(|| DbError::InvalidData("varlong: unexpected end of buffer".into()))?;
        *buf = &buf[1..];
        if shift >= 64 {
            return Err(DbError::InvalidData("varlong: overflow".into()));
        }
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
    }
}

/// Pluggable (de)serializer for the value body of a versioned cell.
///
/// The storage layer supplies the descriptor; the core only frames it with
/// the transaction-id header and presence flag.
pub trait DataType<T>: Send + Sync {
    fn write(&self, buf: &mut Vec<u8>, v: &T) -> Result<()>;

    fn read(&self, buf: &mut &[u8]) -> Result<T>;

    /// Partial read used by scans that only need leading columns. The
    /// default reads the full value; columnar descriptors override it.
    fn read_meta(&self, buf: &mut &[u8], _col_count: usize) -> Result<T> {
        self.read(buf)
    }
}

/// Descriptor for `Value` payloads (and any other serde type).
#[derive(Debug, Default, Clone, Copy)]
pub struct ValueType;

impl<T: Serialize + DeserializeOwned> DataType<T> for ValueType {
    fn write(&self, buf: &mut Vec<u8>, v: &T) -> Result<()> {
        bincode::serialize_into(&mut *buf, v)?;
        Ok(())
    }

    fn read(&self, buf: &mut &[u8]) -> Result<T> {
        let v = bincode::deserialize_from(&mut *buf)?;
        Ok(v)
    }
}

/// Write an optional value: presence flag, then the body if present.
pub fn write_optional<T>(buf: &mut Vec<u8>, dt: &dyn DataType<T>, v: Option<&T>) -> Result<()> {
    match v {
        None => buf.push(FLAG_ABSENT),
        Some(v) => {
            buf.push(FLAG_PRESENT);
            dt.write(buf, v)?;
        }
    }
    Ok(())
}

/// Inverse of [`write_optional`].
pub fn read_optional<T>(buf: &mut &[u8], dt: &dyn DataType<T>) -> Result<Option<T>> {
    let flag = *buf
        .first()
        .ok_or_else(|| DbError::InvalidData("presence flag: unexpected end of buffer".into()))?;
    *buf = &buf[1..];
    match flag {
        FLAG_ABSENT => Ok(None),
        FLAG_PRESENT => Ok(Some(dt.read(buf)?)),
        other => Err(DbError::InvalidData(format!(
            "presence flag: invalid byte {other}"
        ))),
    }
}
