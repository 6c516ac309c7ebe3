//! Checked primitive readers and writers for the wire format.
//!
//! `bytes::Buf` panics on underflow, so every read goes through these
//! helpers, which turn a short buffer into [`ProtoError::Malformed`]
//! carrying the name of the field that failed.

use bytes::{Buf, BufMut, Bytes};

use crate::ProtoError;

pub(crate) fn get_u16(buf: &mut impl Buf, field: &'static str) -> Result<u16, ProtoError> {
    if buf.remaining() < 2 {
        return Err(ProtoError::Malformed(field));
    }
    Ok(buf.get_u16_le())
}

pub(crate) fn get_u32(buf: &mut impl Buf, field: &'static str) -> Result<u32, ProtoError> {
    if buf.remaining() < 4 {
        return Err(ProtoError::Malformed(field));
    }
    Ok(buf.get_u32_le())
}

/// Reads a `u16`-length-prefixed byte blob.
pub(crate) fn get_blob(buf: &mut impl Buf, field: &'static str) -> Result<Bytes, ProtoError> {
    let len = get_u16(buf, field)? as usize;
    if buf.remaining() < len {
        return Err(ProtoError::Malformed(field));
    }
    Ok(buf.copy_to_bytes(len))
}

/// Reads a `u16`-length-prefixed UTF-8 string.
pub(crate) fn get_string(buf: &mut impl Buf, field: &'static str) -> Result<String, ProtoError> {
    let blob = get_blob(buf, field)?;
    String::from_utf8(blob.to_vec()).map_err(|_| ProtoError::Malformed(field))
}

/// Reads exactly `N` raw bytes (no length prefix).
pub(crate) fn get_array<const N: usize>(
    buf: &mut impl Buf,
    field: &'static str,
) -> Result<[u8; N], ProtoError> {
    if buf.remaining() < N {
        return Err(ProtoError::Malformed(field));
    }
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub(crate) fn put_blob(
    buf: &mut impl BufMut,
    data: &[u8],
    field: &'static str,
) -> Result<(), ProtoError> {
    let len = u16::try_from(data.len()).map_err(|_| ProtoError::Oversize(field))?;
    buf.put_u16_le(len);
    buf.put_slice(data);
    Ok(())
}

pub(crate) fn put_string(
    buf: &mut impl BufMut,
    s: &str,
    field: &'static str,
) -> Result<(), ProtoError> {
    put_blob(buf, s.as_bytes(), field)
}
