//! Little-endian field primitives shared by layer save and load.
//!
//! The per-layer format is a fixed sequence of fields: length-prefixed UTF-8
//! strings, `u32`/`u64` integers, and blobs framed as four `u64` dims followed
//! by the `f32` payload. Truncated or malformed input surfaces as an error
//! with the originating cause intact.

use std::io::{Read, Write};

use anyhow::{anyhow, ensure, Context, Result};

use crate::tensor::Blob;

/// Largest element count accepted for a single blob payload; dims claiming
/// more than this are treated as corrupt input rather than allocated.
const MAX_BLOB_LEN: usize = 1 << 28;

pub fn write_u32(w: &mut dyn Write, value: u32) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_u32(r: &mut dyn Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).context("truncated field (u32)")?;
    Ok(u32::from_le_bytes(buf))
}

pub fn write_u64(w: &mut dyn Write, value: u64) -> Result<()> {
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_u64(r: &mut dyn Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).context("truncated field (u64)")?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_u8(w: &mut dyn Write, value: u8) -> Result<()> {
    w.write_all(&[value])?;
    Ok(())
}

pub fn read_u8(r: &mut dyn Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf).context("truncated field (u8)")?;
    Ok(buf[0])
}

/// Writes a length-prefixed UTF-8 string.
pub fn write_string(w: &mut dyn Write, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    write_u32(w, bytes.len() as u32)?;
    w.write_all(bytes)?;
    Ok(())
}

pub fn read_string(r: &mut dyn Read) -> Result<String> {
    let len = read_u32(r)? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes).context("truncated string field")?;
    String::from_utf8(bytes).map_err(|e| anyhow!("string field is not valid UTF-8: {}", e))
}

/// Writes a blob as four `u64` dims followed by the `f32` payload.
pub fn write_blob(w: &mut dyn Write, blob: &Blob) -> Result<()> {
    for dim in blob.dims() {
        write_u64(w, dim as u64)?;
    }
    for &value in blob.data() {
        w.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

pub fn read_blob(r: &mut dyn Read) -> Result<Blob> {
    let mut dims = [0usize; 4];
    for dim in dims.iter_mut() {
        let value = read_u64(r)?;
        *dim = usize::try_from(value).map_err(|_| anyhow!("blob dim {} out of range", value))?;
    }
    let len = dims
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| anyhow!("blob dims {:?} overflow the element count", dims))?;
    ensure!(
        len <= MAX_BLOB_LEN,
        "blob of {} elements exceeds the {} element limit",
        len,
        MAX_BLOB_LEN
    );
    let mut data = Vec::with_capacity(len);
    let mut buf = [0u8; 4];
    for _ in 0..len {
        r.read_exact(&mut buf).context("truncated blob payload")?;
        data.push(f32::from_le_bytes(buf));
    }
    Blob::from_vec(dims[0], dims[1], dims[2], dims[3], data)
}
