//! Growable byte buffers for assembling wire frames, plus reading helpers for
//!  the opposite direction.
//!
//! The writer is backed by a plain `Vec<u8>` with a separate length cursor so
//!  that regions can be padded, patched and shifted without reallocating. It
//!  implements `BufMut` to fit into the `bytes` ecosystem.
//!
//! Reading happens on borrowed `&[u8]` slices through the `bytes` / `bytes-varint`
//!  `try_get_*` family: every primitive read fails instead of panicking when the
//!  remaining slice is too short. All integers on the wire are little-endian,
//!  strings are varint-length-prefixed UTF-8.

use bytes::buf::UninitSlice;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use std::fmt::{Debug, Formatter};

/// A growable write buffer with a length cursor.
#[derive(Eq)]
pub struct WireWriter {
    buf: Vec<u8>,
    len: usize,
}

impl WireWriter {
    const INITIAL_CAPACITY: usize = 64;

    pub fn new() -> WireWriter {
        Self::with_capacity(Self::INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> WireWriter {
        WireWriter {
            // the backing buffer is fully initialized up front - buffers are reused
            //  aggressively through the pool, so the one-time cost is irrelevant
            buf: vec![0; capacity.max(Self::INITIAL_CAPACITY)],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// ensure room for `additional` more bytes, doubling the backing buffer on overflow
    fn ensure_additional(&mut self, additional: usize) {
        let required = self.len + additional;
        if required > self.buf.len() {
            let new_capacity = (self.buf.len() * 2).max(required);
            self.buf.resize(new_capacity, 0);
        }
    }

    /// advance the cursor by `n` zero bytes without writing payload data
    pub fn pad(&mut self, n: usize) {
        self.ensure_additional(n);
        self.buf[self.len..self.len + n].fill(0);
        self.len += n;
    }

    /// shift everything from `offset` onward to the right and insert `src` at `offset`
    pub fn insert_bytes(&mut self, offset: usize, src: &[u8]) {
        assert!(offset <= self.len, "insert offset past the end of written data");
        self.ensure_additional(src.len());
        self.buf.copy_within(offset..self.len, offset + src.len());
        self.buf[offset..offset + src.len()].copy_from_slice(src);
        self.len += src.len();
    }

    /// overwrite four already-written bytes at `offset` with a little-endian u32
    pub fn patch_u32_le(&mut self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.len, "patch region not written yet");
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn truncate(&mut self, len: usize) {
        assert!(len <= self.len);
        self.len = len;
    }
}

impl Default for WireWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for WireWriter {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for WireWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl AsRef<[u8]> for WireWriter {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsMut<[u8]> for WireWriter {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl BufMut for WireWriter {
    fn remaining_mut(&self) -> usize {
        usize::MAX - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.buf.len());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        if self.len == self.buf.len() {
            self.ensure_additional(Self::INITIAL_CAPACITY);
        }
        UninitSlice::new(&mut self.buf[self.len..])
    }
}


pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut &[u8]) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    let raw = try_get_exact(buf, len)?;
    Ok(String::from_utf8(raw)?)
}

pub fn try_get_exact(buf: &mut &[u8], n: usize) -> anyhow::Result<Vec<u8>> {
    if buf.remaining() < n {
        anyhow::bail!("buffer too short: {} bytes required, {} remaining", n, buf.remaining());
    }
    let result = buf[..n].to_vec();
    buf.advance(n);
    Ok(result)
}
