//! Byte-level marshalling for command payloads.
//!
//! All integers are little-endian. Pointers are never sent: an optional
//! pointee is preceded by a one-byte present marker (1 = pointee follows,
//! 0 = null), arrays prepend a u32 element count, and strings travel as
//! `{u32 length-including-nul, bytes}` where a zero length denotes null.
//! Handles are serialized as their boxed 64-bit value.

use crate::handle::BoxedHandle;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("short buffer: needed {needed} bytes, {available} available")]
    ShortBuffer { needed: usize, available: usize },

    #[error("invalid present marker {0:#04x}")]
    BadMarker(u8),

    #[error("invalid enum tag {tag} for {what}")]
    BadTag { what: &'static str, tag: u32 },

    #[error("unknown opcode {0:#x}")]
    BadOpcode(u32),

    #[error("string is not valid UTF-8 or missing NUL")]
    BadString,

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Growable little-endian payload writer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_handle(&mut self, h: BoxedHandle) {
        self.write_u64(h);
    }

    /// Raw bytes, no length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// u32 length prefix followed by the bytes.
    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// Present marker followed by the pointee when `Some`.
    pub fn write_opt<T>(&mut self, value: Option<&T>, f: impl FnOnce(&mut Self, &T)) {
        match value {
            Some(v) => {
                self.write_u8(1);
                f(self, v);
            }
            None => self.write_u8(0),
        }
    }

    /// u32 element count followed by each element.
    pub fn write_seq<T>(&mut self, items: &[T], mut f: impl FnMut(&mut Self, &T)) {
        self.write_u32(items.len() as u32);
        for item in items {
            f(self, item);
        }
    }

    pub fn write_u32_seq(&mut self, items: &[u32]) {
        self.write_seq(items, |w, v| w.write_u32(*v));
    }

    pub fn write_handle_seq(&mut self, items: &[BoxedHandle]) {
        self.write_seq(items, |w, v| w.write_u64(*v));
    }

    /// `{u32 length-including-nul, bytes, 0}`; zero length denotes null.
    /// The byte-exact layout is load-bearing for compatibility.
    pub fn write_string(&mut self, s: Option<&str>) {
        match s {
            Some(s) => {
                self.write_u32(s.len() as u32 + 1);
                self.buf.extend_from_slice(s.as_bytes());
                self.buf.push(0);
            }
            None => self.write_u32(0),
        }
    }
}

/// Little-endian payload reader over a borrowed buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::ShortBuffer {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_handle(&mut self) -> Result<BoxedHandle, DecodeError> {
        self.read_u64()
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_opt<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<Option<T>, DecodeError> {
        match self.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(f(self)?)),
            m => Err(DecodeError::BadMarker(m)),
        }
    }

    pub fn read_seq<T>(
        &mut self,
        mut f: impl FnMut(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<Vec<T>, DecodeError> {
        let count = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            out.push(f(self)?);
        }
        Ok(out)
    }

    pub fn read_u32_seq(&mut self) -> Result<Vec<u32>, DecodeError> {
        self.read_seq(|r| r.read_u32())
    }

    pub fn read_handle_seq(&mut self) -> Result<Vec<BoxedHandle>, DecodeError> {
        self.read_seq(|r| r.read_u64())
    }

    pub fn read_string(&mut self) -> Result<Option<String>, DecodeError> {
        let len = self.read_u32()? as usize;
        if len == 0 {
            return Ok(None);
        }
        let bytes = self.take(len)?;
        if bytes[len - 1] != 0 {
            return Err(DecodeError::BadString);
        }
        String::from_utf8(bytes[..len - 1].to_vec())
            .map(Some)
            .map_err(|_| DecodeError::BadString)
    }

    /// Fails if payload bytes are left over after decoding a command.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.remaining() != 0 {
            return Err(DecodeError::TrailingBytes(self.remaining()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut w = Writer::new();
        w.write_u8(0xAB);
        w.write_u32(0xDEAD_BEEF);
        w.write_u64(0x0123_4567_89AB_CDEF);
        w.write_i32(-42);
        w.write_bool(true);

        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(r.read_i32().unwrap(), -42);
        assert!(r.read_bool().unwrap());
        r.finish().unwrap();
    }

    #[test]
    fn string_layout_is_byte_exact() {
        let mut w = Writer::new();
        w.write_string(Some("abc"));
        // length includes the nul terminator
        assert_eq!(w.as_bytes(), &[4, 0, 0, 0, b'a', b'b', b'c', 0]);

        let mut w = Writer::new();
        w.write_string(None);
        assert_eq!(w.as_bytes(), &[0, 0, 0, 0]);

        let bytes = [4u8, 0, 0, 0, b'a', b'b', b'c', 0];
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_string().unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn optional_pointee_markers() {
        let mut w = Writer::new();
        w.write_opt(Some(&7u32), |w, v| w.write_u32(*v));
        w.write_opt::<u32>(None, |w, v| w.write_u32(*v));

        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_opt(|r| r.read_u32()).unwrap(), Some(7));
        assert_eq!(r.read_opt(|r| r.read_u32()).unwrap(), None);

        let bad = [2u8];
        let mut r = Reader::new(&bad);
        assert_eq!(
            r.read_opt(|r| r.read_u32()),
            Err(DecodeError::BadMarker(2))
        );
    }

    #[test]
    fn short_buffer_is_an_error() {
        let mut r = Reader::new(&[1, 2]);
        assert!(matches!(
            r.read_u32(),
            Err(DecodeError::ShortBuffer { needed: 4, available: 2 })
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let r = Reader::new(&[0u8; 3]);
        assert_eq!(r.finish(), Err(DecodeError::TrailingBytes(3)));
    }
}
