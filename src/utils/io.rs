use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::DbError;
use crate::types::DbResult;

/// A file handle with positioned reads and writes, shared between threads.
///
/// All access goes through an internal mutex; callers never observe a partial
/// seek+read interleaving.
pub struct DbFile {
    file: Mutex<File>,
}

impl DbFile {
    pub fn open<P: AsRef<Path>>(path: P, create: bool, read_only: bool) -> Result<Self, DbError> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(create && !read_only)
            .open(path)
            .map_err(|e| DbError::io("opening a database file", e))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn from_file(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> DbResult {
        let mut file = self.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| DbError::io("seeking for a read", e))?;
        file.read_exact(buf)
            .map_err(|e| DbError::io("reading a database file", e))
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> DbResult {
        let mut file = self.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| DbError::io("seeking for a write", e))?;
        file.write_all(buf)
            .map_err(|e| DbError::io("writing a database file", e))
    }

    pub fn len(&self) -> Result<u64, DbError> {
        let file = self.lock();
        let meta = file
            .metadata()
            .map_err(|e| DbError::io("reading file metadata", e))?;
        Ok(meta.len())
    }

    pub fn set_len(&self, len: u64) -> DbResult {
        self.lock()
            .set_len(len)
            .map_err(|e| DbError::io("resizing a database file", e))
    }

    pub fn sync_all(&self) -> DbResult {
        self.lock()
            .sync_all()
            .map_err(|e| DbError::io("syncing a database file", e))
    }

    pub fn lock(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap()
    }
}

/// Growable little-endian byte sink for page and record encoding.
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        let mut tmp = [0u8; 2];
        LittleEndian::write_u16(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_u32(&mut self, v: u32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_u64(&mut self, v: u64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_u64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    /// Page ids are stored in 6 bytes inside fragment pointers.
    pub fn write_u48(&mut self, v: u64) {
        let mut tmp = [0u8; 8];
        LittleEndian::write_u64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp[..6]);
    }

    pub fn write_bytes_u16(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= u16::max_value() as usize);
        self.write_u16(bytes.len() as u16);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_bytes_u32(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Pad with zeroes up to `size`. Panics if the content already exceeds it;
    /// capacity checks belong to the caller.
    pub fn into_padded_vec(mut self, size: usize) -> Vec<u8> {
        assert!(
            self.buf.len() <= size,
            "encoded content larger than the target: {} > {}",
            self.buf.len(),
            size
        );
        self.buf.resize(size, 0);
        self.buf
    }
}

/// Bounds-checked little-endian reader over a byte slice. Overruns surface as
/// corruption errors rather than panics, since the input usually came from
/// disk.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DbError> {
        if self.pos + n > self.buf.len() {
            return Err(DbError::corrupt(format!(
                "unexpected end of encoded data: wanted {} bytes at offset {} of {}",
                n,
                self.pos,
                self.buf.len()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DbError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DbError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, DbError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, DbError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn read_u48(&mut self) -> Result<u64, DbError> {
        let bytes = self.take(6)?;
        let mut tmp = [0u8; 8];
        tmp[..6].copy_from_slice(bytes);
        Ok(LittleEndian::read_u64(&tmp))
    }

    pub fn read_bytes_u16(&mut self) -> Result<&'a [u8], DbError> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    pub fn read_bytes_u32(&mut self) -> Result<&'a [u8], DbError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    pub fn read_raw(&mut self, n: usize) -> Result<&'a [u8], DbError> {
        self.take(n)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

pub trait Encodeable {
    fn encode(&self, w: &mut ByteWriter);
}

pub trait Decodeable: Sized {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self, DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_fixed_widths() {
        let mut w = ByteWriter::new();
        w.write_u8(7);
        w.write_u16(0xbeef);
        w.write_u32(0xdead_beef);
        w.write_u64(0x0102_0304_0506_0708);
        w.write_u48((1 << 48) - 2);
        let buf = w.into_vec();

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_u16().unwrap(), 0xbeef);
        assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.read_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(r.read_u48().unwrap(), (1 << 48) - 2);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_overrun_is_corruption() {
        let mut r = ByteReader::new(&[1, 2]);
        assert!(r.read_u64().is_err());
    }

    #[test]
    fn test_length_prefixed_slices() {
        let mut w = ByteWriter::new();
        w.write_bytes_u16(b"key");
        w.write_bytes_u32(b"value");
        let buf = w.into_vec();

        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read_bytes_u16().unwrap(), b"key");
        assert_eq!(r.read_bytes_u32().unwrap(), b"value");
    }
}
