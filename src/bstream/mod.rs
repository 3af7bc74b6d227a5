//! Binary stream family used by the cache format.
//!
//! Three concrete sinks (plain file, in-memory buffer, gzip-compressed
//! file) sit behind a pair of trait seams. All multi-byte integers are
//! serialized big-endian regardless of the host, strings are
//! NUL-terminated, and byte vectors carry a `u32` length prefix.
//!
//! Reads return short values silently at end of input; callers check
//! `eof()`/`ok()` after a logical record instead of handling per-field
//! errors. This keeps record-level validation in one place (the codecs)
//! and makes a truncated file indistinguishable from a clean EOF until
//! the record is inspected.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Byte source under a [`BinReader`].
pub trait ReadSource: Send {
    /// Reads into `buf`, returning the number of bytes read (0 at EOF).
    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Current stream position in the logical (decompressed) byte stream.
    fn tell(&mut self) -> u64;
    /// Repositions the stream; returns false if the sink cannot seek.
    fn seek_to(&mut self, offset: u64) -> bool;
}

/// Byte sink under a [`BinWriter`].
pub trait WriteSink: Send {
    /// Writes the whole buffer.
    fn write_raw(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Logical bytes written so far (file offset for plain files).
    fn tell(&self) -> u64;
    /// Flushes buffered data; finishes the compressed member for gzip.
    fn flush_raw(&mut self) -> io::Result<()>;
    /// Hands out the accumulated buffer; only the memory sink has one.
    fn take_data(&mut self) -> Option<Vec<u8>> {
        None
    }
}

struct FileSource {
    inner: BufReader<File>,
}

impl ReadSource for FileSource {
    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn tell(&mut self) -> u64 {
        self.inner.stream_position().unwrap_or(0)
    }

    fn seek_to(&mut self, offset: u64) -> bool {
        self.inner.seek(SeekFrom::Start(offset)).is_ok()
    }
}

struct MemSource {
    inner: Cursor<Vec<u8>>,
}

impl ReadSource for MemSource {
    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn tell(&mut self) -> u64 {
        self.inner.position()
    }

    fn seek_to(&mut self, offset: u64) -> bool {
        self.inner.set_position(offset);
        true
    }
}

struct GzSource {
    inner: MultiGzDecoder<BufReader<File>>,
    pos: u64,
}

impl ReadSource for GzSource {
    fn read_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn tell(&mut self) -> u64 {
        self.pos
    }

    fn seek_to(&mut self, _offset: u64) -> bool {
        false
    }
}

struct FileSink {
    inner: BufWriter<File>,
    pos: u64,
}

impl WriteSink for FileSink {
    fn write_raw(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn flush_raw(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct MemSink {
    buf: Vec<u8>,
}

impl WriteSink for MemSink {
    fn write_raw(&mut self, buf: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.buf.len() as u64
    }

    fn flush_raw(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn take_data(&mut self) -> Option<Vec<u8>> {
        Some(std::mem::take(&mut self.buf))
    }
}

struct GzSink {
    inner: Option<GzEncoder<BufWriter<File>>>,
    pos: u64,
}

impl WriteSink for GzSink {
    fn write_raw(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(enc) => {
                enc.write_all(buf)?;
                self.pos += buf.len() as u64;
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "gzip stream already finished",
            )),
        }
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn flush_raw(&mut self) -> io::Result<()> {
        if let Some(enc) = self.inner.take() {
            let mut file = enc.finish()?;
            file.flush()?;
        }
        Ok(())
    }
}

/// Typed big-endian reader over one of the raw sources.
pub struct BinReader {
    src: Box<dyn ReadSource>,
    ok: bool,
    eof: bool,
}

impl BinReader {
    /// Opens a plain file for reading.
    pub fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::from_source(Box::new(FileSource {
            inner: BufReader::new(file),
        })))
    }

    /// Reads from an in-memory buffer.
    pub fn memory(data: Vec<u8>) -> Self {
        Self::from_source(Box::new(MemSource {
            inner: Cursor::new(data),
        }))
    }

    /// Opens a gzip-compressed file; multi-member streams are read as one.
    pub fn gzip(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self::from_source(Box::new(GzSource {
            inner: MultiGzDecoder::new(BufReader::new(file)),
            pos: 0,
        })))
    }

    fn from_source(src: Box<dyn ReadSource>) -> Self {
        Self {
            src,
            ok: true,
            eof: false,
        }
    }

    /// False once an I/O error has been observed.
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// True once a read ran past the end of input.
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Current position in the logical byte stream.
    pub fn tell(&mut self) -> u64 {
        self.src.tell()
    }

    /// Repositions the stream and clears the EOF flag on success.
    pub fn seek(&mut self, offset: u64) -> bool {
        let seeked = self.src.seek_to(offset);
        if seeked {
            self.eof = false;
        }
        seeked
    }

    fn fill(&mut self, buf: &mut [u8]) -> bool {
        let mut read = 0;
        while read < buf.len() {
            match self.src.read_raw(&mut buf[read..]) {
                Ok(0) => {
                    self.eof = true;
                    return false;
                }
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.ok = false;
                    return false;
                }
            }
        }
        true
    }

    /// Reads one byte, 0 at EOF.
    pub fn read_u8(&mut self) -> u8 {
        let mut buf = [0u8; 1];
        if self.fill(&mut buf) {
            buf[0]
        } else {
            0
        }
    }

    /// Reads a big-endian `u32`, 0 at EOF.
    pub fn read_u32(&mut self) -> u32 {
        let mut buf = [0u8; 4];
        if self.fill(&mut buf) {
            u32::from_be_bytes(buf)
        } else {
            0
        }
    }

    /// Reads a big-endian `u64`, 0 at EOF.
    pub fn read_u64(&mut self) -> u64 {
        let mut buf = [0u8; 8];
        if self.fill(&mut buf) {
            u64::from_be_bytes(buf)
        } else {
            0
        }
    }

    /// Reads an `i64` stored as its unsigned reinterpretation.
    pub fn read_i64(&mut self) -> i64 {
        self.read_u64() as i64
    }

    /// Reads a NUL-terminated string; an EOF mid-string yields "".
    pub fn read_string(&mut self) -> String {
        let mut bytes = Vec::new();
        loop {
            let mut buf = [0u8; 1];
            if !self.fill(&mut buf) {
                return String::new();
            }
            if buf[0] == 0 {
                break;
            }
            bytes.push(buf[0]);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Reads a `u32`-length-prefixed byte vector; short data is truncated
    /// with the EOF flag set. A length prefix beyond the record cap is
    /// treated as corruption, not an allocation request.
    pub fn read_bytes(&mut self) -> Vec<u8> {
        const MAX_RECORD: usize = 1 << 28;
        let len = self.read_u32() as usize;
        if self.eof {
            return Vec::new();
        }
        if len > MAX_RECORD {
            self.ok = false;
            return Vec::new();
        }
        let mut buf = vec![0u8; len];
        if !self.fill(&mut buf) {
            return Vec::new();
        }
        buf
    }
}

/// Typed big-endian writer over one of the raw sinks.
///
/// Write failures latch the `ok` flag instead of failing each call;
/// callers flush or inspect `ok()` after a record.
pub struct BinWriter {
    sink: Box<dyn WriteSink>,
    ok: bool,
}

impl BinWriter {
    /// Opens a plain file for writing, optionally appending.
    pub fn file(path: impl AsRef<Path>, append: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        let pos = if append { file.metadata()?.len() } else { 0 };
        Ok(Self::from_sink(Box::new(FileSink {
            inner: BufWriter::new(file),
            pos,
        })))
    }

    /// Writes into an in-memory buffer retrievable via [`Self::into_data`].
    pub fn memory() -> Self {
        Self::from_sink(Box::new(MemSink { buf: Vec::new() }))
    }

    /// Opens a gzip-compressed file. Appending starts a fresh gzip member
    /// after the existing ones, which decoders read as one stream.
    pub fn gzip(path: impl AsRef<Path>, append: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        Ok(Self::from_sink(Box::new(GzSink {
            inner: Some(GzEncoder::new(BufWriter::new(file), Compression::default())),
            pos: 0,
        })))
    }

    fn from_sink(sink: Box<dyn WriteSink>) -> Self {
        Self { sink, ok: true }
    }

    /// False once a write has failed.
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// Logical bytes written (file offset for plain files).
    pub fn tell(&self) -> u64 {
        self.sink.tell()
    }

    fn put(&mut self, bytes: &[u8]) {
        if self.ok && self.sink.write_raw(bytes).is_err() {
            self.ok = false;
        }
    }

    /// Writes one byte.
    pub fn write_u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    /// Writes a big-endian `u32`.
    pub fn write_u32(&mut self, v: u32) {
        self.put(&v.to_be_bytes());
    }

    /// Writes a big-endian `u64`.
    pub fn write_u64(&mut self, v: u64) {
        self.put(&v.to_be_bytes());
    }

    /// Writes an `i64` as its unsigned reinterpretation.
    pub fn write_i64(&mut self, v: i64) {
        self.write_u64(v as u64);
    }

    /// Writes a string followed by a NUL terminator. The value must not
    /// contain interior NUL bytes.
    pub fn write_string(&mut self, s: &str) {
        self.put(s.as_bytes());
        self.put(&[0]);
    }

    /// Writes a `u32`-length-prefixed byte vector.
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.put(v);
    }

    /// Flushes the sink; for gzip this finishes the current member.
    pub fn flush(&mut self) -> io::Result<()> {
        self.sink.flush_raw()
    }

    /// Consumes the writer and returns the in-memory buffer.
    ///
    /// Panics when called on a non-memory sink; only the codecs use it.
    pub fn into_data(mut self) -> Vec<u8> {
        self.sink
            .take_data()
            .expect("into_data called on a non-memory stream")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn typed_roundtrip_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream.bin");
        {
            let mut out = BinWriter::file(&path, false).unwrap();
            out.write_u32(0xdead_beef);
            out.write_u64(0x0123_4567_89ab_cdef);
            out.write_i64(-42);
            out.write_string("hello");
            out.write_bytes(b"payload");
            out.flush().unwrap();
            assert!(out.ok());
        }
        let mut input = BinReader::file(&path).unwrap();
        assert_eq!(input.read_u32(), 0xdead_beef);
        assert_eq!(input.read_u64(), 0x0123_4567_89ab_cdef);
        assert_eq!(input.read_i64(), -42);
        assert_eq!(input.read_string(), "hello");
        assert_eq!(input.read_bytes(), b"payload");
        assert!(input.ok());
        assert!(!input.eof());
        input.read_u8();
        assert!(input.eof());
    }

    #[test]
    fn big_endian_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("be.bin");
        {
            let mut out = BinWriter::file(&path, false).unwrap();
            out.write_u32(1);
            out.flush().unwrap();
        }
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, [0, 0, 0, 1]);
    }

    #[test]
    fn append_continues_at_file_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("appended.bin");
        {
            let mut out = BinWriter::file(&path, false).unwrap();
            out.write_u32(7);
            out.flush().unwrap();
        }
        let mut out = BinWriter::file(&path, true).unwrap();
        assert_eq!(out.tell(), 4);
        out.write_u32(8);
        out.flush().unwrap();
        let mut input = BinReader::file(&path).unwrap();
        assert_eq!(input.read_u32(), 7);
        assert_eq!(input.read_u32(), 8);
    }

    #[test]
    fn gzip_append_is_readable_as_one_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stream.gz");
        {
            let mut out = BinWriter::gzip(&path, false).unwrap();
            out.write_u32(5);
            out.write_string("first");
            out.flush().unwrap();
        }
        {
            let mut out = BinWriter::gzip(&path, true).unwrap();
            out.write_string("second");
            out.flush().unwrap();
        }
        let mut input = BinReader::gzip(&path).unwrap();
        assert_eq!(input.read_u32(), 5);
        assert_eq!(input.read_string(), "first");
        assert_eq!(input.read_string(), "second");
        input.read_u8();
        assert!(input.eof());
    }

    #[test]
    fn memory_writer_hands_back_its_buffer() {
        let mut out = BinWriter::memory();
        out.write_string("abc");
        out.write_u8(7);
        let data = out.into_data();
        assert_eq!(data, [b'a', b'b', b'c', 0, 7]);
    }

    #[test]
    fn seek_clears_eof() {
        let mut input = BinReader::memory(vec![0, 0, 0, 9]);
        assert_eq!(input.read_u32(), 9);
        input.read_u8();
        assert!(input.eof());
        assert!(input.seek(0));
        assert!(!input.eof());
        assert_eq!(input.read_u32(), 9);
    }

    proptest! {
        #[test]
        fn roundtrip_any_record(v32: u32, v64: u64, s in "[^\0]{0,64}", bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("prop.bin");
            {
                let mut out = BinWriter::file(&path, false).unwrap();
                out.write_u32(v32);
                out.write_u64(v64);
                out.write_string(&s);
                out.write_bytes(&bytes);
                out.flush().unwrap();
            }
            let mut input = BinReader::file(&path).unwrap();
            prop_assert_eq!(input.read_u32(), v32);
            prop_assert_eq!(input.read_u64(), v64);
            prop_assert_eq!(input.read_string(), s);
            prop_assert_eq!(input.read_bytes(), bytes);
        }
    }
}
