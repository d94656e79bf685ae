//! The byte-source abstraction players read from.
//!
//! A [`Source`] yields little-endian interleaved PCM frames in the context's
//! format. Reads follow the usual `std::io` conventions:
//! - `Ok(0)` means end of stream,
//! - `ErrorKind::WouldBlock` (or `Interrupted`) means "no data yet" for
//!   non-blocking sources; the feeder backs off and retries,
//! - any other error is terminal for the player that owns the source.
//!
//! A source must not be shared between two players; ownership moves into the
//! player at construction.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};

/// A blocking byte source with optional seek support.
///
/// Implementors that cannot seek should report `is_seekable() == false` and
/// may leave the `Seek` impl failing; [`ReadOnlySource`] does this for any
/// plain reader.
pub trait Source: Read + Seek + Send + 'static {
    /// Whether [`Seek`] is usable on this source.
    fn is_seekable(&self) -> bool;
}

impl Source for File {
    fn is_seekable(&self) -> bool {
        true
    }
}

impl<T: AsRef<[u8]> + Send + 'static> Source for Cursor<T> {
    fn is_seekable(&self) -> bool {
        true
    }
}

/// Adapter that turns any `Read` into a non-seekable [`Source`].
pub struct ReadOnlySource<R> {
    inner: R,
}

impl<R: Read + Send + 'static> ReadOnlySource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ReadOnlySource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R> Seek for ReadOnlySource<R> {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "source does not support seeking",
        ))
    }
}

impl<R: Read + Send + 'static> Source for ReadOnlySource<R> {
    fn is_seekable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_is_seekable() {
        let src = Cursor::new(vec![0u8; 4]);
        assert!(src.is_seekable());
    }

    #[test]
    fn read_only_source_reads_but_refuses_to_seek() {
        let mut src = ReadOnlySource::new(Cursor::new(vec![1u8, 2, 3]));
        assert!(!src.is_seekable());

        let mut buf = [0u8; 2];
        assert_eq!(src.read(&mut buf).unwrap(), 2);
        assert_eq!(buf, [1, 2]);

        let err = src.seek(SeekFrom::Start(0)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
