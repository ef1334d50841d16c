//! Positional readers.
//!
//! Everything in the crate reads through the `ReadAt` seam: the disk image,
//! the reconstructed `$MFT` stream, assembled file streams, and decompressed
//! views all present the same interface, so higher layers never care where
//! bytes actually come from.

use std::sync::Arc;

use crate::error::{NtfsError, Result};

/// A shareable random-access byte source.
///
/// Contract:
/// - A read starting at or past EOF fails with [`NtfsError::EndOfFile`].
/// - A read overlapping EOF may return a short count; composite readers
///   keep reading into the next segment until the buffer fills.
/// - Implementations are immutable (interior mutability only), so a single
///   source can back many readers concurrently.
pub trait ReadAt: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Drop any cached state so the next read hits the source. Default is
    /// a no-op; the paged reader empties its page cache.
    fn flush(&self) {}
}

/// Read exactly `buf.len()` bytes or fail with `ShortRead`.
pub fn read_exact_at(reader: &dyn ReadAt, offset: u64, buf: &mut [u8]) -> Result<()> {
    let n = match reader.read_at(offset, buf) {
        Ok(n) => n,
        Err(NtfsError::EndOfFile) => 0,
        Err(e) => return Err(e),
    };
    if n < buf.len() {
        return Err(NtfsError::ShortRead {
            offset,
            wanted: buf.len(),
            got: n,
        });
    }
    Ok(())
}

/// Best-effort read: returns however many bytes were available, zero-filling
/// nothing. EOF collapses to a zero count.
pub fn read_some_at(reader: &dyn ReadAt, offset: u64, buf: &mut [u8]) -> Result<usize> {
    match reader.read_at(offset, buf) {
        Ok(n) => Ok(n),
        Err(NtfsError::EndOfFile) => Ok(0),
        Err(e) => Err(e),
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.as_slice().read_at(offset, buf)
    }
}

impl ReadAt for &'static [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        (*self).read_at(offset, buf)
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = self.len() as u64;
        if offset >= len {
            return Err(NtfsError::EndOfFile);
        }
        let start = offset as usize;
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

impl ReadAt for std::fs::File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut total = 0;
        while total < buf.len() {
            #[cfg(unix)]
            let res = {
                use std::os::unix::fs::FileExt;
                FileExt::read_at(self, &mut buf[total..], offset + total as u64)
            };
            #[cfg(windows)]
            let res = {
                use std::os::windows::fs::FileExt;
                FileExt::seek_read(self, &mut buf[total..], offset + total as u64)
            };

            match res {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if total == 0 {
            return Err(NtfsError::EndOfFile);
        }
        Ok(total)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn flush(&self) {
        (**self).flush()
    }
}

/// Rebases an inner reader by a fixed byte offset. Used to address a
/// partition inside a whole-disk image.
pub struct OffsetReader {
    pub base: u64,
    pub inner: Arc<dyn ReadAt>,
}

impl OffsetReader {
    pub fn new(inner: Arc<dyn ReadAt>, base: u64) -> Self {
        OffsetReader { base, inner }
    }
}

impl ReadAt for OffsetReader {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.read_at(self.base + offset, buf)
    }

    fn flush(&self) {
        self.inner.flush()
    }
}

/// An endless run of zeros. Backs sparse runs and uninitialized tails.
pub struct NullReader;

impl ReadAt for NullReader {
    fn read_at(&self, _offset: u64, buf: &mut [u8]) -> Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_reader_in_range() {
        let data = b"abcdef".to_vec();
        let mut buf = [0u8; 3];
        assert_eq!(data.read_at(1, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"bcd");
    }

    #[test]
    fn test_slice_reader_short_read() {
        let data = b"abcdef".to_vec();
        let mut buf = [0u8; 4];
        assert_eq!(data.read_at(4, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn test_slice_reader_past_eof() {
        let data = b"abc".to_vec();
        let mut buf = [0u8; 2];
        assert!(matches!(
            data.read_at(3, &mut buf),
            Err(NtfsError::EndOfFile)
        ));
        assert!(matches!(
            data.read_at(100, &mut buf),
            Err(NtfsError::EndOfFile)
        ));
    }

    #[test]
    fn test_offset_reader() {
        let data = b"xxxabc".to_vec();
        let reader = OffsetReader::new(Arc::new(data), 3);
        let mut buf = [0u8; 3];
        assert_eq!(reader.read_at(0, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_null_reader() {
        let mut buf = [0xAAu8; 8];
        assert_eq!(NullReader.read_at(123456, &mut buf).unwrap(), 8);
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn test_read_exact_at_short() {
        let data = b"ab".to_vec();
        let mut buf = [0u8; 4];
        let err = read_exact_at(&data, 0, &mut buf).unwrap_err();
        assert!(matches!(err, NtfsError::ShortRead { got: 2, .. }));
    }
}
