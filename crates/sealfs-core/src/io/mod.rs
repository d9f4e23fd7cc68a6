//! Random-access byte containers.
//!
//! [`RandomAccess`] is the seam every storage layer in this crate is built
//! on: host files, in-memory buffers, SQLite's own file objects, and the
//! encrypting stream that wraps any of them all speak the same four
//! operations. Every call is offset-explicit; there is no cursor.

use std::sync::Mutex;

use crate::error::{Error, Result};

pub mod crypto;
pub mod file;

pub use crypto::AesGcmRandomAccess;
pub use file::{CreateMode, FileIo};

/// A random-access byte container.
///
/// Semantics:
/// - `read` past the end returns fewer bytes than requested (possibly zero);
///   a short read is not an error.
/// - `write` past the end extends the container, zero-filling any gap.
/// - `resize` truncates or extends; extended bytes read back as zero.
///
/// Implementations carry no internal position and may be shared behind an
/// `Arc`; callers that share one instance must serialize their accesses.
pub trait RandomAccess: Send + Sync {
    /// Read up to `output.len()` bytes at `offset`. Returns the number of
    /// bytes actually read.
    fn read(&self, offset: u64, output: &mut [u8]) -> Result<usize>;

    /// Write all of `input` at `offset`, extending the container if needed.
    fn write(&self, offset: u64, input: &[u8]) -> Result<()>;

    /// Current size in bytes.
    fn size(&self) -> Result<u64>;

    /// Truncate or zero-extend to `new_size` bytes.
    fn resize(&self, new_size: u64) -> Result<()>;
}

/// An in-memory [`RandomAccess`] backed by a `Vec<u8>`.
///
/// The behavioral reference for the encrypting stream's tests, and a real
/// backend for callers that want a scratch container.
#[derive(Debug, Default)]
pub struct MemoryIo {
    data: Mutex<Vec<u8>>,
}

impl MemoryIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// A copy of the full contents.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        // A poisoned buffer is unrecoverable test state; keep going with
        // whatever is there rather than deadlocking.
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RandomAccess for MemoryIo {
    fn read(&self, offset: u64, output: &mut [u8]) -> Result<usize> {
        let data = self.lock();
        let offset = usize::try_from(offset)
            .map_err(|_| Error::invalid("offset exceeds addressable memory"))?;
        if offset >= data.len() {
            return Ok(0);
        }
        let available = &data[offset..];
        let n = available.len().min(output.len());
        output[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }

    fn write(&self, offset: u64, input: &[u8]) -> Result<()> {
        if input.is_empty() {
            return Ok(());
        }
        let mut data = self.lock();
        let offset = usize::try_from(offset)
            .map_err(|_| Error::invalid("offset exceeds addressable memory"))?;
        let end = offset
            .checked_add(input.len())
            .ok_or_else(|| Error::invalid("write range overflows"))?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(input);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.lock().len() as u64)
    }

    fn resize(&self, new_size: u64) -> Result<()> {
        let new_size = usize::try_from(new_size)
            .map_err(|_| Error::invalid("size exceeds addressable memory"))?;
        self.lock().resize(new_size, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_past_end_is_short() {
        let io = MemoryIo::new();
        io.write(0, b"hello").unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(io.read(3, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(io.read(5, &mut buf).unwrap(), 0);
        assert_eq!(io.read(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn write_past_end_zero_fills_gap() {
        let io = MemoryIo::new();
        io.write(4, b"x").unwrap();
        assert_eq!(io.size().unwrap(), 5);
        assert_eq!(io.contents(), vec![0, 0, 0, 0, b'x']);
    }

    #[test]
    fn resize_extends_with_zeros_and_truncates() {
        let io = MemoryIo::with_contents(vec![1, 2, 3]);
        io.resize(5).unwrap();
        assert_eq!(io.contents(), vec![1, 2, 3, 0, 0]);
        io.resize(2).unwrap();
        assert_eq!(io.contents(), vec![1, 2]);
        io.resize(0).unwrap();
        assert_eq!(io.size().unwrap(), 0);
    }
}
