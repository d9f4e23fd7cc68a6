//! Positional host-file I/O.
//!
//! A thin [`RandomAccess`] over `std::fs::File` using the platform's
//! positional read/write calls, so one handle can serve offset-explicit
//! access without seek bookkeeping.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::Result;
use crate::io::RandomAccess;

/// How to treat a possibly-existing file on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// The file must already exist.
    OpenOnly,
    /// The file must not exist yet; it is created exclusively.
    CreateOnly,
    /// Open the file, creating it first if absent.
    CreateIfAbsent,
}

/// A host file exposed as a [`RandomAccess`].
#[derive(Debug)]
pub struct FileIo {
    file: File,
    read_only: bool,
}

impl FileIo {
    pub fn open(path: &Path, create: CreateMode, read_only: bool) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(!read_only);
        match create {
            CreateMode::OpenOnly => {}
            CreateMode::CreateOnly => {
                options.create_new(true);
            }
            CreateMode::CreateIfAbsent => {
                options.create(true);
            }
        }
        Ok(Self {
            file: options.open(path)?,
            read_only,
        })
    }

    /// Whether this handle was opened without write capability.
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Flush file contents and metadata to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<usize> {
    std::os::unix::fs::FileExt::write_at(file, buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> std::io::Result<usize> {
    std::os::windows::fs::FileExt::seek_write(file, buf, offset)
}

impl RandomAccess for FileIo {
    fn read(&self, offset: u64, output: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < output.len() {
            match read_at(&self.file, offset + filled as u64, &mut output[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn write(&self, offset: u64, input: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < input.len() {
            match write_at(&self.file, offset + written as u64, &input[written..]) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "host file refused to accept more bytes",
                    )
                    .into())
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn resize(&self, new_size: u64) -> Result<()> {
        self.file.set_len(new_size)?;
        Ok(())
    }
}
