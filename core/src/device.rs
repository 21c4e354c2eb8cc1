//! The block device I/O primitive. Everything above this trait (mount-option
//! parsing, page-cache glue, VFS adaptation) is out of scope for the core; it
//! only ever reads and writes byte ranges through here.

use crate::error::NtfsResult;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

/// Read/write byte ranges on the volume.
///
/// Implementors are responsible for their own buffering; the core issues
/// reads and writes at whatever granularity the runs/record engines need
/// (not necessarily sector-aligned for reads, always full-record for MFT
/// writes).
pub trait BlockDevice: Send + Sync {
    /// Read `len` bytes starting at logical byte offset `lbo`.
    fn read_bytes(&self, lbo: u64, len: usize) -> NtfsResult<Vec<u8>>;

    /// Write `buf` starting at logical byte offset `lbo`. When `sync` is
    /// set the implementation must not return until the bytes are durable.
    fn write_bytes(&self, lbo: u64, buf: &[u8], sync: bool) -> NtfsResult<()>;

    /// Total addressable size of the device, in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A `Vec<u8>`-backed device, used by unit and property tests that need a
/// full `BlockDevice` without touching the filesystem.
pub struct InMemoryDevice {
    bytes: Mutex<Vec<u8>>,
}

impl InMemoryDevice {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0u8; size]),
        }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }
}

impl BlockDevice for InMemoryDevice {
    fn read_bytes(&self, lbo: u64, len: usize) -> NtfsResult<Vec<u8>> {
        let guard = self.bytes.lock().unwrap();
        let start = lbo as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| crate::error::NtfsError::Other("read range overflow".into()))?;
        if end > guard.len() {
            log::warn!("read past end of device: {end} > {}", guard.len());
            return Err(crate::error::NtfsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read past end of device: {end} > {}", guard.len()),
            )));
        }
        Ok(guard[start..end].to_vec())
    }

    fn write_bytes(&self, lbo: u64, buf: &[u8], _sync: bool) -> NtfsResult<()> {
        let mut guard = self.bytes.lock().unwrap();
        let start = lbo as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| crate::error::NtfsError::Other("write range overflow".into()))?;
        if end > guard.len() {
            log::warn!("write past end of device: {end} > {}", guard.len());
            return Err(crate::error::NtfsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("write past end of device: {end} > {}", guard.len()),
            )));
        }
        guard[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.bytes.lock().unwrap().len() as u64
    }
}

/// A real file-backed device, for integration tests and tools that want to
/// mount an actual on-disk image rather than an in-memory byte buffer.
pub struct FileDevice {
    file: Mutex<File>,
    len: u64,
}

impl FileDevice {
    /// Opens an existing file at `path` as a device of its current length.
    pub fn open(path: impl AsRef<Path>) -> NtfsResult<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file: Mutex::new(file), len })
    }
}

impl BlockDevice for FileDevice {
    fn read_bytes(&self, lbo: u64, len: usize) -> NtfsResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.lock().unwrap().read_exact_at(&mut buf, lbo)?;
        Ok(buf)
    }

    fn write_bytes(&self, lbo: u64, buf: &[u8], sync: bool) -> NtfsResult<()> {
        let file = self.file.lock().unwrap();
        file.write_all_at(buf, lbo)?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let dev = InMemoryDevice::new(4096);
        dev.write_bytes(512, &[1, 2, 3, 4], false).unwrap();
        let back = dev.read_bytes(512, 4).unwrap();
        assert_eq!(back, vec![1, 2, 3, 4]);
    }

    #[test]
    fn read_past_end_is_io_error() {
        let dev = InMemoryDevice::new(16);
        assert!(dev.read_bytes(10, 16).is_err());
    }

    #[test]
    fn file_device_read_write_round_trip() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096).unwrap();

        let dev = FileDevice::open(file.path()).unwrap();
        assert_eq!(dev.len(), 4096);
        dev.write_bytes(512, &[1, 2, 3, 4], true).unwrap();
        assert_eq!(dev.read_bytes(512, 4).unwrap(), vec![1, 2, 3, 4]);

        // A second handle opened on the same path sees the write.
        let dev2 = FileDevice::open(file.path()).unwrap();
        assert_eq!(dev2.read_bytes(512, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn file_device_read_past_end_is_io_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(16).unwrap();

        let dev = FileDevice::open(file.path()).unwrap();
        assert!(dev.read_bytes(10, 16).is_err());
    }
}
