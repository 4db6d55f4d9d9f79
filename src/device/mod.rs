//! Device abstraction
//!
//! A device is whatever a worker reads and writes: a regular file, a raw block
//! device, or an in-memory volume. The I/O loops are written against the
//! [`Device`] trait only and call it the same way for every category; the
//! concrete type is bound once when the I/O context is set up.
//!
//! # Lifecycle
//!
//! 1. `validate_parameters()` before anything is opened
//! 2. `open()` (create on first open for outputs), `start_test()`
//! 3. `read()`/`write()` per record, `flush()` after each write sub-pass
//! 4. `reopen()` between sub-passes and passes
//! 5. `end_test()`, `close()`
//!
//! # Errors
//!
//! Failures are classified into [`DeviceError`] variants so the retry policy
//! can tell retryable transport failures from hard ones and from a full
//! destination.
//!
//! # Thread Safety
//!
//! Devices are `Send` but not `Sync`: every worker owns its own handle, made
//! with [`Device::clone_for`].

pub mod file;
pub mod memory;

use thiserror::Error;

/// Device operation failure
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The OS or transport rejected the request
    #[error("{op} failed at offset {offset}: {source}")]
    Transport {
        op: &'static str,
        offset: u64,
        retryable: bool,
        #[source]
        source: std::io::Error,
    },

    /// Destination full
    #[error("no space left on device (offset {offset})")]
    NoSpace { offset: u64 },

    #[error("device {0} is not open")]
    NotOpen(String),

    #[error("invalid device parameter: {0}")]
    Invalid(String),

    #[error("{0} is not supported by this device")]
    Unsupported(&'static str),
}

impl DeviceError {
    /// Whether an in-place retry may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeviceError::Transport { retryable: true, .. })
    }

    pub fn is_no_space(&self) -> bool {
        matches!(self, DeviceError::NoSpace { .. })
    }

    /// Build a transport error from an OS error, classifying retryability
    pub fn from_os(op: &'static str, offset: u64, source: std::io::Error) -> Self {
        if source.raw_os_error() == Some(libc::ENOSPC) {
            return DeviceError::NoSpace { offset };
        }
        let retryable = matches!(
            source.raw_os_error(),
            Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::ETIMEDOUT)
        );
        DeviceError::Transport {
            op,
            offset,
            retryable,
            source,
        }
    }
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Result of one read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// Bytes moved; fewer than requested only at the end of the device
    Transferred(usize),
    /// Nothing left to read (or no room left to write)
    EndOfData,
}

/// How to open a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    /// Create if missing
    pub create: bool,
    /// Bypass the page cache
    pub direct: bool,
}

impl OpenFlags {
    pub fn read_only(direct: bool) -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            direct,
        }
    }

    /// Read/write, creating the device if it does not exist
    pub fn create(direct: bool) -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            direct,
        }
    }

    /// Read/write on an existing device
    pub fn read_write(direct: bool) -> Self {
        Self {
            read: true,
            write: true,
            create: false,
            direct,
        }
    }
}

/// Operations every device category provides
pub trait Device: Send {
    /// Name used in messages (usually the path)
    fn name(&self) -> &str;

    /// Reject parameters this device cannot honour
    fn validate_parameters(&self, block_size: u64, direct: bool) -> DeviceResult<()>;

    fn open(&mut self, flags: OpenFlags) -> DeviceResult<()>;

    fn close(&mut self) -> DeviceResult<()>;

    /// Close (if open) and open again
    fn reopen(&mut self, flags: OpenFlags) -> DeviceResult<()> {
        if self.is_open() {
            self.close()?;
        }
        self.open(flags)
    }

    fn is_open(&self) -> bool;

    /// Read `buf.len()` bytes at `offset`
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> DeviceResult<IoOutcome>;

    /// Write all of `buf` at `offset`
    fn write(&mut self, offset: u64, buf: &[u8]) -> DeviceResult<IoOutcome>;

    /// Make written data durable
    fn flush(&mut self) -> DeviceResult<()>;

    /// Called once after the first open
    fn start_test(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    /// Called once before the final close
    fn end_test(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    /// Usable size in bytes, if known
    fn capacity(&self) -> DeviceResult<Option<u64>>;

    /// Delete what this device created (dispose policy, delete per pass)
    fn remove(&mut self) -> DeviceResult<()>;

    /// Release the backing storage of a range (trim)
    fn deallocate(&mut self, _offset: u64, _len: u64) -> DeviceResult<()> {
        Err(DeviceError::Unsupported("deallocate"))
    }

    /// Handle for another worker thread
    ///
    /// With `shared` the clone addresses the same storage (slices of one
    /// device); otherwise the category decides, e.g. a per-thread file.
    fn clone_for(&self, thread: usize, shared: bool) -> Box<dyn Device>;
}
