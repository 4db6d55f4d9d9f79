//! File and raw block device
//!
//! Positioned I/O with `pread`/`pwrite`, looping over partial transfers.
//! `O_DIRECT` is requested through the open flags on Linux. A device only
//! ever deletes a regular file it created itself.

use super::{Device, DeviceError, DeviceResult, IoOutcome, OpenFlags};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Regular file or block device
pub struct FileDevice {
    path: PathBuf,
    name: String,
    file: Option<File>,
    /// This device created the file on its first open
    created: bool,
}

impl FileDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self {
            path,
            name,
            file: None,
            created: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_special(&self) -> bool {
        std::fs::metadata(&self.path)
            .map(|m| {
                let t = m.file_type();
                t.is_block_device() || t.is_char_device()
            })
            .unwrap_or(false)
    }

    fn fd(&self) -> DeviceResult<i32> {
        self.file
            .as_ref()
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| DeviceError::NotOpen(self.name.clone()))
    }
}

impl Device for FileDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate_parameters(&self, block_size: u64, direct: bool) -> DeviceResult<()> {
        if block_size == 0 {
            return Err(DeviceError::Invalid("block size must be greater than 0".into()));
        }
        if direct && !cfg!(target_os = "linux") {
            return Err(DeviceError::Unsupported("direct I/O"));
        }
        if direct && block_size % 512 != 0 {
            return Err(DeviceError::Invalid(format!(
                "block size {} is not a multiple of 512 for direct I/O on {}",
                block_size, self.name
            )));
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(DeviceError::Invalid(format!(
                    "directory {} does not exist",
                    parent.display()
                )));
            }
        }
        Ok(())
    }

    fn open(&mut self, flags: OpenFlags) -> DeviceResult<()> {
        if self.file.is_some() {
            return Ok(());
        }

        let existed = self.path.exists();
        let mut opts = OpenOptions::new();
        opts.read(flags.read || !flags.write)
            .write(flags.write)
            .create(flags.create && flags.write);

        #[cfg(target_os = "linux")]
        {
            if flags.direct {
                opts.custom_flags(libc::O_DIRECT);
            }
        }

        let file = opts
            .open(&self.path)
            .map_err(|e| DeviceError::from_os("open", 0, e))?;

        if !existed && flags.create {
            self.created = true;
            debug!(path = %self.name, "created");
        }
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) -> DeviceResult<()> {
        // Dropping the File closes the descriptor
        self.file = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> DeviceResult<IoOutcome> {
        let fd = self.fd()?;
        let length = buf.len();
        let mut total_read = 0;
        let mut current_offset = offset;

        while total_read < length {
            let remaining = &mut buf[total_read..];

            // SAFETY: `remaining` is a live, exclusively borrowed slice and fd
            // is owned by self.file for the duration of the call.
            let result = unsafe {
                libc::pread(
                    fd,
                    remaining.as_mut_ptr() as *mut libc::c_void,
                    remaining.len(),
                    current_offset as libc::off_t,
                )
            };

            if result < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(DeviceError::from_os("read", current_offset, err));
            }
            if result == 0 {
                break;
            }

            total_read += result as usize;
            current_offset += result as u64;
        }

        if total_read == 0 && length > 0 {
            return Ok(IoOutcome::EndOfData);
        }
        Ok(IoOutcome::Transferred(total_read))
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> DeviceResult<IoOutcome> {
        let fd = self.fd()?;
        let length = buf.len();
        let mut total_written = 0;
        let mut current_offset = offset;

        while total_written < length {
            let remaining = &buf[total_written..];

            // SAFETY: `remaining` is a live slice and fd is owned by self.file.
            let result = unsafe {
                libc::pwrite(
                    fd,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                    current_offset as libc::off_t,
                )
            };

            if result < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(DeviceError::from_os("write", current_offset, err));
            }
            if result == 0 {
                // A block device returns 0 past its end
                if total_written == 0 {
                    return Ok(IoOutcome::EndOfData);
                }
                break;
            }

            total_written += result as usize;
            current_offset += result as u64;
        }

        Ok(IoOutcome::Transferred(total_written))
    }

    fn flush(&mut self) -> DeviceResult<()> {
        let fd = self.fd()?;
        // SAFETY: fd is a valid open descriptor owned by self.file.
        let ret = unsafe { libc::fdatasync(fd) };
        if ret != 0 {
            return Err(DeviceError::from_os("flush", 0, std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn capacity(&self) -> DeviceResult<Option<u64>> {
        if let Some(file) = &self.file {
            let mut handle = file;
            let end = handle
                .seek(SeekFrom::End(0))
                .map_err(|e| DeviceError::from_os("seek", 0, e))?;
            return Ok(Some(end));
        }
        if self.is_special() {
            let mut file = File::open(&self.path).map_err(|e| DeviceError::from_os("open", 0, e))?;
            let end = file
                .seek(SeekFrom::End(0))
                .map_err(|e| DeviceError::from_os("seek", 0, e))?;
            return Ok(Some(end));
        }
        match std::fs::metadata(&self.path) {
            Ok(m) => Ok(Some(m.len())),
            Err(_) => Ok(None),
        }
    }

    fn remove(&mut self) -> DeviceResult<()> {
        if !self.created || self.is_special() {
            return Ok(());
        }
        self.file = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.name, "removed");
                self.created = false;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DeviceError::from_os("remove", 0, e)),
        }
    }

    #[cfg(target_os = "linux")]
    fn deallocate(&mut self, offset: u64, len: u64) -> DeviceResult<()> {
        let fd = self.fd()?;
        // SAFETY: fd is a valid open descriptor owned by self.file.
        let ret = unsafe {
            libc::fallocate(
                fd,
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EOPNOTSUPP) {
                return Err(DeviceError::Unsupported("deallocate"));
            }
            return Err(DeviceError::from_os("deallocate", offset, err));
        }
        Ok(())
    }

    fn clone_for(&self, thread: usize, shared: bool) -> Box<dyn Device> {
        if shared || self.is_special() {
            return Box::new(FileDevice::new(self.path.clone()));
        }
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!("-t{}", thread));
        Box::new(FileDevice::new(PathBuf::from(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut dev = FileDevice::new(dir.path().join("data"));
        dev.validate_parameters(512, false).unwrap();
        dev.open(OpenFlags::create(false)).unwrap();

        let data = vec![0x5au8; 1024];
        assert_eq!(dev.write(512, &data).unwrap(), IoOutcome::Transferred(1024));
        dev.flush().unwrap();

        let mut buf = vec![0u8; 1024];
        assert_eq!(dev.read(512, &mut buf).unwrap(), IoOutcome::Transferred(1024));
        assert_eq!(buf, data);
        assert_eq!(dev.capacity().unwrap(), Some(1536));
    }

    #[test]
    fn test_read_past_end_is_end_of_data() {
        let dir = TempDir::new().unwrap();
        let mut dev = FileDevice::new(dir.path().join("short"));
        dev.open(OpenFlags::create(false)).unwrap();
        dev.write(0, &[1u8; 100]).unwrap();

        let mut buf = vec![0u8; 512];
        assert_eq!(dev.read(0, &mut buf).unwrap(), IoOutcome::Transferred(100));
        assert_eq!(dev.read(4096, &mut buf).unwrap(), IoOutcome::EndOfData);
    }

    #[test]
    fn test_not_open() {
        let mut dev = FileDevice::new("/nonexistent/iovet");
        let mut buf = [0u8; 8];
        assert!(matches!(dev.read(0, &mut buf), Err(DeviceError::NotOpen(_))));
        assert!(dev.validate_parameters(512, false).is_err());
    }

    #[test]
    fn test_remove_only_created_files() {
        let dir = TempDir::new().unwrap();
        let existing = dir.path().join("existing");
        std::fs::write(&existing, b"keep me").unwrap();

        let mut dev = FileDevice::new(&existing);
        dev.open(OpenFlags::read_write(false)).unwrap();
        dev.remove().unwrap();
        assert!(existing.exists());

        let mut fresh = FileDevice::new(dir.path().join("fresh"));
        fresh.open(OpenFlags::create(false)).unwrap();
        fresh.remove().unwrap();
        assert!(!dir.path().join("fresh").exists());
        // second remove is a no-op
        fresh.remove().unwrap();
    }

    #[test]
    fn test_clone_for_thread_gets_own_file() {
        let dir = TempDir::new().unwrap();
        let dev = FileDevice::new(dir.path().join("out"));
        let t1 = dev.clone_for(1, false);
        assert!(t1.name().ends_with("out-t1"));
        let shared = dev.clone_for(1, true);
        assert!(shared.name().ends_with("out"));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let mut dev = FileDevice::new(dir.path().join("r"));
        dev.open(OpenFlags::create(false)).unwrap();
        dev.write(0, &[7u8; 512]).unwrap();
        dev.reopen(OpenFlags::read_only(false)).unwrap();
        let mut buf = [0u8; 512];
        dev.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }
}
