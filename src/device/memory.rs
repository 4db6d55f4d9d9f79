//! In-memory volume with fault injection
//!
//! A fixed-capacity byte array standing in for a disk. Used for tests and for
//! dry exercises of the engine without touching storage. Faults are driven by
//! a [`FaultPlan`] shared between the test and every clone of the device, so a
//! test can fail writes, corrupt reads, run out of space, or block a read
//! until it decides to release it.
//!
//! # Example
//!
//! ```
//! use iovet::device::{Device, IoOutcome, OpenFlags};
//! use iovet::device::memory::MemoryDevice;
//!
//! let mut dev = MemoryDevice::new("vol0", 4096);
//! dev.faults().fail_writes_after(1, false);
//! dev.open(OpenFlags::create(false)).unwrap();
//!
//! assert_eq!(dev.write(0, &[1u8; 512]).unwrap(), IoOutcome::Transferred(512));
//! assert!(dev.write(512, &[1u8; 512]).is_err());
//! ```

use super::{Device, DeviceError, DeviceResult, IoOutcome, OpenFlags};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const NEVER: u64 = u64::MAX;

/// Shared storage behind one or more device handles
#[derive(Debug)]
struct Volume {
    data: Mutex<Vec<u8>>,
}

/// Test-controlled failure behaviour
#[derive(Debug)]
pub struct FaultPlan {
    /// Writes allowed before every later write fails
    write_fail_after: AtomicU64,
    /// Reads allowed before every later read fails
    read_fail_after: AtomicU64,
    retryable: AtomicBool,
    /// Writes ending past this byte fail with no space
    space_limit: AtomicU64,
    /// Flip a byte of every read at this offset
    corrupt_offset: AtomicU64,
    /// Corrupt only this many reads at `corrupt_offset`
    corrupt_reads_left: AtomicU64,
    block_reads: Mutex<bool>,
    gate: Condvar,
    latency: Mutex<Duration>,
    reads: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
    blocked: AtomicU64,
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self {
            write_fail_after: AtomicU64::new(NEVER),
            read_fail_after: AtomicU64::new(NEVER),
            retryable: AtomicBool::new(false),
            space_limit: AtomicU64::new(NEVER),
            corrupt_offset: AtomicU64::new(NEVER),
            corrupt_reads_left: AtomicU64::new(0),
            block_reads: Mutex::new(false),
            gate: Condvar::new(),
            latency: Mutex::new(Duration::ZERO),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
        }
    }
}

impl FaultPlan {
    /// Fail every write after the first `n` succeed
    pub fn fail_writes_after(&self, n: u64, retryable: bool) {
        self.retryable.store(retryable, Ordering::SeqCst);
        self.write_fail_after.store(n, Ordering::SeqCst);
    }

    /// Fail every read after the first `n` succeed
    pub fn fail_reads_after(&self, n: u64, retryable: bool) {
        self.retryable.store(retryable, Ordering::SeqCst);
        self.read_fail_after.store(n, Ordering::SeqCst);
    }

    /// Report no space for writes reaching past `bytes`
    pub fn limit_space(&self, bytes: u64) {
        self.space_limit.store(bytes, Ordering::SeqCst);
    }

    /// Corrupt the next `count` reads covering `offset`
    pub fn corrupt_reads_at(&self, offset: u64, count: u64) {
        self.corrupt_offset.store(offset, Ordering::SeqCst);
        self.corrupt_reads_left.store(count, Ordering::SeqCst);
    }

    /// Make every read block until [`release_reads`](Self::release_reads)
    pub fn block_reads(&self) {
        *self.block_reads.lock() = true;
    }

    pub fn release_reads(&self) {
        *self.block_reads.lock() = false;
        self.gate.notify_all();
    }

    /// Delay added to every read and write
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Clear all injected faults (counters are kept)
    pub fn clear(&self) {
        self.write_fail_after.store(NEVER, Ordering::SeqCst);
        self.read_fail_after.store(NEVER, Ordering::SeqCst);
        self.space_limit.store(NEVER, Ordering::SeqCst);
        self.corrupt_reads_left.store(0, Ordering::SeqCst);
        *self.latency.lock() = Duration::ZERO;
        self.release_reads();
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Reads currently parked on the gate
    pub fn blocked_reads(&self) -> u64 {
        self.blocked.load(Ordering::SeqCst)
    }

    fn delay(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
    }

    fn wait_gate(&self) {
        let mut blocked = self.block_reads.lock();
        if *blocked {
            self.blocked.fetch_add(1, Ordering::SeqCst);
            while *blocked {
                self.gate.wait(&mut blocked);
            }
            self.blocked.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn injected(&self, op: &'static str, offset: u64) -> DeviceError {
        DeviceError::Transport {
            op,
            offset,
            retryable: self.retryable.load(Ordering::SeqCst),
            source: std::io::Error::new(std::io::ErrorKind::Other, "injected fault"),
        }
    }
}

/// In-memory device
pub struct MemoryDevice {
    name: String,
    capacity: u64,
    volume: Arc<Volume>,
    faults: Arc<FaultPlan>,
    open: bool,
}

impl MemoryDevice {
    /// Zero-filled volume of `capacity` bytes
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            volume: Arc::new(Volume {
                data: Mutex::new(vec![0u8; capacity as usize]),
            }),
            faults: Arc::new(FaultPlan::default()),
            open: false,
        }
    }

    /// Volume pre-filled with `data`
    pub fn with_data(name: impl Into<String>, data: Vec<u8>) -> Self {
        let capacity = data.len() as u64;
        Self {
            name: name.into(),
            capacity,
            volume: Arc::new(Volume {
                data: Mutex::new(data),
            }),
            faults: Arc::new(FaultPlan::default()),
            open: false,
        }
    }

    /// Another handle on the same volume and fault plan
    pub fn handle(&self) -> MemoryDevice {
        MemoryDevice {
            name: self.name.clone(),
            capacity: self.capacity,
            volume: Arc::clone(&self.volume),
            faults: Arc::clone(&self.faults),
            open: false,
        }
    }

    pub fn faults(&self) -> &Arc<FaultPlan> {
        &self.faults
    }

    /// Copy of the volume content
    pub fn snapshot(&self) -> Vec<u8> {
        self.volume.data.lock().clone()
    }

    fn check_open(&self) -> DeviceResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(DeviceError::NotOpen(self.name.clone()))
        }
    }
}

impl Device for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate_parameters(&self, block_size: u64, _direct: bool) -> DeviceResult<()> {
        if block_size == 0 || block_size > self.capacity {
            return Err(DeviceError::Invalid(format!(
                "block size {} does not fit memory volume {} ({} bytes)",
                block_size, self.name, self.capacity
            )));
        }
        Ok(())
    }

    fn open(&mut self, _flags: OpenFlags) -> DeviceResult<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> DeviceResult<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> DeviceResult<IoOutcome> {
        self.check_open()?;
        let faults = &self.faults;
        faults.wait_gate();
        faults.delay();

        let n = faults.reads.fetch_add(1, Ordering::SeqCst);
        if n >= faults.read_fail_after.load(Ordering::SeqCst) {
            return Err(faults.injected("read", offset));
        }
        if offset >= self.capacity {
            return Ok(IoOutcome::EndOfData);
        }

        let len = (buf.len() as u64).min(self.capacity - offset) as usize;
        {
            let data = self.volume.data.lock();
            let start = offset as usize;
            buf[..len].copy_from_slice(&data[start..start + len]);
        }

        let bad = faults.corrupt_offset.load(Ordering::SeqCst);
        if bad >= offset && bad < offset + len as u64 {
            let left = faults.corrupt_reads_left.load(Ordering::SeqCst);
            if left > 0 {
                faults.corrupt_reads_left.store(left - 1, Ordering::SeqCst);
                buf[(bad - offset) as usize] ^= 0xff;
            }
        }
        Ok(IoOutcome::Transferred(len))
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> DeviceResult<IoOutcome> {
        self.check_open()?;
        let faults = &self.faults;
        faults.delay();

        let n = faults.writes.fetch_add(1, Ordering::SeqCst);
        if n >= faults.write_fail_after.load(Ordering::SeqCst) {
            return Err(faults.injected("write", offset));
        }
        let end = offset + buf.len() as u64;
        if end > faults.space_limit.load(Ordering::SeqCst) {
            return Err(DeviceError::NoSpace { offset });
        }
        if offset >= self.capacity {
            return Err(DeviceError::NoSpace { offset });
        }

        let len = (buf.len() as u64).min(self.capacity - offset) as usize;
        let mut data = self.volume.data.lock();
        let start = offset as usize;
        data[start..start + len].copy_from_slice(&buf[..len]);
        Ok(IoOutcome::Transferred(len))
    }

    fn flush(&mut self) -> DeviceResult<()> {
        self.check_open()?;
        self.faults.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn capacity(&self) -> DeviceResult<Option<u64>> {
        Ok(Some(self.capacity))
    }

    fn remove(&mut self) -> DeviceResult<()> {
        self.open = false;
        self.volume.data.lock().fill(0);
        Ok(())
    }

    fn deallocate(&mut self, offset: u64, len: u64) -> DeviceResult<()> {
        let mut data = self.volume.data.lock();
        let start = (offset.min(self.capacity)) as usize;
        let end = (offset.saturating_add(len).min(self.capacity)) as usize;
        data[start..end].fill(0);
        Ok(())
    }

    /// Slices and thread 0 share the volume; other threads get a fresh
    /// zeroed volume of the same size. The fault plan is always shared.
    fn clone_for(&self, thread: usize, shared: bool) -> Box<dyn Device> {
        if shared || thread == 0 {
            return Box::new(self.handle());
        }
        Box::new(MemoryDevice {
            name: format!("{}-t{}", self.name, thread),
            capacity: self.capacity,
            volume: Arc::new(Volume {
                data: Mutex::new(vec![0u8; self.capacity as usize]),
            }),
            faults: Arc::clone(&self.faults),
            open: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_roundtrip_and_capacity() {
        let mut dev = MemoryDevice::new("m", 2048);
        dev.open(OpenFlags::create(false)).unwrap();
        dev.write(1024, &[9u8; 512]).unwrap();
        let mut buf = [0u8; 512];
        assert_eq!(dev.read(1024, &mut buf).unwrap(), IoOutcome::Transferred(512));
        assert!(buf.iter().all(|&b| b == 9));
        assert_eq!(dev.read(2048, &mut buf).unwrap(), IoOutcome::EndOfData);
        assert!(dev.write(2048, &buf).unwrap_err().is_no_space());
    }

    #[test]
    fn test_not_open() {
        let mut dev = MemoryDevice::new("m", 1024);
        assert!(matches!(dev.write(0, &[0u8; 8]), Err(DeviceError::NotOpen(_))));
    }

    #[test]
    fn test_fail_writes_after() {
        let mut dev = MemoryDevice::new("m", 4096);
        dev.open(OpenFlags::create(false)).unwrap();
        dev.faults().fail_writes_after(2, true);
        assert!(dev.write(0, &[0u8; 512]).is_ok());
        assert!(dev.write(512, &[0u8; 512]).is_ok());
        let err = dev.write(1024, &[0u8; 512]).unwrap_err();
        assert!(err.is_retryable());
        dev.faults().clear();
        assert!(dev.write(1024, &[0u8; 512]).is_ok());
    }

    #[test]
    fn test_corrupt_read_once() {
        let mut dev = MemoryDevice::new("m", 1024);
        dev.open(OpenFlags::create(false)).unwrap();
        dev.faults().corrupt_reads_at(10, 1);
        let mut buf = [0u8; 512];
        dev.read(0, &mut buf).unwrap();
        assert_eq!(buf[10], 0xff);
        dev.read(0, &mut buf).unwrap();
        assert_eq!(buf[10], 0);
    }

    #[test]
    fn test_space_limit() {
        let mut dev = MemoryDevice::new("m", 4096);
        dev.open(OpenFlags::create(false)).unwrap();
        dev.faults().limit_space(1024);
        assert!(dev.write(512, &[0u8; 512]).is_ok());
        assert!(dev.write(1024, &[0u8; 512]).unwrap_err().is_no_space());
    }

    #[test]
    fn test_blocked_read_released() {
        let dev = MemoryDevice::new("m", 1024);
        dev.faults().block_reads();
        let mut reader = dev.handle();
        reader.open(OpenFlags::read_only(false)).unwrap();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader.read(0, &mut buf).map(|_| ())
        });
        while dev.faults().blocked_reads() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        dev.faults().release_reads();
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_clone_sharing() {
        let mut dev = MemoryDevice::new("m", 1024);
        dev.open(OpenFlags::create(false)).unwrap();
        dev.write(0, &[1u8; 16]).unwrap();

        let mut shared = dev.clone_for(3, true);
        shared.open(OpenFlags::read_only(false)).unwrap();
        let mut buf = [0u8; 16];
        shared.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1u8; 16]);

        let mut own = dev.clone_for(3, false);
        own.open(OpenFlags::read_only(false)).unwrap();
        own.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(own.name(), "m-t3");
    }
}
