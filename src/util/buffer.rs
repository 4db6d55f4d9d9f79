//! Aligned I/O buffers
//!
//! Direct I/O requires the user buffer to be aligned to the device's logical
//! block size. Each I/O context owns a data buffer (what is written, or what
//! was read) and a verify buffer (the expected data during a compare). They
//! are never shared between contexts.

use anyhow::Context;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};

/// Default alignment; satisfies O_DIRECT on 4Kn and 512e devices alike
pub const DEFAULT_ALIGNMENT: usize = 4096;

/// Memory-aligned, zero-initialized buffer
pub struct AlignedBuffer {
    ptr: *mut u8,
    size: usize,
    layout: Layout,
}

impl AlignedBuffer {
    /// Allocate `size` bytes aligned to `alignment`
    ///
    /// # Errors
    ///
    /// Fails if `alignment` is not a power of two, `size` is zero, or the
    /// allocator returns null.
    pub fn new(size: usize, alignment: usize) -> crate::Result<Self> {
        if !alignment.is_power_of_two() {
            anyhow::bail!("buffer alignment {} is not a power of 2", alignment);
        }
        if size == 0 {
            anyhow::bail!("buffer size must be greater than 0");
        }

        let layout = Layout::from_size_align(size, alignment)
            .with_context(|| format!("invalid buffer layout: size={}, align={}", size, alignment))?;

        // SAFETY: layout has non-zero size (checked above).
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            anyhow::bail!("failed to allocate {} byte aligned buffer", size);
        }

        Ok(Self { ptr, size, layout })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    #[inline]
    pub fn is_aligned(&self) -> bool {
        (self.ptr as usize) % self.layout.align() == 0
    }

    /// Fill every byte with `value`
    pub fn fill_byte(&mut self, value: u8) {
        self.as_mut().fill(value);
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is a live allocation of `size` bytes owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }
}

impl DerefMut for AlignedBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is a live allocation of `size` bytes, uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with this exact layout.
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

// AlignedBuffer owns its memory exclusively
unsafe impl Send for AlignedBuffer {}

/// The buffer set owned by one I/O context
pub struct IoBuffers {
    /// Data written, or data just read
    pub data: AlignedBuffer,
    /// Expected data during a compare (or the partner's data in copy verify)
    pub verify: AlignedBuffer,
}

impl IoBuffers {
    pub fn new(block_size: usize, alignment: usize) -> crate::Result<Self> {
        Ok(Self {
            data: AlignedBuffer::new(block_size, alignment).context("data buffer")?,
            verify: AlignedBuffer::new(block_size, alignment).context("verify buffer")?,
        })
    }

    pub fn block_size(&self) -> usize {
        self.data.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buffer_creation() {
        let buffer = AlignedBuffer::new(4096, 512).unwrap();
        assert_eq!(buffer.size(), 4096);
        assert_eq!(buffer.alignment(), 512);
        assert!(buffer.is_aligned());
        assert!(buffer.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_aligned_buffer_4k_alignment() {
        let buffer = AlignedBuffer::new(8192, 4096).unwrap();
        assert!(buffer.is_aligned());
    }

    #[test]
    fn test_invalid_alignment() {
        assert!(AlignedBuffer::new(4096, 513).is_err());
        assert!(AlignedBuffer::new(0, 512).is_err());
    }

    #[test]
    fn test_fill_byte() {
        let mut buffer = AlignedBuffer::new(1024, 512).unwrap();
        buffer.fill_byte(0xA5);
        assert!(buffer.iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn test_io_buffers_are_distinct() {
        let mut bufs = IoBuffers::new(512, 512).unwrap();
        bufs.data.fill_byte(1);
        assert!(bufs.verify.iter().all(|&b| b == 0));
        assert_eq!(bufs.block_size(), 512);
    }
}
