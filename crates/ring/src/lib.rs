//! Shared ring buffer (§4.3): a single-writer, multi-reader circular byte
//! buffer backed by one piece of shared memory, mapped twice in a row so a
//! chunk that wraps past the end of the buffer still reads and writes as
//! one contiguous slice. Grounded on the buffer-ring technique in
//! `9f9633d2_lanl-nfs-utility-suite__rpc_protocol-src-server-ring.rs` (the
//! power-of-two capacity assertion and `Ordering::Release`-gated
//! publication), rebuilt here as a magic-ring double mapping instead of an
//! io_uring buffer ring, since there is no kernel consumer to register it
//! with.
//!
//! A writer claims a chunk with [`RingBuffer::new_chunk`], fills it in
//! place, and publishes it; readers call [`RingBuffer::get`] with an
//! absolute stream position and get back a slice, or a
//! [`bus::CoreError::StreamSpec`] if that position has already been
//! overwritten or hasn't been written yet.

use bus::CoreError;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::sys::memfd::{memfd_create, MFdFlags};
use nix::sys::mman::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;

type Result<T> = std::result::Result<T, CoreError>;

pub struct RingBuffer {
    capacity: usize,
    mask: usize,
    base: NonNull<u8>,
    head: AtomicU64,
}

// SAFETY: `base` points at a shared memory mapping that outlives every
// slice handed out from it (the mapping is torn down only in `Drop`, once
// no `&self` borrows can remain). All mutation goes through `new_chunk`,
// which is only ever called by the single writer that owns a `RingBuffer`.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// `capacity` must be a power of two and a multiple of the page size;
    /// pyacq leaves this to the caller, and so do we.
    pub fn new(capacity: usize, name: &str) -> Result<RingBuffer> {
        if capacity == 0 || capacity & (capacity - 1) != 0 {
            return Err(CoreError::StreamSpec(format!(
                "ring buffer capacity must be a power of two, got {capacity}"
            )));
        }

        let fd = memfd_create(name, MFdFlags::empty())
            .map_err(|e| CoreError::StreamSpec(format!("memfd_create failed: {e}")))?;
        ftruncate(fd.as_fd(), capacity as i64)
            .map_err(|e| CoreError::StreamSpec(format!("ftruncate failed: {e}")))?;

        // Reserve a window twice the capacity, unmapped, purely to pin an
        // address range we control.
        let total = NonZeroUsize::new(capacity * 2).expect("capacity > 0 checked above");
        let reservation = unsafe {
            mmap_anonymous(None, total, ProtFlags::PROT_NONE, MapFlags::MAP_PRIVATE)
                .map_err(|e| CoreError::StreamSpec(format!("reservation mmap failed: {e}")))?
        };

        let half = NonZeroUsize::new(capacity).expect("capacity > 0 checked above");
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        let flags = MapFlags::MAP_SHARED | MapFlags::MAP_FIXED;

        // SAFETY: both addresses fall inside the just-reserved, otherwise
        // untouched window, and the fd is sized to exactly `capacity`.
        unsafe {
            mmap(Some(non_null_addr(reservation)), half, prot, flags, fd.as_fd(), 0)
                .map_err(|e| CoreError::StreamSpec(format!("first half mmap failed: {e}")))?;
            let second = NonZeroUsize::new(reservation.as_ptr() as usize + capacity)
                .expect("address is nonzero");
            mmap(Some(second), half, prot, flags, fd.as_fd(), 0)
                .map_err(|e| CoreError::StreamSpec(format!("second half mmap failed: {e}")))?;
        }

        Ok(RingBuffer {
            capacity,
            mask: capacity - 1,
            base: reservation.cast(),
            head: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of bytes published so far (an absolute stream position,
    /// not wrapped to the buffer's physical size).
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Claims `len` bytes starting at the current head for the writer to
    /// fill in place. `len` must not exceed the buffer's capacity.
    pub fn new_chunk(&self, len: usize) -> Result<ChunkWriter<'_>> {
        if len > self.capacity {
            return Err(CoreError::StreamSpec(format!(
                "chunk of {len} bytes exceeds ring buffer capacity {}",
                self.capacity
            )));
        }
        let start = self.head.load(Ordering::Relaxed);
        let offset = (start as usize) & self.mask;
        // SAFETY: offset + len <= 2 * capacity because offset < capacity
        // and len <= capacity, and the whole window is our own mapping.
        let slice = unsafe { slice::from_raw_parts_mut(self.base.as_ptr().add(offset), len) };
        Ok(ChunkWriter { ring: self, start, slice })
    }

    /// Reads `len` bytes starting at absolute position `position`. Fails
    /// if that range hasn't been published yet, or has already been
    /// overwritten by a later chunk.
    pub fn get(&self, position: u64, len: usize) -> Result<&[u8]> {
        let head = self.head.load(Ordering::Acquire);
        let end = position
            .checked_add(len as u64)
            .ok_or_else(|| CoreError::StreamSpec("read range overflows".into()))?;
        if end > head {
            return Err(CoreError::StreamSpec(format!(
                "read position {position}+{len} is ahead of head {head}"
            )));
        }
        if head - position > self.capacity as u64 {
            return Err(CoreError::StreamSpec(format!(
                "read position {position} has fallen behind the buffer's capacity ({head} - {position} > {})",
                self.capacity
            )));
        }
        let offset = (position as usize) & self.mask;
        // SAFETY: same reasoning as `new_chunk`; the range was checked
        // above to lie within one already-published, not-yet-overwritten
        // capacity-sized window.
        Ok(unsafe { slice::from_raw_parts(self.base.as_ptr().add(offset), len) })
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        // SAFETY: nothing outlives `self`, so no slice into this mapping
        // can still be alive.
        unsafe {
            let _ = munmap(self.base.cast(), self.capacity * 2);
        }
    }
}

fn non_null_addr(ptr: NonNull<std::ffi::c_void>) -> NonZeroUsize {
    NonZeroUsize::new(ptr.as_ptr() as usize).expect("mmap never returns a null address")
}

/// A reserved, writer-owned slice of the ring buffer. Drop without calling
/// [`publish`](ChunkWriter::publish) to abandon the chunk without
/// advancing the head (the bytes are left in place but never become
/// readable).
pub struct ChunkWriter<'a> {
    ring: &'a RingBuffer,
    start: u64,
    slice: &'a mut [u8],
}

impl ChunkWriter<'_> {
    pub fn bytes(&mut self) -> &mut [u8] {
        self.slice
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Makes the chunk visible to readers. `Release` ordering here pairs
    /// with the `Acquire` load in `get`/`head`, so a reader that observes
    /// the new head also observes the bytes this writer just wrote.
    pub fn publish(self) {
        let end = self.start + self.slice.len() as u64;
        self.ring.head.store(end, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_are_visible_after_publish() {
        let ring = RingBuffer::new(4096, "ring-test-basic").unwrap();
        {
            let mut chunk = ring.new_chunk(5).unwrap();
            chunk.bytes().copy_from_slice(b"hello");
            chunk.publish();
        }
        let read = ring.get(0, 5).unwrap();
        assert_eq!(read, b"hello");
    }

    #[test]
    fn read_past_head_is_rejected() {
        let ring = RingBuffer::new(4096, "ring-test-ahead").unwrap();
        assert!(ring.get(0, 5).is_err());
    }

    #[test]
    fn wraparound_chunk_reads_contiguously() {
        let ring = RingBuffer::new(16, "ring-test-wrap").unwrap();
        {
            let mut chunk = ring.new_chunk(12).unwrap();
            chunk.bytes().copy_from_slice(&[1u8; 12]);
            chunk.publish();
        }
        {
            let mut chunk = ring.new_chunk(8).unwrap();
            chunk.bytes().copy_from_slice(&[2u8; 8]);
            chunk.publish();
        }
        // Second chunk starts at byte 12 and wraps past the 16-byte
        // physical buffer; the double mapping makes this one slice.
        let read = ring.get(12, 8).unwrap();
        assert_eq!(read, [2u8; 8]);
    }

    #[test]
    fn stale_read_behind_capacity_is_rejected() {
        let ring = RingBuffer::new(16, "ring-test-stale").unwrap();
        for _ in 0..3 {
            let mut chunk = ring.new_chunk(8).unwrap();
            chunk.bytes().copy_from_slice(&[9u8; 8]);
            chunk.publish();
        }
        // Position 0 was overwritten once the head passed 16.
        assert!(ring.get(0, 8).is_err());
    }
}
