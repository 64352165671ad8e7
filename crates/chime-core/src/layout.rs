//! Shared-region layout definitions.
//!
//! This module defines the `repr(C)` queue header at the start of the region,
//! the fixed offsets of the ring storage, lock word and payload area, and the
//! [`SharedRegion`] view that hands out typed access to each of them.
//!
//! Peers in different address spaces map the same physical bytes, so every
//! offset here is part of the wire format and must never change without a
//! protocol revision.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use crate::lock::RegionLock;
use crate::ring::RingQueue;

/// Fixed capacity of the ring storage in bytes.
pub const RING_CAPACITY: usize = 512;

/// Size of the queue metadata header at region offset 0.
pub const QUEUE_HEADER_SIZE: usize = core::mem::size_of::<QueueHeader>();

/// Size of the lock slot at the tail of the ring storage.
///
/// The lock word occupies the first 4 bytes of this slot; the rest is
/// reserved. The slot overlaps the final bytes of the ring storage span —
/// a quirk of the legacy layout that peers on the wire already expect, so
/// it is preserved as-is.
pub const LOCK_SLOT_SIZE: usize = 16;

/// Smallest region that can hold the queue header and ring storage.
/// Anything beyond this becomes payload area.
pub const MIN_REGION_SIZE: usize = QUEUE_HEADER_SIZE + RING_CAPACITY;

/// Queue metadata header at the start of the shared region (24 bytes).
///
/// `head` and `tail` are free-running byte counters; `mask` is the ring
/// capacity minus one and doubles as the "is this region initialized"
/// marker; `esize` is the element size (always 1, the queue is
/// byte-granular).
///
/// `data` holds a peer-local pointer to the ring storage. A mapped address
/// is only meaningful inside the process that produced it, so every peer
/// must overwrite this field with its own view of the storage before any
/// queue access, then issue a full barrier. It is never read back as an
/// address by this implementation; it exists for wire compatibility and as
/// a debugging breadcrumb.
#[repr(C)]
pub struct QueueHeader {
    /// Total bytes ever pushed (free-running, wraps).
    pub head: AtomicU32,
    /// Total bytes ever popped (free-running, wraps).
    pub tail: AtomicU32,
    /// Ring capacity − 1. A value other than `RING_CAPACITY − 1` means the
    /// region has not been initialized yet.
    pub mask: AtomicU32,
    /// Element size in bytes (always 1).
    pub esize: AtomicU32,
    /// Peer-local ring storage address, rewritten before every access.
    pub data: AtomicU64,
}

const _: () = assert!(core::mem::size_of::<QueueHeader>() == 24);

impl QueueHeader {
    /// Capacity the header claims to have, or 0 if uninitialized garbage.
    #[inline]
    pub fn declared_capacity(&self) -> usize {
        self.mask.load(Ordering::Acquire).wrapping_add(1) as usize
    }
}

/// Byte offsets of each section inside a mapped region.
#[derive(Debug, Clone, Copy)]
pub struct RegionLayout {
    /// Offset of the queue metadata header (always 0).
    pub queue_header: usize,
    /// Offset of the ring byte storage.
    pub ring_storage: usize,
    /// Offset of the cross-process lock word.
    pub lock_word: usize,
    /// Offset of the payload area.
    pub payload_area: usize,
    /// Bytes available for payloads.
    pub payload_capacity: usize,
}

impl RegionLayout {
    /// Compute the layout for a region of `size` bytes.
    pub fn for_region(size: usize) -> Result<Self, LayoutError> {
        if size < MIN_REGION_SIZE {
            return Err(LayoutError::RegionTooSmall {
                required: MIN_REGION_SIZE,
                found: size,
            });
        }
        Ok(Self {
            queue_header: 0,
            ring_storage: QUEUE_HEADER_SIZE,
            lock_word: QUEUE_HEADER_SIZE + RING_CAPACITY - LOCK_SLOT_SIZE,
            payload_area: QUEUE_HEADER_SIZE + RING_CAPACITY,
            payload_capacity: size - MIN_REGION_SIZE,
        })
    }
}

/// A typed view over one mapped shared region.
///
/// The view itself owns nothing; the mapping must outlive it. All shared
/// state it touches is synchronized via atomics in the region (plus the
/// region lock for header publication), which is what makes handing copies
/// of this view to multiple threads sound.
pub struct SharedRegion {
    base: *mut u8,
    size: usize,
    layout: RegionLayout,
}

// SAFETY: all access to the pointed-to memory goes through atomics or is
// guarded by the protocol's lock/barrier discipline.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create a view over a mapped region.
    ///
    /// # Safety
    ///
    /// - `base` must point to at least `size` bytes of memory mapped
    ///   shared with the peer, valid for the lifetime of this view.
    /// - The memory may be concurrently mutated by other processes; all
    ///   access must tolerate that (this type's methods do).
    pub unsafe fn from_raw(base: *mut u8, size: usize) -> Result<Self, LayoutError> {
        if (base as usize) % core::mem::align_of::<QueueHeader>() != 0 {
            return Err(LayoutError::MisalignedBase {
                addr: base as usize,
            });
        }
        let layout = RegionLayout::for_region(size)?;
        Ok(Self { base, size, layout })
    }

    #[inline]
    fn header(&self) -> &QueueHeader {
        // SAFETY: offset 0 is in bounds and aligned (checked in from_raw).
        unsafe { &*(self.base.add(self.layout.queue_header) as *const QueueHeader) }
    }

    /// The region's layout offsets.
    #[inline]
    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    /// Total mapped size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes available for payloads.
    #[inline]
    pub fn payload_capacity(&self) -> usize {
        self.layout.payload_capacity
    }

    /// A ring queue view, freshly re-derived from the region base.
    ///
    /// The storage pointer is recomputed on every call and published into
    /// the queue header's view-pointer field, followed by a full barrier.
    /// Another process may have touched the region between calls; nothing
    /// derived from a previous call may be reused.
    pub fn queue(&self) -> RingQueue {
        let header = self.base.wrapping_add(self.layout.queue_header) as *mut QueueHeader;
        let storage = self.base.wrapping_add(self.layout.ring_storage);
        // SAFETY: both pointers are in bounds of the mapped region.
        let queue = unsafe { RingQueue::from_raw(header, storage) };
        self.header()
            .data
            .store(storage as u64, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        queue
    }

    /// The cross-process lock guarding header publication.
    pub fn lock(&self) -> RegionLock {
        let word = self.base.wrapping_add(self.layout.lock_word) as *mut u32;
        // SAFETY: the lock word offset is in bounds and 4-byte aligned.
        unsafe { RegionLock::from_raw(word) }
    }

    /// Lazily initialize the queue metadata if no peer has done so yet.
    ///
    /// The declared capacity is the initialization marker: if it already
    /// equals [`RING_CAPACITY`] the region is left untouched so another
    /// peer's queued records survive. Returns whether this call performed
    /// the initialization.
    ///
    /// Not synchronized against a concurrent initializer on another peer;
    /// two peers attaching at the same instant can race here. Known
    /// limitation of the protocol.
    pub fn initialize_if_needed(&self) -> bool {
        let header = self.header();
        if header.declared_capacity() == RING_CAPACITY {
            return false;
        }

        header.head.store(0, Ordering::Relaxed);
        header.tail.store(0, Ordering::Relaxed);
        header.esize.store(1, Ordering::Relaxed);
        header.data.store(
            self.base.wrapping_add(self.layout.ring_storage) as u64,
            Ordering::Relaxed,
        );
        // Capacity last: a peer that observes it also observes the reset
        // counters.
        header
            .mask
            .store((RING_CAPACITY - 1) as u32, Ordering::Release);
        self.lock().reset();
        fence(Ordering::SeqCst);
        true
    }

    /// Copy `bytes` into the payload area at `offset`.
    pub fn write_payload(&self, offset: u32, bytes: &[u8]) -> Result<(), LayoutError> {
        let offset = offset as usize;
        let end = offset
            .checked_add(bytes.len())
            .ok_or(LayoutError::PayloadRange {
                offset: offset as u64,
                len: bytes.len(),
                capacity: self.layout.payload_capacity,
            })?;
        if end > self.layout.payload_capacity {
            return Err(LayoutError::PayloadRange {
                offset: offset as u64,
                len: bytes.len(),
                capacity: self.layout.payload_capacity,
            });
        }
        // SAFETY: bounds checked against the payload area above.
        unsafe {
            let dst = self.base.add(self.layout.payload_area + offset);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes out of the payload area at `offset`.
    pub fn read_payload(&self, offset: u32, buf: &mut [u8]) -> Result<(), LayoutError> {
        let offset = offset as usize;
        let end = offset
            .checked_add(buf.len())
            .ok_or(LayoutError::PayloadRange {
                offset: offset as u64,
                len: buf.len(),
                capacity: self.layout.payload_capacity,
            })?;
        if end > self.layout.payload_capacity {
            return Err(LayoutError::PayloadRange {
                offset: offset as u64,
                len: buf.len(),
                capacity: self.layout.payload_capacity,
            });
        }
        // SAFETY: bounds checked against the payload area above.
        unsafe {
            let src = self.base.add(self.layout.payload_area + offset);
            std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }
}

/// Errors from layout validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Region smaller than header + ring storage.
    RegionTooSmall { required: usize, found: usize },
    /// Region base not aligned for the queue header.
    MisalignedBase { addr: usize },
    /// Payload access outside the payload area.
    PayloadRange {
        offset: u64,
        len: usize,
        capacity: usize,
    },
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RegionTooSmall { required, found } => {
                write!(f, "region too small: need {} bytes, got {}", required, found)
            }
            Self::MisalignedBase { addr } => {
                write!(f, "region base {:#x} is not 8-byte aligned", addr)
            }
            Self::PayloadRange {
                offset,
                len,
                capacity,
            } => write!(
                f,
                "payload range {}+{} outside payload area of {} bytes",
                offset, len, capacity
            ),
        }
    }
}

impl std::error::Error for LayoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HEADER_RECORD_SIZE;

    /// An 8-aligned heap buffer standing in for a mapped region.
    fn region_buf(size: usize) -> Box<[u64]> {
        vec![0u64; size.div_ceil(8)].into_boxed_slice()
    }

    #[test]
    fn queue_header_size() {
        assert_eq!(core::mem::size_of::<QueueHeader>(), 24);
    }

    #[test]
    fn layout_offsets() {
        let layout = RegionLayout::for_region(4096).unwrap();
        assert_eq!(layout.queue_header, 0);
        assert_eq!(layout.ring_storage, 24);
        assert_eq!(layout.lock_word, 24 + 512 - 16);
        assert_eq!(layout.payload_area, 24 + 512);
        assert_eq!(layout.payload_capacity, 4096 - 536);
    }

    #[test]
    fn layout_rejects_tiny_region() {
        assert!(matches!(
            RegionLayout::for_region(100),
            Err(LayoutError::RegionTooSmall { required: 536, .. })
        ));
    }

    #[test]
    fn initialize_then_noop() {
        let mut buf = region_buf(2048);
        let region =
            unsafe { SharedRegion::from_raw(buf.as_mut_ptr() as *mut u8, 2048) }.unwrap();

        assert!(region.initialize_if_needed());
        assert!(!region.initialize_if_needed());
        assert_eq!(region.header().declared_capacity(), RING_CAPACITY);
    }

    #[test]
    fn reinitialization_preserves_queued_records() {
        let mut buf = region_buf(2048);
        let region =
            unsafe { SharedRegion::from_raw(buf.as_mut_ptr() as *mut u8, 2048) }.unwrap();
        region.initialize_if_needed();

        let record = [7u8; HEADER_RECORD_SIZE];
        assert_eq!(region.queue().push(&record), HEADER_RECORD_SIZE);

        // A second attachment inspecting the region must leave the record
        // in place.
        assert!(!region.initialize_if_needed());
        let mut out = [0u8; HEADER_RECORD_SIZE];
        assert_eq!(region.queue().pop(&mut out), HEADER_RECORD_SIZE);
        assert_eq!(out, record);
    }

    #[test]
    fn payload_roundtrip_and_bounds() {
        let mut buf = region_buf(1024);
        let region =
            unsafe { SharedRegion::from_raw(buf.as_mut_ptr() as *mut u8, 1024) }.unwrap();

        region.write_payload(8, b"abc").unwrap();
        let mut out = [0u8; 3];
        region.read_payload(8, &mut out).unwrap();
        assert_eq!(&out, b"abc");

        let cap = region.payload_capacity();
        assert!(matches!(
            region.write_payload(cap as u32, b"x"),
            Err(LayoutError::PayloadRange { .. })
        ));
    }

    #[test]
    fn misaligned_base_rejected() {
        let mut buf = region_buf(1024);
        let base = unsafe { (buf.as_mut_ptr() as *mut u8).add(1) };
        assert!(matches!(
            unsafe { SharedRegion::from_raw(base, 1023) },
            Err(LayoutError::MisalignedBase { .. })
        ));
    }
}
