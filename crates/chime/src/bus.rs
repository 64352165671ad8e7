//! Device bus collaborator interface.
//!
//! The protocol core does not enumerate devices, map BARs or wire up
//! interrupt vectors itself; that plumbing lives behind [`DeviceBus`].
//! A real implementation fronts an ivshmem-style PCI device; the
//! [`crate::loopback`] module provides an in-process implementation for
//! tests and demos.

use std::io;
use std::sync::Arc;

/// Register block offsets of the doorbell device, shared with every peer
/// implementation on the wire.
pub mod regs {
    /// Interrupt mask register.
    pub const INTR_MASK: u64 = 0x00;
    /// Interrupt status register.
    pub const INTR_STATUS: u64 = 0x04;
    /// This attachment's peer identity.
    pub const IVPOSITION: u64 = 0x08;
    /// Doorbell register; writing posts an interrupt to a remote peer.
    pub const DOORBELL: u64 = 0x0c;
}

/// Number of interrupt vectors an attachment requests from the bus.
pub const INTERRUPT_VECTORS: usize = 4;

/// An interrupt vector handle allocated by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VectorId(pub u16);

/// Callback invoked in interrupt context.
///
/// Runs in a restricted context: it must not block, allocate heavily, or
/// touch the shared queue. Its only job is to schedule deferred work.
pub type InterruptCallback = Box<dyn Fn() + Send + Sync>;

/// The transport plumbing an attachment runs on.
pub trait DeviceBus: Send + Sync {
    /// Map the shared region into this address space.
    fn map_region(&self) -> io::Result<Arc<MappedRegion>>;

    /// Read a device register.
    fn read_register(&self, offset: u64) -> u32;

    /// Write the doorbell register. Fire-and-forget: no acknowledgment,
    /// no retry. The value encodes `(target peer << 16) | vector`.
    fn write_doorbell(&self, value: u32);

    /// Allocate `count` interrupt vectors.
    fn allocate_vectors(&self, count: usize) -> io::Result<Vec<VectorId>>;

    /// Install the interrupt handler for a vector.
    fn on_interrupt(&self, vector: VectorId, callback: InterruptCallback);
}

/// Encode a doorbell register value targeting `peer` on `vector`.
#[inline]
pub fn doorbell_value(peer: u16, vector: u16) -> u32 {
    (peer as u32) << 16 | vector as u32
}

/// Split a doorbell register value into `(peer, vector)`.
#[inline]
pub fn split_doorbell_value(value: u32) -> (u16, u16) {
    ((value >> 16) as u16, (value & 0xffff) as u16)
}

/// An owned memory mapping, unmapped on drop.
pub struct MappedRegion {
    base_addr: usize,
    size: usize,
}

// SAFETY: MappedRegion only hands out the base pointer; synchronization of
// the pointed-to memory is the protocol layer's responsibility.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Create an anonymous shared mapping of `size` bytes, zero-filled.
    ///
    /// Anonymous `MAP_SHARED` memory is only visible to this process and
    /// its children; it is the backing used by the in-process loopback bus.
    pub fn anonymous(size: usize) -> io::Result<Arc<Self>> {
        use libc::{mmap, MAP_ANONYMOUS, MAP_FAILED, MAP_SHARED, PROT_READ, PROT_WRITE};

        tracing::debug!(size, "creating anonymous shared mapping");

        // SAFETY: requesting a fresh anonymous mapping; no existing memory
        // is aliased.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Arc::new(Self {
            base_addr: ptr as usize,
            size,
        }))
    }

    /// Base address of the mapping.
    #[inline]
    pub fn base_ptr(&self) -> *mut u8 {
        self.base_addr as *mut u8
    }

    /// Size of the mapping in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: we own the mapping created in `anonymous`.
        let rc = unsafe { libc::munmap(self.base_addr as *mut libc::c_void, self.size) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            tracing::error!(error = %err, size = self.size, "munmap failed for shared mapping");
        } else {
            tracing::debug!(size = self.size, "unmapped shared mapping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_value_roundtrip() {
        let value = doorbell_value(3, 1);
        assert_eq!(value, 0x0003_0001);
        assert_eq!(split_doorbell_value(value), (3, 1));
    }

    #[test]
    fn anonymous_mapping_is_zeroed_and_writable() {
        let mapping = MappedRegion::anonymous(4096).unwrap();
        let base = mapping.base_ptr();
        unsafe {
            assert_eq!(*base, 0);
            *base = 0xFF;
            assert_eq!(*base, 0xFF);
        }
    }
}
