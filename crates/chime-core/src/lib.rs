//! chime-core: wire-level protocol for doorbell-signalled shared-memory
//! messaging.
//!
//! This crate defines the canonical byte layout of the shared region and the
//! primitives that operate on it: the queue metadata header, the byte ring
//! that carries message header records, the message framing, and the
//! cross-process lock word. Everything here is synchronous and I/O-free;
//! the attachment runtime lives in the `chime` crate.
//!
//! # Memory Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  Queue header (24 bytes: head, tail, mask, esize, view pointer)      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Ring storage (512 bytes, carries 16-byte message header records)    │
//! │    · the last 16 bytes double as the cross-process lock slot         │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Payload area (region size − 536 bytes)                              │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The layout is byte-identical across peers; it is what makes two
//! independently built attachments interoperate over one mapped region.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod frame;
pub mod layout;
pub mod lock;
pub mod ring;

pub use frame::{MessageHeader, HEADER_RECORD_SIZE};
pub use layout::{
    LayoutError, QueueHeader, RegionLayout, SharedRegion, LOCK_SLOT_SIZE, MIN_REGION_SIZE,
    QUEUE_HEADER_SIZE, RING_CAPACITY,
};
pub use lock::{RegionGuard, RegionLock};
pub use ring::RingQueue;
