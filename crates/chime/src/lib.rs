//! chime: doorbell-signalled shared-memory messaging.
//!
//! Peers in separate address spaces (typically virtual machines attached to
//! an ivshmem-style device) exchange discrete messages through one mapped
//! region, with no broker in between. One attachment is the sole producer,
//! one the sole consumer; new-data notification crosses the boundary as a
//! doorbell register write that fires an interrupt on the remote side and
//! schedules a deferred drain there.
//!
//! # Architecture
//!
//! ```text
//!  producer process                       consumer process
//!  ┌──────────────┐   shared region      ┌──────────────────────┐
//!  │ Endpoint     │  ┌───────────────┐   │ Endpoint             │
//!  │  send() ─────┼─►│ ring + payload│◄──┼─ receive()           │
//!  │              │  └───────────────┘   │    ▲                 │
//!  │  doorbell ───┼────── interrupt ─────┼─► DrainState ─► task │
//!  └──────────────┘                      └──────────────────────┘
//! ```
//!
//! The wire-level pieces (region layout, ring queue, framing, lock) live in
//! [`chime_core`]; this crate adds the attachment runtime: the
//! [`DeviceBus`] collaborator trait, the [`Endpoint`] with its role gate
//! and send/receive paths, and the interrupt → drain notification
//! machinery. The [`loopback`] module provides in-process bus plumbing for
//! tests and demos.
//!
//! # Usage
//!
//! ```ignore
//! let (producer, mut consumer) = chime::loopback::attached_pair(1 << 16)?;
//! let mut drained = consumer.start_drain()?;
//!
//! producer.send(b"HELLO\0")?;
//! let message = drained.recv().await.unwrap();
//! assert_eq!(message, b"HELLO\0");
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod bus;
pub mod endpoint;
pub mod loopback;
pub mod notify;

pub use bus::{doorbell_value, split_doorbell_value, DeviceBus, InterruptCallback, MappedRegion, VectorId};
pub use endpoint::{
    AttachError, Command, DrainError, Endpoint, EndpointConfig, ProtocolViolation, RecvError,
    Role, SendError,
};
pub use notify::DrainState;
