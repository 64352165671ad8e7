//! Attachment endpoint: the producer/consumer protocol over one region.
//!
//! An [`Endpoint`] owns everything one attachment needs — the mapped
//! region, its role, its payload cursor and its drain machinery — so two
//! attachments in one process never share mutable state outside the region
//! itself.

use std::io;
use std::sync::atomic::{fence, AtomicU32, Ordering};
use std::sync::Arc;

use chime_core::{LayoutError, MessageHeader, SharedRegion, HEADER_RECORD_SIZE};
use tokio::sync::mpsc;

use crate::bus::{doorbell_value, regs, DeviceBus, MappedRegion, INTERRUPT_VECTORS};
use crate::notify::{spawn_drain, DrainHandle, DrainState};

/// The capability assigned to an attachment for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// May only dequeue.
    Consumer,
    /// May only enqueue.
    Producer,
}

/// Attachment configuration, fixed at attach time.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Producer or Consumer, immutable for the attachment lifetime.
    pub role: Role,
    /// Identity stamped into outgoing message headers.
    pub source_id: u32,
    /// Identity accepted on incoming message headers.
    pub expected_source: u32,
    /// Remote peer the doorbell targets.
    pub doorbell_peer: u16,
    /// Interrupt vector the doorbell targets.
    pub doorbell_vector: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            role: Role::Producer,
            source_id: 1,
            expected_source: 1,
            doorbell_peer: 0,
            doorbell_vector: 1,
        }
    }
}

/// Commands of the thin dispatch surface exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Write a raw value to the doorbell register.
    Ring(u32),
    /// Reserved for a future blocking receive; currently a no-op.
    Wait,
    /// Query this attachment's peer identity.
    LocalId,
}

/// Per-attachment state shared with the drain task.
struct Core {
    bus: Arc<dyn DeviceBus>,
    // Keeps the mapping alive for as long as `region` points into it.
    _mapping: Arc<MappedRegion>,
    region: SharedRegion,
    role: Role,
    local_id: u32,
    source_id: u32,
    expected_source: u32,
    doorbell: u32,
    /// Next free payload offset. Only the single producer attachment
    /// advances it; it is deliberately not synchronized across processes.
    cursor: AtomicU32,
}

impl Core {
    /// Producer enqueue path.
    fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        if self.role != Role::Producer {
            return Err(SendError::CapabilityViolation);
        }

        let queue = self.region.queue();
        let free = queue.free();
        if free < HEADER_RECORD_SIZE {
            return Err(SendError::CapacityExceeded { free });
        }

        // Reserve a payload slot at the cursor, wrapping to the start of
        // the payload area when the tail end would not fit. Wrapping can
        // overwrite older payloads that are still unread; the protocol
        // accepts that in exchange for never tracking per-payload
        // lifetimes.
        let capacity = self.region.payload_capacity();
        if payload.len() > capacity {
            return Err(SendError::CapacityExceeded { free });
        }
        let mut offset = self.cursor.load(Ordering::Relaxed);
        if offset as usize + payload.len() > capacity {
            offset = 0;
        }

        self.region
            .write_payload(offset, payload)
            .expect("payload slot bounds were just checked");

        // Payload bytes must be globally visible before any header that
        // references them.
        fence(Ordering::Release);

        let wrote = {
            let lock = self.region.lock();
            let _guard = lock.lock();
            // Re-derive the ring view under the lock; another process may
            // have moved the counters since the capacity check.
            let queue = self.region.queue();
            let header = MessageHeader {
                source_id: self.source_id,
                payload_offset: offset,
                payload_length: payload.len() as i64,
            };
            queue.push(&header.encode())
        };

        if wrote != HEADER_RECORD_SIZE {
            // The payload copy is abandoned in place; the cursor does not
            // move, so the slot is reused by the next send.
            tracing::warn!(wrote, "header record truncated during publish");
            return Err(SendError::Transport { wrote });
        }

        self.bus.write_doorbell(self.doorbell);
        self.cursor
            .store(offset + payload.len() as u32, Ordering::Relaxed);
        tracing::trace!(offset, len = payload.len(), "message sent");
        Ok(())
    }

    /// Consumer dequeue path. `Ok(0)` means no message was queued.
    fn receive(&self, buf: &mut [u8]) -> Result<usize, RecvError> {
        if self.role != Role::Consumer {
            return Err(RecvError::CapabilityViolation);
        }

        let queue = self.region.queue();
        if queue.used() < HEADER_RECORD_SIZE {
            return Ok(0);
        }

        let mut record = [0u8; HEADER_RECORD_SIZE];
        let got = queue.pop(&mut record);
        if got != HEADER_RECORD_SIZE {
            return Err(RecvError::Protocol(ProtocolViolation::TruncatedRecord {
                got,
            }));
        }

        let header = MessageHeader::decode(&record);
        if header.source_id != self.expected_source {
            return Err(RecvError::Protocol(ProtocolViolation::SourceMismatch {
                expected: self.expected_source,
                found: header.source_id,
            }));
        }

        let capacity = self.region.payload_capacity();
        let length = header.payload_length;
        if length < 0 || header.payload_offset as usize + length as usize > capacity {
            return Err(RecvError::Protocol(ProtocolViolation::PayloadOutOfBounds {
                offset: header.payload_offset,
                length,
                capacity,
            }));
        }

        // Order the header pop before the payload read; the producer's
        // release fence pairs with this.
        fence(Ordering::Acquire);

        let n = buf.len().min(length as usize);
        self.region
            .read_payload(header.payload_offset, &mut buf[..n])
            .expect("payload bounds were just validated");
        tracing::trace!(
            offset = header.payload_offset,
            len = n,
            "message received"
        );
        Ok(n)
    }
}

/// One attachment to a shared region.
pub struct Endpoint {
    core: Arc<Core>,
    gate: Arc<DrainState>,
    drain: Option<DrainHandle>,
}

impl Endpoint {
    /// Attach to the region behind `bus`.
    ///
    /// Maps the region, reads the local peer identity, allocates interrupt
    /// vectors, installs the doorbell handler and lazily initializes the
    /// queue metadata. Failures here are fatal to the attach attempt and
    /// are never retried internally.
    pub fn attach(bus: Arc<dyn DeviceBus>, config: EndpointConfig) -> Result<Self, AttachError> {
        let mapping = bus.map_region().map_err(AttachError::Map)?;
        // SAFETY: the mapping is held by `Core` for at least as long as the
        // region view.
        let region = unsafe { SharedRegion::from_raw(mapping.base_ptr(), mapping.size()) }
            .map_err(AttachError::Layout)?;

        let local_id = bus.read_register(regs::IVPOSITION);
        let vectors = bus
            .allocate_vectors(INTERRUPT_VECTORS)
            .map_err(AttachError::Vectors)?;

        let initialized = region.initialize_if_needed();
        tracing::debug!(
            role = ?config.role,
            local_id,
            vectors = vectors.len(),
            initialized,
            "attached to shared region"
        );

        let gate = Arc::new(DrainState::new());
        for vector in &vectors {
            let gate = gate.clone();
            bus.on_interrupt(
                *vector,
                Box::new(move || {
                    // Interrupt context: schedule the drain and return.
                    gate.ring();
                }),
            );
        }

        let core = Arc::new(Core {
            doorbell: doorbell_value(config.doorbell_peer, config.doorbell_vector),
            bus,
            _mapping: mapping,
            region,
            role: config.role,
            local_id,
            source_id: config.source_id,
            expected_source: config.expected_source,
            cursor: AtomicU32::new(0),
        });

        Ok(Self {
            core,
            gate,
            drain: None,
        })
    }

    /// This attachment's role.
    #[inline]
    pub fn role(&self) -> Role {
        self.core.role
    }

    /// This attachment's peer identity as reported by the bus.
    #[inline]
    pub fn local_id(&self) -> u32 {
        self.core.local_id
    }

    /// Enqueue one message. Producer role only; non-blocking.
    pub fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        self.core.send(payload)
    }

    /// Dequeue one message into `buf`. Consumer role only; non-blocking,
    /// `Ok(0)` when nothing is queued. Returns the number of payload
    /// bytes copied.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize, RecvError> {
        self.core.receive(buf)
    }

    /// Start the deferred drain task and return the channel it forwards
    /// drained messages to. Consumer role only; must be called from within
    /// a tokio runtime. The task performs one `receive` per doorbell
    /// activation and is aborted when the endpoint drops.
    pub fn start_drain(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, DrainError> {
        if self.core.role != Role::Consumer {
            return Err(DrainError::CapabilityViolation);
        }
        if self.drain.is_some() {
            return Err(DrainError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let core = self.core.clone();
        self.drain = Some(spawn_drain(self.gate.clone(), tx, move |buf| {
            core.receive(buf)
        }));
        Ok(rx)
    }

    /// Dispatch one command of the thin control surface.
    pub fn command(&self, command: Command) -> u32 {
        match command {
            Command::Ring(value) => {
                self.core.bus.write_doorbell(value);
                0
            }
            Command::Wait => {
                // Reserved: a blocking receive does not exist yet. Callers
                // poll `receive` or use the drain channel.
                tracing::debug!("wait command is not implemented");
                0
            }
            Command::LocalId => self.core.local_id,
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        tracing::debug!(role = ?self.core.role, "detaching endpoint");
        // DrainHandle aborts its task on drop; the mapping unmaps when the
        // last reference goes away.
        self.drain.take();
    }
}

/// Attach-time failures. Fatal to the attempt, surfaced synchronously.
#[derive(Debug)]
pub enum AttachError {
    /// Region mapping failed or the bus refused it.
    Map(io::Error),
    /// The mapped region cannot hold the protocol layout.
    Layout(LayoutError),
    /// Interrupt vector allocation failed.
    Vectors(io::Error),
}

impl std::fmt::Display for AttachError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Map(e) => write!(f, "region mapping failed: {}", e),
            Self::Layout(e) => write!(f, "region layout invalid: {}", e),
            Self::Vectors(e) => write!(f, "interrupt vector allocation failed: {}", e),
        }
    }
}

impl std::error::Error for AttachError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Map(e) | Self::Vectors(e) => Some(e),
            Self::Layout(e) => Some(e),
        }
    }
}

/// Failures of the producer enqueue path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The attachment is not the producer. Benign; nothing was touched.
    CapabilityViolation,
    /// Fewer free ring bytes than one header record. The caller may retry
    /// later; nothing was written.
    CapacityExceeded { free: usize },
    /// The header record was truncated during publish. The payload slot is
    /// abandoned; not retried automatically.
    Transport { wrote: usize },
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CapabilityViolation => write!(f, "attachment is not the producer"),
            Self::CapacityExceeded { free } => {
                write!(f, "ring full: {} bytes free, need {}", free, HEADER_RECORD_SIZE)
            }
            Self::Transport { wrote } => write!(
                f,
                "header record truncated: wrote {} of {} bytes",
                wrote, HEADER_RECORD_SIZE
            ),
        }
    }
}

impl std::error::Error for SendError {}

/// Failures of the consumer dequeue path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// The attachment is not the consumer. Benign; nothing was touched.
    CapabilityViolation,
    /// The queue held a header that does not belong to the protocol peer.
    Protocol(ProtocolViolation),
}

impl std::fmt::Display for RecvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CapabilityViolation => write!(f, "attachment is not the consumer"),
            Self::Protocol(v) => write!(f, "protocol violation: {}", v),
        }
    }
}

impl std::error::Error for RecvError {}

/// Ways a popped header can turn out to be garbage: uninitialized memory,
/// cross-talk from an unrelated writer, or corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// The header's source does not match the expected peer.
    SourceMismatch { expected: u32, found: u32 },
    /// The header points outside the payload area.
    PayloadOutOfBounds {
        offset: u32,
        length: i64,
        capacity: usize,
    },
    /// The queue yielded less than a whole record.
    TruncatedRecord { got: usize },
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceMismatch { expected, found } => {
                write!(f, "source id {} (expected {})", found, expected)
            }
            Self::PayloadOutOfBounds {
                offset,
                length,
                capacity,
            } => write!(
                f,
                "payload {}+{} outside payload area of {} bytes",
                offset, length, capacity
            ),
            Self::TruncatedRecord { got } => {
                write!(f, "popped {} of {} record bytes", got, HEADER_RECORD_SIZE)
            }
        }
    }
}

/// Failures starting the drain task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainError {
    /// Only consumer attachments drain.
    CapabilityViolation,
    /// The drain task is already running.
    AlreadyRunning,
}

impl std::fmt::Display for DrainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CapabilityViolation => write!(f, "attachment is not the consumer"),
            Self::AlreadyRunning => write!(f, "drain task already running"),
        }
    }
}

impl std::error::Error for DrainError {}
