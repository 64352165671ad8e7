//! In-process loopback bus.
//!
//! Two [`DeviceBus`] endpoints sharing one anonymous mapping, with doorbell
//! writes dispatched synchronously to the target peer's interrupt handler.
//! This stands in for the real device plumbing so the full
//! send → doorbell → interrupt → drain → receive path can run inside one
//! process, which is what the tests, demos and stress harness build on.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::bus::{
    regs, split_doorbell_value, DeviceBus, InterruptCallback, MappedRegion, VectorId,
};
use crate::endpoint::{AttachError, Endpoint, EndpointConfig, Role};

/// Handlers registered by one peer.
#[derive(Default)]
struct PeerSlot {
    handlers: RwLock<HashMap<u16, InterruptCallback>>,
}

struct Shared {
    mapping: Arc<MappedRegion>,
    peers: [PeerSlot; 2],
}

/// One side of an in-process bus pair.
pub struct LoopbackBus {
    shared: Arc<Shared>,
    /// Peer identity, also the index into the handler table.
    id: u32,
}

impl LoopbackBus {
    /// Create a connected pair of buses over one fresh anonymous region.
    /// The first bus reports peer identity 0, the second 1.
    pub fn pair(region_size: usize) -> io::Result<(Self, Self)> {
        let mapping = MappedRegion::anonymous(region_size)?;
        let shared = Arc::new(Shared {
            mapping,
            peers: [PeerSlot::default(), PeerSlot::default()],
        });
        Ok((
            Self {
                shared: shared.clone(),
                id: 0,
            },
            Self { shared, id: 1 },
        ))
    }
}

impl DeviceBus for LoopbackBus {
    fn map_region(&self) -> io::Result<Arc<MappedRegion>> {
        Ok(self.shared.mapping.clone())
    }

    fn read_register(&self, offset: u64) -> u32 {
        match offset {
            regs::IVPOSITION => self.id,
            _ => 0,
        }
    }

    fn write_doorbell(&self, value: u32) {
        let (peer, vector) = split_doorbell_value(value);
        let Some(slot) = self.shared.peers.get(peer as usize) else {
            tracing::trace!(peer, vector, "doorbell to unknown peer dropped");
            return;
        };
        // The handler contract is interrupt-context: short and
        // non-blocking, so invoking under the read lock is fine.
        let handlers = slot.handlers.read();
        match handlers.get(&vector) {
            Some(callback) => callback(),
            None => tracing::trace!(peer, vector, "doorbell on unwired vector dropped"),
        }
    }

    fn allocate_vectors(&self, count: usize) -> io::Result<Vec<VectorId>> {
        Ok((0..count as u16).map(VectorId).collect())
    }

    fn on_interrupt(&self, vector: VectorId, callback: InterruptCallback) {
        self.shared.peers[self.id as usize]
            .handlers
            .write()
            .insert(vector.0, callback);
    }
}

/// Attach a producer/consumer endpoint pair over a fresh loopback region.
///
/// The producer rings peer 1 (the consumer); both sides use the default
/// protocol source identity.
pub fn attached_pair(region_size: usize) -> Result<(Endpoint, Endpoint), AttachError> {
    let (producer_bus, consumer_bus) = LoopbackBus::pair(region_size).map_err(AttachError::Map)?;
    let producer = Endpoint::attach(
        Arc::new(producer_bus),
        EndpointConfig {
            role: Role::Producer,
            doorbell_peer: 1,
            ..EndpointConfig::default()
        },
    )?;
    let consumer = Endpoint::attach(
        Arc::new(consumer_bus),
        EndpointConfig {
            role: Role::Consumer,
            doorbell_peer: 0,
            ..EndpointConfig::default()
        },
    )?;
    Ok((producer, consumer))
}
