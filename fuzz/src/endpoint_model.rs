//! Model of the send/receive protocol flow for property-based testing.
//!
//! Combines the byte ring (carrying 16-byte header records) with a payload
//! area and the producer's wrapping cursor:
//! 1. Producer reserves a payload slot at the cursor (wrapping when the
//!    tail end would not fit).
//! 2. Producer writes payload bytes, then publishes a header record.
//! 3. Consumer pops one record, validates it, copies the payload out.
//!
//! The payload area has no per-message lifetime tracking, so a wrapped
//! cursor may overwrite payloads that are still queued; the oracle tracks
//! which queued messages were clobbered and only checks content for the
//! intact ones.

use std::collections::VecDeque;

use crate::ring_model::ByteRingModel;

/// Size of one encoded header record.
pub const RECORD_SIZE: usize = 16;

/// Ring capacity used by the flow model (the production value).
pub const RING_CAPACITY: u32 = 512;

/// A message the oracle expects the consumer to see.
#[derive(Clone, Debug)]
struct Expected {
    offset: u32,
    len: usize,
    fill: u8,
    /// A later payload write overlapped this message's bytes.
    clobbered: bool,
}

/// Errors of the modelled send path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// Fewer free ring bytes than one record.
    RingFull,
    /// Payload larger than the whole payload area.
    PayloadTooLarge,
}

/// The flow model: one producer, one consumer, one region.
pub struct FlowModel {
    ring: ByteRingModel,
    payload: Vec<u8>,
    cursor: u32,
    source_id: u32,
    expected_source: u32,
    oracle: VecDeque<Expected>,
}

impl FlowModel {
    pub fn new(payload_capacity: usize, source_id: u32, expected_source: u32) -> Self {
        Self {
            ring: ByteRingModel::new(RING_CAPACITY),
            payload: vec![0; payload_capacity],
            cursor: 0,
            source_id,
            expected_source,
            oracle: VecDeque::new(),
        }
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn queued(&self) -> usize {
        self.oracle.len()
    }

    fn encode_header(&self, offset: u32, len: usize) -> [u8; RECORD_SIZE] {
        let mut record = [0u8; RECORD_SIZE];
        record[0..4].copy_from_slice(&self.source_id.to_le_bytes());
        record[4..8].copy_from_slice(&offset.to_le_bytes());
        record[8..16].copy_from_slice(&(len as i64).to_le_bytes());
        record
    }

    /// Producer path. `Err` leaves the cursor and oracle untouched.
    pub fn send(&mut self, len: usize, fill: u8) -> Result<(), SendFailure> {
        if self.ring.free() < RECORD_SIZE {
            return Err(SendFailure::RingFull);
        }
        if len > self.payload.len() {
            return Err(SendFailure::PayloadTooLarge);
        }

        let mut offset = self.cursor;
        if offset as usize + len > self.payload.len() {
            offset = 0;
        }

        self.payload[offset as usize..offset as usize + len].fill(fill);
        // Mark queued messages whose bytes this write overlapped.
        for expected in &mut self.oracle {
            let a = expected.offset as usize..expected.offset as usize + expected.len;
            let b = offset as usize..offset as usize + len;
            if a.start < b.end && b.start < a.end {
                expected.clobbered = true;
            }
        }

        let record = self.encode_header(offset, len);
        let wrote = self.ring.push(&record);
        assert_eq!(wrote, RECORD_SIZE, "free space was checked above");

        self.oracle.push_back(Expected {
            offset,
            len,
            fill,
            clobbered: false,
        });
        self.cursor = offset + len as u32;
        Ok(())
    }

    /// Consumer path. Returns the copied bytes, or `None` when no whole
    /// record is queued.
    pub fn recv(&mut self, max_len: usize) -> Result<Option<Vec<u8>>, String> {
        if self.ring.used() < RECORD_SIZE {
            return Ok(None);
        }

        let mut record = [0u8; RECORD_SIZE];
        let got = self.ring.pop(&mut record);
        if got != RECORD_SIZE {
            return Err(format!("popped {} of {} record bytes", got, RECORD_SIZE));
        }

        let source = u32::from_le_bytes(record[0..4].try_into().unwrap());
        let offset = u32::from_le_bytes(record[4..8].try_into().unwrap());
        let length = i64::from_le_bytes(record[8..16].try_into().unwrap());

        if source != self.expected_source {
            return Err(format!("source {} != expected {}", source, self.expected_source));
        }
        if length < 0 || offset as usize + length as usize > self.payload.len() {
            return Err(format!("payload {}+{} out of bounds", offset, length));
        }

        let expected = self
            .oracle
            .pop_front()
            .ok_or("consumer saw a record the producer never sent")?;
        if expected.offset != offset || expected.len != length as usize {
            return Err(format!(
                "header out of order: got {}+{}, want {}+{}",
                offset, length, expected.offset, expected.len
            ));
        }

        let n = max_len.min(length as usize);
        let bytes = self.payload[offset as usize..offset as usize + n].to_vec();
        if !expected.clobbered && !bytes.iter().all(|&b| b == expected.fill) {
            return Err(format!(
                "payload content mismatch for intact message at {}",
                offset
            ));
        }
        Ok(Some(bytes))
    }
}

/// Operations for flow fuzzing.
#[derive(Clone, Debug)]
pub enum FlowOp {
    Send { len: u16, fill: u8 },
    Recv { max_len: u16 },
}

/// Execute a sequence of flow operations, verifying protocol invariants
/// after every step.
pub fn execute_and_verify(payload_capacity: usize, ops: &[FlowOp]) -> Result<(), String> {
    let mut model = FlowModel::new(payload_capacity, 1, 1);

    for (i, op) in ops.iter().enumerate() {
        match op {
            FlowOp::Send { len, fill } => {
                let cursor_before = model.cursor();
                let queued_before = model.queued();
                match model.send(*len as usize, *fill) {
                    Ok(()) => {
                        if model.queued() != queued_before + 1 {
                            return Err(format!("op {}: send did not queue a record", i));
                        }
                    }
                    Err(SendFailure::RingFull) => {
                        if model.ring.free() >= RECORD_SIZE {
                            return Err(format!(
                                "op {}: reported full with {} bytes free",
                                i,
                                model.ring.free()
                            ));
                        }
                        if model.cursor() != cursor_before {
                            return Err(format!("op {}: cursor moved on failed send", i));
                        }
                    }
                    Err(SendFailure::PayloadTooLarge) => {
                        if (*len as usize) <= payload_capacity {
                            return Err(format!("op {}: {} bytes rejected as too large", i, len));
                        }
                        if model.cursor() != cursor_before {
                            return Err(format!("op {}: cursor moved on failed send", i));
                        }
                    }
                }
            }
            FlowOp::Recv { max_len } => {
                let queued_before = model.queued();
                match model.recv(*max_len as usize)? {
                    Some(bytes) => {
                        if bytes.len() > *max_len as usize {
                            return Err(format!(
                                "op {}: recv copied {} bytes past the caller limit {}",
                                i,
                                bytes.len(),
                                max_len
                            ));
                        }
                    }
                    None => {
                        if queued_before != 0 {
                            return Err(format!(
                                "op {}: recv saw nothing but {} records are queued",
                                i, queued_before
                            ));
                        }
                    }
                }
            }
        }

        // The ring carries whole records only.
        if model.ring.used() % RECORD_SIZE != 0 {
            return Err(format!(
                "op {}: ring holds a partial record ({} bytes)",
                i,
                model.ring.used()
            ));
        }
    }

    Ok(())
}
