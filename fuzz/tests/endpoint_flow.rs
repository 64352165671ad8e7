//! Bolero harness for the send/receive flow model.
//!
//! Properties:
//! - the ring only ever holds whole header records
//! - send fails exactly when free ring bytes < one record, cursor intact
//! - headers arrive in FIFO order with the offsets the producer reserved
//! - receive clamps the copy to the caller's buffer
//! - intact (non-overwritten) payloads read back with the bytes written

use bolero::check;
use chime_fuzz::endpoint_model::{execute_and_verify, FlowOp};

/// Keep the payload area small so cursor wraps happen often.
const PAYLOAD_CAPACITIES: [usize; 3] = [128, 1024, 4096];

fn main() {
    check!()
        .with_type::<(u8, Vec<(bool, u16, u8)>)>()
        .for_each(|(capacity_pick, ops_data)| {
            let payload_capacity =
                PAYLOAD_CAPACITIES[*capacity_pick as usize % PAYLOAD_CAPACITIES.len()];

            let ops: Vec<FlowOp> = ops_data
                .iter()
                .map(|(is_send, len, fill)| {
                    if *is_send {
                        FlowOp::Send {
                            len: *len % 512,
                            fill: *fill,
                        }
                    } else {
                        FlowOp::Recv { max_len: *len }
                    }
                })
                .collect();

            if let Err(e) = execute_and_verify(payload_capacity, &ops) {
                panic!("invariant violated: {}", e);
            }
        });
}

#[cfg(test)]
mod tests {
    #![allow(unused_imports)]
    use chime_fuzz::endpoint_model::{execute_and_verify, FlowOp};

    #[test]
    fn smoke_send_recv_interleaved() {
        let mut ops = Vec::new();
        for i in 0..40u16 {
            ops.push(FlowOp::Send {
                len: i * 7 % 200,
                fill: i as u8,
            });
            if i % 3 == 0 {
                ops.push(FlowOp::Recv { max_len: 256 });
            }
        }
        for _ in 0..40 {
            ops.push(FlowOp::Recv { max_len: 256 });
        }
        execute_and_verify(1024, &ops).unwrap();
    }

    #[test]
    fn smoke_ring_exhaustion() {
        let mut ops = Vec::new();
        for _ in 0..40 {
            ops.push(FlowOp::Send { len: 1, fill: 9 });
        }
        execute_and_verify(4096, &ops).unwrap();
    }
}
