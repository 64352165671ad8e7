//! Cross-thread ordering and end-to-end notification tests.
//!
//! The barrier stress drives the wire-level primitives directly from two
//! threads, with an artificial delay wedged between the payload write and
//! the header publish. If the publication discipline were wrong, the
//! consumer could observe a header whose payload bytes are not yet all
//! written; the test asserts it never does.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chime::loopback::attached_pair;
use chime::{Command, MappedRegion};
use chime_core::{MessageHeader, SharedRegion, HEADER_RECORD_SIZE};

const REGION_SIZE: usize = 4096;

#[test]
fn consumer_never_sees_unfinished_payload() {
    const MESSAGES: u32 = 200;
    const PAYLOAD_LEN: usize = 64;

    let mapping = MappedRegion::anonymous(REGION_SIZE).unwrap();
    let init = unsafe { SharedRegion::from_raw(mapping.base_ptr(), mapping.size()) }.unwrap();
    init.initialize_if_needed();
    let payload_capacity = init.payload_capacity();

    let producer_mapping = Arc::clone(&mapping);
    let producer = std::thread::spawn(move || {
        let region = unsafe {
            SharedRegion::from_raw(producer_mapping.base_ptr(), producer_mapping.size())
        }
        .unwrap();

        let mut cursor = 0u32;
        for seq in 0..MESSAGES {
            let fill = (seq % 251) as u8 + 1;
            if cursor as usize + PAYLOAD_LEN > payload_capacity {
                cursor = 0;
            }
            region.write_payload(cursor, &[fill; PAYLOAD_LEN]).unwrap();
            fence(Ordering::Release);

            // Widen the window between payload write and header publish;
            // only the fences keep the consumer from peeking through it.
            std::thread::sleep(Duration::from_micros(50));

            let header = MessageHeader {
                source_id: 1,
                payload_offset: cursor,
                payload_length: PAYLOAD_LEN as i64,
            };
            loop {
                let lock = region.lock();
                let guard = lock.lock();
                let queue = region.queue();
                if queue.free() >= HEADER_RECORD_SIZE {
                    assert_eq!(queue.push(&header.encode()), HEADER_RECORD_SIZE);
                    drop(guard);
                    break;
                }
                drop(guard);
                std::thread::yield_now();
            }
            cursor += PAYLOAD_LEN as u32;
        }
    });

    let consumer_mapping = Arc::clone(&mapping);
    let consumer = std::thread::spawn(move || {
        let region = unsafe {
            SharedRegion::from_raw(consumer_mapping.base_ptr(), consumer_mapping.size())
        }
        .unwrap();

        let mut seen = 0u32;
        while seen < MESSAGES {
            let queue = region.queue();
            if queue.used() < HEADER_RECORD_SIZE {
                std::thread::yield_now();
                continue;
            }
            let mut record = [0u8; HEADER_RECORD_SIZE];
            assert_eq!(queue.pop(&mut record), HEADER_RECORD_SIZE);
            let header = MessageHeader::decode(&record);
            fence(Ordering::Acquire);

            let mut payload = [0u8; PAYLOAD_LEN];
            region
                .read_payload(header.payload_offset, &mut payload)
                .unwrap();

            let expected = (seen % 251) as u8 + 1;
            assert!(
                payload.iter().all(|&b| b == expected),
                "message {} torn: header published before payload completed",
                seen
            );
            seen += 1;
        }
    });

    producer.join().unwrap();
    consumer.join().unwrap();
}

#[tokio::test]
async fn doorbell_drives_drain_end_to_end() {
    let (producer, mut consumer) = attached_pair(REGION_SIZE).unwrap();
    let mut drained = consumer.start_drain().unwrap();

    for i in 0..5u32 {
        let message = format!("ping {}", i);
        producer.send(message.as_bytes()).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), drained.recv())
            .await
            .expect("drain did not deliver in time")
            .expect("drain channel closed");
        assert_eq!(received, message.as_bytes());
    }
}

#[tokio::test]
async fn burst_drains_with_repeated_doorbells() {
    let (producer, mut consumer) = attached_pair(REGION_SIZE).unwrap();
    let mut drained = consumer.start_drain().unwrap();

    // Fire a burst faster than the drain can run. Doorbells coalesce, so
    // one activation per message is not guaranteed; each activation pops at
    // most one message and later doorbells pick up the rest.
    for i in 0..3u32 {
        producer.send(format!("burst {}", i).as_bytes()).unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 3 {
        match tokio::time::timeout(Duration::from_millis(50), drained.recv()).await {
            Ok(Some(message)) => received.push(message),
            Ok(None) => panic!("drain channel closed"),
            // Coalesced away; ring again, as the next real send would.
            Err(_) => {
                producer.command(Command::Ring(chime::doorbell_value(1, 1)));
            }
        }
    }

    for (i, message) in received.iter().enumerate() {
        assert_eq!(message, format!("burst {}", i).as_bytes());
    }
}
