#![no_main]

use libfuzzer_sys::fuzz_target;
use tempo_core::{Aid, Peer};
use tempo_node::delivery::{DeliveryFuture, DeliveryResult, PendingDeliveries};

fuzz_target!(|data: &[u8]| {
    let aids: Vec<Aid> = (0..4u8).map(|i| Aid::of(&[i])).collect();
    let peers: Vec<Peer> = (0..4u8)
        .map(|i| Peer::from_address(format!("peer-{i}")))
        .collect();
    let tracker = PendingDeliveries::new();
    let mut futures = Vec::new();

    for op in data {
        let aid = aids[usize::from(op & 0x03)];
        match op >> 2 & 0x03 {
            0 => {
                let start = usize::from(op >> 4 & 0x03);
                let (promise, future) = DeliveryFuture::pending();
                tracker.add(aid, &peers[start], &peers[start..], promise);
                futures.push(future);
            }
            1 => {
                let _ = tracker.pop_fallback(&aid);
            }
            2 => {
                tracker.complete(&aid, DeliveryResult::Failed);
                assert!(!tracker.is_pending(&aid));
            }
            _ => {
                if op >> 4 == 0x0F {
                    tracker.reset();
                    assert!(tracker.is_empty());
                }
            }
        }
        assert!(tracker.len() <= aids.len());
    }

    // Once the table is cleared nothing may be left in flight.
    tracker.reset();
    for mut future in futures {
        assert!(future.try_result().is_some());
    }
});
