use std::panic;

use tempo_codec::{
    decode_message_cbor, encode_message_cbor, DeliveryRequestMessage, DeliveryResponseMessage,
    Message,
};
use tempo_core::{Aid, LedgerEntry};

fn xorshift64(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut s = seed.max(1);
    let mut out = vec![0_u8; len];
    for b in &mut out {
        *b = (xorshift64(&mut s) & 0xFF) as u8;
    }
    out
}

fn sample_messages() -> Vec<Vec<u8>> {
    let request = Message::from(DeliveryRequestMessage::new(
        (0_u8..16).map(|i| Aid::of(&[i])),
    ));
    let response = Message::from(DeliveryResponseMessage {
        entry: LedgerEntry::new(random_bytes(7, 512)),
    });
    vec![
        encode_message_cbor(&request).expect("request should encode"),
        encode_message_cbor(&response).expect("response should encode"),
    ]
}

#[test]
fn decode_random_bytes_never_panics() {
    for seed in 1..512_u64 {
        let len = (seed as usize * 7) % 700;
        let bytes = random_bytes(seed, len);
        let outcome = panic::catch_unwind(|| decode_message_cbor(&bytes));
        assert!(outcome.is_ok(), "decoder panicked for seed {seed}");
    }
}

#[test]
fn decode_mutated_messages_never_panics() {
    for (idx, encoded) in sample_messages().into_iter().enumerate() {
        for seed in 1..256_u64 {
            let mut mutated = encoded.clone();
            let noise = random_bytes(seed ^ idx as u64, 4);
            let pos = (xorshift64(&mut (seed + 1)) as usize) % mutated.len();
            mutated[pos] ^= noise[0] | 1;
            if seed % 3 == 0 {
                mutated.truncate(pos);
            }
            let outcome = panic::catch_unwind(|| decode_message_cbor(&mutated));
            assert!(outcome.is_ok(), "decoder panicked on mutation {seed}");
        }
    }
}
