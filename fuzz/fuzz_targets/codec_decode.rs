#![no_main]

use libfuzzer_sys::fuzz_target;
use tempo_codec::{decode_message_cbor, encode_message_cbor};

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = decode_message_cbor(data) {
        // Anything that decodes must re-encode and decode to the same message.
        let bytes = encode_message_cbor(&message).expect("decoded message re-encodes");
        assert_eq!(decode_message_cbor(&bytes).ok(), Some(message));
    }
});
