//! Fuzz target for gateway frame decoding.
//!
//! Decoding arbitrary bytes must never panic, and every decoded simple
//! frame that fits the limits must encode back to the same frame.

#![no_main]

use apnkit_push::{encode_frame, Frame, COMMAND_SIMPLE};
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut buf = Bytes::copy_from_slice(data);
    while let Ok(Some(frame)) = Frame::decode(&mut buf) {
        if frame.command != COMMAND_SIMPLE {
            continue;
        }
        if let Ok(encoded) = encode_frame(&frame.device_token(), &frame.payload) {
            let decoded = Frame::decode_all(&encoded).expect("re-decode");
            assert_eq!(decoded, vec![frame]);
        }
    }
});
