//! Fuzz target for feedback record decoding.

#![no_main]

use apnkit_push::{FeedbackRecord, RECORD_LEN};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for chunk in data.chunks_exact(RECORD_LEN) {
        let Ok(record) = <&[u8; RECORD_LEN]>::try_from(chunk) else {
            continue;
        };
        let decoded = FeedbackRecord::decode(record);
        // decoding is deterministic
        assert_eq!(FeedbackRecord::decode(record), decoded);
        assert_eq!(decoded.token.to_bytes().expect("token bytes"), record[6..].to_vec());
    }
});
