//! Random-input fuzzer for reference protocol segments.
//!
//! Captured bytes are untrusted: parsing must never panic, and a parsed
//! segment must serialize back to the bytes it came from.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tandem_core::Packet;
use tandem_harness::Segment;

fuzz_target!(|data: &[u8]| {
    if let Ok(segment) = Segment::from_bytes(data) {
        // Addresses are canonicalized on parse, so compare after one cycle
        let bytes = segment.to_bytes();
        let again = Segment::from_bytes(&bytes).expect("own encoding parses");
        assert_eq!(again, segment);
    }
});
