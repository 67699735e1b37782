//! Random-input fuzzer for sync datagram decoding.
//!
//! Whatever arrives on the side channel, decoding must return a value or an
//! error, never panic. Anything that decodes must survive re-encoding, and
//! state snapshots must rebuild a state container.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tandem_core::State;
use tandem_proto::{Datagram, SyncMessage};

fuzz_target!(|data: &[u8]| {
    if let Ok(datagram) = Datagram::decode(data) {
        let encoded = datagram.encode().expect("decoded datagram fits a datagram");
        let again = Datagram::decode(&encoded).expect("own encoding decodes");
        assert_eq!(again, datagram);
    }

    if let Ok(message) = SyncMessage::decode(data) {
        assert!(message.encode().is_ok());
    }

    let _ = State::from_wire(data);
});
