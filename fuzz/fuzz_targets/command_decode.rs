//! Fuzz target for line decoding
//!
//! Feeds arbitrary text to `Command::decode`. Decoding must never panic, and
//! anything that decodes must survive a re-encode with the same verb.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_proto::Command;

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(command) = Command::decode(line) {
        let again = Command::decode(&command.encode());
        assert!(again.is_ok(), "re-encoded {command:?} failed to decode");
        if let Ok(again) = again {
            assert_eq!(again.verb_str(), command.verb_str());
        }
    }
});
