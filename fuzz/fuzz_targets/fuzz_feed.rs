//! Fuzz target: raw bytes into one connection half
//!
//! The parser must never panic, whether the input arrives whole or split
//! across reads the way reassembled TCP chunks do.

#![no_main]

use h2session::{H2ConnectionState, TimestampNs};
use libfuzzer_sys::fuzz_target;

fn drain(state: &mut H2ConnectionState) {
    while state.try_pop().is_some() {}
}

fuzz_target!(|data: &[u8]| {
    let mut whole = H2ConnectionState::new();
    let _ = whole.feed(data, TimestampNs(1));
    drain(&mut whole);

    if data.len() > 10 {
        let mut split = H2ConnectionState::new();
        let mid = data.len() / 2;
        if split.feed(&data[..mid], TimestampNs(1)).is_ok() {
            let _ = split.feed(&data[mid..], TimestampNs(2));
        }
        drain(&mut split);
        split.evict_stale_streams(TimestampNs(u64::MAX));
    }
});
