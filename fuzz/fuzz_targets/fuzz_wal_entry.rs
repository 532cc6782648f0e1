// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Fuzz target for WAL entry decoding.
// Run with: cargo +nightly fuzz run fuzz_wal_entry
//
// The first four bytes are taken as the claimed entry length, the rest as
// the entry body. Decoding must reject anything malformed without
// panicking, and anything it accepts must survive a re-encode.

#![no_main]

use chronotag_wal::WalEntry;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let claimed = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if let Ok(entry) = WalEntry::deserialize(&data[4..], claimed) {
        let encoded = entry.serialize();
        let length = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        let decoded = WalEntry::deserialize(&encoded[4..], length).expect("re-encoded entry decodes");
        assert_eq!(decoded, entry);
    }
});
