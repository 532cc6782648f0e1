// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Fuzz target for the entity store file scanner.
// Run with: cargo +nightly fuzz run fuzz_store_scan
//
// Recovery scans whatever is on disk, so no byte image may panic the
// scanner and the torn tail can never exceed the file.

#![no_main]

use chronotag_store::scan_bytes;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let scan = scan_bytes(data).expect("reading from memory cannot fail");
    assert!(scan.torn_tail <= data.len() as u64);
    for locator in scan.entities.values().chain(scan.chunks.values()) {
        assert!(locator.offset + u64::from(locator.length) <= data.len() as u64);
    }
    for locator in scan.entities.values() {
        assert!(locator.sequence <= scan.watermark);
    }
});
