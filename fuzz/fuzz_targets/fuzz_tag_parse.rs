// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Fuzz target for tag and query pattern parsing.
// Run with: cargo +nightly fuzz run fuzz_tag_parse

#![no_main]

use chronotag_index::{Tag, TagPattern};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    if input.len() > 4096 {
        return;
    }

    if let Ok(tag) = Tag::parse(input) {
        let canonical = tag.canonical();
        assert_eq!(Tag::parse(&canonical).ok(), Some(tag.clone()));
        if let Ok(pattern) = TagPattern::parse(input) {
            assert!(pattern.matches(&canonical));
        }
    }
    let _ = TagPattern::parse(input);
});
