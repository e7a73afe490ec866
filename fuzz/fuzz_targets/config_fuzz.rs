//! Fuzz configuration block splitting and parsing.
//!
//! Splitting must yield two slices that reassemble the input; parsing may
//! fail but must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sql_decomposer::config::{QueryConfig, split_config_block};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Some((block, query)) = split_config_block(text) {
        assert_eq!(block.len() + query.len(), text.len());
        assert!(query.get(..4).is_some_and(|w| w.eq_ignore_ascii_case("with")));
        let _ = QueryConfig::parse(block);
    }
});
