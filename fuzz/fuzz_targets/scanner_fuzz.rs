//! Fuzz the boundary scanner and backlink analyzer with arbitrary text.
//!
//! Every span must lie inside the input and re-slice cleanly, and the
//! analyzer must never panic on any body the scanner produces.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sql_decomposer::backlink::analyze;
use sql_decomposer::scanner::split_query;

fuzz_target!(|data: &[u8]| {
    let Ok(query) = std::str::from_utf8(data) else {
        return;
    };
    let (spans, recomposition) = split_query(query);
    assert!(recomposition.len() <= query.len());

    let mut known: Vec<String> = Vec::new();
    for span in &spans {
        assert!(span.start <= span.end && span.end < query.len());
        let body = span.body(query).to_lowercase();
        let analysis = analyze(&body, |ident| known.iter().any(|k| k == ident));
        assert!(analysis.backlinks.iter().all(|b| known.contains(&b.target)));
        known.push(span.name.to_lowercase());
    }
});
