//! Fuzz target for sequence token ordering.
//!
//! Comparison must never panic, and `SequenceToken`'s `Ord` must be a
//! total order even for malformed tokens.

#![no_main]

use insight_fanout::event::{calculate_lag_ms, compare_sequence_tokens, parse_token_timestamp, SequenceToken};
use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str, &str)| {
    let (a, b, c) = data;

    assert_eq!(compare_sequence_tokens(a, b), compare_sequence_tokens(b, a).reverse());
    assert_eq!(compare_sequence_tokens(a, a), Ordering::Equal);

    let (ta, tb, tc) = (SequenceToken::from(a), SequenceToken::from(b), SequenceToken::from(c));
    assert_eq!(ta.cmp(&tb) == Ordering::Equal, ta == tb);
    if ta <= tb && tb <= tc {
        assert!(ta <= tc);
    }

    let _ = parse_token_timestamp(a);
    if let Some(lag) = calculate_lag_ms(a, b) {
        assert!(lag <= parse_token_timestamp(b).unwrap_or(0));
    }
});
