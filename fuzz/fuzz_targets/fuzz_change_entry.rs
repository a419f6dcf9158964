//! Fuzz target for stream entry parsing.
//!
//! Arbitrary field maps must parse or fail cleanly, and anything that
//! parses must satisfy the image invariants.

#![no_main]

use insight_fanout::stream::parse_change_entry;
use libfuzzer_sys::fuzz_target;
use std::collections::HashMap;

const FIELDS: [&str; 8] = ["kind", "entity", "tenant", "pk", "sk", "old", "new", "hash"];

fuzz_target!(|data: (&str, Vec<(u8, Vec<u8>)>)| {
    let (id, raw) = data;

    let fields: HashMap<String, redis::Value> = raw
        .into_iter()
        .map(|(slot, bytes)| {
            let name = FIELDS[slot as usize % FIELDS.len()].to_string();
            (name, redis::Value::BulkString(bytes))
        })
        .collect();

    if let Ok(event) = parse_change_entry("fuzz", id, &fields) {
        assert!(event.validate().is_ok());
        assert_eq!(event.sequence_token.as_str(), id);
    }
});
