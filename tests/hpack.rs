//! HPACK round-trip and table-behavior tests (spec.md §4.2, §8 property 5).

use mockwire::h2::hpack::{Decoder, Encoder};
use mockwire::headers::HeaderList;

fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderList {
    let mut h = HeaderList::new();
    for (name, value) in pairs {
        h.add(*name, *value);
    }
    h
}

#[test]
fn static_table_entries_round_trip() {
    let mut enc = Encoder::new(4096);
    let mut dec = Decoder::new(4096);

    let src = headers(&[(":method", "GET"), (":scheme", "https"), (":path", "/")]);
    let block = enc.encode_block(&src);
    let decoded = dec.decode_block(&block).unwrap();

    assert_eq!(decoded.get_str(":method"), Some("GET"));
    assert_eq!(decoded.get_str(":scheme"), Some("https"));
    assert_eq!(decoded.get_str(":path"), Some("/"));
}

#[test]
fn repeated_header_is_served_from_the_dynamic_table_on_the_second_block() {
    let mut enc = Encoder::new(4096);
    let mut dec = Decoder::new(4096);

    let src = headers(&[("x-request-id", "abc-123-some-longer-value")]);
    let first = enc.encode_block(&src);
    let second = enc.encode_block(&src);

    // The second block should be smaller: one indexed-field byte instead of
    // a literal name+value, since `:authority`-style incremental indexing
    // applies to any header mockwire chooses to index (spec.md §4.2).
    assert!(second.len() <= first.len());

    let decoded_first = dec.decode_block(&first).unwrap();
    let decoded_second = dec.decode_block(&second).unwrap();
    assert_eq!(decoded_first.get_str("x-request-id"), Some("abc-123-some-longer-value"));
    assert_eq!(decoded_second.get_str("x-request-id"), Some("abc-123-some-longer-value"));
}

#[test]
fn header_names_are_lower_cased_before_emit() {
    let mut enc = Encoder::new(4096);
    let mut dec = Decoder::new(4096);

    let src = headers(&[("X-Custom-Header", "value")]);
    let block = enc.encode_block(&src);
    let decoded = dec.decode_block(&block).unwrap();

    assert_eq!(decoded.get_str("x-custom-header"), Some("value"));
    assert!(decoded.iter().all(|h| h.name.iter().all(u8::is_ascii_lowercase)));
}

#[test]
fn dynamic_table_size_update_is_respected_by_both_sides() {
    let mut enc = Encoder::new(4096);
    let mut dec = Decoder::new(4096);

    // Shrink the table so far that nothing can be indexed; headers should
    // still decode correctly, they just never hit the dynamic table.
    enc.set_max_size(0);
    dec.set_max_size(0);

    let src = headers(&[("x-tiny", "v"), ("x-tiny-2", "v2")]);
    let block = enc.encode_block(&src);
    let decoded = dec.decode_block(&block).unwrap();

    assert_eq!(decoded.get_str("x-tiny"), Some("v"));
    assert_eq!(decoded.get_str("x-tiny-2"), Some("v2"));
}

#[test]
fn many_distinct_headers_evict_the_oldest_dynamic_entries() {
    let mut enc = Encoder::new(128);
    let mut dec = Decoder::new(128);

    for i in 0..20 {
        let name = format!("x-header-{i}");
        let mut src = HeaderList::new();
        src.add(name.clone(), "some-value-to-fill-the-table");
        let block = enc.encode_block(&src);
        let decoded = dec.decode_block(&block).unwrap();
        assert_eq!(decoded.get_str(&name), Some("some-value-to-fill-the-table"));
    }
}
