//! HTTP/1 request-line + header parsing (spec.md §4.5 steps 1-2).
//!
//! Grounded in the teacher's `proto::h1::role::Server::parse`: `httparse`
//! over a growing buffer, `Status::Partial` means "read more", headers are
//! copied out into mockwire's own ordered multimap (`add_header_lenient`,
//! preserving non-ASCII byte-for-byte, the way `record_header_indices` /
//! `HeadersAsBytesIter` copy header bytes out of the parse buffer there).

use bytes::Bytes;

use crate::error::Error;
use crate::headers::HeaderList;
use crate::request::{HttpVersion, RequestLine};

const MAX_HEADERS: usize = 100;

/// A fully parsed request head, and how many bytes of `buf` it consumed.
pub struct ParsedHead {
    pub request_line: RequestLine,
    pub headers: HeaderList,
    pub consumed: usize,
}

/// Attempts to parse one request head from `buf`. Returns `Ok(None)` if
/// more bytes are needed (`httparse::Status::Partial`); an empty `buf`
/// returns `Ok(None)` too (spec.md §4.5 step 1 treats that as "connection
/// went away", which the caller distinguishes by checking for EOF).
pub fn parse_request(buf: &[u8]) -> Result<Option<ParsedHead>, Error> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut raw_headers);
    let status = req.parse(buf).map_err(Error::from)?;
    let consumed = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let method = req.method.ok_or_else(|| Error::new_parse("missing method"))?.to_owned();
    let target = req.path.ok_or_else(|| Error::new_parse("missing request target"))?.to_owned();
    let version = match req.version {
        Some(0) => HttpVersion::Http10,
        Some(1) => HttpVersion::Http11,
        _ => return Err(Error::new_parse("unsupported http version")),
    };

    let mut headers = HeaderList::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        headers.add_lenient(Bytes::copy_from_slice(h.name.as_bytes()), Bytes::copy_from_slice(h.value));
    }

    Ok(Some(ParsedHead {
        request_line: RequestLine::new(method, target, version),
        headers,
        consumed,
    }))
}

/// `Content-Length` header value, validated against spec.md §4.5 step 3:
/// "first occurrence" wins if the header repeats with the same value, but a
/// mismatched repeat is a protocol error (RFC 7230 §3.3.3 rule 4).
pub fn content_length(headers: &HeaderList) -> Result<Option<u64>, Error> {
    let mut seen: Option<u64> = None;
    for value in headers.get_all("content-length") {
        let text = std::str::from_utf8(value).map_err(|_| Error::new_parse("invalid content-length"))?;
        let n: u64 = text.trim().parse().map_err(|_| Error::new_parse("invalid content-length"))?;
        match seen {
            None => seen = Some(n),
            Some(prev) if prev == n => {}
            Some(_) => return Err(Error::new_parse("conflicting content-length headers")),
        }
    }
    Ok(seen)
}

pub fn is_chunked(headers: &HeaderList) -> bool {
    headers
        .get_all("transfer-encoding")
        .any(|v| v.split(|&b| b == b',').any(|tok| {
            let tok = std::str::from_utf8(tok).unwrap_or("").trim();
            tok.eq_ignore_ascii_case("chunked")
        }))
}

/// RFC 7230 §3.3: methods for which a request body is never permitted to be
/// interpreted as message framing (a body present anyway is a caller bug,
/// flagged by the exchange engine per spec.md §4.5 step 4).
pub fn method_permits_body(method: &str) -> bool {
    !matches!(method, "GET" | "HEAD")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get() {
        let buf = b"GET /foo HTTP/1.1\r\nHost: h\r\n\r\n";
        let parsed = parse_request(buf).unwrap().unwrap();
        assert_eq!(parsed.request_line.as_text(), "GET /foo HTTP/1.1");
        assert_eq!(parsed.headers.get("host"), Some(&b"h"[..]));
        assert_eq!(parsed.consumed, buf.len());
    }

    #[test]
    fn partial_request_returns_none() {
        let buf = b"GET /foo HTTP/1.1\r\nHost: h\r\n";
        assert!(parse_request(buf).unwrap().is_none());
    }

    #[test]
    fn conflicting_content_length_is_error() {
        let mut h = HeaderList::new();
        h.add("content-length", "5");
        h.add("content-length", "6");
        assert!(content_length(&h).is_err());
    }

    #[test]
    fn repeated_identical_content_length_is_ok() {
        let mut h = HeaderList::new();
        h.add("content-length", "5");
        h.add("content-length", "5");
        assert_eq!(content_length(&h).unwrap(), Some(5));
    }

    #[test]
    fn detects_chunked_transfer_encoding() {
        let mut h = HeaderList::new();
        h.add("transfer-encoding", "chunked");
        assert!(is_chunked(&h));
    }
}
