//! Request-line and recorded-request data model (spec.md §3, C10).

use std::time::SystemTime;

use bytes::Bytes;

use crate::error::Error;
use crate::headers::HeaderList;

/// HTTP version as carried on the wire; mirrors `spec.md`'s
/// `RequestLine.version` enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
    Http2,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
            HttpVersion::Http2 => "HTTP/2",
        }
    }
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{ method, target, version }`. `target` is kept verbatim: origin-form
/// (`/foo`), absolute-form (`http://host/foo`), authority-form (`CONNECT`'s
/// `host:port`), or `*` (`OPTIONS *`).
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
}

impl RequestLine {
    pub fn new(method: impl Into<String>, target: impl Into<String>, version: HttpVersion) -> RequestLine {
        RequestLine {
            method: method.into(),
            target: target.into(),
            version,
        }
    }

    /// The textual request line, e.g. `"GET /foo HTTP/1.1"`.
    pub fn as_text(&self) -> String {
        format!("{} {} {}", self.method, self.target, self.version)
    }
}

impl std::fmt::Display for RequestLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// TLS handshake details captured for a connection, when TLS was used.
/// Certificate loading/verification itself is out of scope (spec.md §1);
/// this only records the negotiated facts the recorder exposes.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub tls_version: String,
    pub cipher_suite: String,
    pub alpn_protocol: Option<String>,
}

/// `RecordedRequest`: an immutable snapshot of one exchange, appended to the
/// server's recorder queue once fully parsed (or once parsing failed).
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request_line: RequestLine,
    pub headers: HeaderList,
    /// Bounded prefix of the body, up to the configured `bodyLimit`.
    pub body: Option<Bytes>,
    /// Total bytes received for the body, pre-truncation.
    pub body_size: u64,
    /// Present iff the request used chunked transfer-encoding; the
    /// sequence of non-zero chunk sizes as seen on the wire.
    pub chunk_sizes: Option<Vec<usize>>,
    /// 0-based connection ordinal, assigned by the acceptor.
    pub connection_index: u64,
    /// 0-based exchange ordinal on this connection.
    pub exchange_index: u64,
    pub handshake: Option<HandshakeInfo>,
    pub handshake_server_names: Vec<String>,
    /// Set when a client protocol error ended the exchange before a
    /// response could be written (spec.md §7, "client protocol errors").
    pub failure: Option<String>,
    pub received_at: SystemTime,
}

impl RecordedRequest {
    pub fn bookkeeping(connection_index: u64, exchange_index: u64, failure: Option<Error>) -> RecordedRequest {
        RecordedRequest {
            request_line: RequestLine::new("", "", HttpVersion::Http11),
            headers: HeaderList::new(),
            body: None,
            body_size: 0,
            chunk_sizes: None,
            connection_index,
            exchange_index,
            handshake: None,
            handshake_server_names: Vec::new(),
            failure: failure.map(|e| e.to_string()),
            received_at: SystemTime::now(),
        }
    }

    pub fn get_header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name)
    }

    pub fn body_utf8(&self) -> Option<String> {
        self.body.as_ref().map(|b| String::from_utf8_lossy(b).into_owned())
    }
}
