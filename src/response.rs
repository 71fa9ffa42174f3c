//! The scripted response model (spec.md §3 `MockResponse`, §4.7 writer, C7).
//!
//! Grounded in the teacher's `Response<B>` (status/headers/body triple,
//! `proto/response.rs`) generalized per `spec.md`'s design note: "the
//! runtime value is immutable, collapse the mutable builder into a
//! construction-time config struct". `BodyKind` is the "sealed sum" the
//! design notes ask for in place of inheritance.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Reason;
use crate::headers::HeaderList;

/// At most one of body / stream handler / websocket listener may be set on
/// a `MockResponse`; this sum makes that structurally true.
#[derive(Clone)]
pub enum BodyKind {
    None,
    /// A length-known body; `Content-Length` is derived from its size.
    Bytes(Bytes),
    /// Pre-chunked bytes, produced by `chunked_body`; already framed as
    /// `hex-size CRLF bytes CRLF ... 0 CRLF`.
    Chunked { chunks: Arc<Vec<Bytes>> },
    /// Claims the socket after headers are written; see spec.md §4.7 step 3.
    StreamHandler(Arc<dyn StreamHandler>),
    /// Installs the WebSocket handshake + post-upgrade listener hand-off.
    WebSocket(Arc<dyn WebSocketListener>),
}

/// Callback given the raw duplex socket once response headers have been
/// written, for responses built with `.stream_handler(...)`.
pub trait StreamHandler: Send + Sync {
    fn handle(&self, socket: crate::h1::conn::DuplexSocket);
}

/// Callback given the post-handshake framed stream, for responses built
/// with `.web_socket_upgrade(...)`. Message framing above the handshake is
/// explicitly out of scope (spec.md §1); the listener receives raw I/O.
pub trait WebSocketListener: Send + Sync {
    fn on_open(&self, socket: crate::h1::conn::DuplexSocket);
}

/// A scripted adverse socket action, injected at one of the four phases
/// named in spec.md §4.6 (`onRequestStart`, `onRequestBody`,
/// `onResponseStart`, `onResponseBody`, `onResponseEnd`).
#[derive(Debug, Clone)]
pub enum SocketEffect {
    CloseSocket {
        close_socket: bool,
        shutdown_input: bool,
        shutdown_output: bool,
    },
    /// HTTP/2: GOAWAY once buffered frames drain, then close. HTTP/1: close.
    ///
    /// `last_good_stream_id` overrides the GOAWAY boundary the connection
    /// would otherwise compute on its own (the highest stream id it has
    /// fully dispatched); `None` uses that natural boundary. A script can
    /// set this explicitly to refuse a stream whose HEADERS already arrived
    /// (spec.md §8 scenario S5: two streams' HEADERS are both accepted, but
    /// GOAWAY still names the first as the boundary so the second is
    /// refused).
    ShutdownConnection { last_good_stream_id: Option<u32> },
    /// HTTP/2: RST_STREAM with the given code. HTTP/1: close the connection
    /// (there is no stream to reset independently of the socket).
    CloseStream { http2_error_code: Reason },
    /// Sleep up to a server-bounded interval (one hour, per spec.md §5),
    /// waking only on shutdown.
    Stall,
}

impl SocketEffect {
    pub fn close() -> SocketEffect {
        SocketEffect::CloseSocket {
            close_socket: true,
            shutdown_input: true,
            shutdown_output: true,
        }
    }

    pub fn shutdown_input_only() -> SocketEffect {
        SocketEffect::CloseSocket {
            close_socket: false,
            shutdown_input: true,
            shutdown_output: false,
        }
    }

    pub fn shutdown_output_only() -> SocketEffect {
        SocketEffect::CloseSocket {
            close_socket: false,
            shutdown_input: false,
            shutdown_output: true,
        }
    }

    pub fn reset_stream(code: Reason) -> SocketEffect {
        SocketEffect::CloseStream { http2_error_code: code }
    }

    pub fn shutdown_connection() -> SocketEffect {
        SocketEffect::ShutdownConnection { last_good_stream_id: None }
    }

    /// A `ShutdownConnection` that names its own GOAWAY boundary rather than
    /// the highest stream id the connection has dispatched so far (spec.md
    /// §8 scenario S5).
    pub fn shutdown_connection_at(last_good_stream_id: u32) -> SocketEffect {
        SocketEffect::ShutdownConnection {
            last_good_stream_id: Some(last_good_stream_id),
        }
    }
}

/// Sparse settings map over the six recognized HTTP/2 identifiers
/// (spec.md §3). Unknown identifiers round-trip through `extra`.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
    pub extra: Vec<(u16, u32)>,
}

impl Settings {
    pub fn new() -> Settings {
        Settings::default()
    }

    /// Merges `other` into `self`, field-by-field: a non-present field in
    /// `other` leaves `self` untouched (spec.md §4.4 "merging the new
    /// values ... field-by-field; a non-present identifier is preserved").
    pub fn merge(&mut self, other: &Settings) {
        if let Some(v) = other.header_table_size {
            self.header_table_size = Some(v);
        }
        if let Some(v) = other.enable_push {
            self.enable_push = Some(v);
        }
        if let Some(v) = other.max_concurrent_streams {
            self.max_concurrent_streams = Some(v);
        }
        if let Some(v) = other.initial_window_size {
            self.initial_window_size = Some(v);
        }
        if let Some(v) = other.max_frame_size {
            self.max_frame_size = Some(v);
        }
        if let Some(v) = other.max_header_list_size {
            self.max_header_list_size = Some(v);
        }
        for &(id, val) in &other.extra {
            if let Some(existing) = self.extra.iter_mut().find(|(eid, _)| *eid == id) {
                existing.1 = val;
            } else {
                self.extra.push((id, val));
            }
        }
    }

    /// Looks up any identifier, recognized or not.
    pub fn get(&self, id: u16) -> Option<u32> {
        match id {
            1 => self.header_table_size,
            2 => self.enable_push.map(|b| b as u32),
            3 => self.max_concurrent_streams,
            4 => self.initial_window_size,
            5 => self.max_frame_size,
            6 => self.max_header_list_size,
            other => self.extra.iter().find(|(eid, _)| *eid == other).map(|(_, v)| *v),
        }
    }

    /// Iterates every present field as `(id, value)`, in ascending id order
    /// (the order the HTTP/2 framer writes a SETTINGS frame's payload in).
    pub fn iter(&self) -> impl Iterator<Item = (u16, u32)> + '_ {
        let mut out = Vec::new();
        if let Some(v) = self.header_table_size {
            out.push((1, v));
        }
        if let Some(v) = self.enable_push {
            out.push((2, v as u32));
        }
        if let Some(v) = self.max_concurrent_streams {
            out.push((3, v));
        }
        if let Some(v) = self.initial_window_size {
            out.push((4, v));
        }
        if let Some(v) = self.max_frame_size {
            out.push((5, v));
        }
        if let Some(v) = self.max_header_list_size {
            out.push((6, v));
        }
        out.extend(self.extra.iter().copied());
        out.into_iter()
    }
}

/// `{ method, path, headers, response }` — a server-initiated HTTP/2
/// sub-stream, advertised via PUSH_PROMISE.
#[derive(Clone)]
pub struct PushPromise {
    pub method: String,
    pub path: String,
    pub headers: HeaderList,
    pub response: MockResponse,
}

impl PushPromise {
    pub fn new(method: impl Into<String>, path: impl Into<String>, response: MockResponse) -> PushPromise {
        PushPromise {
            method: method.into(),
            path: path.into(),
            headers: HeaderList::new(),
            response,
        }
    }
}

/// An immutable scripted response. Constructed once via `MockResponseBuilder`
/// and shared (by clone, cheaply: the only owned heap data is `Bytes`/`Arc`)
/// across every exchange it's enqueued for.
#[derive(Clone)]
pub struct MockResponse {
    status: Arc<str>,
    code: u16,
    message: Arc<str>,
    headers: HeaderList,
    trailers: HeaderList,
    body: BodyKind,
    pub in_tunnel: bool,
    pub informational_responses: Vec<MockResponse>,
    pub throttle_bytes_per_period: u64,
    pub throttle_period: Duration,
    pub headers_delay: Duration,
    pub body_delay: Duration,
    pub trailers_delay: Duration,
    pub on_request_start: Option<SocketEffect>,
    pub on_request_body: Option<SocketEffect>,
    pub on_response_start: Option<SocketEffect>,
    pub on_response_body: Option<SocketEffect>,
    pub on_response_end: Option<SocketEffect>,
    pub push_promises: Vec<PushPromise>,
    pub settings: Option<Settings>,
    fail_handshake: bool,
    do_not_read_request_body: bool,
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ if (100..200).contains(&code) => "Informational",
        _ if (200..300).contains(&code) => "OK",
        _ if (300..400).contains(&code) => "Redirection",
        _ if (400..500).contains(&code) => "Client Error",
        _ => "Server Error",
    }
}

impl MockResponse {
    pub fn builder() -> MockResponseBuilder {
        MockResponseBuilder::new()
    }

    pub fn status_line(&self) -> &str {
        &self.status
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn trailers(&self) -> &HeaderList {
        &self.trailers
    }

    pub fn body(&self) -> &BodyKind {
        &self.body
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.body, BodyKind::Chunked { .. })
    }

    /// Scripted TLS handshake failure policy (spec.md §4.6 step 2), a
    /// distinct knob from any `onRequestStart` socket effect — those are
    /// pre-read effects applied after the handshake, not during it.
    pub fn fail_handshake(&self) -> bool {
        self.fail_handshake
    }

    /// "Treat body as absent" policy (spec.md §4.5 step 3), a distinct knob
    /// from any `onRequestStart` socket effect.
    pub fn do_not_read_request_body(&self) -> bool {
        self.do_not_read_request_body
    }

    pub fn shutdown_server(&self) -> bool {
        matches!(self.on_response_end, Some(SocketEffect::ShutdownConnection { .. }))
    }

    /// Total content length, if known up front (used to place
    /// `onResponseBody`'s half-way trigger). `-1` signals "unknown".
    pub fn content_length(&self) -> i64 {
        match &self.body {
            BodyKind::None => 0,
            BodyKind::Bytes(b) => b.len() as i64,
            BodyKind::Chunked { .. } => -1,
            BodyKind::StreamHandler(_) | BodyKind::WebSocket(_) => -1,
        }
    }
}

/// Construction-time config for `MockResponse`; mutual exclusion of
/// body/stream-handler/websocket is enforced here rather than by each
/// setter clearing the others (spec.md's design note §9).
#[derive(Clone)]
pub struct MockResponseBuilder {
    status: Option<String>,
    code: u16,
    message: Option<String>,
    headers: HeaderList,
    trailers: HeaderList,
    body: BodyKind,
    in_tunnel: bool,
    informational_responses: Vec<MockResponse>,
    throttle_bytes_per_period: u64,
    throttle_period: Duration,
    headers_delay: Duration,
    body_delay: Duration,
    trailers_delay: Duration,
    on_request_start: Option<SocketEffect>,
    on_request_body: Option<SocketEffect>,
    on_response_start: Option<SocketEffect>,
    on_response_body: Option<SocketEffect>,
    on_response_end: Option<SocketEffect>,
    push_promises: Vec<PushPromise>,
    settings: Option<Settings>,
    fail_handshake: bool,
    do_not_read_request_body: bool,
}

impl Default for MockResponseBuilder {
    fn default() -> Self {
        MockResponseBuilder {
            status: None,
            code: 200,
            message: None,
            headers: HeaderList::new(),
            trailers: HeaderList::new(),
            body: BodyKind::None,
            in_tunnel: false,
            informational_responses: Vec::new(),
            throttle_bytes_per_period: 0,
            throttle_period: Duration::ZERO,
            headers_delay: Duration::ZERO,
            body_delay: Duration::ZERO,
            trailers_delay: Duration::ZERO,
            on_request_start: None,
            on_request_body: None,
            on_response_start: None,
            on_response_body: None,
            on_response_end: None,
            push_promises: Vec::new(),
            settings: None,
            fail_handshake: false,
            do_not_read_request_body: false,
        }
    }
}

impl MockResponseBuilder {
    pub fn new() -> MockResponseBuilder {
        MockResponseBuilder::default()
    }

    pub fn code(mut self, code: u16) -> Self {
        self.code = code;
        self.status = None;
        self
    }

    pub fn status(mut self, status_line: impl Into<String>) -> Self {
        self.status = Some(status_line.into());
        self
    }

    pub fn add_header(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn set_header(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn remove_header(mut self, name: &str) -> Self {
        self.headers.remove(name);
        self
    }

    pub fn clear_headers(mut self) -> Self {
        self.headers.clear();
        self
    }

    pub fn trailer(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.trailers.add(name, value);
        self
    }

    /// Sets a length-known body and `Content-Length`; clears any other
    /// body variant, per the "at most one of" invariant.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.headers.set("content-length", body.len().to_string());
        self.headers.remove("transfer-encoding");
        self.body = BodyKind::Bytes(body);
        self
    }

    /// Encodes `body` as chunked, `max_chunk_size` bytes per chunk, strips
    /// `Content-Length`, and sets `Transfer-Encoding: chunked`.
    pub fn chunked_body(mut self, body: impl Into<Bytes>, max_chunk_size: usize) -> Self {
        let body = body.into();
        let chunks = chunk_body(&body, max_chunk_size.max(1));
        self.headers.remove("content-length");
        self.headers.set("transfer-encoding", "chunked");
        self.body = BodyKind::Chunked { chunks: Arc::new(chunks) };
        self
    }

    pub fn stream_handler(mut self, handler: Arc<dyn StreamHandler>) -> Self {
        self.headers.remove("content-length");
        self.body = BodyKind::StreamHandler(handler);
        self
    }

    pub fn web_socket_upgrade(mut self, listener: Arc<dyn WebSocketListener>) -> Self {
        self.body = BodyKind::WebSocket(listener);
        self
    }

    pub fn in_tunnel(mut self) -> Self {
        self.in_tunnel = true;
        self
    }

    pub fn add_informational_response(mut self, response: MockResponse) -> Self {
        self.informational_responses.push(response);
        self
    }

    pub fn add_100_continue(self) -> Self {
        self.add_informational_response(MockResponse::builder().code(100).build())
    }

    pub fn add_push(mut self, push: PushPromise) -> Self {
        self.push_promises.push(push);
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn throttle_body(mut self, bytes_per_period: u64, period: Duration) -> Self {
        self.throttle_bytes_per_period = bytes_per_period;
        self.throttle_period = period;
        self
    }

    pub fn headers_delay(mut self, d: Duration) -> Self {
        self.headers_delay = d;
        self
    }

    pub fn body_delay(mut self, d: Duration) -> Self {
        self.body_delay = d;
        self
    }

    pub fn trailers_delay(mut self, d: Duration) -> Self {
        self.trailers_delay = d;
        self
    }

    pub fn on_request_start(mut self, effect: SocketEffect) -> Self {
        self.on_request_start = Some(effect);
        self
    }

    pub fn on_request_body(mut self, effect: SocketEffect) -> Self {
        self.on_request_body = Some(effect);
        self
    }

    pub fn on_response_start(mut self, effect: SocketEffect) -> Self {
        self.on_response_start = Some(effect);
        self
    }

    pub fn on_response_body(mut self, effect: SocketEffect) -> Self {
        self.on_response_body = Some(effect);
        self
    }

    pub fn on_response_end(mut self, effect: SocketEffect) -> Self {
        self.on_response_end = Some(effect);
        self
    }

    /// Scripts a TLS handshake failure (spec.md §4.6 step 2): the engine
    /// aborts the connection before ALPN selection, recording a bookkeeping
    /// request with an untrusted-handshake error.
    pub fn fail_handshake(mut self) -> Self {
        self.fail_handshake = true;
        self
    }

    /// Scripts "treat body as absent" (spec.md §4.5 step 3): the request
    /// reader skips body reading entirely, regardless of `Content-Length`
    /// or `Transfer-Encoding`.
    pub fn do_not_read_request_body(mut self) -> Self {
        self.do_not_read_request_body = true;
        self
    }

    pub fn build(self) -> MockResponse {
        let code = self.code;
        let message: Arc<str> = self
            .message
            .unwrap_or_else(|| reason_phrase(code).to_owned())
            .into();
        let status: Arc<str> = self
            .status
            .unwrap_or_else(|| format!("HTTP/1.1 {} {}", code, message))
            .into();
        MockResponse {
            status,
            code,
            message,
            headers: self.headers,
            trailers: self.trailers,
            body: self.body,
            in_tunnel: self.in_tunnel,
            informational_responses: self.informational_responses,
            throttle_bytes_per_period: self.throttle_bytes_per_period,
            throttle_period: self.throttle_period,
            headers_delay: self.headers_delay,
            body_delay: self.body_delay,
            trailers_delay: self.trailers_delay,
            on_request_start: self.on_request_start,
            on_request_body: self.on_request_body,
            on_response_start: self.on_response_start,
            on_response_body: self.on_response_body,
            on_response_end: self.on_response_end,
            push_promises: self.push_promises,
            settings: self.settings,
            fail_handshake: self.fail_handshake,
            do_not_read_request_body: self.do_not_read_request_body,
        }
    }
}

/// Pre-chunks `body` into `hex-size CRLF bytes CRLF`-framed pieces,
/// terminated with a zero-length chunk (spec.md §4.7's `chunkedBody`
/// builder). The encoded bytes are produced once, up front, since a
/// `MockResponse` is immutable and replayed across exchanges.
pub fn chunk_body(body: &[u8], max_chunk_size: usize) -> Vec<Bytes> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + max_chunk_size).min(body.len());
        let mut framed = Vec::with_capacity(end - offset + 16);
        framed.extend_from_slice(format!("{:x}\r\n", end - offset).as_bytes());
        framed.extend_from_slice(&body[offset..end]);
        framed.extend_from_slice(b"\r\n");
        chunks.push(Bytes::from(framed));
        offset = end;
    }
    chunks.push(Bytes::from_static(b"0\r\n"));
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_derives_default_status_line() {
        let r = MockResponse::builder().code(404).build();
        assert_eq!(r.status_line(), "HTTP/1.1 404 Not Found");
        assert_eq!(r.message(), "Not Found");
    }

    #[test]
    fn body_sets_content_length() {
        let r = MockResponse::builder().body("ABCDE").build();
        assert_eq!(r.headers().get("content-length"), Some(&b"5"[..]));
    }

    #[test]
    fn chunked_body_clears_content_length() {
        let r = MockResponse::builder()
            .body("ABCDE")
            .chunked_body("ABCDE", 1024)
            .build();
        assert!(!r.headers().contains("content-length"));
        assert_eq!(r.headers().get("transfer-encoding"), Some(&b"chunked"[..]));
        assert!(r.is_chunked());
    }

    #[test]
    fn last_writer_wins_between_chunked_and_set_header() {
        let r = MockResponse::builder()
            .chunked_body("ABCDE", 1024)
            .set_header("content-length", "5")
            .build();
        assert_eq!(r.headers().get("content-length"), Some(&b"5"[..]));
    }

    #[test]
    fn chunk_body_splits_and_terminates() {
        let chunks = chunk_body(b"HELLO", 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[0][..], b"3\r\nHEL\r\n");
        assert_eq!(&chunks[1][..], b"2\r\nLO\r\n");
        assert_eq!(&chunks[2][..], b"0\r\n");
    }

    #[test]
    fn settings_merge_preserves_unset_fields() {
        let mut base = Settings::new();
        base.initial_window_size = Some(100);
        let mut update = Settings::new();
        update.max_frame_size = Some(20000);
        base.merge(&update);
        assert_eq!(base.initial_window_size, Some(100));
        assert_eq!(base.max_frame_size, Some(20000));
    }

    #[test]
    fn fail_handshake_and_do_not_read_request_body_are_independent_flags() {
        let r = MockResponse::builder().fail_handshake().build();
        assert!(r.fail_handshake());
        assert!(!r.do_not_read_request_body());

        let r = MockResponse::builder().do_not_read_request_body().build();
        assert!(r.do_not_read_request_body());
        assert!(!r.fail_handshake());

        let r = MockResponse::builder().build();
        assert!(!r.fail_handshake());
        assert!(!r.do_not_read_request_body());
    }
}
