//! The exchange engine (spec.md §4.6, C6): the per-connection serial loop
//! that reads a request, consults the dispatcher, writes the response, and
//! threads socket effects and delays through both directions.
//!
//! Grounded in `hyper`'s `proto::h1::Conn`/`Dispatcher` pairing (one task
//! owns a socket end to end, drives parse → service call → encode in a
//! loop, decides keep-alive per exchange) with the teacher's pipelined
//! `Service` call replaced by a single scripted `Dispatcher::dispatch`.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};

use crate::buffer::{CloseSignal, Sink, SocketSink, ThrottledSink, TriggerSink};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::h1::decode::{self, BodyReadEffects};
use crate::h1::io::BufferedReader;
use crate::h1::parse;
use crate::headers::HeaderList;
use crate::recorder::Recorder;
use crate::request::{HttpVersion, RecordedRequest, RequestLine};
use crate::response::{BodyKind, MockResponse, SocketEffect};
use crate::websocket;

/// How long a `Stall` socket effect parks for, woken early by socket
/// closure (spec.md §5 "Cancellation and timeouts").
const STALL_DURATION: Duration = Duration::from_secs(3600);

/// A type-erased bidirectional stream, handed to `StreamHandler`/
/// `WebSocketListener` once the engine is done driving the socket itself.
///
/// Boxing the halves (rather than exposing `Connection<IO>`'s own type
/// parameter) keeps `MockResponse`/`StreamHandler` free of a generic
/// parameter, matching spec.md §4.7's "hand the bidirectional socket to
/// it" — callers see one concrete type regardless of TLS/plain, TCP/duplex
/// test transport.
pub struct DuplexSocket {
    reader: Box<dyn AsyncRead + Unpin + Send>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
}

impl DuplexSocket {
    pub fn new<R, W>(reader: R, writer: W) -> DuplexSocket
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        DuplexSocket {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl AsyncRead for DuplexSocket {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexSocket {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Bytes already pulled off the socket (e.g. a pipelined request's prefix)
/// that must be replayed before a handed-off `DuplexSocket` reads live
/// bytes off the wire.
struct PrefixedReader<R> {
    prefix: Bytes,
    inner: R,
}

impl<R: AsyncRead + Unpin> AsyncRead for PrefixedReader<R> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = buf.remaining().min(self.prefix.len());
            buf.put_slice(&self.prefix[..n]);
            self.prefix = self.prefix.split_off(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Shared, per-connection context handed down from the acceptor (C9).
pub struct ConnectionContext {
    pub dispatcher: Arc<dyn Dispatcher>,
    pub recorder: Arc<Recorder>,
    pub connection_index: u64,
    /// `TruncatingBuffer`'s cap on captured (not received) request body
    /// bytes.
    pub body_limit: usize,
    /// Set by a `ShutdownConnection` `onResponseEnd` effect; the acceptor
    /// watches this to start orderly server shutdown (spec.md §4.6 step 3
    /// "If `shutdownServer` is set, initiate server close").
    pub shutdown_requested: Arc<AtomicBool>,
    /// `server.setPingInterval(...)` (SPEC_FULL.md §11.3); only consulted by
    /// the HTTP/2 connection, which schedules a degraded-liveness PING on
    /// this cadence. `None` disables the scheduler (no pings sent on the
    /// connection's own initiative; `writePingAndAwaitPong` remains
    /// available for callers to drive directly).
    pub ping_interval: Option<Duration>,
}

/// Outcome of one request/response exchange.
enum Outcome {
    /// Keep reading further exchanges off this socket.
    Reuse,
    /// The exchange engine is done with this socket; it may already be
    /// half-closed.
    Close,
    /// A `streamHandler`/WebSocket listener now owns the socket.
    HandedOff,
}

pub struct Connection<IO> {
    reader: Option<BufferedReader<ReadHalf<IO>>>,
    writer: Option<WriteHalf<IO>>,
    ctx: ConnectionContext,
    exchange_index: u64,
    close_signal: CloseSignal,
}

impl<IO> Connection<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(io: IO, ctx: ConnectionContext) -> Connection<IO> {
        let (r, w) = io::split(io);
        Connection {
            reader: Some(BufferedReader::new(r)),
            writer: Some(w),
            ctx,
            exchange_index: 0,
            close_signal: CloseSignal::new(),
        }
    }

    fn reader(&mut self) -> &mut BufferedReader<ReadHalf<IO>> {
        self.reader.as_mut().expect("socket already handed off")
    }

    fn writer(&mut self) -> &mut WriteHalf<IO> {
        self.writer.as_mut().expect("socket already handed off")
    }

    /// Drives exchanges until the socket closes, a scripted effect ends
    /// the connection, or ownership is handed off to a stream/WebSocket
    /// handler (spec.md §4.6 item 3).
    pub async fn serve(mut self) {
        loop {
            match self.run_one_exchange().await {
                Ok(Outcome::Reuse) => continue,
                Ok(Outcome::Close) | Err(_) => {
                    if let Some(w) = self.writer.as_mut() {
                        let _ = w.shutdown().await;
                    }
                    return;
                }
                Ok(Outcome::HandedOff) => return,
            }
        }
    }

    /// Drives exchanges while `dispatcher.peek().in_tunnel` holds (spec.md
    /// §4.6 step 1, `CONNECT` proxy tunneling): every exchange here runs in
    /// plain HTTP/1 over the raw socket, never TLS. Returns `Ok(true)` once
    /// the peeked next response is no longer in-tunnel and the connection
    /// is still open and ready for protocol selection; `Ok(false)` if the
    /// socket closed or was handed off while still in the tunnel phase (or
    /// if the connection was never in-tunnel to begin with, which is the
    /// common case and just falls straight through).
    pub(crate) async fn serve_tunnel(&mut self) -> Result<bool> {
        loop {
            if !self.ctx.dispatcher.peek().in_tunnel {
                return Ok(true);
            }
            match self.run_one_exchange().await? {
                Outcome::Reuse => continue,
                Outcome::Close | Outcome::HandedOff => return Ok(false),
            }
        }
    }

    /// Reclaims the raw socket and per-connection context once the tunnel
    /// phase has exited, for the acceptor to drive through protocol
    /// selection (spec.md §4.6 step 2: TLS handshake, then HTTP/2 or
    /// HTTP/1.1).
    pub(crate) fn into_duplex(mut self) -> (DuplexSocket, ConnectionContext) {
        let socket = self.take_socket();
        (socket, self.ctx)
    }

    async fn run_one_exchange(&mut self) -> Result<Outcome> {
        let peeked = self.ctx.dispatcher.peek();

        if let Some(effect) = peeked.on_request_start.clone() {
            self.ctx.recorder.record(RecordedRequest::bookkeeping(
                self.ctx.connection_index,
                self.exchange_index,
                None,
            ));
            return Ok(self.apply_pre_read_effect(effect).await?);
        }

        let head = match self.read_request_head().await? {
            Some(head) => head,
            None => return Ok(Outcome::Close),
        };

        let content_length = parse::content_length(&head.headers)?;
        let chunked = parse::is_chunked(&head.headers);
        let permits_body = parse::method_permits_body(&head.request_line.method);

        let mut body = None;
        let mut body_size = 0u64;
        let mut chunk_sizes = None;

        if !peeked.do_not_read_request_body() {
            let pending_effect: Arc<std::sync::Mutex<Option<SocketEffect>>> = Arc::new(std::sync::Mutex::new(None));
            let trigger_effect = peeked.on_request_body.clone();
            let trigger_slot = pending_effect.clone();
            let effects = BodyReadEffects {
                throttle_bytes_per_period: peeked.throttle_bytes_per_period,
                throttle_period: peeked.throttle_period,
                trigger_at: content_length.unwrap_or(0) / 2,
                on_trigger: trigger_effect.map(|effect| -> Box<dyn FnMut() + Send> {
                    Box::new(move || {
                        *trigger_slot.lock().unwrap() = Some(effect.clone());
                    })
                }),
                close_signal: self.close_signal.clone(),
            };

            if chunked {
                let (buf, sizes) = decode::read_chunked_body(self.reader(), self.ctx.body_limit, effects).await?;
                body_size = buf.received_byte_count();
                body = Some(buf.into_captured());
                chunk_sizes = Some(sizes);
            } else if let Some(len) = content_length {
                if len > 0 && !permits_body {
                    return Err(Error::new_bad_body("body present on a method that forbids one"));
                }
                let buf = decode::read_content_length_body(self.reader(), len, self.ctx.body_limit, effects).await?;
                body_size = buf.received_byte_count();
                body = Some(buf.into_captured());
            }

            if let Some(effect) = pending_effect.lock().unwrap().take() {
                self.ctx.recorder.record(RecordedRequest {
                    request_line: head.request_line.clone(),
                    headers: head.headers.clone(),
                    body: body.clone(),
                    body_size,
                    chunk_sizes: chunk_sizes.clone(),
                    connection_index: self.ctx.connection_index,
                    exchange_index: self.exchange_index,
                    handshake: None,
                    handshake_server_names: Vec::new(),
                    failure: None,
                    received_at: std::time::SystemTime::now(),
                });
                self.exchange_index += 1;
                return Ok(self.apply_pre_read_effect(effect).await?);
            }
        }

        let is_websocket_request = websocket::is_upgrade_request(&head.headers);
        let version = head.request_line.version;
        let recorded = RecordedRequest {
            request_line: head.request_line,
            headers: head.headers,
            body,
            body_size,
            chunk_sizes,
            connection_index: self.ctx.connection_index,
            exchange_index: self.exchange_index,
            handshake: None,
            handshake_server_names: Vec::new(),
            failure: None,
            received_at: std::time::SystemTime::now(),
        };
        self.exchange_index += 1;
        let request_headers = recorded.headers.clone();
        self.ctx.recorder.record(recorded.clone());

        let response = self.ctx.dispatcher.dispatch(&recorded);

        if let Some(effect) = response.on_response_start.clone() {
            return Ok(self.apply_pre_read_effect(effect).await?);
        }

        let outcome = self
            .write_response(&response, is_websocket_request && response.body().is_websocket(), &request_headers)
            .await?;

        if let Some(SocketEffect::Stall) = response.on_response_end {
            self.close_signal.sleep_or_closed(STALL_DURATION).await;
        } else if matches!(outcome, Outcome::Reuse) {
            if let Some(effect) = response.on_response_end.clone() {
                return Ok(self.apply_pre_read_effect(effect).await?);
            }
        }

        if response.shutdown_server() {
            self.ctx.shutdown_requested.store(true, Ordering::SeqCst);
        }

        if !matches!(outcome, Outcome::Reuse) {
            return Ok(outcome);
        }

        if !connection_permits_reuse(version, &request_headers, response.headers()) {
            return Ok(Outcome::Close);
        }

        Ok(Outcome::Reuse)
    }

    /// Applies a `SocketEffect` scripted at a phase that pre-empts the rest
    /// of the exchange (`onRequestStart`/`onResponseStart`/`onResponseEnd`,
    /// spec.md §4.6): every variant here ends the exchange, either by
    /// closing the socket or by parking for `Stall`.
    async fn apply_pre_read_effect(&mut self, effect: SocketEffect) -> Result<Outcome> {
        match effect {
            SocketEffect::CloseSocket {
                close_socket,
                shutdown_input,
                shutdown_output,
            } => {
                if shutdown_output || close_socket {
                    let _ = self.writer().shutdown().await;
                }
                // Read-side-only half-close has no `AsyncRead` counterpart
                // to `AsyncWrite::shutdown`; closing the whole connection
                // (below, via `close_signal`) is the closest any caller can
                // observe over a plain `TcpStream`-backed socket.
                let _ = shutdown_input;
                self.close_signal.close();
                Ok(Outcome::Close)
            }
            SocketEffect::ShutdownConnection { .. } => {
                let _ = self.writer().shutdown().await;
                self.close_signal.close();
                Ok(Outcome::Close)
            }
            SocketEffect::CloseStream { .. } => {
                // HTTP/1 has no stream distinct from the connection itself.
                let _ = self.writer().shutdown().await;
                self.close_signal.close();
                Ok(Outcome::Close)
            }
            SocketEffect::Stall => {
                self.close_signal.sleep_or_closed(STALL_DURATION).await;
                Ok(Outcome::Close)
            }
        }
    }

    async fn read_request_head(&mut self) -> Result<Option<ParsedRequest>> {
        loop {
            let snapshot = self.reader().peek();
            match parse::parse_request(&snapshot)? {
                Some(parsed) => {
                    self.reader().consume(parsed.consumed);
                    return Ok(Some(ParsedRequest {
                        request_line: parsed.request_line,
                        headers: parsed.headers,
                    }));
                }
                None => {
                    if self.reader().is_eof() {
                        return Ok(None);
                    }
                    if !self.reader().fill_more().await? {
                        if self.reader().buffered_len() == 0 {
                            return Ok(None);
                        }
                        return Err(Error::new_parse("connection closed mid-request"));
                    }
                }
            }
        }
    }

    /// Writes a response per spec.md §4.7; also performs the WebSocket
    /// upgrade hand-off when `response` carries a `webSocketListener` and
    /// the request asked for one.
    async fn write_response(
        &mut self,
        response: &MockResponse,
        is_websocket_upgrade: bool,
        request_headers: &HeaderList,
    ) -> Result<Outcome> {
        for informational in &response.informational_responses {
            self.write_head(informational).await?;
        }

        if is_websocket_upgrade {
            if let BodyKind::WebSocket(listener) = response.body() {
                let accept = request_headers
                    .get_str("sec-websocket-key")
                    .map(websocket::accept_key)
                    .unwrap_or_default();
                let upgrade = MockResponse::builder()
                    .code(101)
                    .set_header("connection", "Upgrade")
                    .set_header("upgrade", "websocket")
                    .set_header("sec-websocket-accept", accept)
                    .build();
                self.write_head(&upgrade).await?;
                self.hand_off(listener.clone());
                return Ok(Outcome::HandedOff);
            }
        }

        if self.close_signal.sleep_or_closed(response.headers_delay).await {
            return Ok(Outcome::Close);
        }
        self.write_head(response).await?;

        match response.body() {
            BodyKind::StreamHandler(handler) => {
                let handler = handler.clone();
                self.hand_off_stream(handler);
                return Ok(Outcome::HandedOff);
            }
            BodyKind::None => return Ok(Outcome::Reuse),
            BodyKind::Bytes(_) | BodyKind::Chunked { .. } => {}
            BodyKind::WebSocket(_) => return Ok(Outcome::Reuse),
        }

        if self.close_signal.sleep_or_closed(response.body_delay).await {
            return Ok(Outcome::Close);
        }

        self.write_body(response).await?;

        if self.close_signal.sleep_or_closed(response.trailers_delay).await {
            return Ok(Outcome::Close);
        }
        if response.is_chunked() {
            self.write_trailers(response).await?;
        }

        Ok(Outcome::Reuse)
    }

    async fn write_head(&mut self, response: &MockResponse) -> Result<()> {
        let mut out = Vec::new();
        out.extend_from_slice(response.status_line().as_bytes());
        out.extend_from_slice(b"\r\n");
        for header in response.headers().iter() {
            out.extend_from_slice(&header.name);
            out.extend_from_slice(b": ");
            out.extend_from_slice(&header.value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        self.writer().write_all(&out).await.map_err(Error::from)?;
        self.writer().flush().await.map_err(Error::from)
    }

    async fn write_trailers(&mut self, response: &MockResponse) -> Result<()> {
        let mut out = Vec::new();
        for header in response.trailers().iter() {
            out.extend_from_slice(&header.name);
            out.extend_from_slice(b": ");
            out.extend_from_slice(&header.value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        self.writer().write_all(&out).await.map_err(Error::from)?;
        self.writer().flush().await
    }

    async fn write_body(&mut self, response: &MockResponse) -> Result<()> {
        let socket = SocketSink::new(self.writer());
        let throttled = ThrottledSink::new(
            socket,
            response.throttle_bytes_per_period,
            response.throttle_period,
            self.close_signal.clone(),
        );
        let content_length = response.content_length();
        let trigger_at = if content_length < 0 { 0 } else { content_length / 2 };

        if let Some(effect) = response.on_response_body.clone() {
            let close_signal = self.close_signal.clone();
            let mut triggered = TriggerSink::new(
                throttled,
                trigger_at,
                Box::new(move || {
                    if matches!(effect, SocketEffect::Stall) {
                        // Approximated: a mid-body stall degrades to closing
                        // the socket rather than blocking inside a
                        // synchronous trigger callback (see DESIGN.md).
                        close_signal.close();
                    } else {
                        close_signal.close();
                    }
                }),
            );
            self.write_body_chunks(response, &mut triggered).await?;
            triggered.flush().await
        } else {
            let mut throttled = throttled;
            self.write_body_chunks(response, &mut throttled).await?;
            throttled.flush().await
        }
    }

    async fn write_body_chunks(&self, response: &MockResponse, sink: &mut dyn Sink) -> Result<()> {
        match response.body() {
            BodyKind::Bytes(bytes) => sink.write_all(bytes).await,
            BodyKind::Chunked { chunks } => {
                for chunk in chunks.iter() {
                    sink.write_all(chunk).await?;
                }
                Ok(())
            }
            BodyKind::None | BodyKind::StreamHandler(_) | BodyKind::WebSocket(_) => Ok(()),
        }
    }

    fn take_socket(&mut self) -> DuplexSocket {
        let mut reader = self.reader.take().expect("socket already handed off");
        let leftover = reader.peek();
        reader.consume(leftover.len());
        let (raw_reader, _) = reader.into_inner();
        let writer = self.writer.take().expect("socket already handed off");
        DuplexSocket::new(
            PrefixedReader {
                prefix: leftover,
                inner: raw_reader,
            },
            writer,
        )
    }

    fn hand_off(&mut self, listener: Arc<dyn crate::response::WebSocketListener>) {
        let socket = self.take_socket();
        listener.on_open(socket);
    }

    fn hand_off_stream(&mut self, handler: Arc<dyn crate::response::StreamHandler>) {
        let socket = self.take_socket();
        handler.handle(socket);
    }
}

struct ParsedRequest {
    request_line: RequestLine,
    headers: HeaderList,
}

/// HTTP/1 keep-alive rule (RFC 7230 §6.1): HTTP/1.1 defaults to
/// persistent, HTTP/1.0 defaults to closing; either side's explicit
/// `Connection: close` overrides the default, and HTTP/1.1's explicit
/// `Connection: keep-alive` doesn't change anything (already the default).
fn connection_permits_reuse(version: HttpVersion, request_headers: &HeaderList, response_headers: &HeaderList) -> bool {
    if request_headers.connection_has("close") || response_headers.connection_has("close") {
        return false;
    }
    match version {
        HttpVersion::Http10 => request_headers.connection_has("keep-alive"),
        HttpVersion::Http11 | HttpVersion::Http2 => true,
    }
}

impl BodyKind {
    fn is_websocket(&self) -> bool {
        matches!(self, BodyKind::WebSocket(_))
    }
}
