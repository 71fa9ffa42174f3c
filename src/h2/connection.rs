//! The HTTP/2 connection multiplexer (spec.md §4.4, C4): reader/writer
//! tasks, settings negotiation, PING liveness, GOAWAY, and the exchange
//! dispatch loop shared with HTTP/1 via the same `Dispatcher` contract.
//!
//! Grounded in `rama-http-core`'s `h2::proto::connection` (the
//! reader-drives-everything, writer-serialized-behind-one-mutex split) and
//! spec.md §9's design note: "the reader continually consumes frames, the
//! writer is invoked by response-writing code... a mutex is sufficient and
//! keeps backpressure direct."

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::buffer::{CloseSignal, Sink, ThrottledSink, TriggerSink};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Reason, Result};
use crate::h2::frame::{self, Frame};
use crate::h2::hpack;
use crate::h2::stream::{Http2Stream, StreamState, DEFAULT_RECV_WINDOW};
use crate::headers::HeaderList;
use crate::recorder::Recorder;
use crate::request::{HttpVersion, RecordedRequest, RequestLine};
use crate::response::{BodyKind, MockResponse, PushPromise, Settings, SocketEffect};

/// The "await" ping payload: its pong releases the oldest waiter in
/// `await_waiters` (spec.md §4.4 "an 'await' ping whose pong arrival
/// releases a waiter").
pub const AWAIT_PING: [u8; 8] = *b"MOCKWIRE";
/// The "degraded" ping payload: absence of a pong within
/// `DEGRADED_PONG_TIMEOUT` marks the connection unhealthy.
pub const DEGRADED_PING: [u8; 8] = *b"DEGRADE1";
const DEGRADED_PONG_TIMEOUT: Duration = Duration::from_secs(1);

struct WriteState<W> {
    io: W,
    hpack: hpack::Encoder,
    max_frame_size: u32,
}

impl<W: tokio::io::AsyncWrite + Unpin> WriteState<W> {
    async fn send(&mut self, frame: &Frame) -> Result<()> {
        let mut buf = BytesMut::new();
        frame::encode(frame, self.max_frame_size, &mut buf)?;
        self.io.write_all(&buf).await.map_err(Error::from)?;
        self.io.flush().await.map_err(Error::from)
    }
}

/// Shared, per-connection state reachable from the reader loop, every
/// per-stream exchange task, and pushed-stream writers alike.
pub struct Http2Shared<W> {
    pub dispatcher: Arc<dyn Dispatcher>,
    pub recorder: Arc<Recorder>,
    pub connection_index: u64,
    streams: AsyncMutex<HashMap<u32, Arc<Http2Stream>>>,
    next_push_stream_id: AtomicU32,
    peer_settings: AsyncMutex<Settings>,
    local_initial_window: i32,
    connection_send_window: crate::h2::stream::Window,
    write: AsyncMutex<WriteState<W>>,
    shutting_down: AtomicBool,
    last_good_stream_id: AtomicU32,
    close_signal: CloseSignal,
    await_waiters: AsyncMutex<VecDeque<oneshot::Sender<()>>>,
    degraded_pong_pending: AtomicBool,
    healthy: AtomicBool,
}

impl<W: tokio::io::AsyncWrite + Unpin + Send> Http2Shared<W> {
    async fn send_frame(&self, frame: Frame) -> Result<()> {
        let mut write = self.write.lock().await;
        write.send(&frame).await
    }

    async fn stream(&self, id: u32) -> Option<Arc<Http2Stream>> {
        self.streams.lock().await.get(&id).cloned()
    }

    async fn insert_stream(&self, stream: Arc<Http2Stream>) {
        self.streams.lock().await.insert(stream.id, stream);
    }
}

/// Writes a pseudo-header-then-regular-header block for a response
/// (`:status` first, per spec.md §6 "`:status` on responses").
fn encode_response_headers(hpack: &mut hpack::Encoder, response: &MockResponse) -> Bytes {
    let mut headers = HeaderList::new();
    headers.add(":status", response.code().to_string());
    for header in response.headers().iter() {
        if !header.name.starts_with(b":") {
            headers.add(header.name.clone(), header.value.clone());
        }
    }
    hpack.encode_block(&headers)
}

/// Drives one HTTP/2 connection end to end: preface, settings handshake,
/// then the reader loop for the lifetime of the socket (spec.md §4.4,
/// §4.6 item 4).
pub async fn serve<IO>(io: IO, ctx: crate::h1::conn::ConnectionContext) -> Result<()>
where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut r, w) = tokio::io::split(io);

    // Server role: read and validate the client connection preface before
    // anything else (spec.md §6 "Preface: client sends `PRI * HTTP/2.0...`").
    let mut preface = [0u8; frame::CLIENT_PREFACE.len()];
    r.read_exact(&mut preface).await.map_err(Error::from)?;
    if preface != *frame::CLIENT_PREFACE {
        return Err(Error::new_protocol(Reason::ProtocolError));
    }

    let local_settings = Settings {
        initial_window_size: Some(DEFAULT_RECV_WINDOW),
        max_frame_size: Some(frame::DEFAULT_MAX_FRAME_SIZE),
        ..Settings::default()
    };

    let shared = Arc::new(Http2Shared {
        dispatcher: ctx.dispatcher,
        recorder: ctx.recorder,
        connection_index: ctx.connection_index,
        streams: AsyncMutex::new(HashMap::new()),
        next_push_stream_id: AtomicU32::new(2),
        peer_settings: AsyncMutex::new(Settings::default()),
        local_initial_window: DEFAULT_RECV_WINDOW as i32,
        connection_send_window: crate::h2::stream::Window::new(65_535),
        write: AsyncMutex::new(WriteState {
            io: w,
            hpack: hpack::Encoder::new(4096),
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
        }),
        shutting_down: AtomicBool::new(false),
        last_good_stream_id: AtomicU32::new(0),
        close_signal: CloseSignal::new(),
        await_waiters: AsyncMutex::new(VecDeque::new()),
        degraded_pong_pending: AtomicBool::new(false),
        healthy: AtomicBool::new(true),
    });

    shared
        .send_frame(Frame::Settings {
            ack: false,
            values: local_settings.iter().collect(),
        })
        .await?;

    if let Some(interval) = ctx.ping_interval {
        spawn_ping_scheduler(shared.clone(), interval);
    }

    let mut hpack_decoder = hpack::Decoder::new(4096);
    let mut read_buf = BytesMut::new();
    let mut pending_headers: Option<PendingHeaders> = None;
    let mut seen_first_frame = false;
    let mut exchange_index = 0u64;

    loop {
        let frame = match read_one_frame(&mut r, &mut read_buf).await? {
            Some(f) => f,
            None => break,
        };

        if !seen_first_frame {
            seen_first_frame = true;
            if !matches!(frame, Frame::Settings { .. }) {
                shared.send_frame(goaway_frame(0, Reason::ProtocolError)).await.ok();
                return Err(Error::new_protocol(Reason::ProtocolError));
            }
        }

        match frame {
            Frame::Settings { ack, values } => {
                if ack {
                    continue;
                }
                let mut incoming = Settings::default();
                for (id, value) in values {
                    set_setting(&mut incoming, id, value);
                }
                apply_peer_settings(&shared, &incoming).await;
                shared.send_frame(Frame::Settings { ack: true, values: Vec::new() }).await?;
            }
            Frame::Headers {
                stream_id,
                header_block,
                end_stream,
                end_headers,
                ..
            } => {
                let mut block = BytesMut::new();
                block.extend_from_slice(&header_block);
                if end_headers {
                    let headers = hpack_decoder.decode_block(&block).map_err(|_| Error::new_protocol(Reason::CompressionError))?;
                    reject_uppercase_names(&shared, &headers).await?;
                    on_headers_complete(&shared, stream_id, headers, end_stream, &mut exchange_index).await?;
                } else {
                    pending_headers = Some(PendingHeaders { stream_id, block, end_stream });
                }
            }
            Frame::Continuation { stream_id, header_block, end_headers } => {
                let pending = pending_headers
                    .as_mut()
                    .filter(|p| p.stream_id == stream_id)
                    .ok_or_else(|| Error::new_protocol(Reason::ProtocolError))?;
                pending.block.extend_from_slice(&header_block);
                if end_headers {
                    let PendingHeaders { block, end_stream, .. } = pending_headers.take().unwrap();
                    let headers = hpack_decoder.decode_block(&block).map_err(|_| Error::new_protocol(Reason::CompressionError))?;
                    reject_uppercase_names(&shared, &headers).await?;
                    on_headers_complete(&shared, stream_id, headers, end_stream, &mut exchange_index).await?;
                }
            }
            Frame::Data { stream_id, data, end_stream } => {
                let stream = shared.stream(stream_id).await.ok_or_else(|| Error::new_protocol(Reason::StreamClosed))?;
                let len = data.len() as u64;
                stream.push_body(data, end_stream);
                if let Some(increment) = stream.note_received(len, shared.local_initial_window as u32) {
                    shared
                        .send_frame(Frame::WindowUpdate { stream_id, increment })
                        .await?;
                }
            }
            Frame::WindowUpdate { stream_id, increment } => {
                if stream_id == 0 {
                    shared.connection_send_window.adjust(increment as i64);
                } else if let Some(stream) = shared.stream(stream_id).await {
                    stream.send_window.adjust(increment as i64);
                }
            }
            Frame::RstStream { stream_id, error_code } => {
                if let Some(stream) = shared.stream(stream_id).await {
                    *stream.error_code.lock().unwrap() = Some(Reason::from_u32(error_code));
                    stream.set_state(StreamState::Closed);
                    stream.body_ready.notify_waiters();
                }
            }
            Frame::Ping { ack, payload } => {
                if ack {
                    handle_pong(&shared, payload).await;
                } else {
                    shared.send_frame(Frame::Ping { ack: true, payload }).await?;
                }
            }
            Frame::GoAway { .. } => {
                shared.shutting_down.store(true, Ordering::SeqCst);
            }
            Frame::Priority { .. } => {}
            Frame::PushPromise { .. } => {
                return Err(Error::new_protocol(Reason::ProtocolError));
            }
        }
    }

    shared.close_signal.close();
    Ok(())
}

struct PendingHeaders {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
}

async fn read_one_frame<R: tokio::io::AsyncRead + Unpin>(r: &mut R, buf: &mut BytesMut) -> Result<Option<Frame>> {
    loop {
        if let Some((head, payload)) = frame::try_parse_one(buf)? {
            if let Some(frame) = frame::decode(head, &payload)? {
                return Ok(Some(frame));
            }
            continue;
        }
        let mut scratch = vec![0u8; 16 * 1024];
        let n = r.read(&mut scratch).await.map_err(Error::from)?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&scratch[..n]);
    }
}

fn set_setting(s: &mut Settings, id: u16, value: u32) {
    match id {
        1 => s.header_table_size = Some(value),
        2 => s.enable_push = Some(value != 0),
        3 => s.max_concurrent_streams = Some(value),
        4 => s.initial_window_size = Some(value),
        5 => s.max_frame_size = Some(value),
        6 => s.max_header_list_size = Some(value),
        other => s.extra.push((other, value)),
    }
}

/// Merges incoming peer settings, adjusting every open stream's send
/// window by the delta when `INITIAL_WINDOW_SIZE` changes (spec.md §4.4).
async fn apply_peer_settings<W: tokio::io::AsyncWrite + Unpin + Send>(shared: &Arc<Http2Shared<W>>, incoming: &Settings) {
    let mut peer = shared.peer_settings.lock().await;
    let prior_window = peer.initial_window_size;
    peer.merge(incoming);
    if let Some(new_window) = incoming.initial_window_size {
        let delta = new_window as i64 - prior_window.unwrap_or(65_535) as i64;
        if delta != 0 {
            let streams = shared.streams.lock().await;
            for stream in streams.values() {
                stream.send_window.adjust(delta);
            }
        }
    }
    if let Some(max_frame) = incoming.max_frame_size {
        let mut write = shared.write.lock().await;
        write.max_frame_size = max_frame;
    }
}

async fn handle_pong<W: tokio::io::AsyncWrite + Unpin + Send>(shared: &Arc<Http2Shared<W>>, payload: [u8; 8]) {
    if payload == AWAIT_PING {
        let mut waiters = shared.await_waiters.lock().await;
        if let Some(tx) = waiters.pop_front() {
            let _ = tx.send(());
        }
    } else if payload == DEGRADED_PING {
        shared.degraded_pong_pending.store(false, Ordering::SeqCst);
        shared.healthy.store(true, Ordering::SeqCst);
    }
    // Any other payload is an unexpected pong; spec.md §5 says to drop it.
}

fn goaway_frame(last_good_stream_id: u32, reason: Reason) -> Frame {
    Frame::GoAway {
        last_stream_id: last_good_stream_id,
        error_code: reason.into_u32(),
        debug_data: Bytes::new(),
    }
}

/// Rejects a header block carrying a mixed-case field name with
/// `PROTOCOL_ERROR` (spec.md §4.2 "receiving a mixed-case name is a
/// protocol error", §6 "uppercase on the wire is a PROTOCOL_ERROR"). Emits
/// GOAWAY before returning, same as any other connection-fatal error.
async fn reject_uppercase_names<W: tokio::io::AsyncWrite + Unpin + Send>(shared: &Arc<Http2Shared<W>>, headers: &HeaderList) -> Result<()> {
    let has_uppercase = headers.iter().any(|h| h.name.iter().any(u8::is_ascii_uppercase));
    if has_uppercase {
        shared.send_frame(goaway_frame(shared.last_good_stream_id.load(Ordering::SeqCst), Reason::ProtocolError)).await.ok();
        return Err(Error::new_protocol(Reason::ProtocolError));
    }
    Ok(())
}

/// Builds the request-side data for one stream once its header block (and,
/// if `end_stream`, body) is fully available, then hands it to the same
/// scripted-dispatch path HTTP/1 uses (spec.md §4.6 item 4).
async fn on_headers_complete<W: tokio::io::AsyncWrite + Unpin + Send + 'static>(
    shared: &Arc<Http2Shared<W>>,
    stream_id: u32,
    headers: HeaderList,
    end_stream: bool,
    exchange_index: &mut u64,
) -> Result<()> {
    let peer_settings = shared.peer_settings.lock().await.clone();
    let initial_send_window = peer_settings.initial_window_size.unwrap_or(65_535) as i32;
    let stream = Arc::new(Http2Stream::new(stream_id, initial_send_window, shared.local_initial_window));
    stream.set_state(if end_stream { StreamState::HalfClosedRemote } else { StreamState::Open });
    *stream.request_headers.lock().unwrap() = Some(headers);
    if end_stream {
        *stream.end_stream_received.lock().unwrap() = true;
    }
    shared.insert_stream(stream.clone()).await;
    note_last_good_stream_id(shared, stream_id);

    if end_stream {
        let idx = *exchange_index;
        *exchange_index += 1;
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(_e) = run_exchange(shared, stream, idx).await {
                // Stream-scoped errors surface as RST_STREAM inside
                // `run_exchange`; anything that escapes here is a resource
                // error the reader loop already treats as connection loss.
            }
        });
    }
    Ok(())
}

/// Derived from a request's pseudo-headers + regular headers (spec.md §4.5
/// "For HTTP/2, the pseudo-headers ... populate `(method, target,
/// version="HTTP/2")`").
fn build_recorded_request(
    headers: &HeaderList,
    body: Bytes,
    connection_index: u64,
    exchange_index: u64,
) -> RecordedRequest {
    let method = headers.get_str(":method").unwrap_or("GET").to_owned();
    let path = headers.get_str(":path").unwrap_or("/").to_owned();
    let mut remaining = HeaderList::new();
    for h in headers.iter() {
        if !h.name.starts_with(b":") {
            remaining.add(h.name.clone(), h.value.clone());
        }
    }
    RecordedRequest {
        request_line: RequestLine::new(method, path, HttpVersion::Http2),
        headers: remaining,
        body: if body.is_empty() { None } else { Some(body.clone()) },
        body_size: body.len() as u64,
        chunk_sizes: None,
        connection_index,
        exchange_index,
        handshake: None,
        handshake_server_names: Vec::new(),
        failure: None,
        received_at: std::time::SystemTime::now(),
    }
}

/// Runs one stream's dispatch-and-respond exchange: equivalent to an HTTP/1
/// exchange's back half, reusing the same `MockResponse` writer semantics
/// (informational responses, delays, throttling, socket effects, push
/// promises) over DATA/HEADERS/trailers framing instead of CRLF text.
async fn run_exchange<W: tokio::io::AsyncWrite + Unpin + Send + 'static>(
    shared: Arc<Http2Shared<W>>,
    stream: Arc<Http2Stream>,
    exchange_index: u64,
) -> Result<()> {
    let headers = stream.request_headers.lock().unwrap().clone().unwrap_or_default();
    let body = stream.take_body();
    let recorded = build_recorded_request(&headers, body, shared.connection_index, exchange_index);
    shared.recorder.record(recorded.clone());

    let response = shared.dispatcher.dispatch(&recorded);

    if let Some(SocketEffect::CloseStream { http2_error_code }) = &response.on_response_start {
        stream.set_state(StreamState::Closed);
        shared
            .send_frame(Frame::RstStream { stream_id: stream.id, error_code: http2_error_code.into_u32() })
            .await?;
        return Ok(());
    }
    if let Some(SocketEffect::ShutdownConnection { last_good_stream_id }) = &response.on_response_start {
        return initiate_goaway(&shared, Reason::NoError, *last_good_stream_id).await;
    }

    write_response_h2(&shared, &stream, &response).await?;

    for push in &response.push_promises {
        push_promise(&shared, stream.id, push).await?;
    }

    if let Some(SocketEffect::ShutdownConnection { last_good_stream_id }) = response.on_response_end {
        initiate_goaway(&shared, Reason::NoError, last_good_stream_id).await?;
    }

    Ok(())
}

/// Writes HEADERS, then DATA through the same throttle/trigger sink chain
/// the HTTP/1 writer uses, then trailers, honoring each phase's delay
/// (spec.md §4.6 item 4, §4.7).
async fn write_response_h2<W: tokio::io::AsyncWrite + Unpin + Send + 'static>(
    shared: &Arc<Http2Shared<W>>,
    stream: &Arc<Http2Stream>,
    response: &MockResponse,
) -> Result<()> {
    let close_signal = shared.close_signal.clone();

    for informational in &response.informational_responses {
        send_headers(shared, stream.id, informational, false).await?;
    }

    if close_signal.sleep_or_closed(response.headers_delay).await {
        return Ok(());
    }

    let has_body = !matches!(response.body(), BodyKind::None);
    send_headers(shared, stream.id, response, !has_body && response.trailers().is_empty()).await?;

    match response.body() {
        // `StreamHandler`/`WebSocket` bodies hand off a raw duplex socket
        // (spec.md §4.7 step 3); that model has no analog on a multiplexed
        // HTTP/2 stream, so these response kinds are a no-op beyond headers.
        BodyKind::None | BodyKind::StreamHandler(_) | BodyKind::WebSocket(_) => {
            stream.set_state(StreamState::Closed);
            return Ok(());
        }
        BodyKind::Bytes(_) | BodyKind::Chunked { .. } => {}
    }

    if close_signal.sleep_or_closed(response.body_delay).await {
        return Ok(());
    }

    let end_stream_after_body = response.trailers().is_empty();
    write_data(shared, stream, response, end_stream_after_body).await?;

    if close_signal.sleep_or_closed(response.trailers_delay).await {
        return Ok(());
    }
    if !response.trailers().is_empty() {
        send_trailers(shared, stream.id, response).await?;
    }

    stream.set_state(StreamState::Closed);
    Ok(())
}

async fn send_headers<W: tokio::io::AsyncWrite + Unpin + Send>(
    shared: &Arc<Http2Shared<W>>,
    stream_id: u32,
    response: &MockResponse,
    end_stream: bool,
) -> Result<()> {
    let mut write = shared.write.lock().await;
    let header_block = encode_response_headers(&mut write.hpack, response);
    let frame = Frame::Headers {
        stream_id,
        header_block,
        end_stream,
        end_headers: true,
        priority: None,
    };
    write.send(&frame).await
}

async fn send_trailers<W: tokio::io::AsyncWrite + Unpin + Send>(
    shared: &Arc<Http2Shared<W>>,
    stream_id: u32,
    response: &MockResponse,
) -> Result<()> {
    let mut write = shared.write.lock().await;
    let trailers = hpack_trailers(&mut write.hpack, response);
    let frame = Frame::Headers {
        stream_id,
        header_block: trailers,
        end_stream: true,
        end_headers: true,
        priority: None,
    };
    write.send(&frame).await
}

fn hpack_trailers(hpack: &mut hpack::Encoder, response: &MockResponse) -> Bytes {
    hpack.encode_block(response.trailers())
}

/// Undoes `chunk_body`'s `hex-size CRLF bytes CRLF ... 0 CRLF` wire framing
/// back to raw bytes, for responses scripted with `.chunked_body(...)` but
/// served over HTTP/2, which has no transfer-coding of its own.
fn dechunk(chunks: &[Bytes]) -> Bytes {
    let mut out = BytesMut::new();
    for chunk in chunks {
        if let Some(idx) = chunk.windows(2).position(|w| w == b"\r\n") {
            let size_str = std::str::from_utf8(&chunk[..idx]).unwrap_or("0");
            if let Ok(size) = usize::from_str_radix(size_str, 16) {
                if size > 0 {
                    out.extend_from_slice(&chunk[idx + 2..idx + 2 + size]);
                }
            }
        }
    }
    out.freeze()
}

/// A `Sink` that writes HTTP/2 DATA frames for one stream, waiting on
/// stream and connection flow-control windows before each chunk (spec.md
/// §4.4 "Writes block when either the stream or the connection send window
/// is ≤ 0").
struct H2DataSink<'a, W> {
    shared: &'a Arc<Http2Shared<W>>,
    stream: &'a Arc<Http2Stream>,
}

impl<'a, W: tokio::io::AsyncWrite + Unpin + Send + 'static> Sink for H2DataSink<'a, W> {
    fn write_all<'b>(
        &'b mut self,
        src: &'b [u8],
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'b>> {
        Box::pin(async move {
            let mut offset = 0;
            while offset < src.len() {
                let want = (src.len() - offset) as u32;
                let stream_ok = self.stream.send_window.reserve(want, &self.shared.close_signal).await?;
                let conn_ok = self
                    .shared
                    .connection_send_window
                    .reserve(stream_ok, &self.shared.close_signal)
                    .await?;
                let max_frame = { self.shared.write.lock().await.max_frame_size };
                let take = (conn_ok.min(max_frame)) as usize;
                let take = take.max(1).min(src.len() - offset);
                let end = offset + take;
                self.shared
                    .send_frame(Frame::Data {
                        stream_id: self.stream.id,
                        data: Bytes::copy_from_slice(&src[offset..end]),
                        end_stream: false,
                    })
                    .await?;
                self.stream.send_window.consume(take as i64);
                self.shared.connection_send_window.consume(take as i64);
                offset = end;
            }
            Ok(())
        })
    }

    fn flush(&mut self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn close(&mut self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

async fn write_data<W: tokio::io::AsyncWrite + Unpin + Send + 'static>(
    shared: &Arc<Http2Shared<W>>,
    stream: &Arc<Http2Stream>,
    response: &MockResponse,
    end_stream: bool,
) -> Result<()> {
    // HTTP/2 has no wire chunked-transfer-encoding (RFC 7540 §8.1); a
    // `.chunked_body(...)`-scripted response is re-flattened to its raw
    // bytes and sent as ordinary DATA frames.
    let body: Bytes = match response.body() {
        BodyKind::Bytes(b) => b.clone(),
        BodyKind::Chunked { chunks } => dechunk(chunks),
        _ => Bytes::new(),
    };

    let sink = H2DataSink { shared, stream };
    let throttled = ThrottledSink::new(
        sink,
        response.throttle_bytes_per_period,
        response.throttle_period,
        shared.close_signal.clone(),
    );
    let content_length = response.content_length();
    let trigger_at = if content_length < 0 { 0 } else { content_length / 2 };

    if let Some(effect) = response.on_response_body.clone() {
        let close_signal = shared.close_signal.clone();
        let mut triggered = TriggerSink::new(
            throttled,
            trigger_at,
            Box::new(move || {
                let _ = &effect;
                close_signal.close();
            }),
        );
        triggered.write_all(&body).await?;
        triggered.flush().await?;
    } else {
        let mut throttled = throttled;
        throttled.write_all(&body).await?;
        throttled.flush().await?;
    }

    if end_stream {
        shared.send_frame(Frame::Data { stream_id: stream.id, data: Bytes::new(), end_stream: true }).await?;
    }
    Ok(())
}

/// Sends a server-initiated PUSH_PROMISE plus its pushed response on a new
/// even-numbered stream id (spec.md §4.4 "our server assigns even ids for
/// pushed streams starting from 2").
async fn push_promise<W: tokio::io::AsyncWrite + Unpin + Send + 'static>(
    shared: &Arc<Http2Shared<W>>,
    associated_stream_id: u32,
    push: &PushPromise,
) -> Result<()> {
    let pushed_id = shared.next_push_stream_id.fetch_add(2, Ordering::SeqCst);
    let mut promise_headers = HeaderList::new();
    promise_headers.add(":method", push.method.clone());
    promise_headers.add(":path", push.path.clone());
    for h in push.headers.iter() {
        promise_headers.add(h.name.clone(), h.value.clone());
    }

    let header_block = {
        let mut write = shared.write.lock().await;
        write.hpack.encode_block(&promise_headers)
    };
    shared
        .send_frame(Frame::PushPromise {
            stream_id: associated_stream_id,
            promised_stream_id: pushed_id,
            header_block,
            end_headers: true,
        })
        .await?;

    let peer_window = shared.peer_settings.lock().await.initial_window_size.unwrap_or(65_535) as i32;
    let pushed_stream = Arc::new(Http2Stream::new(pushed_id, peer_window, shared.local_initial_window));
    pushed_stream.set_state(StreamState::HalfClosedRemote);
    shared.insert_stream(pushed_stream.clone()).await;

    write_response_h2(shared, &pushed_stream, &push.response).await
}

/// Sends GOAWAY then closes all streams above `lastGoodStreamId` with
/// `REFUSED_STREAM` and the rest with `CANCEL` (spec.md §4.4 "Shutdown").
///
/// `override_last_good`, when set, names the GOAWAY boundary explicitly
/// (spec.md §8 scenario S5); otherwise the boundary is the highest stream
/// id the connection has fully dispatched so far.
async fn initiate_goaway<W: tokio::io::AsyncWrite + Unpin + Send>(
    shared: &Arc<Http2Shared<W>>,
    reason: Reason,
    override_last_good: Option<u32>,
) -> Result<()> {
    shared.shutting_down.store(true, Ordering::SeqCst);
    let last_good = override_last_good.unwrap_or_else(|| shared.last_good_stream_id.load(Ordering::SeqCst));
    shared.send_frame(goaway_frame(last_good, reason)).await?;

    let streams = shared.streams.lock().await;
    for (&id, stream) in streams.iter() {
        if stream.is_closed() {
            continue;
        }
        let code = if id > last_good { Reason::RefusedStream } else { Reason::Cancel };
        *stream.error_code.lock().unwrap() = Some(code);
        stream.set_state(StreamState::Closed);
    }
    drop(streams);
    shared.close_signal.close();
    Ok(())
}

/// Marks the highest stream id processed so far as the GOAWAY boundary;
/// called by the reader loop before `initiate_goaway` when a caller scripts
/// a mid-connection GOAWAY (spec.md §8 scenario S5).
pub fn note_last_good_stream_id<W>(shared: &Http2Shared<W>, id: u32) {
    let current = shared.last_good_stream_id.load(Ordering::SeqCst);
    if id > current {
        shared.last_good_stream_id.store(id, Ordering::SeqCst);
    }
}

/// Sends the "await" ping and waits for its pong (or connection close),
/// used by tests to fence events (spec.md §4.4 "Liveness").
pub async fn write_ping_and_await_pong<W: tokio::io::AsyncWrite + Unpin + Send>(shared: &Arc<Http2Shared<W>>) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    shared.await_waiters.lock().await.push_back(tx);
    shared.send_frame(Frame::Ping { ack: false, payload: AWAIT_PING }).await?;
    rx.await.map_err(|_| Error::new_io(std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "connection closed before pong")))
}

/// Sends a "degraded" liveness ping and starts the timeout that marks the
/// connection unhealthy if no pong arrives in time (spec.md §4.4).
pub async fn send_degraded_ping<W: tokio::io::AsyncWrite + Unpin + Send + 'static>(shared: Arc<Http2Shared<W>>) -> Result<()> {
    shared.degraded_pong_pending.store(true, Ordering::SeqCst);
    shared.send_frame(Frame::Ping { ack: false, payload: DEGRADED_PING }).await?;
    let shared2 = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep(DEGRADED_PONG_TIMEOUT).await;
        if shared2.degraded_pong_pending.load(Ordering::SeqCst) {
            shared2.healthy.store(false, Ordering::SeqCst);
        }
    });
    Ok(())
}

pub fn is_healthy<W>(shared: &Http2Shared<W>) -> bool {
    shared.healthy.load(Ordering::SeqCst)
}

/// Drives `send_degraded_ping` on a fixed cadence for the lifetime of the
/// connection (spec.md §4.4 "ping scheduler"), stopping once the socket
/// closes. A send failure (socket already gone) ends the scheduler rather
/// than propagating, since the reader loop is the one place connection
/// teardown is reported.
fn spawn_ping_scheduler<W: tokio::io::AsyncWrite + Unpin + Send + 'static>(shared: Arc<Http2Shared<W>>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            if shared.close_signal.sleep_or_closed(interval).await {
                return;
            }
            if send_degraded_ping(shared.clone()).await.is_err() {
                return;
            }
        }
    });
}
