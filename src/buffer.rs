//! Owned byte FIFO and the composable `Sink` chain used to apply throttling
//! and mid-stream triggers to both request and response bodies.
//!
//! Grounded in `hyper`'s `proto::h1::io::Buffered` read/write buffer (same
//! "accumulate into a `BytesMut`, hand slices out" shape), generalized here
//! into a standalone container since mockwire's buffer is shared by the
//! HTTP/1 decoder, the HTTP/2 HPACK codec, and the frame codec alike.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// An owned, growable FIFO of bytes.
///
/// Not generic over any I/O trait: callers `write` bytes in (from a socket
/// read, or from an encoder) and `read`/`skip` them back out in order.
#[derive(Debug, Default, Clone)]
pub struct ByteQueue {
    buf: BytesMut,
}

impl ByteQueue {
    pub fn new() -> ByteQueue {
        ByteQueue {
            buf: BytesMut::new(),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Removes and returns up to `n` bytes from the front of the queue.
    pub fn read(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// Removes up to `n` bytes from the front of the queue without
    /// returning them.
    pub fn skip(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    /// Number of bytes currently buffered.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn exhausted(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the buffered bytes without consuming them.
    pub fn clone_without_consume(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    /// Reads one CRLF-terminated line, excluding the terminator.
    ///
    /// Returns `None` if no full line is buffered yet; the caller is
    /// expected to `write` more bytes and retry. Unlike a lenient reader,
    /// a line that never terminates before the peer closes the connection
    /// is a protocol error (`read_line_strict`'s contract), which is
    /// enforced by the HTTP/1 request reader rather than here: this method
    /// only ever returns "not yet available" or a parsed line.
    pub fn read_line_strict(&mut self) -> Option<Bytes> {
        if let Some(idx) = self.buf.windows(2).position(|w| w == b"\r\n") {
            let line = self.buf.split_to(idx).freeze();
            self.buf.advance(2);
            return Some(line);
        }
        // Lenient fallback: a bare LF also terminates a line.
        if let Some(idx) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(idx).freeze();
            self.buf.advance(1);
            return Some(line);
        }
        None
    }
}

/// A destination for bytes, mirroring the teacher's `AsyncWrite`-backed
/// buffered writer but exposed as a small, composable trait so throttling
/// and trigger behavior can wrap any concrete socket type.
pub trait Sink: Send {
    /// Writes all of `src`, returning only once every byte has been
    /// accepted (never a short write).
    fn write_all<'a>(&'a mut self, src: &'a [u8]) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn flush(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Adapts any `AsyncWrite` socket into a `Sink`, the bottom of every chain.
pub struct SocketSink<W> {
    io: W,
}

impl<W> SocketSink<W> {
    pub fn new(io: W) -> SocketSink<W> {
        SocketSink { io }
    }

    pub fn into_inner(self) -> W {
        self.io
    }
}

impl<W: AsyncWrite + Unpin + Send> Sink for SocketSink<W> {
    fn write_all<'a>(&'a mut self, src: &'a [u8]) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { self.io.write_all(src).await.map_err(Error::from) })
    }

    fn flush(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.io.flush().await.map_err(Error::from) })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.io.shutdown().await.map_err(Error::from) })
    }
}

/// A cooperative "the socket went away, stop sleeping" signal shared by
/// `ThrottledSink`, `Stall`, and anything else that parks on a timer.
#[derive(Clone, Default)]
pub struct CloseSignal {
    notify: std::sync::Arc<Notify>,
    closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CloseSignal {
    pub fn new() -> CloseSignal {
        CloseSignal::default()
    }

    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Sleeps for `dur`, waking early (and returning `true`) if `close()`
    /// is called from another task.
    pub async fn sleep_or_closed(&self, dur: Duration) -> bool {
        if self.is_closed() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(dur) => false,
            _ = self.notify.notified() => true,
        }
    }
}

/// Wraps a delegate `Sink`, sleeping `period` after every contiguous
/// `bytes_per_period` bytes written. Never returns a short write; the sleep
/// happens *between* chunks, inside this `write_all` call.
pub struct ThrottledSink<S> {
    delegate: S,
    bytes_per_period: u64,
    period: Duration,
    since_sleep: u64,
    close_signal: CloseSignal,
}

impl<S: Sink> ThrottledSink<S> {
    pub fn new(delegate: S, bytes_per_period: u64, period: Duration, close_signal: CloseSignal) -> ThrottledSink<S> {
        ThrottledSink {
            delegate,
            bytes_per_period,
            period,
            since_sleep: 0,
            close_signal,
        }
    }
}

impl<S: Sink + Send> Sink for ThrottledSink<S> {
    fn write_all<'a>(&'a mut self, src: &'a [u8]) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.bytes_per_period == 0 {
                return self.delegate.write_all(src).await;
            }
            let mut offset = 0usize;
            while offset < src.len() {
                let remaining_in_period = self.bytes_per_period - self.since_sleep;
                let take = remaining_in_period.min((src.len() - offset) as u64) as usize;
                let take = take.max(1);
                let end = (offset + take).min(src.len());
                self.delegate.write_all(&src[offset..end]).await?;
                self.since_sleep += (end - offset) as u64;
                offset = end;
                if self.since_sleep >= self.bytes_per_period && offset < src.len() {
                    self.since_sleep = 0;
                    if self.close_signal.sleep_or_closed(self.period).await {
                        return Err(Error::new_io(std::io::Error::new(
                            std::io::ErrorKind::ConnectionAborted,
                            "socket closed during throttle sleep",
                        )));
                    }
                }
            }
            Ok(())
        })
    }

    fn flush(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.delegate.flush()
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.delegate.close()
    }
}

/// A callback invoked exactly once after `trigger_byte_count` bytes have
/// passed through. Every byte after that point (and the trigger callback
/// itself) never blocks the write; the callback decides whether to close
/// the underlying socket via the `CloseSignal` it was constructed with.
pub type TriggerCallback = Box<dyn FnMut() + Send>;

pub struct TriggerSink<S> {
    delegate: S,
    trigger_byte_count: i64,
    seen: i64,
    callback: Option<TriggerCallback>,
    fired: bool,
}

impl<S: Sink> TriggerSink<S> {
    /// `trigger_byte_count == -1` fires the callback immediately, matching
    /// the "unknown expected length fires at offset 0" rule in spec.md §4.1.
    pub fn new(delegate: S, trigger_byte_count: i64, callback: TriggerCallback) -> TriggerSink<S> {
        TriggerSink {
            delegate,
            trigger_byte_count,
            seen: 0,
            callback: Some(callback),
            fired: false,
        }
    }
}

impl<S: Sink + Send> Sink for TriggerSink<S> {
    fn write_all<'a>(&'a mut self, src: &'a [u8]) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            // Already fired on an earlier call: silently discard every byte
            // after that point (spec.md §4.1), rather than keep forwarding.
            if self.fired {
                return Ok(());
            }
            if self.callback.is_some() && self.seen >= self.trigger_byte_count.max(0) {
                if let Some(mut cb) = self.callback.take() {
                    cb();
                }
            }
            self.seen += src.len() as i64;
            let result = self.delegate.write_all(src).await;
            if self.callback.is_some() && self.seen >= self.trigger_byte_count.max(0) {
                if let Some(mut cb) = self.callback.take() {
                    cb();
                }
            }
            if self.callback.is_none() {
                self.fired = true;
            }
            result
        })
    }

    fn flush(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.delegate.flush()
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.delegate.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_queue_fifo() {
        let mut q = ByteQueue::new();
        q.write(b"hello");
        q.write(b" world");
        assert_eq!(q.size(), 11);
        assert_eq!(&q.read(5)[..], b"hello");
        q.skip(1);
        assert_eq!(&q.read(5)[..], b"world");
        assert!(q.exhausted());
    }

    #[test]
    fn read_line_strict_waits_for_full_line() {
        let mut q = ByteQueue::new();
        q.write(b"partial");
        assert!(q.read_line_strict().is_none());
        q.write(b" line\r\nnext");
        let line = q.read_line_strict().unwrap();
        assert_eq!(&line[..], b"partial line");
        assert_eq!(q.size(), 4);
    }

    #[tokio::test]
    async fn throttle_splits_writes_into_periods() {
        tokio::time::pause();
        let sink = SocketSink::new(tokio_test::io::Builder::new().write(b"AB").write(b"CD").build());
        let signal = CloseSignal::new();
        let mut throttled = ThrottledSink::new(sink, 2, Duration::from_millis(100), signal);
        let start = tokio::time::Instant::now();
        throttled.write_all(b"ABCD").await.unwrap();
        assert!(tokio::time::Instant::now() - start >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn trigger_fires_once_at_offset() {
        let sink = SocketSink::new(tokio_test::io::Builder::new().write(b"hello").build());
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired2 = fired.clone();
        let mut trigger = TriggerSink::new(
            sink,
            2,
            Box::new(move || {
                fired2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        );
        trigger.write_all(b"hello").await.unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn trigger_discards_bytes_written_after_it_fires() {
        // The mock sink only expects the first write; a second write_all
        // call reaching the delegate would fail this test via an
        // unexpected-write panic from `tokio_test::io`.
        let sink = SocketSink::new(tokio_test::io::Builder::new().write(b"he").build());
        let mut trigger = TriggerSink::new(sink, 2, Box::new(|| {}));
        trigger.write_all(b"he").await.unwrap();
        trigger.write_all(b"llo").await.unwrap();
    }
}
