//! Buffered socket reader used by the HTTP/1 exchange loop.
//!
//! Grounded in `hyper`'s `proto::h1::io::Buffered` (`BytesMut` read buffer,
//! fill-then-parse loop) but trimmed to what a *server* needs: mockwire
//! never pipelines writes, so there is no write-buffer strategy to choose
//! between, just read buffering plus the raw socket for writes.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::buffer::ByteQueue;
use crate::error::{Error, Result};

const INIT_BUFFER_SIZE: usize = 8192;

/// Accumulates bytes read from `io` into a `ByteQueue`, handing out full
/// lines and exact byte counts as they become available.
pub struct BufferedReader<R> {
    io: R,
    buf: ByteQueue,
    eof: bool,
}

impl<R: AsyncRead + Unpin> BufferedReader<R> {
    pub fn new(io: R) -> BufferedReader<R> {
        BufferedReader {
            io,
            buf: ByteQueue::new(),
            eof: false,
        }
    }

    pub fn into_inner(self) -> (R, ByteQueue) {
        (self.io, self.buf)
    }

    /// Reads more bytes from the socket into the internal queue. Returns
    /// `false` on EOF (no more bytes will ever arrive).
    pub async fn fill_more(&mut self) -> Result<bool> {
        let mut scratch = vec![0u8; INIT_BUFFER_SIZE];
        let n = self.io.read(&mut scratch).await.map_err(Error::from)?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.buf.write(&scratch[..n]);
        Ok(true)
    }

    /// Reads one CRLF-terminated line, rejecting EOF mid-line (spec.md
    /// §4.1 `readLineStrict`). Returns `Ok(None)` only when EOF lands
    /// exactly at a line boundary (buffer empty), which the HTTP/1 request
    /// reader treats as "the connection went away" rather than an error.
    pub async fn read_line_strict(&mut self) -> Result<Option<bytes::Bytes>> {
        loop {
            if let Some(line) = self.buf.read_line_strict() {
                return Ok(Some(line));
            }
            if self.eof {
                if self.buf.exhausted() {
                    return Ok(None);
                }
                return Err(Error::new_parse("connection closed mid-line"));
            }
            self.fill_more().await?;
        }
    }

    /// Current buffered bytes, without consuming them. Used by the
    /// request-head parser, which re-parses the growing window on every
    /// `fill_more` until `httparse` reports completion.
    pub fn peek(&self) -> bytes::Bytes {
        self.buf.clone_without_consume()
    }

    pub fn consume(&mut self, n: usize) {
        self.buf.skip(n);
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.size()
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.buf.exhausted()
    }

    /// Blocks until at least one byte is buffered (or EOF), then removes
    /// and returns up to `max` of them. Callers that need to thread
    /// throttle sleeps or mid-body triggers between chunks drive this in a
    /// loop themselves rather than handing this reader a callback, so the
    /// `.await` points stay visible at the call site.
    pub async fn read_some(&mut self, max: usize) -> Result<bytes::Bytes> {
        while self.buf.exhausted() && !self.eof {
            self.fill_more().await?;
        }
        if self.buf.exhausted() {
            return Err(Error::new_bad_body("connection closed mid-body"));
        }
        Ok(self.buf.read(max.min(self.buf.size())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_line_across_fill_calls() {
        let io = tokio_test::io::Builder::new().read(b"GET / HTTP").read(b"/1.1\r\n").build();
        let mut reader = BufferedReader::new(io);
        let line = reader.read_line_strict().await.unwrap().unwrap();
        assert_eq!(&line[..], b"GET / HTTP/1.1");
    }

    #[tokio::test]
    async fn empty_connection_returns_none() {
        let io = tokio_test::io::Builder::new().build();
        let mut reader = BufferedReader::new(io);
        assert!(reader.read_line_strict().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_some_drains_buffered_bytes() {
        let io = tokio_test::io::Builder::new().read(b"hello world").build();
        let mut reader = BufferedReader::new(io);
        let mut got = Vec::new();
        while got.len() < 11 {
            let chunk = reader.read_some(11 - got.len()).await.unwrap();
            got.extend_from_slice(&chunk);
        }
        assert_eq!(got, b"hello world");
    }
}
