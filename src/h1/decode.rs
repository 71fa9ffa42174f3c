//! Request body decoding: content-length and chunked transfer-encoding,
//! through a truncating, throttled, triggered sink (spec.md §4.5, §4.1).
//!
//! Grounded in `hyper`'s `proto::h1::decode::Decoder` (the
//! `Chunked`/`Length`/`Eof` state machine that drives reads off the shared
//! buffer) adapted to mockwire's own `BufferedReader` and to the
//! truncate/throttle/trigger behaviors `spec.md` layers on top, which the
//! teacher's decoder has no equivalent of.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncRead;

use crate::buffer::CloseSignal;
use crate::error::{Error, Result};
use crate::h1::io::BufferedReader;

/// A byte sink that retains up to `limit` bytes verbatim and silently
/// discards the rest, while still counting every byte offered
/// (`received_byte_count`). This is how `RecordedRequest.body_size` can
/// exceed `RecordedRequest.body.len()` (spec.md's glossary "Truncating
/// buffer").
pub struct TruncatingBuffer {
    limit: usize,
    captured: BytesMut,
    received: u64,
}

impl TruncatingBuffer {
    pub fn new(limit: usize) -> TruncatingBuffer {
        TruncatingBuffer {
            limit,
            captured: BytesMut::new(),
            received: 0,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.received += bytes.len() as u64;
        if self.captured.len() < self.limit {
            let room = self.limit - self.captured.len();
            let take = room.min(bytes.len());
            self.captured.extend_from_slice(&bytes[..take]);
        }
    }

    pub fn received_byte_count(&self) -> u64 {
        self.received
    }

    pub fn into_captured(self) -> Bytes {
        self.captured.freeze()
    }
}

/// Effects available to the request-body reader: a half-way trigger
/// (`onRequestBody`) and a throttle, applied the same way the response
/// writer applies them in the other direction (spec.md §4.1, §4.6).
pub struct BodyReadEffects<'a> {
    pub throttle_bytes_per_period: u64,
    pub throttle_period: Duration,
    /// Byte offset at which `on_trigger` fires; callers pass `0` for
    /// bodies with no declared length (spec.md §4.1's "unknown length
    /// fires at offset 0" rule) before ever reading a byte.
    pub trigger_at: u64,
    pub on_trigger: Option<Box<dyn FnMut() + Send + 'a>>,
    pub close_signal: CloseSignal,
}

impl<'a> BodyReadEffects<'a> {
    pub fn none() -> BodyReadEffects<'a> {
        BodyReadEffects {
            throttle_bytes_per_period: 0,
            throttle_period: Duration::ZERO,
            trigger_at: 0,
            on_trigger: None,
            close_signal: CloseSignal::new(),
        }
    }

    fn maybe_fire(&mut self, consumed_before: u64, consumed_after: u64) {
        if self.on_trigger.is_some() && consumed_before <= self.trigger_at && consumed_after >= self.trigger_at {
            if let Some(mut cb) = self.on_trigger.take() {
                cb();
            }
        }
    }

    async fn maybe_throttle(&mut self, since_sleep: &mut u64, just_wrote: usize) -> Result<()> {
        if self.throttle_bytes_per_period == 0 {
            return Ok(());
        }
        *since_sleep += just_wrote as u64;
        if *since_sleep >= self.throttle_bytes_per_period {
            *since_sleep = 0;
            if self.close_signal.sleep_or_closed(self.throttle_period).await {
                return Err(Error::new_io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "socket closed during throttle sleep",
                )));
            }
        }
        Ok(())
    }
}

/// Copies exactly `len` bytes from `reader` into a `TruncatingBuffer`
/// bounded by `limit`, applying throttle/trigger effects (spec.md §4.5
/// step 3, `Content-Length: n` case).
pub async fn read_content_length_body<R: AsyncRead + Unpin>(
    reader: &mut BufferedReader<R>,
    len: u64,
    limit: usize,
    mut effects: BodyReadEffects<'_>,
) -> Result<TruncatingBuffer> {
    let mut dst = TruncatingBuffer::new(limit);
    effects.maybe_fire(0, 0);
    let mut consumed = 0u64;
    let mut since_sleep = 0u64;
    while consumed < len {
        let want = ((len - consumed) as usize).min(64 * 1024);
        let chunk = reader.read_some(want).await?;
        dst.write(&chunk);
        let before = consumed;
        consumed += chunk.len() as u64;
        effects.maybe_fire(before, consumed);
        effects.maybe_throttle(&mut since_sleep, chunk.len()).await?;
    }
    Ok(dst)
}

/// Reads a chunked body (`chunk-size CRLF data CRLF ... 0 CRLF CRLF`,
/// RFC 7230 §4.1) into a `TruncatingBuffer`, recording the sequence of
/// non-zero chunk sizes (spec.md §4.5 step 3, chunked case; §8 property 4).
pub async fn read_chunked_body<R: AsyncRead + Unpin>(
    reader: &mut BufferedReader<R>,
    limit: usize,
    mut effects: BodyReadEffects<'_>,
) -> Result<(TruncatingBuffer, Vec<usize>)> {
    let mut dst = TruncatingBuffer::new(limit);
    let mut chunk_sizes = Vec::new();
    let mut consumed = 0u64;
    let mut since_sleep = 0u64;
    // Chunked bodies have no declared total length; spec.md §4.1 fires the
    // trigger at offset 0, before any chunk is read.
    effects.maybe_fire(0, 0);

    loop {
        let size_line = reader
            .read_line_strict()
            .await?
            .ok_or_else(|| Error::new_bad_body("connection closed before chunk size"))?;
        let size_text = std::str::from_utf8(&size_line)
            .map_err(|_| Error::new_bad_body("invalid chunk size"))?
            .split(';')
            .next()
            .unwrap_or("");
        let size = usize::from_str_radix(size_text.trim(), 16).map_err(|_| Error::new_bad_body("invalid chunk size"))?;

        if size == 0 {
            // Trailing CRLF after the terminating zero-size chunk.
            reader.read_line_strict().await?;
            break;
        }

        chunk_sizes.push(size);
        let mut remaining = size as u64;
        while remaining > 0 {
            let want = (remaining as usize).min(64 * 1024);
            let chunk = reader.read_some(want).await?;
            dst.write(&chunk);
            let before = consumed;
            consumed += chunk.len() as u64;
            remaining -= chunk.len() as u64;
            effects.maybe_fire(before, consumed);
            effects.maybe_throttle(&mut since_sleep, chunk.len()).await?;
        }

        let trailer = reader
            .read_line_strict()
            .await?
            .ok_or_else(|| Error::new_bad_body("connection closed after chunk data"))?;
        if !trailer.is_empty() {
            return Err(Error::new_bad_body("malformed chunk terminator"));
        }
    }

    Ok((dst, chunk_sizes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn content_length_body_truncates_and_counts_full_size() {
        let io = tokio_test::io::Builder::new().read(b"HELLO").build();
        let mut reader = BufferedReader::new(io);
        let buf = read_content_length_body(&mut reader, 5, 3, BodyReadEffects::none()).await.unwrap();
        assert_eq!(&buf.into_captured()[..], b"HEL");
    }

    #[tokio::test]
    async fn chunked_body_records_chunk_sizes_and_truncates() {
        let io = tokio_test::io::Builder::new().read(b"3\r\nHEL\r\n2\r\nLO\r\n0\r\n\r\n").build();
        let mut reader = BufferedReader::new(io);
        let (buf, sizes) = read_chunked_body(&mut reader, 3, BodyReadEffects::none()).await.unwrap();
        assert_eq!(sizes, vec![3, 2]);
        assert_eq!(buf.received_byte_count(), 5);
        assert_eq!(&buf.into_captured()[..], b"HEL");
    }

    #[test]
    fn truncating_buffer_counts_past_limit() {
        let mut b = TruncatingBuffer::new(2);
        b.write(b"abc");
        b.write(b"def");
        assert_eq!(b.received_byte_count(), 6);
        assert_eq!(&b.into_captured()[..], b"ab");
    }

    #[tokio::test]
    async fn trigger_fires_once_mid_body() {
        let io = tokio_test::io::Builder::new().read(b"ABCDEFGH").build();
        let mut reader = BufferedReader::new(io);
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired2 = fired.clone();
        let effects = BodyReadEffects {
            trigger_at: 4,
            on_trigger: Some(Box::new(move || {
                fired2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
            ..BodyReadEffects::none()
        };
        read_content_length_body(&mut reader, 8, 8, effects).await.unwrap();
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
