//! HTTP/2 frame encode/decode (RFC 7540 §4 & §6), spec.md §4.3, C3.
//!
//! Grounded in `rama-http-core`'s `h2::frame` split (one file per frame
//! kind, a shared `Head`) and carllerche's original `h2` crate it forked
//! from; mockwire keeps the same `Head`-plus-per-kind-struct shape but in
//! one module, since mockwire's framer has no codec-trait machinery to
//! plug frame kinds into, just a flat `decode`/`encode` pair the
//! connection driver calls directly.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const FRAME_HEADER_LEN: usize = 9;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl Kind {
    fn from_u8(n: u8) -> Kind {
        match n {
            0 => Kind::Data,
            1 => Kind::Headers,
            2 => Kind::Priority,
            3 => Kind::RstStream,
            4 => Kind::Settings,
            5 => Kind::PushPromise,
            6 => Kind::Ping,
            7 => Kind::GoAway,
            8 => Kind::WindowUpdate,
            9 => Kind::Continuation,
            other => Kind::Unknown(other),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Kind::Data => 0,
            Kind::Headers => 1,
            Kind::Priority => 2,
            Kind::RstStream => 3,
            Kind::Settings => 4,
            Kind::PushPromise => 5,
            Kind::Ping => 6,
            Kind::GoAway => 7,
            Kind::WindowUpdate => 8,
            Kind::Continuation => 9,
            Kind::Unknown(n) => n,
        }
    }
}

/// The fixed 9-byte frame header shared by every frame type.
#[derive(Debug, Clone, Copy)]
pub struct Head {
    pub length: u32,
    pub kind: Kind,
    pub flags: u8,
    pub stream_id: u32,
}

impl Head {
    pub fn parse(buf: &[u8]) -> Result<Head> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(Error::new_bad_frame("short frame header"));
        }
        let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | buf[2] as u32;
        let kind = Kind::from_u8(buf[3]);
        let flags = buf[4];
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
        Ok(Head { length, kind, flags, stream_id })
    }

    pub fn write(&self, out: &mut BytesMut) {
        out.put_u8((self.length >> 16) as u8);
        out.put_u8((self.length >> 8) as u8);
        out.put_u8(self.length as u8);
        out.put_u8(self.kind.as_u8());
        out.put_u8(self.flags);
        out.put_u32(self.stream_id & 0x7fff_ffff);
    }
}

#[derive(Debug, Clone)]
pub struct Priority {
    pub stream_dependency: u32,
    pub exclusive: bool,
    /// Stored as the wire byte plus one (RFC 7540 §6.2: "Weight:... the
    /// value advertised ... is one less than the actual value").
    pub weight: u16,
}

#[derive(Debug, Clone)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    Headers {
        stream_id: u32,
        header_block: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
    },
    Priority {
        stream_id: u32,
        priority: Priority,
    },
    RstStream {
        stream_id: u32,
        error_code: u32,
    },
    Settings {
        ack: bool,
        values: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        header_block: Bytes,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: u32,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        header_block: Bytes,
        end_headers: bool,
    },
}

fn strip_padding(payload: &[u8], padded: bool) -> Result<(&[u8], usize)> {
    if !padded {
        return Ok((payload, 0));
    }
    if payload.is_empty() {
        return Err(Error::new_bad_frame("PADDED flag set with empty payload"));
    }
    let pad_len = payload[0] as usize;
    let rest = &payload[1..];
    if pad_len > rest.len() {
        return Err(Error::new_bad_frame("padding longer than frame payload"));
    }
    Ok((&rest[..rest.len() - pad_len], 1 + pad_len))
}

fn parse_priority(buf: &[u8]) -> Result<Priority> {
    if buf.len() < 5 {
        return Err(Error::new_bad_frame("short PRIORITY payload"));
    }
    let raw = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    Ok(Priority {
        stream_dependency: raw & 0x7fff_ffff,
        exclusive: raw & 0x8000_0000 != 0,
        weight: buf[4] as u16 + 1,
    })
}

/// Decodes one frame from `head` plus its exact `payload` (the caller has
/// already read `head.length` bytes off the wire). Unknown frame types are
/// represented as `Ok(None)` (spec.md §4.3 "Unknown frame types are
/// silently skipped").
pub fn decode(head: Head, payload: &[u8]) -> Result<Option<Frame>> {
    match head.kind {
        Kind::Data => {
            if head.stream_id == 0 {
                return Err(Error::new_bad_frame("DATA on stream 0"));
            }
            let (data, _) = strip_padding(payload, head.flags & flags::PADDED != 0)?;
            Ok(Some(Frame::Data {
                stream_id: head.stream_id,
                data: Bytes::copy_from_slice(data),
                end_stream: head.flags & flags::END_STREAM != 0,
            }))
        }
        Kind::Headers => {
            let (unpadded, _) = strip_padding(payload, head.flags & flags::PADDED != 0)?;
            let (priority, header_block) = if head.flags & flags::PRIORITY != 0 {
                if unpadded.len() < 5 {
                    return Err(Error::new_bad_frame("short HEADERS priority prefix"));
                }
                (Some(parse_priority(&unpadded[..5])?), &unpadded[5..])
            } else {
                (None, unpadded)
            };
            Ok(Some(Frame::Headers {
                stream_id: head.stream_id,
                header_block: Bytes::copy_from_slice(header_block),
                end_stream: head.flags & flags::END_STREAM != 0,
                end_headers: head.flags & flags::END_HEADERS != 0,
                priority,
            }))
        }
        Kind::Priority => Ok(Some(Frame::Priority {
            stream_id: head.stream_id,
            priority: parse_priority(payload)?,
        })),
        Kind::RstStream => {
            if payload.len() != 4 {
                return Err(Error::new_bad_frame("RST_STREAM payload must be 4 bytes"));
            }
            Ok(Some(Frame::RstStream {
                stream_id: head.stream_id,
                error_code: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
            }))
        }
        Kind::Settings => {
            if head.stream_id != 0 {
                return Err(Error::new_bad_frame("SETTINGS on non-zero stream"));
            }
            let ack = head.flags & flags::ACK != 0;
            if ack {
                if !payload.is_empty() {
                    return Err(Error::new_bad_frame("SETTINGS ack must carry no payload"));
                }
                return Ok(Some(Frame::Settings { ack: true, values: Vec::new() }));
            }
            if payload.len() % 6 != 0 {
                return Err(Error::new_bad_frame("SETTINGS payload not a multiple of 6"));
            }
            let mut values = Vec::with_capacity(payload.len() / 6);
            for chunk in payload.chunks(6) {
                let id = u16::from_be_bytes([chunk[0], chunk[1]]);
                let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
                validate_setting(id, value)?;
                values.push((id, value));
            }
            Ok(Some(Frame::Settings { ack: false, values }))
        }
        Kind::PushPromise => {
            let (unpadded, _) = strip_padding(payload, head.flags & flags::PADDED != 0)?;
            if unpadded.len() < 4 {
                return Err(Error::new_bad_frame("short PUSH_PROMISE payload"));
            }
            let promised = u32::from_be_bytes([unpadded[0], unpadded[1], unpadded[2], unpadded[3]]) & 0x7fff_ffff;
            Ok(Some(Frame::PushPromise {
                stream_id: head.stream_id,
                promised_stream_id: promised,
                header_block: Bytes::copy_from_slice(&unpadded[4..]),
                end_headers: head.flags & flags::END_HEADERS != 0,
            }))
        }
        Kind::Ping => {
            if payload.len() != 8 {
                return Err(Error::new_bad_frame("PING payload must be 8 bytes"));
            }
            let mut p = [0u8; 8];
            p.copy_from_slice(payload);
            Ok(Some(Frame::Ping { ack: head.flags & flags::ACK != 0, payload: p }))
        }
        Kind::GoAway => {
            if payload.len() < 8 {
                return Err(Error::new_bad_frame("short GOAWAY payload"));
            }
            let last_stream_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
            let error_code = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
            Ok(Some(Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data: Bytes::copy_from_slice(&payload[8..]),
            }))
        }
        Kind::WindowUpdate => {
            if payload.len() != 4 {
                return Err(Error::new_bad_frame("WINDOW_UPDATE payload must be 4 bytes"));
            }
            let increment = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
            if increment == 0 {
                return Err(Error::new_bad_frame("WINDOW_UPDATE increment of 0"));
            }
            Ok(Some(Frame::WindowUpdate { stream_id: head.stream_id, increment }))
        }
        Kind::Continuation => Ok(Some(Frame::Continuation {
            stream_id: head.stream_id,
            header_block: Bytes::copy_from_slice(payload),
            end_headers: head.flags & flags::END_HEADERS != 0,
        })),
        Kind::Unknown(_) => Ok(None),
    }
}

fn validate_setting(id: u16, value: u32) -> Result<()> {
    match id {
        2 if value > 1 => Err(Error::new_bad_frame("ENABLE_PUSH must be 0 or 1")),
        4 if value > i32::MAX as u32 => Err(Error::new_bad_frame("INITIAL_WINDOW_SIZE too large")),
        5 if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) => {
            Err(Error::new_bad_frame("MAX_FRAME_SIZE out of range"))
        }
        _ => Ok(()),
    }
}

/// Writes `frame` as one or more wire frames (HEADERS/PUSH_PROMISE are
/// split across CONTINUATION frames when the block exceeds
/// `max_frame_size`), appending to `out`.
pub fn encode(frame: &Frame, max_frame_size: u32, out: &mut BytesMut) -> Result<()> {
    match frame {
        Frame::Data { stream_id, data, end_stream } => {
            write_split(out, *stream_id, data, max_frame_size, Kind::Data, *end_stream, flags::END_STREAM)
        }
        Frame::Headers {
            stream_id,
            header_block,
            end_stream,
            priority,
            ..
        } => {
            let mut payload = BytesMut::new();
            if let Some(p) = priority {
                let mut dep = p.stream_dependency & 0x7fff_ffff;
                if p.exclusive {
                    dep |= 0x8000_0000;
                }
                payload.put_u32(dep);
                payload.put_u8((p.weight.saturating_sub(1)) as u8);
            }
            payload.extend_from_slice(header_block);
            let extra_flag = if *end_stream { flags::END_STREAM } else { 0 }
                | if priority.is_some() { flags::PRIORITY } else { 0 };
            write_header_block(out, *stream_id, &payload, max_frame_size, Kind::Headers, extra_flag)
        }
        Frame::Priority { stream_id, priority } => {
            let mut payload = BytesMut::with_capacity(5);
            let mut dep = priority.stream_dependency & 0x7fff_ffff;
            if priority.exclusive {
                dep |= 0x8000_0000;
            }
            payload.put_u32(dep);
            payload.put_u8(priority.weight.saturating_sub(1) as u8);
            write_whole(out, *stream_id, Kind::Priority, 0, &payload)
        }
        Frame::RstStream { stream_id, error_code } => {
            let mut payload = BytesMut::with_capacity(4);
            payload.put_u32(*error_code);
            write_whole(out, *stream_id, Kind::RstStream, 0, &payload)
        }
        Frame::Settings { ack, values } => {
            if *ack {
                return write_whole(out, 0, Kind::Settings, flags::ACK, &BytesMut::new());
            }
            let mut payload = BytesMut::with_capacity(values.len() * 6);
            for &(id, value) in values {
                payload.put_u16(id);
                payload.put_u32(value);
            }
            write_whole(out, 0, Kind::Settings, 0, &payload)
        }
        Frame::PushPromise {
            stream_id,
            promised_stream_id,
            header_block,
            ..
        } => {
            let mut payload = BytesMut::with_capacity(4 + header_block.len());
            payload.put_u32(*promised_stream_id & 0x7fff_ffff);
            payload.extend_from_slice(header_block);
            write_header_block(out, *stream_id, &payload, max_frame_size, Kind::PushPromise, 0)
        }
        Frame::Ping { ack, payload } => write_whole(out, 0, Kind::Ping, if *ack { flags::ACK } else { 0 }, payload),
        Frame::GoAway { last_stream_id, error_code, debug_data } => {
            let mut payload = BytesMut::with_capacity(8 + debug_data.len());
            payload.put_u32(*last_stream_id & 0x7fff_ffff);
            payload.put_u32(*error_code);
            payload.extend_from_slice(debug_data);
            write_whole(out, 0, Kind::GoAway, 0, &payload)
        }
        Frame::WindowUpdate { stream_id, increment } => {
            let mut payload = BytesMut::with_capacity(4);
            payload.put_u32(*increment & 0x7fff_ffff);
            write_whole(out, *stream_id, Kind::WindowUpdate, 0, &payload)
        }
        Frame::Continuation { stream_id, header_block, end_headers } => {
            let flag = if *end_headers { flags::END_HEADERS } else { 0 };
            write_whole(out, *stream_id, Kind::Continuation, flag, header_block)
        }
    }
}

fn write_whole(out: &mut BytesMut, stream_id: u32, kind: Kind, flags: u8, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_MAX_FRAME_SIZE as usize {
        return Err(Error::new_bad_frame("frame payload too large to encode"));
    }
    Head {
        length: payload.len() as u32,
        kind,
        flags,
        stream_id,
    }
    .write(out);
    out.extend_from_slice(payload);
    Ok(())
}

fn write_split(
    out: &mut BytesMut,
    stream_id: u32,
    data: &[u8],
    max_frame_size: u32,
    kind: Kind,
    end_on_last: bool,
    end_flag: u8,
) -> Result<()> {
    let max = max_frame_size.max(1) as usize;
    if data.is_empty() {
        return write_whole(out, stream_id, kind, if end_on_last { end_flag } else { 0 }, &[]);
    }
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + max).min(data.len());
        let is_last = end == data.len();
        write_whole(
            out,
            stream_id,
            kind,
            if is_last && end_on_last { end_flag } else { 0 },
            &data[offset..end],
        )?;
        offset = end;
    }
    Ok(())
}

/// Writes a HEADERS/PUSH_PROMISE payload, splitting across CONTINUATION
/// frames when it exceeds `max_frame_size` (spec.md §4.3 "Header fragments
/// are concatenated across CONTINUATION frames until END_HEADERS").
fn write_header_block(
    out: &mut BytesMut,
    stream_id: u32,
    payload: &[u8],
    max_frame_size: u32,
    kind: Kind,
    extra_flags: u8,
) -> Result<()> {
    let max = max_frame_size.max(1) as usize;
    if payload.len() <= max {
        return write_whole(out, stream_id, kind, extra_flags | flags::END_HEADERS, payload);
    }
    write_whole(out, stream_id, kind, extra_flags, &payload[..max])?;
    let mut offset = max;
    while offset < payload.len() {
        let end = (offset + max).min(payload.len());
        let is_last = end == payload.len();
        write_whole(
            out,
            stream_id,
            Kind::Continuation,
            if is_last { flags::END_HEADERS } else { 0 },
            &payload[offset..end],
        )?;
        offset = end;
    }
    Ok(())
}

/// Attempts to split `buf` into one `(Head, payload)` pair, consuming from
/// `buf` if a complete frame is present. `Ok(None)` means "need more bytes".
pub fn try_parse_one(buf: &mut BytesMut) -> Result<Option<(Head, Bytes)>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let head = Head::parse(&buf[..FRAME_HEADER_LEN])?;
    let total = FRAME_HEADER_LEN + head.length as usize;
    if buf.len() < total {
        return Ok(None);
    }
    buf.advance(FRAME_HEADER_LEN);
    let payload = buf.split_to(head.length as usize).freeze();
    Ok(Some((head, payload)))
}

pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        encode(&frame, DEFAULT_MAX_FRAME_SIZE, &mut buf).unwrap();
        let (head, payload) = try_parse_one(&mut buf).unwrap().unwrap();
        decode(head, &payload).unwrap().unwrap()
    }

    #[test]
    fn data_frame_round_trips() {
        let frame = Frame::Data { stream_id: 3, data: Bytes::from_static(b"hello"), end_stream: true };
        match roundtrip(frame) {
            Frame::Data { stream_id, data, end_stream } => {
                assert_eq!(stream_id, 3);
                assert_eq!(&data[..], b"hello");
                assert!(end_stream);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn settings_frame_round_trips() {
        let frame = Frame::Settings { ack: false, values: vec![(4, 65535), (5, 16384)] };
        match roundtrip(frame) {
            Frame::Settings { ack, values } => {
                assert!(!ack);
                assert_eq!(values, vec![(4, 65535), (5, 16384)]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn window_update_rejects_zero_increment() {
        let mut buf = BytesMut::new();
        Head { length: 4, kind: Kind::WindowUpdate, flags: 0, stream_id: 1 }.write(&mut buf);
        buf.extend_from_slice(&0u32.to_be_bytes());
        let (head, payload) = try_parse_one(&mut buf).unwrap().unwrap();
        assert!(decode(head, &payload).is_err());
    }

    #[test]
    fn headers_larger_than_max_frame_size_splits_into_continuation() {
        let block = Bytes::from(vec![b'x'; 100]);
        let mut buf = BytesMut::new();
        encode(
            &Frame::Headers {
                stream_id: 1,
                header_block: block.clone(),
                end_stream: false,
                end_headers: true,
                priority: None,
            },
            40,
            &mut buf,
        )
        .unwrap();

        let mut reassembled = BytesMut::new();
        let mut frame_count = 0;
        while let Some((head, payload)) = try_parse_one(&mut buf).unwrap() {
            frame_count += 1;
            reassembled.extend_from_slice(&payload);
            let _ = head;
        }
        assert!(frame_count > 1);
        assert_eq!(&reassembled[..], &block[..]);
    }

    #[test]
    fn unknown_frame_type_decodes_to_none() {
        let mut buf = BytesMut::new();
        Head { length: 2, kind: Kind::Unknown(200), flags: 0, stream_id: 0 }.write(&mut buf);
        buf.extend_from_slice(b"hi");
        let (head, payload) = try_parse_one(&mut buf).unwrap().unwrap();
        assert!(decode(head, &payload).unwrap().is_none());
    }
}
