//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Result type used throughout mockwire.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// An error produced while driving a mock connection, frame, or script.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
    reason: Option<Reason>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The request line or headers could not be parsed.
    Parse,
    /// A chunked or content-length body was malformed.
    BadBody,
    /// An http/2 frame violated the wire format.
    BadFrame,
    /// An HPACK instruction violated the compression format.
    Hpack,
    /// A stream- or connection-level protocol invariant was violated.
    Protocol,
    /// The socket was closed, reset, or otherwise unusable.
    Io,
    /// The TLS handshake failed (scripted or otherwise).
    Handshake,
    /// The server was asked to do something its current state forbids.
    User,
}

/// HTTP/2 error codes, carried by RST_STREAM and GOAWAY frames.
///
/// Grounded in RFC 7540 §7; only the subset mockwire's scripts and protocol
/// checks ever emit is named, everything else round-trips as `Other(u32)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
    Other(u32),
}

impl Reason {
    pub fn into_u32(self) -> u32 {
        match self {
            Reason::NoError => 0x0,
            Reason::ProtocolError => 0x1,
            Reason::InternalError => 0x2,
            Reason::FlowControlError => 0x3,
            Reason::SettingsTimeout => 0x4,
            Reason::StreamClosed => 0x5,
            Reason::FrameSizeError => 0x6,
            Reason::RefusedStream => 0x7,
            Reason::Cancel => 0x8,
            Reason::CompressionError => 0x9,
            Reason::ConnectError => 0xa,
            Reason::EnhanceYourCalm => 0xb,
            Reason::InadequateSecurity => 0xc,
            Reason::Http11Required => 0xd,
            Reason::Other(n) => n,
        }
    }

    pub fn from_u32(n: u32) -> Reason {
        match n {
            0x0 => Reason::NoError,
            0x1 => Reason::ProtocolError,
            0x2 => Reason::InternalError,
            0x3 => Reason::FlowControlError,
            0x4 => Reason::SettingsTimeout,
            0x5 => Reason::StreamClosed,
            0x6 => Reason::FrameSizeError,
            0x7 => Reason::RefusedStream,
            0x8 => Reason::Cancel,
            0x9 => Reason::CompressionError,
            0xa => Reason::ConnectError,
            0xb => Reason::EnhanceYourCalm,
            0xc => Reason::InadequateSecurity,
            0xd => Reason::Http11Required,
            other => Reason::Other(other),
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                cause: None,
                reason: None,
            }),
        }
    }

    pub(crate) fn with_cause<E: Into<Cause>>(mut self, cause: E) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn with_reason(mut self, reason: Reason) -> Error {
        self.inner.reason = Some(reason);
        self
    }

    pub(crate) fn new_parse<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Parse).with_cause(cause)
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io).with_cause(cause)
    }

    pub(crate) fn new_protocol(reason: Reason) -> Error {
        Error::new(Kind::Protocol).with_reason(reason)
    }

    pub(crate) fn new_hpack<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Hpack).with_cause(cause)
    }

    pub(crate) fn new_bad_frame(msg: &'static str) -> Error {
        Error::new(Kind::BadFrame).with_cause(msg)
    }

    pub(crate) fn new_bad_body(msg: &'static str) -> Error {
        Error::new(Kind::BadBody).with_cause(msg)
    }

    pub(crate) fn new_handshake<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Handshake).with_cause(cause)
    }

    pub(crate) fn new_user(msg: &'static str) -> Error {
        Error::new(Kind::User).with_cause(msg)
    }

    /// True if this error should terminate the whole HTTP/2 connection
    /// (GOAWAY) rather than just the one stream (RST_STREAM).
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self.inner.kind, Kind::BadFrame | Kind::Hpack)
            || matches!(self.inner.kind, Kind::Protocol if self.inner.reason.is_some())
    }

    /// The HTTP/2 error code this failure should be reported with, if any.
    pub fn h2_reason(&self) -> Reason {
        self.inner.reason.unwrap_or(Reason::ProtocolError)
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("mockwire::Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref reason) = self.inner.reason {
            builder.field("reason", reason);
        }
        if let Some(ref cause) = self.inner.cause {
            builder.field("cause", cause);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Parse => write!(f, "error parsing request")?,
            Kind::BadBody => write!(f, "error decoding request body")?,
            Kind::BadFrame => write!(f, "error decoding http/2 frame")?,
            Kind::Hpack => write!(f, "error decoding hpack header block")?,
            Kind::Protocol => write!(f, "protocol error")?,
            Kind::Io => write!(f, "connection error")?,
            Kind::Handshake => write!(f, "tls handshake failed")?,
            Kind::User => write!(f, "invalid usage")?,
        }
        if let Some(ref reason) = self.inner.reason {
            write!(f, ": {}", reason)?;
        }
        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.cause.as_ref().map(|e| &**e as _)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::new_io(err)
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Error {
        Error::new_parse(err.to_string())
    }
}
