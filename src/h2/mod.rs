//! HTTP/2 support (spec.md §4.2–§4.4, C2–C4): HPACK, the frame codec, the
//! per-stream state machine, and the connection multiplexer built on top of
//! them. Gated behind the `http2` feature, the way the teacher gates its
//! own optional protocol surfaces behind cargo features.

pub mod connection;
pub mod frame;
pub mod hpack;
pub mod huffman;
pub mod stream;

pub use connection::{serve, Http2Shared};
pub use frame::{Frame, Kind as FrameKind};
pub use stream::{Http2Stream, StreamState};
