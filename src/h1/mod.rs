//! HTTP/1.1 support (spec.md §4.5–§4.6, C5–C6): request-line/header
//! parsing, chunked/content-length body decoding, and the per-connection
//! exchange engine built on top of them.

pub mod conn;
pub mod decode;
pub mod io;
pub mod parse;

pub use conn::{Connection, ConnectionContext, DuplexSocket};
