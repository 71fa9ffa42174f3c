//! mockwire: a scriptable in-process mock HTTP server for exercising
//! client-library wire behavior (spec.md §1 OVERVIEW).
//!
//! HTTP/1.1 (chunked transfer-encoding, `CONNECT` tunneling), HTTP/2 (HPACK,
//! flow control, server push, prior-knowledge), and the WebSocket upgrade
//! handshake are all driven by one scripted [`Dispatcher`] strategy: tests
//! enqueue [`MockResponse`] values (or install their own `Dispatcher`) and
//! then make assertions against the [`RecordedRequest`] queue the server
//! captures in wire-arrival order.
//!
//! Module layout follows the teacher's own split between wire codecs
//! (`h1`, `h2`), the shared data model (`headers`, `request`, `response`),
//! and the connection-driving glue (`server`, `dispatcher`, `recorder`) —
//! grounded per-module in `DESIGN.md`.
//!
//! ```no_run
//! # async fn run() -> mockwire::error::Result<()> {
//! use mockwire::{MockResponse, MockWireServer};
//!
//! let server = MockWireServer::new();
//! server.enqueue(MockResponse::builder().code(200).body(b"hello".to_vec()).build());
//! server.start(None, None).await?;
//!
//! let url = server.url("/");
//! // ... point an HTTP client under test at `url` ...
//!
//! let recorded = server.take_request().await;
//! assert_eq!(recorded.request_line.target, "/");
//!
//! server.close().await;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod dispatcher;
pub mod error;
pub mod h1;
#[cfg(feature = "http2")]
pub mod h2;
pub mod headers;
pub mod recorder;
pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use dispatcher::{Dispatcher, QueueDispatcher};
pub use error::{Error, Result};
pub use recorder::Recorder;
pub use request::{HandshakeInfo, HttpVersion, RecordedRequest, RequestLine};
pub use response::{BodyKind, MockResponse, MockResponseBuilder, PushPromise, Settings, SocketEffect, StreamHandler, WebSocketListener};
pub use server::{ClientAuth, MockWireServer, Protocol, TlsAcceptor};
