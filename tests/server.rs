//! Integration tests for the acceptor/exchange engine (spec.md §8 S1/S2/S3,
//! properties 1-2/8-9). Requests are issued over a raw `TcpStream` rather
//! than through a full HTTP client, the same way the teacher's own
//! `tests/server.rs` drives its lowest-level protocol assertions.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use mockwire::{MockResponse, MockWireServer, SocketEffect};

async fn connect(server: &MockWireServer) -> TcpStream {
    TcpStream::connect(("127.0.0.1", server.port())).await.unwrap()
}

async fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    out
}

#[tokio::test]
async fn simple_get_roundtrip() {
    let server = MockWireServer::new();
    server.enqueue(
        MockResponse::builder()
            .code(200)
            .set_header("content-type", "text/plain")
            .body(b"hello mockwire".to_vec())
            .build(),
    );
    server.start(None, None).await.unwrap();

    let mut socket = connect(&server).await;
    socket
        .write_all(b"GET /greeting HTTP/1.1\r\nHost: example\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let _ = socket.shutdown().await;
    let response = read_to_eof(&mut socket).await;
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"), "unexpected status line: {response}");
    assert!(response.contains("hello mockwire"));

    let recorded = server.take_request().await;
    assert_eq!(recorded.request_line.method, "GET");
    assert_eq!(recorded.request_line.target, "/greeting");
    assert_eq!(server.request_count(), 1);

    server.close().await;
}

#[tokio::test]
async fn requests_are_recorded_in_wire_arrival_order() {
    let server = MockWireServer::new();
    server.enqueue(MockResponse::builder().code(200).build());
    server.enqueue(MockResponse::builder().code(200).build());
    server.start(None, None).await.unwrap();

    for path in ["/first", "/second"] {
        let mut socket = connect(&server).await;
        socket
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: example\r\nConnection: close\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let _ = read_to_eof(&mut socket).await;
    }

    assert_eq!(server.request_count(), 2);
    let first = server.take_request().await;
    let second = server.take_request().await;
    assert_eq!(first.request_line.target, "/first");
    assert_eq!(second.request_line.target, "/second");

    server.close().await;
}

#[tokio::test]
async fn take_request_timeout_elapses_when_queue_is_empty() {
    let server = MockWireServer::new();
    server.start(None, None).await.unwrap();
    let got = server.take_request_timeout(Duration::from_millis(20)).await;
    assert!(got.is_none());
    server.close().await;
}

#[tokio::test]
async fn start_is_idempotent_for_the_same_port() {
    let server = MockWireServer::new();
    server.start(None, None).await.unwrap();
    let port = server.port();
    server.start(None, Some(port)).await.unwrap();
    assert_eq!(server.port(), port);
    server.close().await;
}

#[tokio::test]
async fn close_is_idempotent() {
    let server = MockWireServer::new();
    server.start(None, None).await.unwrap();
    server.close().await;
    server.close().await;
}

#[tokio::test]
async fn url_and_proxy_address_reflect_the_bound_port() {
    let server = MockWireServer::new();
    server.start(None, None).await.unwrap();
    let port = server.port();
    assert_eq!(server.url("/x"), format!("http://127.0.0.1:{port}/x"));
    assert_eq!(server.proxy_address(), format!("127.0.0.1:{port}"));
    server.close().await;
}

#[tokio::test]
async fn pre_read_close_socket_effect_closes_before_any_bytes_are_read() {
    let server = MockWireServer::new();
    server.enqueue(
        MockResponse::builder()
            .code(200)
            .on_request_start(SocketEffect::close())
            .build(),
    );
    server.start(None, None).await.unwrap();

    let mut socket = connect(&server).await;
    // The server never reads anything we send; it closes as soon as it
    // accepts, per the pre-accept `onRequestStart` check (spec.md §4.9).
    let response = read_to_eof(&mut socket).await;
    assert!(response.is_empty());

    server.close().await;
}

#[tokio::test]
async fn do_not_read_request_body_leaves_the_body_on_the_wire() {
    // `doNotReadRequestBody` treats the body as absent (spec.md §4.5 step
    // 3) without any `onRequestStart` effect pre-empting the exchange, so
    // the response is still written normally.
    let server = MockWireServer::new();
    server.enqueue(
        MockResponse::builder()
            .code(200)
            .do_not_read_request_body()
            .body(b"ignored your body".to_vec())
            .build(),
    );
    server.start(None, None).await.unwrap();

    let mut socket = connect(&server).await;
    socket
        .write_all(b"POST /upload HTTP/1.1\r\nHost: example\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
        .await
        .unwrap();
    let _ = socket.shutdown().await;
    let response = read_to_eof(&mut socket).await;
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "unexpected status line: {response}");
    assert!(response.contains("ignored your body"));

    let recorded = server.take_request().await;
    assert_eq!(recorded.request_line.target, "/upload");
    assert!(recorded.body.is_none());

    server.close().await;
}
