//! Integration test for the WebSocket upgrade handshake (spec.md §8 S6).

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use mockwire::h1::DuplexSocket;
use mockwire::{MockResponse, MockWireServer, WebSocketListener};

struct Echo;

impl WebSocketListener for Echo {
    fn on_open(&self, mut socket: DuplexSocket) {
        tokio::spawn(async move {
            let mut buf = [0u8; 5];
            if socket.read_exact(&mut buf).await.is_ok() {
                let _ = socket.write_all(&buf).await;
            }
        });
    }
}

#[tokio::test]
async fn upgrade_handshake_hands_the_socket_to_the_listener() {
    let server = MockWireServer::new();
    server.enqueue(
        MockResponse::builder()
            .web_socket_upgrade(Arc::new(Echo))
            .build(),
    );
    server.start(None, None).await.unwrap();

    let mut socket = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
    socket
        .write_all(
            b"GET /chat HTTP/1.1\r\n\
              Host: example\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        socket.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let head = String::from_utf8_lossy(&head);
    assert!(head.starts_with("HTTP/1.1 101"), "unexpected status line: {head}");
    assert!(head.to_ascii_lowercase().contains("sec-websocket-accept: s3pplmbitxaq9kygzzhzrbk+xoo="));

    socket.write_all(b"hello").await.unwrap();
    let mut echoed = [0u8; 5];
    socket.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello");

    let recorded = server.take_request().await;
    assert_eq!(recorded.request_line.target, "/chat");

    server.close().await;
}
