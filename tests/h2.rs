//! Integration tests for the HTTP/2 connection multiplexer (spec.md §8 S4/
//! S5, properties 5-7). A minimal hand-rolled HTTP/2 client drives a real
//! `MockWireServer` over loopback, the same way `tests/server.rs` drives
//! HTTP/1 with a raw `TcpStream` instead of a full client library.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use mockwire::h2::{frame, hpack, Frame};
use mockwire::headers::HeaderList;
use mockwire::{MockResponse, MockWireServer, Protocol};

async fn connect_prior_knowledge(server: &MockWireServer) -> TcpStream {
    let mut socket = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
    socket.write_all(frame::CLIENT_PREFACE).await.unwrap();
    send_frame(&mut socket, &Frame::Settings { ack: false, values: Vec::new() }).await;
    socket
}

async fn send_frame(socket: &mut TcpStream, frame: &Frame) {
    let mut buf = BytesMut::new();
    frame::encode(frame, frame::DEFAULT_MAX_FRAME_SIZE, &mut buf).unwrap();
    socket.write_all(&buf).await.unwrap();
}

async fn read_frame(socket: &mut TcpStream) -> Frame {
    loop {
        let mut head_buf = [0u8; frame::FRAME_HEADER_LEN];
        socket.read_exact(&mut head_buf).await.unwrap();
        let head = frame::Head::parse(&head_buf).unwrap();
        let mut payload = vec![0u8; head.length as usize];
        if !payload.is_empty() {
            socket.read_exact(&mut payload).await.unwrap();
        }
        if let Some(frame) = frame::decode(head, &payload).unwrap() {
            return frame;
        }
        // Unknown frame type: skip and keep reading, same as the server does.
    }
}

fn request_header_block(authority: String) -> Bytes {
    let mut headers = HeaderList::new();
    headers.add(":method", "GET");
    headers.add(":scheme", "http");
    headers.add(":authority", authority);
    headers.add(":path", "/");
    let mut encoder = hpack::Encoder::new(4096);
    encoder.encode_block(&headers)
}

/// Reads frames until the server's initial SETTINGS frame (non-ack) has
/// arrived, consuming any frames before it (the server may send SETTINGS
/// and nothing else at connection start).
async fn await_server_settings(socket: &mut TcpStream) {
    loop {
        if let Frame::Settings { ack: false, .. } = read_frame(socket).await {
            return;
        }
    }
}

#[tokio::test]
async fn prior_knowledge_get_round_trip() {
    let server = MockWireServer::new();
    server.set_protocols(vec![Protocol::H2PriorKnowledge]).unwrap();
    server.enqueue(
        MockResponse::builder()
            .code(200)
            .set_header("content-type", "text/plain")
            .body(b"h2 hello".to_vec())
            .build(),
    );
    server.start(None, None).await.unwrap();

    let mut socket = connect_prior_knowledge(&server).await;
    await_server_settings(&mut socket).await;

    let block = request_header_block(server.proxy_address());
    send_frame(
        &mut socket,
        &Frame::Headers {
            stream_id: 1,
            header_block: block,
            end_stream: true,
            end_headers: true,
            priority: None,
        },
    )
    .await;

    let mut status = None;
    let mut body = Vec::new();
    let mut decoder = hpack::Decoder::new(4096);
    loop {
        match read_frame(&mut socket).await {
            Frame::Headers { header_block, stream_id, .. } => {
                assert_eq!(stream_id, 1);
                let headers = decoder.decode_block(&header_block).unwrap();
                status = headers.get(":status").map(|v| String::from_utf8_lossy(v).into_owned());
            }
            Frame::Data { data, end_stream, stream_id, .. } => {
                assert_eq!(stream_id, 1);
                body.extend_from_slice(&data);
                if end_stream {
                    break;
                }
            }
            Frame::Settings { ack: false, .. } => {
                send_frame(&mut socket, &Frame::Settings { ack: true, values: Vec::new() }).await;
            }
            Frame::Ping { ack: false, payload } => {
                send_frame(&mut socket, &Frame::Ping { ack: true, payload }).await;
            }
            Frame::WindowUpdate { .. } | Frame::Settings { ack: true, .. } => {}
            other => panic!("unexpected frame while awaiting response: {other:?}"),
        }
    }

    assert_eq!(status.as_deref(), Some("200"));
    assert_eq!(body, b"h2 hello");

    let recorded = server.take_request().await;
    assert_eq!(recorded.request_line.version, mockwire::HttpVersion::Http2);

    server.close().await;
}

#[tokio::test]
async fn goaway_after_first_stream_lets_a_second_connection_proceed() {
    let server = MockWireServer::new();
    server.set_protocols(vec![Protocol::H2PriorKnowledge]).unwrap();
    server.enqueue(
        MockResponse::builder()
            .code(200)
            .on_response_end(mockwire::SocketEffect::shutdown_connection())
            .build(),
    );
    server.enqueue(MockResponse::builder().code(200).body(b"second".to_vec()).build());
    server.start(None, None).await.unwrap();

    // First connection: one stream, then the server GOAWAYs and closes.
    {
        let mut socket = connect_prior_knowledge(&server).await;
        await_server_settings(&mut socket).await;
        let block = request_header_block(server.proxy_address());
        send_frame(
            &mut socket,
            &Frame::Headers {
                stream_id: 1,
                header_block: block,
                end_stream: true,
                end_headers: true,
                priority: None,
            },
        )
        .await;

        let mut saw_goaway = false;
        loop {
            match read_frame(&mut socket).await {
                Frame::Settings { ack: false, .. } => {
                    send_frame(&mut socket, &Frame::Settings { ack: true, values: Vec::new() }).await;
                }
                Frame::GoAway { .. } => {
                    saw_goaway = true;
                    break;
                }
                Frame::Headers { .. } | Frame::Data { .. } | Frame::Settings { ack: true, .. } => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert!(saw_goaway);
    }

    // A fresh connection still gets served from the same scripted queue.
    let mut socket = connect_prior_knowledge(&server).await;
    await_server_settings(&mut socket).await;
    let block = request_header_block(server.proxy_address());
    send_frame(
        &mut socket,
        &Frame::Headers {
            stream_id: 1,
            header_block: block,
            end_stream: true,
            end_headers: true,
            priority: None,
        },
    )
    .await;

    let mut body = Vec::new();
    loop {
        match read_frame(&mut socket).await {
            Frame::Data { data, end_stream, .. } => {
                body.extend_from_slice(&data);
                if end_stream {
                    break;
                }
            }
            Frame::Settings { ack: false, .. } => {
                send_frame(&mut socket, &Frame::Settings { ack: true, values: Vec::new() }).await;
            }
            Frame::Headers { .. } | Frame::Settings { ack: true, .. } => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert_eq!(body, b"second");

    server.close().await;
}

/// spec.md §8 S5: both streams' HEADERS are accepted, but the scripted
/// GOAWAY still names the first as `lastGoodStreamId` — the second stream
/// is refused even though its request already arrived.
#[tokio::test]
async fn goaway_with_explicit_boundary_refuses_a_later_stream() {
    let server = MockWireServer::new();
    server.set_protocols(vec![Protocol::H2PriorKnowledge]).unwrap();
    server.enqueue(MockResponse::builder().code(200).body(b"first".to_vec()).build());
    server.enqueue(
        MockResponse::builder()
            .code(200)
            .on_response_start(mockwire::SocketEffect::shutdown_connection_at(1))
            .build(),
    );
    server.start(None, None).await.unwrap();

    let mut socket = connect_prior_knowledge(&server).await;
    await_server_settings(&mut socket).await;

    let block = request_header_block(server.proxy_address());
    send_frame(
        &mut socket,
        &Frame::Headers {
            stream_id: 1,
            header_block: block.clone(),
            end_stream: true,
            end_headers: true,
            priority: None,
        },
    )
    .await;

    let mut decoder = hpack::Decoder::new(4096);
    let mut body = Vec::new();
    loop {
        match read_frame(&mut socket).await {
            Frame::Headers { header_block, stream_id, .. } => {
                assert_eq!(stream_id, 1);
                decoder.decode_block(&header_block).unwrap();
            }
            Frame::Data { data, end_stream, stream_id, .. } => {
                assert_eq!(stream_id, 1);
                body.extend_from_slice(&data);
                if end_stream {
                    break;
                }
            }
            Frame::Settings { ack: false, .. } => {
                send_frame(&mut socket, &Frame::Settings { ack: true, values: Vec::new() }).await;
            }
            Frame::Settings { ack: true, .. } => {}
            other => panic!("unexpected frame while awaiting first response: {other:?}"),
        }
    }
    assert_eq!(body, b"first");

    send_frame(
        &mut socket,
        &Frame::Headers {
            stream_id: 3,
            header_block: block,
            end_stream: true,
            end_headers: true,
            priority: None,
        },
    )
    .await;

    let mut last_good = None;
    loop {
        match read_frame(&mut socket).await {
            Frame::GoAway { last_stream_id, .. } => {
                last_good = Some(last_stream_id);
                break;
            }
            Frame::Settings { .. } => {}
            other => panic!("unexpected frame while awaiting goaway: {other:?}"),
        }
    }
    assert_eq!(last_good, Some(1));

    server.close().await;
}
