//! End-to-end integration tests for wsrelay.
//!
//! These tests run a mock WebSocket relay and verify that TCP clients,
//! the listener, and the prober behave correctly against it.

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use wsrelay::{
    probe, Frame, ListenerEvent, RelayListener, RelayStream, SessionConfig, WsEndpoint,
    MIN_READ_SIZE,
};

fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut buf = BytesMut::new();
    frame.encode(&mut buf);
    buf.to_vec()
}

fn sid_message(sid: &str) -> Message {
    Message::Binary(encode_frame(&Frame::ConnectSuccessSid {
        sid: sid.to_string(),
    }))
}

/// Spawns a relay that assigns SID "abc" and echoes DATA frames back.
async fn spawn_echo_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
                ws.send(sid_message("abc")).await.unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Binary(data) = msg {
                        // Echo DATA back; ACKs are absorbed
                        if matches!(Frame::decode(&data), Ok(Frame::Data { .. })) {
                            if ws.send(Message::Binary(data)).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    format!("ws://{}/v4/connect", addr)
}

/// Spawns a relay that assigns a SID and then stays silent.
async fn spawn_idle_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
                ws.send(sid_message("idle")).await.unwrap();
                // Hold the connection open without sending anything
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });

    format!("ws://{}/v4/connect", addr)
}

/// An address nothing is listening on.
async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}/v4/connect", addr)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ListenerEvent>) -> ListenerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for listener event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_tunnel_round_trip() {
    let url = spawn_echo_relay().await;
    let target = Arc::new(WsEndpoint::new(url, None));

    let (mut listener, mut events) =
        RelayListener::bind("127.0.0.1:0", target, SessionConfig::default())
            .await
            .unwrap();
    listener.set_accept_limit(1);
    let addr = listener.local_addr().unwrap();
    let run = tokio::spawn(listener.run());

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"PING").await.unwrap();

    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PING");

    // Closing the client ends the bridge cleanly
    drop(client);
    run.await.unwrap().unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        ListenerEvent::ClientConnected { client: 1 }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        ListenerEvent::ClientDisconnected { client: 1 }
    ));
}

#[tokio::test]
async fn test_listener_reports_unreachable_relay() {
    let url = unreachable_url().await;
    let target = Arc::new(WsEndpoint::new(url, None));

    let (mut listener, mut events) =
        RelayListener::bind("127.0.0.1:0", target, SessionConfig::default())
            .await
            .unwrap();
    listener.set_accept_limit(1);
    let addr = listener.local_addr().unwrap();
    let run = tokio::spawn(listener.run());

    let _client = TcpStream::connect(addr).await.unwrap();
    run.await.unwrap().unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        ListenerEvent::ClientConnected { client: 1 }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        ListenerEvent::ConnectionFailed { client: 1, .. }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        ListenerEvent::ClientDisconnected { client: 1 }
    ));
}

#[tokio::test]
async fn test_large_transfer_round_trips() {
    let url = spawn_echo_relay().await;
    let target = Arc::new(WsEndpoint::new(url, None));

    let (mut listener, _events) =
        RelayListener::bind("127.0.0.1:0", target, SessionConfig::default())
            .await
            .unwrap();
    listener.set_accept_limit(1);
    let addr = listener.local_addr().unwrap();
    let run = tokio::spawn(listener.run());

    // 100KB forces fragmentation into multiple DATA frames
    let payload: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();

    let client = TcpStream::connect(addr).await.unwrap();
    let (mut read_half, mut write_half) = client.into_split();

    // Keep the write half open until the echo is fully back; a local
    // EOF ends the bridge.
    let sent = payload.clone();
    let writer = tokio::spawn(async move {
        write_half.write_all(&sent).await.unwrap();
        write_half
    });

    let mut received = Vec::with_capacity(payload.len());
    let mut buf = [0u8; 8192];
    while received.len() < payload.len() {
        let n = read_half.read(&mut buf).await.unwrap();
        assert_ne!(n, 0, "stream ended before the full payload came back");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, payload);

    let write_half = writer.await.unwrap();
    drop(write_half);
    drop(read_half);
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_session_resumes_after_relay_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let seen_paths = Arc::new(Mutex::new(Vec::new()));
    let relay_paths = Arc::clone(&seen_paths);

    tokio::spawn(async move {
        let record = |paths: &Arc<Mutex<Vec<String>>>| {
            let paths = Arc::clone(paths);
            move |req: &Request, resp: Response| {
                paths.lock().unwrap().push(req.uri().to_string());
                Ok(resp)
            }
        };

        // First connection: assign the SID, take one DATA frame, then
        // drop without a close handshake.
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_hdr_async(socket, record(&relay_paths))
            .await
            .unwrap();
        ws.send(sid_message("abc")).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Binary(data) = msg {
                if matches!(Frame::decode(&data), Ok(Frame::Data { .. })) {
                    break;
                }
            }
        }
        drop(ws);

        // Resumed connection: claim nothing arrived, then echo the replay.
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_hdr_async(socket, record(&relay_paths))
            .await
            .unwrap();
        ws.send(Message::Binary(encode_frame(&Frame::ReconnectAck {
            ack: 0,
        })))
        .await
        .unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Binary(data) = msg {
                if matches!(Frame::decode(&data), Ok(Frame::Data { .. })) {
                    ws.send(Message::Binary(data)).await.unwrap();
                }
            }
        }
    });

    let target = Arc::new(WsEndpoint::new(format!("ws://{}/v4/connect", addr), None));
    let config = SessionConfig {
        max_reconnects: 2,
        reconnect_backoff: Duration::from_millis(10),
        ..SessionConfig::default()
    };
    let stream = RelayStream::connect(target, config).await.unwrap();
    assert_eq!(stream.sid(), "abc");

    stream.write(b"hello").await.unwrap();

    // The relay drops; the session resumes, replays "hello", and the
    // echoed replay comes back on the new connection.
    let mut buf = vec![0u8; MIN_READ_SIZE];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello");

    let paths = seen_paths.lock().unwrap().clone();
    assert_eq!(paths.len(), 2);
    assert_eq!(paths[0], "/v4/connect");
    assert_eq!(paths[1], "/v4/reconnect?sid=abc&ack=0");
}

#[tokio::test]
async fn test_stream_survives_two_relay_drops() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let seen_paths = Arc::new(Mutex::new(Vec::new()));
    let relay_paths = Arc::clone(&seen_paths);

    // The relay accumulates the bytes it has accepted across connections
    // and reports that position on each resume.
    tokio::spawn(async move {
        let record = |paths: &Arc<Mutex<Vec<String>>>| {
            let paths = Arc::clone(paths);
            move |req: &Request, resp: Response| {
                paths.lock().unwrap().push(req.uri().to_string());
                Ok(resp)
            }
        };
        let mut received: Vec<u8> = Vec::new();

        // First connection: assign the SID, accept one DATA frame but
        // keep only its first three bytes, then drop without a close
        // handshake.
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_hdr_async(socket, record(&relay_paths))
            .await
            .unwrap();
        ws.send(sid_message("abc")).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Binary(data) = msg {
                if let Ok(Frame::Data { data }) = Frame::decode(&data) {
                    received.extend_from_slice(&data);
                    break;
                }
            }
        }
        received.truncate(3);
        drop(ws);

        // Second connection: resume mid-chunk, accept one replayed DATA
        // frame, then drop again.
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_hdr_async(socket, record(&relay_paths))
            .await
            .unwrap();
        ws.send(Message::Binary(encode_frame(&Frame::ReconnectAck {
            ack: received.len() as u64,
        })))
        .await
        .unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Binary(data) = msg {
                if let Ok(Frame::Data { data }) = Frame::decode(&data) {
                    received.extend_from_slice(&data);
                    break;
                }
            }
        }
        drop(ws);

        // Third connection: resume, collect the rest, and echo the whole
        // accepted stream back in one frame.
        let (socket, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_hdr_async(socket, record(&relay_paths))
            .await
            .unwrap();
        ws.send(Message::Binary(encode_frame(&Frame::ReconnectAck {
            ack: received.len() as u64,
        })))
        .await
        .unwrap();
        while received.len() < 11 {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if let Ok(Frame::Data { data }) = Frame::decode(&data) {
                        received.extend_from_slice(&data);
                    }
                }
                _ => return,
            }
        }
        ws.send(Message::Binary(encode_frame(&Frame::Data {
            data: received.clone().into(),
        })))
        .await
        .unwrap();
        // Hold the connection open while the client reads the echo
        while let Some(Ok(_)) = ws.next().await {}
    });

    let target = Arc::new(WsEndpoint::new(format!("ws://{}/v4/connect", addr), None));
    let config = SessionConfig {
        max_reconnects: 2,
        reconnect_backoff: Duration::from_millis(10),
        ..SessionConfig::default()
    };
    let stream = RelayStream::connect(target, config).await.unwrap();
    assert_eq!(stream.sid(), "abc");

    stream.write(b"hello ").await.unwrap();
    stream.write(b"world").await.unwrap();

    // Two forced drops later the relay has seen "hello world" exactly
    // once, byte for byte, and echoes it back whole.
    let mut buf = vec![0u8; MIN_READ_SIZE];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello world");

    let paths = seen_paths.lock().unwrap().clone();
    assert_eq!(paths.len(), 3);
    assert_eq!(paths[0], "/v4/connect");
    assert_eq!(paths[1], "/v4/reconnect?sid=abc&ack=0");
    assert_eq!(paths[2], "/v4/reconnect?sid=abc&ack=0");
}

#[tokio::test]
async fn test_probe_succeeds_against_idle_relay() {
    let url = spawn_idle_relay().await;
    let target = Arc::new(WsEndpoint::new(url, None));

    let result = probe(
        target,
        SessionConfig::default(),
        Duration::from_millis(500),
    )
    .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_probe_fails_when_relay_unreachable() {
    let url = unreachable_url().await;
    let target = Arc::new(WsEndpoint::new(url, None));

    let result = probe(target, SessionConfig::default(), Duration::from_secs(2)).await;
    assert!(result.is_err());
}
