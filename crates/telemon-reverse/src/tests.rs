use crate::backoff::{Backoff, BASE_DELAY, JITTER_MS};
use crate::codec::{self, Command, Frame, CodecError, HEADER_LEN, MAX_CONTROL_PAYLOAD};
use crate::connection::{Connection, ConnectionOpts, ConnectionState, SessionEnd};
use crate::error::OpError;
use axum::routing::get;
use axum::Router;
use bytes::BufMut;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use telemon_check::{BrokerConfig, ReverseUrl};
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

fn ensure_rustls_provider() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

// --- codec ---

#[tokio::test]
async fn codec_round_trips_every_command() {
    for (command, payload) in [
        (Command::Connect, &b"{\"name\":\"abc\"}"[..]),
        (Command::Request, &b"GET /run HTTP/1.1\r\n\r\n"[..]),
        (Command::Reset, &b""[..]),
        (Command::Close, &b""[..]),
    ] {
        let frame = Frame::new(42, command, payload);
        let encoded = codec::encode(&frame);
        assert_eq!(encoded.len(), HEADER_LEN + payload.len());

        let mut reader: &[u8] = &encoded;
        let decoded = codec::read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, frame);
    }
}

#[tokio::test]
async fn codec_header_layout_is_fixed() {
    let frame = Frame::new(0x0102_0304, Command::Close, &b"xy"[..]);
    let encoded = codec::encode(&frame);
    assert_eq!(&encoded[..4], &[0x01, 0x02, 0x03, 0x04]);
    assert_eq!(&encoded[4..11], b"CLOSE  ");
    assert_eq!(&encoded[11..15], &[0, 0, 0, 2]);
    assert_eq!(&encoded[15..], b"xy");
}

#[tokio::test]
async fn codec_rejects_unknown_command_tag() {
    let mut buf = Vec::new();
    buf.put_u32(1);
    buf.extend_from_slice(b"SHUTDWN");
    buf.put_u32(0);
    let mut reader: &[u8] = &buf;
    let err = codec::read_frame(&mut reader).await.unwrap_err();
    assert!(matches!(err, CodecError::UnknownCommand(_)));
}

#[tokio::test]
async fn codec_rejects_oversize_control_payload_before_reading_it() {
    let mut buf = Vec::new();
    buf.put_u32(1);
    buf.extend_from_slice(Command::Close.tag());
    buf.put_u32((MAX_CONTROL_PAYLOAD + 1) as u32);
    // No payload bytes present: the cap check must fire on the header alone.
    let mut reader: &[u8] = &buf;
    let err = codec::read_frame(&mut reader).await.unwrap_err();
    assert!(matches!(err, CodecError::PayloadTooLarge { .. }));
}

#[tokio::test]
async fn codec_allows_large_request_payloads_up_to_their_own_cap() {
    let payload = vec![0u8; MAX_CONTROL_PAYLOAD + 1];
    let frame = Frame::new(9, Command::Request, payload);
    let encoded = codec::encode(&frame);
    let mut reader: &[u8] = &encoded;
    assert!(codec::read_frame(&mut reader).await.unwrap().is_some());

    let mut buf = Vec::new();
    buf.put_u32(9);
    buf.extend_from_slice(Command::Request.tag());
    buf.put_u32((codec::MAX_REQUEST_PAYLOAD + 1) as u32);
    let mut reader: &[u8] = &buf;
    assert!(matches!(
        codec::read_frame(&mut reader).await.unwrap_err(),
        CodecError::PayloadTooLarge { .. }
    ));
}

#[tokio::test]
async fn codec_clean_eof_is_none_but_truncation_is_an_error() {
    let mut reader: &[u8] = &[];
    assert!(codec::read_frame(&mut reader).await.unwrap().is_none());

    // Header cut short
    let encoded = codec::encode(&Frame::new(1, Command::Close, &b""[..]));
    let mut reader: &[u8] = &encoded[..HEADER_LEN - 3];
    assert!(matches!(
        codec::read_frame(&mut reader).await.unwrap_err(),
        CodecError::TruncatedFrame
    ));

    // Payload cut short
    let encoded = codec::encode(&Frame::new(1, Command::Request, &b"abcdef"[..]));
    let mut reader: &[u8] = &encoded[..encoded.len() - 2];
    assert!(matches!(
        codec::read_frame(&mut reader).await.unwrap_err(),
        CodecError::TruncatedFrame
    ));
}

// --- backoff ---

#[test]
fn backoff_delay_stays_in_exponential_envelope() {
    let max = Duration::from_secs(30);
    let mut backoff = Backoff::new(max);
    for attempt in 1u32..=8 {
        let expected = (BASE_DELAY * 2u32.pow(attempt - 1)).min(max);
        let delay = backoff.next_delay();
        assert!(delay >= expected, "attempt {attempt}: {delay:?} < {expected:?}");
        assert!(
            delay <= expected + Duration::from_millis(JITTER_MS),
            "attempt {attempt}: {delay:?} too large"
        );
    }
}

#[test]
fn backoff_reset_returns_to_base_delay() {
    let mut backoff = Backoff::new(Duration::from_secs(30));
    for _ in 0..5 {
        backoff.next_delay();
    }
    backoff.reset();
    let delay = backoff.next_delay();
    assert!(delay < Duration::from_secs(2));
    assert_eq!(backoff.attempt(), 1);
}

// --- error classification ---

#[test]
fn op_error_flags_are_mutually_exclusive() {
    assert!(OpError::Fatal("x".into()).is_fatal());
    assert!(!OpError::Fatal("x".into()).wants_refresh());
    assert!(OpError::RefreshCheck("x".into()).wants_refresh());
    assert!(!OpError::RefreshCheck("x".into()).is_fatal());
    assert!(!OpError::Retry("x".into()).is_fatal());
    assert!(!OpError::Retry("x".into()).wants_refresh());
}

// --- connection sessions over an in-memory duplex ---

async fn spawn_metrics_endpoint() -> String {
    let app = Router::new()
        .route("/run", get(|| async { r#"{"x":1}"# }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                "late"
            }),
        )
        .route(
            "/hang",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                "never"
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr.to_string()
}

fn test_broker_config() -> BrokerConfig {
    ensure_rustls_provider();
    BrokerConfig {
        broker_id: "/broker/1".to_string(),
        cn: "broker.test".to_string(),
        address: "127.0.0.1:1".to_string(),
        reverse_url: ReverseUrl::parse("mtev_reverse://127.0.0.1:1/check/test").unwrap(),
        tls: telemon_check::tls::client_config("").unwrap(),
    }
}

fn test_connection(agent_address: &str) -> Connection {
    Connection::new(
        test_broker_config(),
        "11111111-2222-3333-4444-555555555555",
        agent_address,
        ConnectionOpts {
            dispatch_timeout: Duration::from_secs(5),
            max_backoff: Duration::from_secs(30),
        },
    )
    .unwrap()
}

/// Broker side of the handshake: consume CONNECT, send the zero-length ack.
async fn accept_introduction(broker: &mut DuplexStream) -> Frame {
    let hello = codec::read_frame(broker).await.unwrap().unwrap();
    assert_eq!(hello.command, Command::Connect);
    let doc: serde_json::Value = serde_json::from_slice(&hello.payload).unwrap();
    assert!(doc["name"].is_string());
    assert!(doc["version"].is_string());
    codec::write_frame(broker, &Frame::empty(0, Command::Connect))
        .await
        .unwrap();
    hello
}

/// Read response frames for `seq` until the zero-length terminator,
/// returning the concatenated payload.
async fn collect_response(broker: &mut DuplexStream, seq: u32) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let frame = codec::read_frame(broker).await.unwrap().unwrap();
        assert_eq!(frame.command, Command::Request);
        assert_eq!(frame.seq, seq);
        if frame.payload.is_empty() {
            return body;
        }
        body.extend_from_slice(&frame.payload);
    }
}

#[tokio::test]
async fn session_serves_request_and_exits_on_clean_close() {
    let agent_addr = spawn_metrics_endpoint().await;
    let (agent_end, mut broker) = tokio::io::duplex(1 << 20);
    let token = CancellationToken::new();

    // The broker side runs in a task so the connection can be driven here
    // and its state inspected afterwards.
    let broker_task = tokio::spawn(async move {
        accept_introduction(&mut broker).await;
        codec::write_frame(
            &mut broker,
            &Frame::new(1, Command::Request, &b"GET /run HTTP/1.1\r\n\r\n"[..]),
        )
        .await
        .unwrap();
        let response = collect_response(&mut broker, 1).await;
        codec::write_frame(&mut broker, &Frame::empty(0, Command::Close))
            .await
            .unwrap();
        response
    });

    let mut conn = test_connection(&agent_addr);
    let end = conn.run_session(agent_end, &token).await.unwrap();
    assert_eq!(end, SessionEnd::Closed);
    assert_eq!(conn.state(), ConnectionState::Closed);

    let response = broker_task.await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200"), "got: {text}");
    assert!(text.ends_with(r#"{"x":1}"#), "got: {text}");
}

#[tokio::test]
async fn session_keeps_response_order_across_concurrent_dispatches() {
    let agent_addr = spawn_metrics_endpoint().await;
    let (agent_end, mut broker) = tokio::io::duplex(1 << 20);
    let token = CancellationToken::new();

    let mut conn = test_connection(&agent_addr);
    let handle = tokio::spawn(async move { conn.run_session(agent_end, &token).await });

    accept_introduction(&mut broker).await;

    // The slow dispatch is read first; its response must still come first.
    for (seq, path) in [(10u32, "/slow"), (11, "/run"), (12, "/run")] {
        codec::write_frame(
            &mut broker,
            &Frame::new(
                seq,
                Command::Request,
                format!("GET {path} HTTP/1.1\r\n\r\n").into_bytes(),
            ),
        )
        .await
        .unwrap();
    }

    for seq in [10u32, 11, 12] {
        let response = collect_response(&mut broker, seq).await;
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200"));
    }

    codec::write_frame(&mut broker, &Frame::empty(0, Command::Close))
        .await
        .unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::Closed);
}

#[tokio::test]
async fn session_reset_drops_unsent_responses_for_that_seq() {
    let agent_addr = spawn_metrics_endpoint().await;
    let (agent_end, mut broker) = tokio::io::duplex(1 << 20);
    let token = CancellationToken::new();

    let mut conn = test_connection(&agent_addr);
    let handle = tokio::spawn(async move { conn.run_session(agent_end, &token).await });

    accept_introduction(&mut broker).await;

    codec::write_frame(
        &mut broker,
        &Frame::new(7, Command::Request, &b"GET /slow HTTP/1.1\r\n\r\n"[..]),
    )
    .await
    .unwrap();
    codec::write_frame(&mut broker, &Frame::empty(7, Command::Reset))
        .await
        .unwrap();
    codec::write_frame(
        &mut broker,
        &Frame::new(8, Command::Request, &b"GET /run HTTP/1.1\r\n\r\n"[..]),
    )
    .await
    .unwrap();

    // Only seq 8 ever reaches the wire.
    let response = collect_response(&mut broker, 8).await;
    assert!(String::from_utf8_lossy(&response).ends_with(r#"{"x":1}"#));

    codec::write_frame(&mut broker, &Frame::empty(0, Command::Close))
        .await
        .unwrap();
    assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::Closed);
}

#[tokio::test]
async fn session_cancellation_mid_dispatch_exits_promptly() {
    let agent_addr = spawn_metrics_endpoint().await;
    let (agent_end, mut broker) = tokio::io::duplex(1 << 20);
    let token = CancellationToken::new();

    let session_token = token.clone();
    let mut conn = test_connection(&agent_addr);
    let handle =
        tokio::spawn(async move { conn.run_session(agent_end, &session_token).await });

    accept_introduction(&mut broker).await;
    codec::write_frame(
        &mut broker,
        &Frame::new(3, Command::Request, &b"GET /hang HTTP/1.1\r\n\r\n"[..]),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    token.cancel();

    let end = handle.await.unwrap().unwrap();
    assert_eq!(end, SessionEnd::Cancelled);
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[tokio::test]
async fn session_eof_without_close_is_retryable() {
    let agent_addr = spawn_metrics_endpoint().await;
    let (agent_end, mut broker) = tokio::io::duplex(1 << 20);
    let token = CancellationToken::new();

    let broker_task = tokio::spawn(async move {
        accept_introduction(&mut broker).await;
        drop(broker);
    });

    let mut conn = test_connection(&agent_addr);
    let err = conn.run_session(agent_end, &token).await.unwrap_err();
    assert!(matches!(err, OpError::Retry(_)), "got {err}");
    // Failure from Serving lands on Closed.
    assert_eq!(conn.state(), ConnectionState::Closed);
    broker_task.await.unwrap();
}

#[tokio::test]
async fn session_connect_from_broker_is_a_protocol_error() {
    let agent_addr = spawn_metrics_endpoint().await;
    let (agent_end, mut broker) = tokio::io::duplex(1 << 20);
    let token = CancellationToken::new();

    let mut conn = test_connection(&agent_addr);
    let handle = tokio::spawn(async move { conn.run_session(agent_end, &token).await });

    accept_introduction(&mut broker).await;
    codec::write_frame(&mut broker, &Frame::empty(5, Command::Connect))
        .await
        .unwrap();

    let err = handle.await.unwrap().unwrap_err();
    match err {
        OpError::Retry(msg) => assert!(msg.contains("protocol error"), "got {msg}"),
        other => panic!("expected retry, got {other}"),
    }
}

#[tokio::test]
async fn session_close_with_ownership_error_wants_refresh() {
    let agent_addr = spawn_metrics_endpoint().await;
    let (agent_end, mut broker) = tokio::io::duplex(1 << 20);
    let token = CancellationToken::new();

    let mut conn = test_connection(&agent_addr);
    let handle = tokio::spawn(async move { conn.run_session(agent_end, &token).await });

    accept_introduction(&mut broker).await;
    codec::write_frame(
        &mut broker,
        &Frame::new(
            0,
            Command::Close,
            &br#"{"error":"no such check on this broker"}"#[..],
        ),
    )
    .await
    .unwrap();

    let err = handle.await.unwrap().unwrap_err();
    assert!(err.wants_refresh(), "got {err}");
}

#[tokio::test]
async fn introduction_refused_for_ownership_wants_refresh() {
    let agent_addr = spawn_metrics_endpoint().await;
    let (agent_end, mut broker) = tokio::io::duplex(1 << 20);
    let token = CancellationToken::new();

    let mut conn = test_connection(&agent_addr);
    let handle = tokio::spawn(async move { conn.run_session(agent_end, &token).await });

    let hello = codec::read_frame(&mut broker).await.unwrap().unwrap();
    assert_eq!(hello.command, Command::Connect);
    codec::write_frame(
        &mut broker,
        &Frame::new(0, Command::Close, &br#"{"error":"unknown check"}"#[..]),
    )
    .await
    .unwrap();

    let err = handle.await.unwrap().unwrap_err();
    assert!(err.wants_refresh(), "got {err}");
}

#[tokio::test]
async fn introduction_refused_otherwise_is_fatal() {
    let agent_addr = spawn_metrics_endpoint().await;
    let (agent_end, mut broker) = tokio::io::duplex(1 << 20);
    let token = CancellationToken::new();

    let mut conn = test_connection(&agent_addr);
    let handle = tokio::spawn(async move { conn.run_session(agent_end, &token).await });

    let hello = codec::read_frame(&mut broker).await.unwrap().unwrap();
    assert_eq!(hello.command, Command::Connect);
    codec::write_frame(
        &mut broker,
        &Frame::new(0, Command::Close, &br#"{"error":"authentication refused"}"#[..]),
    )
    .await
    .unwrap();

    let err = handle.await.unwrap().unwrap_err();
    assert!(err.is_fatal(), "got {err}");
}

#[tokio::test]
async fn repeated_dispatch_failures_flag_stale_config() {
    // No listener on this port: every dispatch yields a synthetic 502.
    let agent_addr = "127.0.0.1:9".to_string();
    let (agent_end, mut broker) = tokio::io::duplex(1 << 20);
    let token = CancellationToken::new();

    let mut conn = test_connection(&agent_addr);
    let handle = tokio::spawn(async move { conn.run_session(agent_end, &token).await });

    accept_introduction(&mut broker).await;

    for seq in 1u32..=5 {
        codec::write_frame(
            &mut broker,
            &Frame::new(seq, Command::Request, &b"GET /run HTTP/1.1\r\n\r\n"[..]),
        )
        .await
        .unwrap();
        let response = collect_response(&mut broker, seq).await;
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 502"));
    }

    // Give the last failure count a moment to land, then wake the reader.
    tokio::time::sleep(Duration::from_millis(100)).await;
    codec::write_frame(&mut broker, &Frame::empty(99, Command::Reset))
        .await
        .unwrap();

    let err = handle.await.unwrap().unwrap_err();
    assert!(err.wants_refresh(), "got {err}");
}
