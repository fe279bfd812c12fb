//! End-to-end connection tests against a scripted in-memory server.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use muxwire::codec::method::{
    connection, BlockedFields, CloseFields, CloseOkFields, Method, OpenFields, OpenOkFields,
    StartFields, StartOkFields, TuneFields, UnblockedFields,
};
use muxwire::codec::wire::reply_code;
use muxwire::codec::{
    encode_header_frame, encode_method_frame, ContentHeader, Frame, FrameBody, FrameBuffer,
    PROTOCOL_HEADER,
};
use muxwire::{
    Connection, ConnectionEvent, Credentials, Delivery, EngineError, OpenOptions,
};

/// Arbitrary non-connection-class method used as channel traffic.
const SAMPLE_METHOD: u32 = (20u32 << 16) | 10;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct SampleFields {
    value: u32,
}

/// Opt-in tracing for debugging test failures: RUST_LOG=muxwire=trace.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The server side of a duplex pipe, speaking the protocol by script.
struct TestServer {
    stream: DuplexStream,
    buffer: FrameBuffer,
}

impl TestServer {
    fn new(stream: DuplexStream) -> Self {
        init_tracing();
        Self {
            stream,
            buffer: FrameBuffer::new(),
        }
    }

    async fn recv_frame(&mut self) -> Frame {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = self.buffer.try_next().unwrap() {
                return frame;
            }
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed while a frame was expected");
            self.buffer.extend(&chunk[..n]);
        }
    }

    async fn recv_control(&mut self) -> Method {
        let frame = self.recv_frame().await;
        assert_eq!(frame.channel, 0, "expected a control frame");
        match frame.body {
            FrameBody::Method(method) => method,
            other => panic!("expected a method frame, got {:?}", other),
        }
    }

    async fn send_method<T: Serialize>(&mut self, channel: u16, id: u32, fields: &T) {
        let method = Method::build(id, fields).unwrap();
        self.stream
            .write_all(&encode_method_frame(channel, &method))
            .await
            .unwrap();
    }

    async fn send_raw(&mut self, bytes: Bytes) {
        self.stream.write_all(&bytes).await.unwrap();
    }

    async fn expect_eof(&mut self) {
        let mut chunk = [0u8; 64];
        let n = self.stream.read(&mut chunk).await.unwrap();
        assert_eq!(n, 0, "expected the client to end the transport");
    }

    /// Play the server side of the opening handshake. Returns the fields
    /// the client sent in start-ok and tune-ok.
    async fn handshake(&mut self, tune: TuneFields) -> (StartOkFields, TuneFields) {
        let mut header = [0u8; 8];
        self.stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header, PROTOCOL_HEADER);

        self.send_method(
            0,
            connection::START,
            &StartFields {
                mechanisms: "EXTERNAL PLAIN".to_string(),
                locales: "en_US".to_string(),
                server_properties: Default::default(),
            },
        )
        .await;

        let start_ok = self.recv_control().await;
        assert_eq!(start_ok.id, connection::START_OK);
        let start_ok_fields: StartOkFields = start_ok.fields().unwrap();

        self.send_method(0, connection::TUNE, &tune).await;

        let tune_ok = self.recv_control().await;
        assert_eq!(tune_ok.id, connection::TUNE_OK);
        let tune_ok_fields: TuneFields = tune_ok.fields().unwrap();

        let open = self.recv_control().await;
        assert_eq!(open.id, connection::OPEN);
        let _open_fields: OpenFields = open.fields().unwrap();

        self.send_method(0, connection::OPEN_OK, &OpenOkFields::default())
            .await;

        (start_ok_fields, tune_ok_fields)
    }
}

fn default_tune() -> TuneFields {
    TuneFields {
        channel_max: 0,
        frame_max: 0,
        heartbeat: 0,
    }
}

/// Open a connection against a scripted server in one step.
async fn open_pair(
    tune: TuneFields,
    options: OpenOptions,
) -> (
    Connection,
    mpsc::UnboundedReceiver<ConnectionEvent>,
    TestServer,
) {
    let (client, server) = duplex(1 << 20);
    let mut srv = TestServer::new(server);

    let opening = tokio::spawn(Connection::open(client, options));
    srv.handshake(tune).await;
    let (connection, events) = opening.await.unwrap().unwrap();

    (connection, events, srv)
}

fn sample_channel(
    connection: &Connection,
) -> (u16, mpsc::UnboundedReceiver<Delivery>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = connection.allocate_channel(tx).unwrap();
    (id, rx)
}

// ---------------------------------------------------------------------------
// Handshake

#[tokio::test]
async fn handshake_negotiates_limits_and_sends_credentials() {
    let tune = TuneFields {
        channel_max: 0,
        frame_max: 0,
        heartbeat: 60,
    };
    let options = OpenOptions::default()
        .credentials(Credentials::plain("user", "secret"))
        .channel_max(0)
        .frame_max(4096)
        .heartbeat(30);

    let (client, server) = duplex(1 << 20);
    let mut srv = TestServer::new(server);

    let opening = tokio::spawn(Connection::open(client, options));
    let (start_ok, tune_ok) = srv.handshake(tune).await;
    let (connection, _events) = opening.await.unwrap().unwrap();

    assert_eq!(start_ok.mechanism, "PLAIN");
    assert_eq!(start_ok.response, b"\0user\0secret");
    assert_eq!(start_ok.client_properties.get("product").unwrap(), "muxwire");

    // Each side at 0 defers to the other; both limiting takes the minimum.
    assert_eq!(tune_ok.channel_max, 0);
    assert_eq!(tune_ok.frame_max, 4096);
    assert_eq!(tune_ok.heartbeat, 30);

    // A negotiated 0 means no limit, so the encoding maximum applies.
    assert_eq!(connection.channel_max(), u16::MAX);
    assert_eq!(connection.frame_max(), 4096);
    assert_eq!(connection.heartbeat(), 30);
}

#[tokio::test]
async fn handshake_rejects_unsupported_mechanism() {
    let (client, server) = duplex(1 << 20);
    let mut srv = TestServer::new(server);

    let server_side = async {
        let mut header = [0u8; 8];
        srv.stream.read_exact(&mut header).await.unwrap();
        srv.send_method(
            0,
            connection::START,
            &StartFields {
                mechanisms: "EXTERNAL KERBEROS".to_string(),
                locales: "en_US".to_string(),
                server_properties: Default::default(),
            },
        )
        .await;
    };

    let (result, _) = tokio::join!(
        Connection::open(client, OpenOptions::default()),
        server_side
    );
    let err = result.unwrap_err();
    assert!(matches!(err, EngineError::Handshake(_)));
    assert!(err.to_string().contains("PLAIN"));
}

#[tokio::test]
async fn handshake_fails_on_secure_challenge() {
    let (client, server) = duplex(1 << 20);
    let mut srv = TestServer::new(server);

    let server_side = async {
        let mut header = [0u8; 8];
        srv.stream.read_exact(&mut header).await.unwrap();
        srv.send_method(
            0,
            connection::START,
            &StartFields {
                mechanisms: "PLAIN".to_string(),
                locales: "en_US".to_string(),
                server_properties: Default::default(),
            },
        )
        .await;
        let start_ok = srv.recv_control().await;
        assert_eq!(start_ok.id, connection::START_OK);
        srv.send_method(
            0,
            connection::SECURE,
            &muxwire::codec::method::SecureFields { challenge: vec![] },
        )
        .await;
    };

    let (result, _) = tokio::join!(
        Connection::open(client, OpenOptions::default()),
        server_side
    );
    let err = result.unwrap_err();
    assert!(err.to_string().contains("not supported"));
}

#[tokio::test]
async fn handshake_surfaces_server_close_as_error() {
    let (client, server) = duplex(1 << 20);
    let mut srv = TestServer::new(server);

    let server_side = async {
        let mut header = [0u8; 8];
        srv.stream.read_exact(&mut header).await.unwrap();
        srv.send_method(
            0,
            connection::START,
            &StartFields {
                mechanisms: "PLAIN".to_string(),
                locales: "en_US".to_string(),
                server_properties: Default::default(),
            },
        )
        .await;
        let _ = srv.recv_control().await;
        srv.send_method(
            0,
            connection::CLOSE,
            &CloseFields {
                reply_code: 403,
                reply_text: "access denied".to_string(),
                class_id: 0,
                method_id: 0,
            },
        )
        .await;
    };

    let (result, _) = tokio::join!(
        Connection::open(client, OpenOptions::default()),
        server_side
    );
    let err = result.unwrap_err();
    assert!(matches!(err, EngineError::Handshake(_)));
    assert!(err.to_string().contains("access denied"));
    assert!(err.to_string().contains("403"));
}

#[tokio::test]
async fn handshake_fails_when_transport_drops_early() {
    let (client, server) = duplex(1 << 20);
    drop(server);

    let err = Connection::open(client, OpenOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Handshake(_)));
}

// ---------------------------------------------------------------------------
// Frame routing

#[tokio::test]
async fn frames_route_to_their_channel_in_order() {
    let (connection, _events, mut srv) =
        open_pair(default_tune(), OpenOptions::default()).await;

    let (ch1, mut rx1) = sample_channel(&connection);
    let (ch2, mut rx2) = sample_channel(&connection);
    assert_eq!(ch1, 1);
    assert_eq!(ch2, 2);

    srv.send_method(ch1, SAMPLE_METHOD, &SampleFields { value: 1 })
        .await;
    srv.send_method(ch2, SAMPLE_METHOD, &SampleFields { value: 2 })
        .await;
    srv.send_method(ch1, SAMPLE_METHOD, &SampleFields { value: 3 })
        .await;

    let values = |delivery: Delivery| match delivery {
        Delivery::Frame(FrameBody::Method(m)) => m.fields::<SampleFields>().unwrap().value,
        other => panic!("unexpected delivery: {:?}", other),
    };

    assert_eq!(values(rx1.recv().await.unwrap()), 1);
    assert_eq!(values(rx1.recv().await.unwrap()), 3);
    assert_eq!(values(rx2.recv().await.unwrap()), 2);
}

#[tokio::test]
async fn content_frames_are_delivered_with_their_header() {
    let (connection, _events, mut srv) =
        open_pair(default_tune(), OpenOptions::default()).await;
    let (ch, mut rx) = sample_channel(&connection);

    let header = ContentHeader {
        props_id: 60,
        body_size: 5,
        props: Bytes::new(),
    };
    srv.send_raw(encode_header_frame(ch, &header)).await;
    srv.send_raw(muxwire::codec::wire::body_frame(ch, b"hello"))
        .await;

    match rx.recv().await.unwrap() {
        Delivery::Frame(FrameBody::Header(h)) => {
            assert_eq!(h.props_id, 60);
            assert_eq!(h.body_size, 5);
        }
        other => panic!("unexpected delivery: {:?}", other),
    }
    match rx.recv().await.unwrap() {
        Delivery::Frame(FrameBody::Body(body)) => assert_eq!(&body[..], b"hello"),
        other => panic!("unexpected delivery: {:?}", other),
    }
}

#[tokio::test]
async fn frame_on_unknown_channel_closes_the_connection() {
    let (connection, mut events, mut srv) =
        open_pair(default_tune(), OpenOptions::default()).await;

    srv.send_method(7, SAMPLE_METHOD, &SampleFields { value: 0 })
        .await;

    match events.recv().await.unwrap() {
        ConnectionEvent::Error(message) => assert!(message.contains("unknown channel 7")),
        other => panic!("expected an error event, got {:?}", other),
    }

    let close = srv.recv_control().await;
    assert_eq!(close.id, connection::CLOSE);
    let fields: CloseFields = close.fields().unwrap();
    assert_eq!(fields.reply_code, reply_code::CHANNEL_ERROR);

    srv.send_method(0, connection::CLOSE_OK, &CloseOkFields::default())
        .await;

    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::Close { .. }
    ));

    // Sends are invalidated with the close context.
    let err = connection
        .send_method(1, &Method::build(SAMPLE_METHOD, &SampleFields { value: 0 }).unwrap())
        .unwrap_err();
    assert!(matches!(err, EngineError::IllegalOperation { .. }));
}

// ---------------------------------------------------------------------------
// Sending

#[tokio::test]
async fn small_messages_are_coalesced_into_one_write() {
    let (connection, _events, mut srv) =
        open_pair(default_tune(), OpenOptions::default()).await;
    let (ch, _rx) = sample_channel(&connection);

    let method = Method::build(SAMPLE_METHOD, &SampleFields { value: 9 }).unwrap();
    connection
        .send_message(ch, &method, 60, Bytes::new(), Bytes::from_static(b"tiny"))
        .unwrap();

    let m = srv.recv_frame().await;
    assert!(matches!(m.body, FrameBody::Method(_)));
    match srv.recv_frame().await.body {
        FrameBody::Header(h) => assert_eq!(h.body_size, 4),
        other => panic!("expected a header frame, got {:?}", other),
    }
    match srv.recv_frame().await.body {
        FrameBody::Body(body) => assert_eq!(&body[..], b"tiny"),
        other => panic!("expected a body frame, got {:?}", other),
    }
}

#[tokio::test]
async fn large_bodies_fragment_at_the_frame_limit() {
    // A 100-byte frame limit leaves 92 bytes of body per frame.
    let tune = TuneFields {
        channel_max: 0,
        frame_max: 100,
        heartbeat: 0,
    };
    let (connection, _events, mut srv) = open_pair(tune, OpenOptions::default()).await;
    assert_eq!(connection.frame_max(), 100);

    let (ch, _rx) = sample_channel(&connection);
    let body: Vec<u8> = (0..250u32).map(|i| i as u8).collect();

    let method = Method::build(SAMPLE_METHOD, &SampleFields { value: 1 }).unwrap();
    connection
        .send_message(ch, &method, 60, Bytes::new(), Bytes::from(body.clone()))
        .unwrap();

    let m = srv.recv_frame().await;
    assert!(matches!(m.body, FrameBody::Method(_)));
    let h = srv.recv_frame().await;
    match h.body {
        FrameBody::Header(h) => assert_eq!(h.body_size, 250),
        other => panic!("expected a header frame, got {:?}", other),
    }

    let mut reassembled = Vec::new();
    while reassembled.len() < body.len() {
        match srv.recv_frame().await.body {
            FrameBody::Body(fragment) => {
                assert!(fragment.len() <= 92, "fragment exceeds the frame limit");
                reassembled.extend_from_slice(&fragment);
            }
            other => panic!("expected a body frame, got {:?}", other),
        }
    }
    assert_eq!(reassembled, body);
}

#[tokio::test]
async fn write_reports_high_water_mark_and_drains() {
    let mut options = OpenOptions::default();
    options.write_hwm = 2;
    let (connection, _events, mut srv) = open_pair(default_tune(), options).await;
    let (ch, _rx) = sample_channel(&connection);

    let method = Method::build(SAMPLE_METHOD, &SampleFields { value: 0 }).unwrap();
    connection.send_method(ch, &method).unwrap();
    connection.send_method(ch, &method).unwrap();

    // The writer keeps flushing, so the queue must come back below its mark.
    tokio::time::timeout(std::time::Duration::from_secs(2), connection.drained(ch))
        .await
        .expect("drain signal")
        .unwrap();

    let _ = srv.recv_frame().await;
}

#[tokio::test]
async fn send_on_unallocated_channel_fails() {
    let (connection, _events, _srv) =
        open_pair(default_tune(), OpenOptions::default()).await;

    let method = Method::build(SAMPLE_METHOD, &SampleFields { value: 0 }).unwrap();
    let err = connection.send_method(3, &method).unwrap_err();
    assert!(matches!(err, EngineError::Protocol(_)));
}

// ---------------------------------------------------------------------------
// Channels

#[tokio::test]
async fn released_channel_ids_are_reused() {
    let (connection, _events, _srv) =
        open_pair(default_tune(), OpenOptions::default()).await;

    let (ch1, _rx1) = sample_channel(&connection);
    let (ch2, _rx2) = sample_channel(&connection);
    assert_eq!((ch1, ch2), (1, 2));

    connection.release_channel(ch1).unwrap();
    let (again, _rx3) = sample_channel(&connection);
    assert_eq!(again, 1);

    assert!(connection.release_channel(9).is_err());
}

#[tokio::test]
async fn connection_close_cascades_to_channels() {
    let (connection, mut events, mut srv) =
        open_pair(default_tune(), OpenOptions::default()).await;
    let (_ch, mut rx) = sample_channel(&connection);

    srv.send_method(
        0,
        connection::CLOSE,
        &CloseFields {
            reply_code: reply_code::CONNECTION_FORCED,
            reply_text: "maintenance".to_string(),
            class_id: 0,
            method_id: 0,
        },
    )
    .await;

    match rx.recv().await.unwrap() {
        Delivery::Closed(context) => assert!(context.contains("maintenance")),
        other => panic!("expected a closed notice, got {:?}", other),
    }
    // Sender dropped after the notice.
    assert!(rx.recv().await.is_none());

    // Forced close is not fatal: the close event arrives with no error
    // event before it.
    match events.recv().await.unwrap() {
        ConnectionEvent::Close { error } => {
            assert!(error.unwrap().contains("maintenance"));
        }
        other => panic!("expected a close event, got {:?}", other),
    }

    let close_ok = srv.recv_control().await;
    assert_eq!(close_ok.id, connection::CLOSE_OK);
}

// ---------------------------------------------------------------------------
// Closing

#[tokio::test]
async fn clean_close_completes_the_handshake() {
    let (connection, mut events, mut srv) =
        open_pair(default_tune(), OpenOptions::default()).await;

    let closer = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.close().await })
    };

    let close = srv.recv_control().await;
    assert_eq!(close.id, connection::CLOSE);
    let fields: CloseFields = close.fields().unwrap();
    assert_eq!(fields.reply_code, reply_code::REPLY_SUCCESS);

    srv.send_method(0, connection::CLOSE_OK, &CloseOkFields::default())
        .await;

    closer.await.unwrap().unwrap();
    match events.recv().await.unwrap() {
        ConnectionEvent::Close { error } => assert!(error.is_none()),
        other => panic!("expected a close event, got {:?}", other),
    }
    srv.expect_eof().await;
}

#[tokio::test]
async fn concurrent_closes_share_one_close_frame() {
    let (connection, _events, mut srv) =
        open_pair(default_tune(), OpenOptions::default()).await;

    let first = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.close().await })
    };
    let second = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.close().await })
    };

    let close = srv.recv_control().await;
    assert_eq!(close.id, connection::CLOSE);
    srv.send_method(0, connection::CLOSE_OK, &CloseOkFields::default())
        .await;

    // Both callers resolve off the single closing handshake.
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    // Exactly one close frame was sent: the next thing on the wire is EOF.
    srv.expect_eof().await;
}

#[tokio::test]
async fn simultaneous_close_acknowledges_and_still_resolves() {
    let (connection, mut events, mut srv) =
        open_pair(default_tune(), OpenOptions::default()).await;

    let closer = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.close().await })
    };

    let close = srv.recv_control().await;
    assert_eq!(close.id, connection::CLOSE);

    // Answer the client's close with our own close instead of close-ok.
    srv.send_method(
        0,
        connection::CLOSE,
        &CloseFields {
            reply_code: reply_code::CONNECTION_FORCED,
            reply_text: "shutting down".to_string(),
            class_id: 0,
            method_id: 0,
        },
    )
    .await;

    // The client acknowledges ours and keeps waiting for its own close-ok.
    let close_ok = srv.recv_control().await;
    assert_eq!(close_ok.id, connection::CLOSE_OK);

    srv.send_method(0, connection::CLOSE_OK, &CloseOkFields::default())
        .await;

    closer.await.unwrap().unwrap();
    match events.recv().await.unwrap() {
        ConnectionEvent::Close { error } => assert!(error.is_none()),
        other => panic!("expected a close event, got {:?}", other),
    }
    srv.expect_eof().await;
}

#[tokio::test]
async fn fatal_peer_close_emits_error_then_close() {
    let (_connection, mut events, mut srv) =
        open_pair(default_tune(), OpenOptions::default()).await;

    srv.send_method(
        0,
        connection::CLOSE,
        &CloseFields {
            reply_code: reply_code::FRAME_ERROR,
            reply_text: "corrupt frame".to_string(),
            class_id: 0,
            method_id: 0,
        },
    )
    .await;

    match events.recv().await.unwrap() {
        ConnectionEvent::Error(message) => {
            assert!(message.contains("corrupt frame"));
            assert!(message.contains("501"));
        }
        other => panic!("expected an error event, got {:?}", other),
    }
    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::Close { error: Some(_) }
    ));

    let close_ok = srv.recv_control().await;
    assert_eq!(close_ok.id, connection::CLOSE_OK);
}

#[tokio::test]
async fn operations_after_close_fail_with_context() {
    let (connection, _events, mut srv) =
        open_pair(default_tune(), OpenOptions::default()).await;

    let closer = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.close().await })
    };
    let _ = srv.recv_control().await;
    srv.send_method(0, connection::CLOSE_OK, &CloseOkFields::default())
        .await;
    closer.await.unwrap().unwrap();

    let method = Method::build(SAMPLE_METHOD, &SampleFields { value: 0 }).unwrap();
    let err = connection.send_method(1, &method).unwrap_err();
    match err {
        EngineError::IllegalOperation { context } => {
            assert!(context.contains("connection closed"));
        }
        other => panic!("expected an illegal-operation error, got {:?}", other),
    }

    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(connection.allocate_channel(tx).is_err());
    assert!(connection.close().await.is_err());

    // Release and drain fail the same way, with the close context rather
    // than a missing-channel error.
    assert!(matches!(
        connection.release_channel(1).unwrap_err(),
        EngineError::IllegalOperation { .. }
    ));
    assert!(matches!(
        connection.drained(1).await.unwrap_err(),
        EngineError::IllegalOperation { .. }
    ));
}

#[tokio::test]
async fn transport_failure_surfaces_as_error_then_close() {
    let (_connection, mut events, srv) =
        open_pair(default_tune(), OpenOptions::default()).await;

    drop(srv);

    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::Error(_)
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::Close { error: Some(_) }
    ));
}

// ---------------------------------------------------------------------------
// Server notifications

#[tokio::test]
async fn blocked_and_unblocked_become_events() {
    let (_connection, mut events, mut srv) =
        open_pair(default_tune(), OpenOptions::default()).await;

    srv.send_method(
        0,
        connection::BLOCKED,
        &BlockedFields {
            reason: "low on disk".to_string(),
        },
    )
    .await;
    srv.send_method(0, connection::UNBLOCKED, &UnblockedFields::default())
        .await;

    match events.recv().await.unwrap() {
        ConnectionEvent::Blocked(reason) => assert_eq!(reason, "low on disk"),
        other => panic!("expected a blocked event, got {:?}", other),
    }
    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::Unblocked
    ));
}

// ---------------------------------------------------------------------------
// Heartbeats

#[tokio::test(start_paused = true)]
async fn idle_connection_sends_heartbeats() {
    let tune = TuneFields {
        channel_max: 0,
        frame_max: 0,
        heartbeat: 1,
    };
    let (connection, _events, mut srv) =
        open_pair(tune, OpenOptions::default().heartbeat(1)).await;
    assert_eq!(connection.heartbeat(), 1);

    // Nothing is being sent, so the first frame after the handshake must
    // be a heartbeat.
    let frame = srv.recv_frame().await;
    assert_eq!(frame.channel, 0);
    assert!(matches!(frame.body, FrameBody::Heartbeat));
}

#[tokio::test(start_paused = true)]
async fn silent_peer_triggers_heartbeat_timeout() {
    let tune = TuneFields {
        channel_max: 0,
        frame_max: 0,
        heartbeat: 1,
    };
    let (_connection, mut events, _srv) =
        open_pair(tune, OpenOptions::default().heartbeat(1)).await;

    match events.recv().await.unwrap() {
        ConnectionEvent::Error(message) => assert!(message.contains("heartbeat")),
        other => panic!("expected an error event, got {:?}", other),
    }
    assert!(matches!(
        events.recv().await.unwrap(),
        ConnectionEvent::Close { error: Some(_) }
    ));
}

#[tokio::test(start_paused = true)]
async fn inbound_heartbeats_keep_the_connection_alive() {
    let tune = TuneFields {
        channel_max: 0,
        frame_max: 0,
        heartbeat: 1,
    };
    let (_connection, mut events, mut srv) =
        open_pair(tune, OpenOptions::default().heartbeat(1)).await;

    // Feed heartbeats from the server while draining what the client sends;
    // no timeout may fire.
    for _ in 0..5 {
        srv.send_raw(muxwire::codec::wire::heartbeat_frame()).await;
        let frame = srv.recv_frame().await;
        assert!(matches!(frame.body, FrameBody::Heartbeat));
    }

    tokio::select! {
        event = events.recv() => panic!("unexpected event: {:?}", event),
        _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
    }
}
