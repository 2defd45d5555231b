//! Integration tests against a scripted in-process broker.

use rill_client::{Client, ClientConfig, ClientEvent, OffsetSpec};
use rill_protocol::deliver::CompressionRegistry;
use rill_protocol::frame::{response_frame, FrameDecoder};
use rill_protocol::messages::TuneFrame;
use rill_protocol::{Command, Frame, WireWriter, RESPONSE_CODE_OK, RESPONSE_FLAG};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

/// The broker end of one accepted connection.
struct Broker {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl Broker {
    async fn accept(listener: &TcpListener) -> Broker {
        let (stream, _) = listener.accept().await.unwrap();
        Broker {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    async fn next_frame(&mut self) -> Frame {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(frame) = self.decoder.next_frame().unwrap() {
                return frame;
            }
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client hung up while the broker expected a frame");
            self.decoder.feed(&buf[..n]);
        }
    }

    /// Next frame that is not a heartbeat (they interleave freely).
    async fn next_command(&mut self) -> Frame {
        loop {
            let frame = self.next_frame().await;
            if frame.key != Command::Heartbeat.key() {
                return frame;
            }
        }
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }
}

fn corr_id(frame: &Frame) -> u32 {
    u32::from_be_bytes(frame.payload[0..4].try_into().unwrap())
}

/// A frame the envelope helpers refuse to build: raw key, no status code.
fn raw_frame(key: u16, version: u16, build: impl FnOnce(&mut WireWriter)) -> Vec<u8> {
    let mut body = WireWriter::new();
    build(&mut body);
    let body = body.into_bytes();
    let mut out = Vec::new();
    out.extend_from_slice(&((4 + body.len()) as u32).to_be_bytes());
    out.extend_from_slice(&key.to_be_bytes());
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Deliver payload with a single plain record.
fn plain_chunk(sub_id: u8, offset: u64, record: &[u8]) -> Vec<u8> {
    let mut data = WireWriter::new();
    data.bytes(record);
    let data = data.into_bytes();
    chunk_frame(sub_id, offset, 1, 1, &data)
}

/// Deliver payload with one compressed sub-batch under `compression`.
fn sub_batch_chunk(sub_id: u8, offset: u64, compression: u8, records: &[&[u8]]) -> Vec<u8> {
    let mut region = WireWriter::new();
    for rec in records {
        region.bytes(rec);
    }
    let region = region.into_bytes();

    let mut data = WireWriter::new();
    data.u8(0x80 | (compression << 4));
    data.u16(records.len() as u16);
    data.u32(region.len() as u32);
    data.bytes(&region);
    let data = data.into_bytes();
    chunk_frame(sub_id, offset, 1, records.len() as u32, &data)
}

fn chunk_frame(sub_id: u8, offset: u64, entries: u16, records: u32, data: &[u8]) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.u8(sub_id);
    w.u8(0x50); // magic
    w.u8(0); // chunk type
    w.u16(entries);
    w.u32(records);
    w.i64(0); // timestamp
    w.u64(0); // epoch
    w.u64(offset);
    w.u32(crc32fast_hash(data));
    w.u32(data.len() as u32);
    w.u64(0); // trailer, reserved
    let mut payload = w.into_bytes().to_vec();
    payload.extend_from_slice(data);

    raw_frame(Command::Deliver.key(), 1, |w| w.raw(&payload))
}

fn crc32fast_hash(data: &[u8]) -> u32 {
    // flate2 pulls in crc32fast; recompute the IEEE CRC the broker would.
    let mut hasher = flate2::Crc::new();
    hasher.update(data);
    hasher.sum()
}

/// Drives the broker side of the fixed handshake and returns the tune
/// values the client acknowledged.
async fn run_handshake(broker: &mut Broker, frame_max: u32, heartbeat: u32) -> (u32, u32) {
    let frame = broker.next_frame().await;
    assert_eq!(frame.key, Command::PeerProperties.key());
    broker
        .send(&response_frame(
            Command::PeerProperties,
            1,
            corr_id(&frame),
            RESPONSE_CODE_OK,
            |w| {
                w.array_size(1);
                w.string("product");
                w.string("mock-broker");
            },
        ))
        .await;

    let frame = broker.next_frame().await;
    assert_eq!(frame.key, Command::SaslHandshake.key());
    broker
        .send(&response_frame(
            Command::SaslHandshake,
            1,
            corr_id(&frame),
            RESPONSE_CODE_OK,
            |w| {
                w.array_size(2);
                w.string("PLAIN");
                w.string("AMQPLAIN");
            },
        ))
        .await;

    let frame = broker.next_frame().await;
    assert_eq!(frame.key, Command::SaslAuthenticate.key());
    broker
        .send(&response_frame(
            Command::SaslAuthenticate,
            1,
            corr_id(&frame),
            RESPONSE_CODE_OK,
            |_| {},
        ))
        .await;

    broker
        .send(
            &TuneFrame {
                frame_max,
                heartbeat,
            }
            .encode(),
        )
        .await;

    let frame = broker.next_frame().await;
    assert_eq!(frame.key, Command::Tune.key());
    let acked_frame_max = u32::from_be_bytes(frame.payload[0..4].try_into().unwrap());
    let acked_heartbeat = u32::from_be_bytes(frame.payload[4..8].try_into().unwrap());

    let frame = broker.next_frame().await;
    assert_eq!(frame.key, Command::Open.key());
    broker
        .send(&response_frame(
            Command::Open,
            1,
            corr_id(&frame),
            RESPONSE_CODE_OK,
            |w| {
                w.array_size(1);
                w.string("version");
                w.string("3.13");
            },
        ))
        .await;

    (acked_frame_max, acked_heartbeat)
}

/// Responds OK with an empty body to any correlated request.
async fn respond_ok(broker: &mut Broker, frame: &Frame) {
    let cmd = Command::try_from(frame.key).unwrap();
    broker
        .send(&response_frame(cmd, 1, corr_id(frame), RESPONSE_CODE_OK, |_| {}))
        .await;
}

fn test_config(port: u16) -> ClientConfig {
    ClientConfig::new("127.0.0.1")
        .with_port(port)
        .with_credentials("guest", "guest")
        .with_request_timeout(Duration::from_secs(2))
}

async fn next_event(events: &mut UnboundedReceiver<ClientEvent>) -> ClientEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn setup() -> (TcpListener, u16) {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[tokio::test]
async fn open_sequence_emits_open_with_merged_properties() {
    let (listener, port) = setup().await;

    let broker_task = tokio::spawn(async move {
        let mut broker = Broker::accept(&listener).await;
        let acked = run_handshake(&mut broker, 1_048_576, 60).await;

        // Client-initiated close arrives next.
        let frame = broker.next_command().await;
        assert_eq!(frame.key, Command::Close.key());
        respond_ok(&mut broker, &frame).await;
        acked
    });

    let (client, mut events) = Client::connect(test_config(port)).await.unwrap();
    assert!(client.is_open());

    // Peer properties and Open properties are merged.
    let props = client.server_properties();
    assert_eq!(props.get("product").map(String::as_str), Some("mock-broker"));
    assert_eq!(props.get("version").map(String::as_str), Some("3.13"));
    assert_eq!(client.heartbeat_interval(), 60);

    // Exactly one open event, first, with the same merged map.
    match next_event(&mut events).await {
        ClientEvent::Open { server_properties } => {
            assert_eq!(
                server_properties.get("product").map(String::as_str),
                Some("mock-broker")
            );
            assert_eq!(
                server_properties.get("version").map(String::as_str),
                Some("3.13")
            );
        }
        other => panic!("expected Open first, got {:?}", other),
    }

    client.close().await.unwrap();
    match next_event(&mut events).await {
        ClientEvent::Close { .. } => {}
        other => panic!("expected Close, got {:?}", other),
    }
    assert!(!client.is_open());

    // The client acknowledged the broker's tune values unchanged.
    let (acked_frame_max, acked_heartbeat) = broker_task.await.unwrap();
    assert_eq!(acked_frame_max, 1_048_576);
    assert_eq!(acked_heartbeat, 60);
}

#[tokio::test]
async fn deliveries_are_released_in_receipt_order_under_adversarial_decode() {
    let (listener, port) = setup().await;

    // Codec 5: an identity "decompressor" that finishes late, so the
    // second chunk's decode completes before the first one's.
    let mut registry = CompressionRegistry::new();
    registry.register(
        5,
        Arc::new(|input: &[u8]| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(input.to_vec())
        }),
    );
    let config = test_config(port).with_compression(registry);

    let broker_task = tokio::spawn(async move {
        let mut broker = Broker::accept(&listener).await;
        run_handshake(&mut broker, 0, 0).await;

        let frame = broker.next_command().await;
        assert_eq!(frame.key, Command::Subscribe.key());
        respond_ok(&mut broker, &frame).await;

        // Slow chunk first, fast chunk second.
        broker
            .send(&sub_batch_chunk(1, 100, 5, &[b"slow-a", b"slow-b"]))
            .await;
        broker.send(&plain_chunk(1, 101, b"fast")).await;

        // One credit top-up per surfaced chunk.
        let mut credits = 0;
        while credits < 2 {
            let frame = broker.next_command().await;
            if frame.key == Command::Credit.key() {
                assert_eq!(frame.payload[0], 1); // subscription id
                assert_eq!(frame.payload[2], 1); // amount
                credits += 1;
            }
        }
    });

    let (client, mut events) = Client::connect(config).await.unwrap();
    next_event(&mut events).await; // Open

    client
        .subscribe(1, "test-stream", OffsetSpec::First, 10, &[])
        .await
        .unwrap();

    // Receipt order wins over completion order.
    match next_event(&mut events).await {
        ClientEvent::Delivery(delivery) => {
            assert_eq!(delivery.offset, 100);
            assert_eq!(delivery.records.len(), 2);
            assert_eq!(delivery.records[0].as_ref(), b"slow-a");
        }
        other => panic!("expected the slow chunk first, got {:?}", other),
    }
    match next_event(&mut events).await {
        ClientEvent::Delivery(delivery) => {
            assert_eq!(delivery.offset, 101);
            assert_eq!(delivery.records[0].as_ref(), b"fast");
        }
        other => panic!("expected the fast chunk second, got {:?}", other),
    }

    broker_task.await.unwrap();
}

#[tokio::test]
async fn tampered_chunk_fails_alone_and_the_queue_continues() {
    let (listener, port) = setup().await;

    let broker_task = tokio::spawn(async move {
        let mut broker = Broker::accept(&listener).await;
        run_handshake(&mut broker, 0, 0).await;

        let frame = broker.next_command().await;
        respond_ok(&mut broker, &frame).await;

        let mut bad = plain_chunk(1, 200, b"tampered");
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        broker.send(&bad).await;
        broker.send(&plain_chunk(1, 201, b"clean")).await;

        // Both the failed and the surfaced chunk top up credit.
        let mut credits = 0;
        while credits < 2 {
            let frame = broker.next_command().await;
            if frame.key == Command::Credit.key() {
                credits += 1;
            }
        }
    });

    let (client, mut events) = Client::connect(test_config(port)).await.unwrap();
    next_event(&mut events).await; // Open
    client
        .subscribe(1, "test-stream", OffsetSpec::Next, 10, &[])
        .await
        .unwrap();

    match next_event(&mut events).await {
        ClientEvent::Error(err) => assert!(err.to_string().contains("checksum")),
        other => panic!("expected a checksum error, got {:?}", other),
    }
    match next_event(&mut events).await {
        ClientEvent::Delivery(delivery) => assert_eq!(delivery.offset, 201),
        other => panic!("expected the clean chunk, got {:?}", other),
    }

    broker_task.await.unwrap();
}

#[tokio::test]
async fn heartbeat_timeout_closes_the_connection() {
    let (listener, port) = setup().await;

    let broker_task = tokio::spawn(async move {
        let mut broker = Broker::accept(&listener).await;
        run_handshake(&mut broker, 0, 1).await;

        // Stay silent but keep the socket open: the client heartbeats
        // once, then declares us dead one interval later and hangs up.
        let frame = broker.next_frame().await;
        assert_eq!(frame.key, Command::Heartbeat.key());
        let mut buf = [0u8; 256];
        loop {
            let n = broker.stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
        }
    });

    let (client, mut events) = Client::connect(test_config(port)).await.unwrap();
    next_event(&mut events).await; // Open
    assert_eq!(client.heartbeat_interval(), 1);

    match next_event(&mut events).await {
        ClientEvent::Error(err) => assert!(err.to_string().contains("heartbeat")),
        other => panic!("expected a heartbeat timeout, got {:?}", other),
    }
    match next_event(&mut events).await {
        ClientEvent::Close { .. } => {}
        other => panic!("expected Close, got {:?}", other),
    }
    assert!(!client.is_open());

    broker_task.await.unwrap();
}

#[tokio::test]
async fn unexpected_response_is_isolated() {
    let (listener, port) = setup().await;

    let broker_task = tokio::spawn(async move {
        let mut broker = Broker::accept(&listener).await;
        run_handshake(&mut broker, 0, 0).await;

        // A response nobody asked for.
        broker
            .send(&response_frame(Command::Create, 1, 999, RESPONSE_CODE_OK, |_| {}))
            .await;

        // The session survives: the next real request still round-trips.
        let frame = broker.next_command().await;
        assert_eq!(frame.key, Command::Create.key());
        respond_ok(&mut broker, &frame).await;
    });

    let (client, mut events) = Client::connect(test_config(port)).await.unwrap();
    next_event(&mut events).await; // Open

    match next_event(&mut events).await {
        ClientEvent::Error(err) => assert!(err.to_string().contains("unexpected response")),
        other => panic!("expected an unexpected-response error, got {:?}", other),
    }

    client.create_stream("s", &[]).await.unwrap();
    assert!(client.is_open());

    broker_task.await.unwrap();
}

#[tokio::test]
async fn response_key_mismatch_rejects_only_that_caller() {
    let (listener, port) = setup().await;

    let broker_task = tokio::spawn(async move {
        let mut broker = Broker::accept(&listener).await;
        run_handshake(&mut broker, 0, 0).await;

        // Reply to the Create request with a Delete-keyed response.
        let frame = broker.next_command().await;
        assert_eq!(frame.key, Command::Create.key());
        broker
            .send(&response_frame(
                Command::Delete,
                1,
                corr_id(&frame),
                RESPONSE_CODE_OK,
                |_| {},
            ))
            .await;

        // Connection still healthy afterwards.
        let frame = broker.next_command().await;
        assert_eq!(frame.key, Command::Delete.key());
        respond_ok(&mut broker, &frame).await;
    });

    let (client, mut events) = Client::connect(test_config(port)).await.unwrap();
    next_event(&mut events).await; // Open

    let err = client.create_stream("s", &[]).await.unwrap_err();
    assert!(err.to_string().contains("mismatch"));

    client.delete_stream("s").await.unwrap();

    broker_task.await.unwrap();
}

#[tokio::test]
async fn metadata_response_bypasses_status_routing() {
    let (listener, port) = setup().await;

    let broker_task = tokio::spawn(async move {
        let mut broker = Broker::accept(&listener).await;
        run_handshake(&mut broker, 0, 0).await;

        let frame = broker.next_command().await;
        assert_eq!(frame.key, Command::Metadata.key());
        let corr = corr_id(&frame);

        // Correlation id but no status code, as the broker really sends it.
        broker
            .send(&raw_frame(
                Command::Metadata.key() | RESPONSE_FLAG,
                1,
                |w| {
                    w.u32(corr);
                    w.array_size(1);
                    w.u16(0);
                    w.string("broker-0");
                    w.u32(5552);
                    w.array_size(1);
                    w.string("test-stream");
                    w.u16(RESPONSE_CODE_OK);
                    w.u16(0);
                    w.array_size(0);
                },
            ))
            .await;
    });

    let (client, mut events) = Client::connect(test_config(port)).await.unwrap();
    next_event(&mut events).await; // Open

    let metadata = client.metadata(&["test-stream".to_string()]).await.unwrap();
    assert_eq!(metadata.brokers[&0].host, "broker-0");
    assert_eq!(metadata.streams["test-stream"].leader_ref, 0);

    broker_task.await.unwrap();
}

#[tokio::test]
async fn server_initiated_close_is_acknowledged_then_closed() {
    let (listener, port) = setup().await;

    let broker_task = tokio::spawn(async move {
        let mut broker = Broker::accept(&listener).await;
        run_handshake(&mut broker, 0, 0).await;

        broker
            .send(&raw_frame(Command::Close.key(), 1, |w| {
                w.u32(7); // broker's correlation id
                w.u16(0x0f);
                w.string("maintenance");
            }))
            .await;

        // The acknowledgement carries our correlation id back.
        let frame = broker.next_command().await;
        assert_eq!(frame.key, Command::Close.key() | RESPONSE_FLAG);
        assert_eq!(corr_id(&frame), 7);
    });

    let (client, mut events) = Client::connect(test_config(port)).await.unwrap();
    next_event(&mut events).await; // Open

    match next_event(&mut events).await {
        ClientEvent::Close { reason } => assert_eq!(reason, "maintenance"),
        other => panic!("expected Close, got {:?}", other),
    }
    assert!(!client.is_open());

    broker_task.await.unwrap();
}

#[tokio::test]
async fn request_timeout_rejects_the_caller() {
    let (listener, port) = setup().await;

    let broker_task = tokio::spawn(async move {
        let mut broker = Broker::accept(&listener).await;
        run_handshake(&mut broker, 0, 0).await;

        // Swallow the request and never answer.
        let frame = broker.next_command().await;
        assert_eq!(frame.key, Command::Create.key());
        broker
    });

    let config = test_config(port).with_request_timeout(Duration::from_millis(200));
    let (client, mut events) = Client::connect(config).await.unwrap();
    next_event(&mut events).await; // Open

    let err = client.create_stream("s", &[]).await.unwrap_err();
    assert!(err.to_string().contains("timeout"));

    drop(broker_task.await.unwrap());
}
