//! End-to-end control channel behavior over the Unix-socket entry point:
//! session exclusivity, framed request dispatch, and capture-record drain.

use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};
use weir::{
    control::{server::ControlServer, StatsReport},
    packet::{Packet, PacketBatch},
    runtime::{conf::Conf, context::Context},
};
use weir_common::{capture, control as wire, Direction, PacketMeta};

struct TestHarness {
    ctx: Context,
    socket_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

async fn start() -> TestHarness {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("weir.sock");
    let ctx = Context::from_conf(Conf::default());

    let server = ControlServer::bind(&socket_path, ctx.control.clone()).unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    // Let the accept loop come up before the first connect.
    tokio::time::sleep(Duration::from_millis(10)).await;
    TestHarness {
        ctx,
        socket_path,
        _dir: dir,
    }
}

async fn request(stream: &mut UnixStream, opcode: u32, payload: &[u8]) -> (u32, Vec<u8>) {
    let header = wire::FrameHeader::new(opcode, payload.len() as u32);
    stream.write_all(&header.to_bytes()).await.unwrap();
    stream.write_all(payload).await.unwrap();
    read_frame(stream).await
}

async fn read_frame(stream: &mut UnixStream) -> (u32, Vec<u8>) {
    let mut header = [0u8; wire::HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let frame = wire::FrameHeader::from_bytes(&header).unwrap();
    let mut payload = vec![0u8; frame.length as usize];
    stream.read_exact(&mut payload).await.unwrap();
    (frame.word, payload)
}

fn allow_all_record() -> [u8; 8] {
    let mut record = [0u8; 8];
    record[0] = 0xff;
    record
}

#[tokio::test]
async fn second_connection_gets_busy_then_slot_frees() {
    let harness = start().await;

    let mut first = UnixStream::connect(&harness.socket_path).await.unwrap();
    // Prove the first connection holds the session.
    let (status, _) = request(&mut first, wire::OP_STATS_QUERY, &[]).await;
    assert_eq!(status, wire::STATUS_OK);

    let mut second = UnixStream::connect(&harness.socket_path).await.unwrap();
    let (status, _) = read_frame(&mut second).await;
    assert_eq!(status, wire::STATUS_BUSY);

    drop(first);
    // Session release is driven by connection teardown; give it a moment.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut third = UnixStream::connect(&harness.socket_path).await.unwrap();
    let (status, _) = request(&mut third, wire::OP_STATS_QUERY, &[]).await;
    assert_eq!(status, wire::STATUS_OK);
}

#[tokio::test]
async fn ruleset_update_round_trip() {
    let harness = start().await;
    let id = harness.ctx.pipeline.attach("eth0").unwrap();

    let mut stream = UnixStream::connect(&harness.socket_path).await.unwrap();
    let (status, payload) = request(&mut stream, wire::OP_RULESET_UPDATE, &allow_all_record()).await;
    assert_eq!(status, wire::STATUS_OK);
    let version = u64::from_le_bytes(payload.try_into().unwrap());
    assert_eq!(version, 1);

    // The attached instance observed the bump.
    let instance = harness.ctx.pipeline.registry().get(id).unwrap();
    assert_eq!(instance.ruleset_version(), 1);

    // Malformed rule sets are rejected with the evaluation status.
    let (status, _) = request(&mut stream, wire::OP_RULESET_UPDATE, &[1, 2, 3]).await;
    assert_eq!(status, wire::STATUS_RULE_EVAL);
}

#[tokio::test]
async fn stats_query_reflects_traffic() {
    let harness = start().await;
    let pipeline = &harness.ctx.pipeline;
    let id = pipeline.attach("eth0").unwrap();
    pipeline.restart(id).unwrap();

    let packets = (0..4)
        .map(|_| Packet::new(PacketMeta::default(), vec![0u8; 64]))
        .collect();
    let forwarded =
        pipeline.inbound_accept(id, PacketBatch::from_packets(Direction::Ingress, packets));
    assert_eq!(forwarded.len(), 4);

    let mut stream = UnixStream::connect(&harness.socket_path).await.unwrap();
    let (status, payload) = request(&mut stream, wire::OP_STATS_QUERY, &[]).await;
    assert_eq!(status, wire::STATUS_OK);

    let report: StatsReport = serde_json::from_slice(&payload).unwrap();
    assert_eq!(report.global.allowed, 4);
    assert_eq!(report.instances.len(), 1);
    assert_eq!(report.instances[0].adapter, "eth0");
    assert_eq!(report.instances[0].pending_recv, 4);

    pipeline.inbound_complete(id, forwarded);
    let (_, payload) = request(&mut stream, wire::OP_STATS_QUERY, &[]).await;
    let report: StatsReport = serde_json::from_slice(&payload).unwrap();
    assert_eq!(report.instances[0].pending_recv, 0);
}

#[tokio::test]
async fn ring_drain_returns_capture_records() {
    let harness = start().await;
    let pipeline = &harness.ctx.pipeline;
    let id = pipeline.attach("eth0").unwrap();
    pipeline.restart(id).unwrap();

    let mut stream = UnixStream::connect(&harness.socket_path).await.unwrap();

    // Load a capture-everything rule set.
    let mut record = [0u8; 8];
    record[0] = 0xff;
    record[1] = 2;
    let (status, _) = request(&mut stream, wire::OP_RULESET_UPDATE, &record).await;
    assert_eq!(status, wire::STATUS_OK);

    // Push one packet through so a capture record lands on the ring.
    let mut meta = PacketMeta::default();
    meta.dst_port = 8080u16.to_be_bytes();
    let forwarded = pipeline.inbound_accept(
        id,
        PacketBatch::from_packets(Direction::Ingress, vec![Packet::new(meta, vec![0x5a; 200])]),
    );
    assert_eq!(forwarded.len(), 1);

    let (status, payload) = request(&mut stream, wire::OP_RING_DRAIN, &[]).await;
    assert_eq!(status, wire::STATUS_OK);
    assert!(!payload.is_empty());

    // Payload framing: u32 LE record length, then the record.
    let record_len = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
    let record = &payload[4..4 + record_len];
    let header = capture::CaptureHeader::from_bytes(record).unwrap();
    assert_eq!(header.orig_len, 200);
    assert_eq!(header.snap_len, capture::SNAP_LEN as u32);
    let meta = PacketMeta::from_bytes(&record[capture::HEADER_LEN..]).unwrap();
    assert_eq!(meta.dst_port(), 8080);

    // Ring is now empty; a poll drain returns nothing.
    let (status, payload) = request(&mut stream, wire::OP_RING_DRAIN, &[]).await;
    assert_eq!(status, wire::STATUS_OK);
    assert!(payload.is_empty());

    pipeline.inbound_complete(id, forwarded);
}

#[tokio::test]
async fn oversized_request_is_rejected() {
    let harness = start().await;
    let mut stream = UnixStream::connect(&harness.socket_path).await.unwrap();

    let header = wire::FrameHeader::new(wire::OP_STATS_QUERY, wire::MAX_PAYLOAD + 1);
    stream.write_all(&header.to_bytes()).await.unwrap();
    let (status, _) = read_frame(&mut stream).await;
    assert_eq!(status, wire::STATUS_PROTOCOL);
}
