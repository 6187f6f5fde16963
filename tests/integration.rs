//! Integration tests for camwire.
//!
//! These tests drive a bound server over loopback TCP and exercise the
//! public module APIs together.

use std::sync::Arc;
use std::time::Duration;

use camwire::camera::{ImageFormat, RawImage};
use camwire::congestion::{CongestionDetector, CongestionLevel};
use camwire::handler::Device;
use camwire::preview::{PreviewConfig, PreviewPipeline, TickOutcome};
use camwire::protocol::{
    commands, encode, parse_preview_data, ErrorCode, Frame, FrameBuffer, ParameterBlock,
    ResolutionList, StatusSnapshot,
};
use camwire::session::{ConnectionId, Flag, SessionRegistry};
use camwire::writer::{spawn_writer_task, WriterConfig};
use camwire::{ServerBuilder, ServerConfig, SimulatedCamera};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct TestServer {
    addr: std::net::SocketAddr,
    sessions: Arc<SessionRegistry>,
    device: Arc<Device>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<camwire::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let mut config = ServerConfig::default();
        config.reporter.interval_ms = 200;
        let server = ServerBuilder::new()
            .config(config)
            .bind_to("127.0.0.1", 0)
            .camera(SimulatedCamera::new(160, 120))
            .bind()
            .await
            .unwrap();
        let addr = server.local_addr();
        let sessions = server.sessions().clone();
        let device = server.device().clone();
        let (stop, rx) = oneshot::channel();
        let task = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));
        Self {
            addr,
            sessions,
            device,
            stop,
            task,
        }
    }

    async fn connect(&self) -> Client {
        Client {
            stream: TcpStream::connect(self.addr).await.unwrap(),
            decoder: FrameBuffer::new(),
            backlog: Vec::new(),
        }
    }

    async fn shutdown(self) {
        self.stop.send(()).unwrap();
        self.task.await.unwrap().unwrap();
    }
}

struct Client {
    stream: TcpStream,
    decoder: FrameBuffer,
    backlog: Vec<Frame>,
}

impl Client {
    async fn send(&mut self, command: u8, data: &[u8]) {
        let bytes = encode(command, data).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Next frame whose code is `command`; status reports and preview
    /// frames interleave freely, so other codes are kept aside.
    async fn expect(&mut self, command: u8) -> Frame {
        if let Some(pos) = self.backlog.iter().position(|f| f.command == command) {
            return self.backlog.remove(pos);
        }
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            assert!(n > 0, "server closed the connection");
            for decoded in self.decoder.push(&buf[..n]) {
                if let Some(frame) = decoded.into_frame() {
                    self.backlog.push(frame);
                }
            }
            if let Some(pos) = self.backlog.iter().position(|f| f.command == command) {
                return self.backlog.remove(pos);
            }
        }
    }

    /// Next reply to a command: a success or failure frame.
    async fn reply(&mut self) -> Frame {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            if let Some(pos) = self.backlog.iter().position(|f| {
                f.command == commands::RESPONSE_SUCCESS || f.command == commands::RESPONSE_FAILED
            }) {
                return self.backlog.remove(pos);
            }
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for a reply")
                .unwrap();
            assert!(n > 0, "server closed the connection");
            for decoded in self.decoder.push(&buf[..n]) {
                if let Some(frame) = decoded.into_frame() {
                    self.backlog.push(frame);
                }
            }
        }
    }
}

fn failure(command: u8, code: ErrorCode) -> Vec<u8> {
    let [hi, lo] = code.to_be_bytes();
    vec![command, hi, lo]
}

/// Raw query-status bytes from a client get a status report back.
#[tokio::test]
async fn test_query_status_scenario() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client
        .stream
        .write_all(&[0xFE, 0xFE, 0x20, 0x00, 0x01, 0x30, 0x11, 0xEF, 0xEF])
        .await
        .unwrap();
    let frame = client.expect(commands::STATUS_REPORT).await;
    assert_eq!(frame.data.len(), 1);
    let status = StatusSnapshot::from_byte(frame.data[0]);
    assert!(status.camera_connected);
    assert!(!status.recording);

    server.shutdown().await;
}

/// Two connections racing a mutating command: exactly one wins control.
#[tokio::test]
async fn test_concurrent_mutation_single_controller() {
    let server = TestServer::start().await;
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    let gain = 200u16.to_be_bytes();
    tokio::join!(
        a.send(commands::SET_GAIN, &gain),
        b.send(commands::SET_GAIN, &gain)
    );
    let (ra, rb) = tokio::join!(a.reply(), b.reply());

    let successes = [&ra, &rb]
        .iter()
        .filter(|f| f.command == commands::RESPONSE_SUCCESS)
        .count();
    assert_eq!(successes, 1);
    let loser = if ra.command == commands::RESPONSE_FAILED { &ra } else { &rb };
    assert_eq!(
        &loser.data[..],
        &failure(commands::SET_GAIN, ErrorCode::NotController)[..]
    );
    assert!(server.sessions.controller().is_some());

    server.shutdown().await;
}

/// Observers can query but not mutate; control passes on once the
/// controller disconnects.
#[tokio::test]
async fn test_controller_handover_on_disconnect() {
    let server = TestServer::start().await;
    let mut controller = server.connect().await;
    let mut observer = server.connect().await;

    controller.send(commands::SET_GAIN_AUTO, &[1]).await;
    assert_eq!(controller.reply().await.command, commands::RESPONSE_SUCCESS);

    observer.send(commands::SET_GAIN_AUTO, &[0]).await;
    let rejected = observer.reply().await;
    assert_eq!(
        &rejected.data[..],
        &failure(commands::SET_GAIN_AUTO, ErrorCode::NotController)[..]
    );

    observer.send(commands::QUERY_GAIN_AUTO, &[]).await;
    let frame = observer.expect(commands::GAIN_AUTO_REPORT).await;
    assert_eq!(&frame.data[..], &[1]);

    drop(controller);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while server.sessions.controller().is_some() {
        assert!(tokio::time::Instant::now() < deadline, "controller never released");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    observer.send(commands::SET_GAIN_AUTO, &[0]).await;
    assert_eq!(observer.reply().await.command, commands::RESPONSE_SUCCESS);

    server.shutdown().await;
}

/// A frame split into single-byte writes is still answered exactly once.
#[tokio::test]
async fn test_fragmented_request() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;
    client.stream.set_nodelay(true).unwrap();

    let bytes = encode(commands::QUERY_PARAMS, &[]).unwrap();
    for byte in bytes {
        client.stream.write_all(&[byte]).await.unwrap();
        client.stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let frame = client.expect(commands::PARAMS_REPORT).await;
    let block = ParameterBlock::decode(&frame.data).unwrap();
    assert_eq!(block, ParameterBlock::default());
    assert!(client
        .backlog
        .iter()
        .all(|f| f.command != commands::PARAMS_REPORT));

    server.shutdown().await;
}

/// Garbage, a corrupted frame and a valid frame in one write.
#[tokio::test]
async fn test_resync_and_checksum_error() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    let mut bytes = vec![0x00, 0x13, 0x37, 0xEF];
    let mut corrupted = encode(commands::QUERY_RESOLUTIONS, &[]).unwrap();
    let checksum_at = corrupted.len() - 3;
    corrupted[checksum_at] ^= 0xFF;
    bytes.extend(&corrupted);
    bytes.extend(encode(commands::QUERY_RESOLUTIONS, &[]).unwrap());
    client.stream.write_all(&bytes).await.unwrap();

    let failed = client.reply().await;
    assert_eq!(failed.command, commands::RESPONSE_FAILED);
    assert_eq!(
        &failed.data[..],
        &failure(commands::QUERY_RESOLUTIONS, ErrorCode::ChecksumFailed)[..]
    );

    let frame = client.expect(commands::RESOLUTIONS_REPORT).await;
    let list = ResolutionList::decode(&frame.data).unwrap();
    assert_eq!(list.0.len(), 7);

    server.shutdown().await;
}

/// Unknown codes and wrong versions are answered; the connection stays up.
#[tokio::test]
async fn test_command_errors_keep_connection() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.send(0x77, &[]).await;
    assert_eq!(
        &client.reply().await.data[..],
        &failure(0x77, ErrorCode::UnknownCommand)[..]
    );

    let mut old_version = encode(commands::HEARTBEAT, &[]).unwrap();
    old_version[2] = 0x10;
    // Recompute the checksum for the changed version byte.
    let len = old_version.len();
    old_version[len - 3] = old_version[2..len - 3].iter().fold(0, |acc, b| acc ^ b);
    client.stream.write_all(&old_version).await.unwrap();
    assert_eq!(
        &client.reply().await.data[..],
        &failure(commands::HEARTBEAT, ErrorCode::VersionMismatch)[..]
    );

    client.send(commands::SET_EXPOSURE, &[1]).await;
    assert_eq!(
        &client.reply().await.data[..],
        &failure(commands::SET_EXPOSURE, ErrorCode::DataLengthError)[..]
    );

    client.send(commands::HEARTBEAT, &[]).await;
    let ok = client.reply().await;
    assert_eq!(ok.command, commands::RESPONSE_SUCCESS);
    assert_eq!(&ok.data[..], &[commands::HEARTBEAT]);

    server.shutdown().await;
}

/// Status reports arrive without being asked for.
#[tokio::test]
async fn test_periodic_status_reports() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.expect(commands::STATUS_REPORT).await;
    client.expect(commands::STATUS_REPORT).await;

    server.shutdown().await;
}

/// Preview start streams JPEG frames; dropping the only viewer stops it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_preview_streams_and_stops_with_viewer() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    // Index 6 is 640x480; fps 0 selects the default rate.
    client.send(commands::PREVIEW_START, &[6, 0]).await;
    assert_eq!(client.reply().await.command, commands::RESPONSE_SUCCESS);
    client.backlog.clear();
    assert!(server.device.preview().is_running());

    let frame = client.expect(commands::PREVIEW_FRAME).await;
    let (seq, jpeg) = parse_preview_data(&frame.data).unwrap();
    assert!(seq >= 1);
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    client.send(commands::QUERY_STATUS, &[]).await;
    let status = client.expect(commands::STATUS_REPORT).await;
    assert!(StatusSnapshot::from_byte(status.data[0]).previewing);

    drop(client);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !server.sessions.is_empty() || server.device.preview().is_running() {
        assert!(tokio::time::Instant::now() < deadline, "viewer never torn down");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut other = server.connect().await;
    other.send(commands::PREVIEW_START, &[6, 10]).await;
    assert_eq!(other.reply().await.command, commands::RESPONSE_SUCCESS);
    other.send(commands::PREVIEW_STOP, &[]).await;
    assert_eq!(other.reply().await.command, commands::RESPONSE_SUCCESS);

    server.shutdown().await;
}

/// Recording blocks captures until it is stopped.
#[tokio::test]
async fn test_record_and_capture() {
    let server = TestServer::start().await;
    let mut client = server.connect().await;

    client.send(commands::CAPTURE_SINGLE, &[]).await;
    let capture = client.expect(commands::CAPTURE_COMPLETE).await;
    assert_eq!(&capture.data[4..], &[0, 160, 0, 120]);

    client.send(commands::RECORD_START, &[]).await;
    assert_eq!(client.reply().await.command, commands::RESPONSE_SUCCESS);

    client.send(commands::CAPTURE_SINGLE, &[]).await;
    assert_eq!(
        &client.reply().await.data[..],
        &failure(commands::CAPTURE_SINGLE, ErrorCode::StateRecording)[..]
    );

    client.send(commands::RECORD_STOP, &[]).await;
    assert_eq!(client.reply().await.command, commands::RESPONSE_SUCCESS);
    let done = client.expect(commands::RECORD_COMPLETE).await;
    assert_eq!(done.data.len(), 4);

    server.shutdown().await;
}

fn bgr_frame(width: u32, height: u32) -> RawImage {
    RawImage {
        width,
        height,
        format: ImageFormat::Bgr8,
        data: vec![90; (width * height * 3) as usize],
    }
}

/// A skip directive drops the frame before any buffer is leased or any
/// byte is queued.
#[tokio::test]
async fn test_skip_directive_sends_nothing() {
    let sessions = Arc::new(SessionRegistry::new());
    let (client, _server) = tokio::io::duplex(1 << 20);
    let (writer, _task) = spawn_writer_task(client, WriterConfig::default(), None);
    sessions.register(ConnectionId(1), writer.clone());
    sessions.set_flag(ConnectionId(1), Flag::Previewing, true);

    let detector = Arc::new(CongestionDetector::default());
    let pipeline = PreviewPipeline::new(PreviewConfig::default(), sessions, detector.clone());

    detector.record_latency(Duration::from_millis(400));
    let directive = detector.observe(10);
    assert_eq!(directive.level, CongestionLevel::Severe);
    assert!(directive.should_skip(1));

    assert_eq!(pipeline.process_frame(&bgr_frame(32, 32)), TickOutcome::Skipped);
    let stats = pipeline.stats();
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.pool.acquire_count, 0);
    assert_eq!(writer.pending_count(), 0);
}

/// Quality and skip ratio stay in bounds under any sample sequence.
#[test]
fn test_congestion_bounds() {
    let detector = CongestionDetector::default();
    let latencies = [0u64, 500, 20, 1000, 150, 0, 0, 90, 300, 5];
    for round in 0..200 {
        let latency = latencies[round % latencies.len()];
        detector.record_latency(Duration::from_millis(latency));
        let directive = detector.observe(round % 9);
        assert!((30..=90).contains(&directive.quality));
        assert!((0.0..1.0).contains(&directive.skip_ratio));
    }
}
