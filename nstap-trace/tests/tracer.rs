//! End-to-end tracer tests over real sockets

use bytes::Bytes;
use nstap_capture::{read_container, DataLink, MergeWriter, WriterOptions};
use nstap_core::{CapturedPacket, Error, InterfaceHandle};
use nstap_trace::{read_log, ListenAddr, TraceClient, TraceEvent, Tracer, TracerConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

fn loopback() -> ListenAddr {
    "tcp:127.0.0.1:0".parse().unwrap()
}

fn record_line(index: u64) -> Vec<u8> {
    format!("{{\"index\":{index},\"message\":\"m\",\"timestamp\":\"2024-05-01T12:00:00Z\"}}\n")
        .into_bytes()
}

async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

#[tokio::test]
async fn test_five_submissions_are_logged() {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("trace.log");
    let tracer = Tracer::start_local(TracerConfig::new(loopback()).with_log_path(&log))
        .await
        .unwrap();

    let mut client = TraceClient::connect(tracer.local_addr()).await.unwrap();
    for i in 0..5 {
        client.submit(i, "Hello from test process").await.unwrap();
    }
    client.close().await.unwrap();

    tracer.stop().await.unwrap();
    assert_eq!(tracer.received(), 5);
    assert_eq!(tracer.malformed(), 0);

    let events = read_log(&log).unwrap();
    assert_eq!(events.len(), 5);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.index(), i as u64);
        assert_eq!(event.seq, i as u64);
        assert_eq!(event.message(), "Hello from test process");
        assert_eq!(event.record.pid, Some(std::process::id()));
    }
}

#[tokio::test]
async fn test_malformed_line_is_dropped() {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("trace.log");
    let tracer = Tracer::start_local(TracerConfig::new(loopback()).with_log_path(&log))
        .await
        .unwrap();

    let ListenAddr::Tcp(host) = tracer.local_addr().clone() else {
        panic!("expected tcp address");
    };
    let mut stream = TcpStream::connect(host.as_str()).await.unwrap();
    stream.write_all(b"this is not json\n").await.unwrap();
    stream
        .write_all(b"{\"index\":7,\"message\":\"ok\",\"timestamp\":\"2024-05-01T12:00:00Z\"}\n")
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    tracer.stop().await.unwrap();
    assert_eq!(tracer.malformed(), 1);
    assert_eq!(tracer.received(), 1);

    let events = read_log(&log).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].index(), 7);
    assert_eq!(events[0].seq, 0);
}

#[tokio::test]
async fn test_address_in_use() {
    let first = Tracer::start_local(TracerConfig::new(loopback())).await.unwrap();

    let taken = first.local_addr().clone();
    let second = Tracer::start_local(TracerConfig::new(taken)).await;
    assert!(matches!(second, Err(Error::AddressInUse(_))));

    first.stop().await.unwrap();
}

#[tokio::test]
async fn test_unix_socket_is_removed_on_stop() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("trace.sock");
    let log = tmp.path().join("trace.log");
    let addr = ListenAddr::Unix(socket.clone());

    let tracer = Tracer::start_local(TracerConfig::new(addr.clone()).with_log_path(&log))
        .await
        .unwrap();
    assert!(socket.exists());

    let mut client = TraceClient::connect(&addr).await.unwrap().with_source("h1");
    client
        .submit_with_data(0, "state", &json!({"peers": 2}))
        .await
        .unwrap();
    client.close().await.unwrap();

    tracer.stop().await.unwrap();
    assert!(!socket.exists());

    let events = read_log(&log).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].record.source.as_deref(), Some("h1"));
    assert_eq!(events[0].record.data, Some(json!({"peers": 2})));
}

#[tokio::test]
async fn test_events_share_capture_container() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("merged.pcapng");
    let writer = MergeWriter::create(&path, WriterOptions::default().with_comment("traced"))
        .unwrap();

    let h1 = Arc::new(InterfaceHandle::new("h1", "veth0"));
    writer
        .write(&CapturedPacket::new(
            h1,
            Bytes::from_static(&[0u8; 60]),
            SystemTime::now(),
        ))
        .unwrap();

    let tracer = Tracer::start_local(TracerConfig::new(loopback()).with_capture(&writer))
        .await
        .unwrap();

    let mut client = TraceClient::connect(tracer.local_addr()).await.unwrap();
    for i in 0..3 {
        client.submit(i, format!("step {i}")).await.unwrap();
    }
    client.close().await.unwrap();
    tracer.stop().await.unwrap();

    // the test still holds a lease, so the container is open
    assert!(!writer.writer().is_closed());
    writer.release().unwrap();
    assert!(writer.writer().is_closed());

    let container = read_container(&path).unwrap();
    assert_eq!(container.comment.as_deref(), Some("traced"));
    assert_eq!(container.interface_names(), vec!["h1/veth0", "tracer"]);
    assert_eq!(container.interfaces[1].linktype, DataLink::USER0);

    let traced = container.records_for("tracer");
    assert_eq!(traced.len(), 3);
    for (i, record) in traced.iter().enumerate() {
        assert_eq!(record.comment.as_deref(), Some(format!("step {i}").as_str()));
        let event = TraceEvent::from_json(std::str::from_utf8(&record.data).unwrap()).unwrap();
        assert_eq!(event.index(), i as u64);
        assert_eq!(record.timestamp.as_micros(), event.since_epoch().as_micros());
    }
    assert!(container.records[0].timestamp <= traced[0].timestamp);
}

#[tokio::test]
async fn test_invalid_utf8_line_keeps_connection_open() {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("trace.log");
    let tracer = Tracer::start_local(TracerConfig::new(loopback()).with_log_path(&log))
        .await
        .unwrap();

    let ListenAddr::Tcp(host) = tracer.local_addr().clone() else {
        panic!("expected tcp address");
    };
    let mut stream = TcpStream::connect(host.as_str()).await.unwrap();
    stream.write_all(&record_line(0)).await.unwrap();
    stream.write_all(b"\xff\xfe garbage\n").await.unwrap();
    stream.write_all(&record_line(1)).await.unwrap();
    stream.shutdown().await.unwrap();

    tracer.stop().await.unwrap();
    assert_eq!(tracer.malformed(), 1);
    assert_eq!(tracer.received(), 2);

    let indices: Vec<u64> = read_log(&log).unwrap().iter().map(|e| e.index()).collect();
    assert_eq!(indices, vec![0, 1]);
}

#[tokio::test]
async fn test_failed_log_open_releases_socket() {
    let tmp = TempDir::new().unwrap();
    let socket = tmp.path().join("trace.sock");
    let addr = ListenAddr::Unix(socket.clone());

    let missing = tmp.path().join("no-such-dir").join("trace.log");
    let result = Tracer::start_local(TracerConfig::new(addr.clone()).with_log_path(missing)).await;
    assert!(matches!(result, Err(Error::Io(_))));
    assert!(!socket.exists());

    // the same address is usable right away
    let log = tmp.path().join("trace.log");
    let tracer = Tracer::start_local(TracerConfig::new(addr).with_log_path(&log))
        .await
        .unwrap();
    tracer.stop().await.unwrap();
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_stop_drains_open_connection() {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("trace.log");
    let tracer = Tracer::start_local(TracerConfig::new(loopback()).with_log_path(&log))
        .await
        .unwrap();

    let mut client = TraceClient::connect(tracer.local_addr()).await.unwrap();
    client.submit(0, "first").await.unwrap();
    assert!(wait_until(|| tracer.received() == 1).await);

    // still in flight when stop is requested; the client never closes
    for i in 1..5 {
        client.submit(i, "pending").await.unwrap();
    }

    let started = Instant::now();
    tracer.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let indices: Vec<u64> = read_log(&log).unwrap().iter().map(|e| e.index()).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    assert_eq!(tracer.written(), 5);
    drop(client);
}
