//! Trace event collector
//!
//! A [`Tracer`] listens on a TCP or Unix socket for newline-delimited
//! [`TraceRecord`]s. Each connection is served by its own task; a single
//! writer task assigns arrival sequence numbers and appends every event to
//! the JSON-lines log and, optionally, to a shared capture container on the
//! `tracer` pseudo-interface.

use crate::event::{TraceEvent, TraceRecord};
use chrono::Utc;
use nstap_capture::{DataLink, WriterHandle};
use nstap_core::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Name of the capture pseudo-interface carrying trace events
pub const TRACER_INTERFACE: &str = "tracer";

/// Default listen address
pub const DEFAULT_LISTEN: &str = "tcp:[::1]:42125";

/// Default capacity of the queue between connections and the writer
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// How long a connection keeps reading after stop was requested
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Where a tracer listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// `host:port`
    Tcp(String),
    /// Filesystem path of a Unix stream socket
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("tcp", rest)) if rest.rsplit_once(':').is_some() => {
                Ok(ListenAddr::Tcp(rest.to_string()))
            }
            Some(("unix", rest)) if !rest.is_empty() => Ok(ListenAddr::Unix(PathBuf::from(rest))),
            _ => Err(Error::InvalidAddress(s.to_string())),
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "tcp:{}", addr),
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Tracer construction options
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Listen address
    pub listen: ListenAddr,
    /// JSON-lines event log, truncated on start
    pub log_path: Option<PathBuf>,
    /// Shared capture container that also receives every event
    pub capture: Option<WriterHandle>,
    /// Queue capacity between connections and the writer task
    pub channel_capacity: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            listen: ListenAddr::Tcp("[::1]:42125".to_string()),
            log_path: None,
            capture: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl TracerConfig {
    /// Listen on `listen`
    pub fn new(listen: ListenAddr) -> Self {
        Self {
            listen,
            ..Default::default()
        }
    }

    /// Write events to `path`
    pub fn with_log_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Also append events to a shared capture container
    ///
    /// Takes its own lease on the writer.
    pub fn with_capture(mut self, writer: &WriterHandle) -> Self {
        self.capture = Some(writer.clone());
        self
    }

    /// Set the queue capacity
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    malformed: AtomicU64,
    written: AtomicU64,
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

type EventStream = Box<dyn AsyncRead + Send + Unpin>;

impl Listener {
    async fn bind(addr: &ListenAddr) -> Result<(Self, ListenAddr)> {
        let in_use = |e: io::Error| {
            if e.kind() == io::ErrorKind::AddrInUse {
                Error::AddressInUse(addr.to_string())
            } else {
                Error::Io(e)
            }
        };

        match addr {
            ListenAddr::Tcp(host) => {
                let listener = TcpListener::bind(host.as_str()).await.map_err(in_use)?;
                let bound = ListenAddr::Tcp(listener.local_addr()?.to_string());
                Ok((Listener::Tcp(listener), bound))
            }
            ListenAddr::Unix(path) => {
                let listener = UnixListener::bind(path).map_err(in_use)?;
                Ok((Listener::Unix(listener), addr.clone()))
            }
        }
    }

    async fn accept(&self) -> io::Result<(EventStream, String)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Box::new(stream), peer.to_string()))
            }
            Listener::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok((Box::new(stream), "unix".to_string()))
            }
        }
    }
}

/// A running trace event collector
pub struct Tracer {
    id: Uuid,
    addr: ListenAddr,
    log_path: Option<PathBuf>,
    capture: Option<WriterHandle>,
    counters: Arc<Counters>,
    shutdown: watch::Sender<bool>,
    local: Mutex<Option<mpsc::Sender<TraceRecord>>>,
    accept_task: Mutex<Option<JoinHandle<Listener>>>,
    writer_task: Mutex<Option<JoinHandle<Result<()>>>>,
    stopped: AtomicBool,
}

impl Tracer {
    /// Bind the listen address and start collecting
    ///
    /// Fails immediately when the address is taken or the log cannot be
    /// created.
    pub async fn start_local(config: TracerConfig) -> Result<Self> {
        let (listener, addr) = Listener::bind(&config.listen).await?;

        let log = match open_log(config.log_path.as_deref()).await {
            Ok(log) => log,
            Err(e) => {
                drop(listener);
                remove_socket_file(&addr);
                return Err(e);
            }
        };

        let counters = Arc::new(Counters::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));

        let writer_task = tokio::spawn(write_events(
            rx,
            log,
            config.capture.clone(),
            counters.clone(),
        ));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            tx.clone(),
            shutdown_rx,
            counters.clone(),
        ));

        let id = Uuid::now_v7();
        info!(tracer = %id, addr = %addr, "tracer listening");

        Ok(Self {
            id,
            addr,
            log_path: config.log_path,
            capture: config.capture,
            counters,
            shutdown,
            local: Mutex::new(Some(tx)),
            accept_task: Mutex::new(Some(accept_task)),
            writer_task: Mutex::new(Some(writer_task)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Unique tracer id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Bound address; for TCP port 0 this carries the chosen port
    pub fn local_addr(&self) -> &ListenAddr {
        &self.addr
    }

    /// Event log path
    pub fn log_path(&self) -> Option<&PathBuf> {
        self.log_path.as_ref()
    }

    /// Records accepted so far
    pub fn received(&self) -> u64 {
        self.counters.received.load(Ordering::SeqCst)
    }

    /// Lines dropped because they could not be decoded
    pub fn malformed(&self) -> u64 {
        self.counters.malformed.load(Ordering::SeqCst)
    }

    /// Events written by the writer task
    pub fn written(&self) -> u64 {
        self.counters.written.load(Ordering::SeqCst)
    }

    /// Submit a record from inside this process
    pub async fn record(&self, record: TraceRecord) -> Result<()> {
        let tx = self
            .local
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidState("tracer is stopped".into()))?;
        self.counters.received.fetch_add(1, Ordering::SeqCst);
        tx.send(record)
            .await
            .map_err(|_| Error::InvalidState("tracer writer has exited".into()))
    }

    /// Stop the tracer
    ///
    /// Stops accepting, lets open connections drain, writes every queued
    /// event, removes a Unix socket file and gives back the capture lease.
    /// Returns the first write error seen during the tracer's lifetime.
    /// Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown.send(true);
        self.local.lock().take();

        let accept = self.accept_task.lock().take();
        let listener = match accept {
            Some(task) => match task.await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    error!(tracer = %self.id, error = %e, "accept task failed");
                    None
                }
            },
            None => None,
        };

        let writer = self.writer_task.lock().take();
        let mut result = match writer {
            Some(task) => task
                .await
                .unwrap_or_else(|e| Err(Error::InvalidState(format!("writer task failed: {e}")))),
            None => Ok(()),
        };

        // every queued event is persisted before the listening socket goes away
        drop(listener);
        remove_socket_file(&self.addr);

        if let Some(capture) = &self.capture {
            if let Err(e) = capture.release() {
                result = result.and(Err(e));
            }
        }

        info!(
            tracer = %self.id,
            received = self.received(),
            malformed = self.malformed(),
            "tracer stopped"
        );
        result
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::SeqCst) {
            let _ = self.shutdown.send(true);
            remove_socket_file(&self.addr);
        }
    }
}

async fn accept_loop(
    listener: Listener,
    tx: mpsc::Sender<TraceRecord>,
    mut shutdown: watch::Receiver<bool>,
    counters: Arc<Counters>,
) -> Listener {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "trace connection opened");
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        tx.clone(),
                        shutdown.clone(),
                        counters.clone(),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "failed to accept trace connection");
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    while connections.join_next().await.is_some() {}
    listener
}

async fn handle_connection(
    stream: EventStream,
    peer: String,
    tx: mpsc::Sender<TraceRecord>,
    mut shutdown: watch::Receiver<bool>,
    counters: Arc<Counters>,
) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut draining = *shutdown.borrow();

    loop {
        buf.clear();
        match read_line(&mut reader, &mut buf, &mut shutdown, &mut draining).await {
            Some(Ok(0)) => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(peer = %peer, error = %e, "trace connection read failed");
                break;
            }
            None => {
                debug!(peer = %peer, "trace connection still open after drain timeout");
                break;
            }
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim(),
            Err(e) => {
                counters.malformed.fetch_add(1, Ordering::SeqCst);
                warn!(peer = %peer, error = %e, "dropping trace event that is not UTF-8");
                continue;
            }
        };

        if line.is_empty() {
            continue;
        }

        match TraceRecord::decode(line) {
            Ok(record) => {
                counters.received.fetch_add(1, Ordering::SeqCst);
                if tx.send(record).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                counters.malformed.fetch_add(1, Ordering::SeqCst);
                warn!(peer = %peer, error = %e, "dropping malformed trace event");
            }
        }
    }

    debug!(peer = %peer, "trace connection closed");
}

/// Read one line into `buf`
///
/// Once stop was requested the read is bounded by [`DRAIN_TIMEOUT`];
/// `None` means the peer sent nothing within it.
async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    shutdown: &mut watch::Receiver<bool>,
    draining: &mut bool,
) -> Option<io::Result<usize>> {
    let read = reader.read_until(b'\n', buf);
    tokio::pin!(read);

    if !*draining {
        tokio::select! {
            result = &mut read => return Some(result),
            _ = shutdown.changed() => *draining = true,
        }
    }

    tokio::time::timeout(DRAIN_TIMEOUT, read).await.ok()
}

async fn open_log(path: Option<&Path>) -> Result<Option<BufWriter<tokio::fs::File>>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    Ok(Some(BufWriter::new(file)))
}

fn remove_socket_file(addr: &ListenAddr) {
    if let ListenAddr::Unix(path) = addr {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove tracer socket");
            }
        }
    }
}

async fn write_events(
    mut rx: mpsc::Receiver<TraceRecord>,
    mut log: Option<BufWriter<tokio::fs::File>>,
    capture: Option<WriterHandle>,
    counters: Arc<Counters>,
) -> Result<()> {
    let mut seq = 0u64;
    let mut first_error: Option<Error> = None;

    while let Some(record) = rx.recv().await {
        let event = TraceEvent::new(seq, record, Utc::now());
        seq += 1;

        if let Err(e) = write_event(&event, log.as_mut(), capture.as_ref()).await {
            warn!(seq = event.seq, error = %e, "failed to persist trace event");
            first_error.get_or_insert(e);
            continue;
        }
        counters.written.fetch_add(1, Ordering::SeqCst);
    }

    if let Some(log) = log.as_mut() {
        if let Err(e) = finish_log(log).await {
            first_error.get_or_insert(e);
        }
    }
    if let Some(capture) = &capture {
        if let Err(e) = capture.flush() {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn write_event(
    event: &TraceEvent,
    log: Option<&mut BufWriter<tokio::fs::File>>,
    capture: Option<&WriterHandle>,
) -> Result<()> {
    let json = event.to_json()?;

    if let Some(log) = log {
        log.write_all(json.as_bytes()).await?;
        log.write_all(b"\n").await?;
    }

    if let Some(capture) = capture {
        capture.write_with_link(
            TRACER_INTERFACE,
            DataLink::USER0,
            event.since_epoch(),
            json.as_bytes(),
            Some(event.message()),
        )?;
    }

    Ok(())
}

async fn finish_log(log: &mut BufWriter<tokio::fs::File>) -> Result<()> {
    log.flush().await?;
    log.get_mut().sync_data().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_addr() {
        assert_eq!(
            "tcp:[::1]:42125".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("[::1]:42125".into())
        );
        assert_eq!(
            "tcp:127.0.0.1:0".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("127.0.0.1:0".into())
        );
        assert_eq!(
            "unix:/tmp/trace.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("/tmp/trace.sock"))
        );
    }

    #[test]
    fn test_parse_listen_addr_rejects() {
        for bad in ["", "tcp", "tcp:", "tcp:localhost", "unix:", "udp:1.2.3.4:5", "/tmp/x"] {
            assert!(
                matches!(bad.parse::<ListenAddr>(), Err(Error::InvalidAddress(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_listen_addr_display_round_trips() {
        for text in ["tcp:[::1]:42125", "unix:/run/nstap/trace.sock"] {
            let addr: ListenAddr = text.parse().unwrap();
            assert_eq!(addr.to_string(), text);
        }
        assert_eq!(DEFAULT_LISTEN.parse::<ListenAddr>().unwrap(), TracerConfig::default().listen);
    }

    #[test]
    fn test_config_builder() {
        let config = TracerConfig::new("unix:/tmp/t.sock".parse().unwrap())
            .with_log_path("/tmp/trace.log")
            .with_channel_capacity(0);

        assert_eq!(config.log_path, Some(PathBuf::from("/tmp/trace.log")));
        assert_eq!(config.channel_capacity, 1);
        assert!(config.capture.is_none());
    }

    #[tokio::test]
    async fn test_record_after_stop_fails() {
        let tracer = Tracer::start_local(TracerConfig::new("tcp:127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap();

        tracer.record(TraceRecord::new(0, "local")).await.unwrap();
        tracer.stop().await.unwrap();

        assert_eq!(tracer.received(), 1);
        assert_eq!(tracer.written(), 1);
        assert!(matches!(
            tracer.record(TraceRecord::new(1, "late")).await,
            Err(Error::InvalidState(_))
        ));
        tracer.stop().await.unwrap();
    }
}
