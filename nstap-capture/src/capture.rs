//! Multi-interface capture
//!
//! A [`Capturer`] attaches one tap per selected interface. Every tap runs on
//! its own thread and feeds the shared pipeline: filter chain, packet count,
//! then sequential delivery to every sink in configuration order. Delivery
//! failures never stop a tap; they are collected and reported by the next
//! [`Capturer::flush`] or [`Capturer::stop`].

use bytes::Bytes;
use crossbeam_channel::bounded;
use nstap_core::{CapturedPacket, Error, InterfaceHandle, InterfaceKey, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bpf::BpfProgram;
use crate::filter::{Filter, FilterChain, InterfacePredicate, PacketPredicate};
use crate::sink::{first_error, FileTarget, Sink, SinkDescriptor};
use crate::stats::{CaptureStats, StatsAccumulator};
use crate::tap::{Frame, PcapTapOpener, TapOpener, TapSettings, TapSource};
use crate::template::NameTemplate;
use crate::writer::{WriterHandle, WriterOptions, DEFAULT_SNAPLEN};

/// Largest accepted snap length
pub const MAX_SNAPLEN: u32 = 262_144;

/// Default tap read timeout
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Delivery failures kept for reporting; later ones are only counted
const MAX_KEPT_FAILURES: usize = 256;

/// Immutable capture configuration
#[derive(Clone)]
pub struct CaptureConfig {
    /// Packet destinations, in delivery order
    pub sinks: Vec<SinkDescriptor>,
    /// Maximum bytes captured per packet
    pub snaplen: u32,
    /// Enable promiscuous mode
    pub promiscuous: bool,
    /// Kernel-level program and in-process predicates
    pub filters: Vec<Filter>,
    /// Selects the interfaces to attach to
    pub interface_filter: Option<InterfacePredicate>,
    /// Section comment of owned containers
    pub comment: Option<String>,
    /// Interface names inside owned containers
    pub interface_name: NameTemplate,
    /// How long a tap read may block before checking for shutdown
    pub read_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sinks: Vec::new(),
            snaplen: DEFAULT_SNAPLEN,
            promiscuous: true,
            filters: Vec::new(),
            interface_filter: None,
            comment: None,
            interface_name: NameTemplate::default_interface_name(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl CaptureConfig {
    /// Start building a configuration
    pub fn builder() -> CaptureBuilder {
        CaptureBuilder::new()
    }

    /// Options for containers this capture creates itself
    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            comment: self.comment.clone(),
            snaplen: self.snaplen,
            interface_name: self.interface_name.clone(),
            ..Default::default()
        }
    }

    fn selects(&self, interface: &InterfaceHandle) -> bool {
        self.interface_filter
            .as_ref()
            .map(|f| f(interface))
            .unwrap_or(true)
    }

    /// Every problem with this configuration
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.sinks.is_empty() {
            problems.push("no sink configured".to_string());
        }
        if self.snaplen == 0 || self.snaplen > MAX_SNAPLEN {
            problems.push(format!(
                "length must be between 1 and {}, got {}",
                MAX_SNAPLEN, self.snaplen
            ));
        }
        if self.read_timeout.is_zero() {
            problems.push("read timeout must be positive".to_string());
        }
        if self.filters.iter().filter(|f| f.is_kernel()).count() > 1 {
            problems.push("at most one filter expression or program may be given".to_string());
        }
        for filter in &self.filters {
            if let Filter::Expression(expr) = filter {
                if expr.trim().is_empty() {
                    problems.push("filter expression is empty".to_string());
                } else if let Err(e) = BpfProgram::compile(expr, self.snaplen.max(1)) {
                    problems.push(e.to_string());
                }
            }
        }

        problems
    }
}

impl fmt::Debug for CaptureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureConfig")
            .field("sinks", &self.sinks)
            .field("snaplen", &self.snaplen)
            .field("promiscuous", &self.promiscuous)
            .field("filters", &self.filters)
            .field("interface_filter", &self.interface_filter.is_some())
            .field("comment", &self.comment)
            .field("interface_name", &self.interface_name.as_str())
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

/// Builder for [`CaptureConfig`]
///
/// Problems are collected as options are given and reported together by
/// [`CaptureBuilder::build`].
#[derive(Default)]
pub struct CaptureBuilder {
    config: CaptureConfig,
    problems: Vec<String>,
}

impl CaptureBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Write to a container file owned by the capture
    pub fn to_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config
            .sinks
            .push(SinkDescriptor::File(FileTarget::Path(path.as_ref().to_path_buf())));
        self
    }

    /// Write to one container per rendered file name
    pub fn to_file_template(mut self, template: &str) -> Self {
        match NameTemplate::parse(template) {
            Ok(t) => self.config.sinks.push(SinkDescriptor::File(FileTarget::Template(t))),
            Err(e) => self.problems.push(e.to_string()),
        }
        self
    }

    /// Write to a shared container
    pub fn to_writer(mut self, handle: &WriterHandle) -> Self {
        self.config.sinks.push(SinkDescriptor::shared(handle));
        self
    }

    /// Send packets to a channel, blocking while it is full
    pub fn to_channel(mut self, sender: crossbeam_channel::Sender<CapturedPacket>) -> Self {
        self.config.sinks.push(SinkDescriptor::channel(sender));
        self
    }

    /// Send packets to a channel, giving up on a packet after `timeout`
    pub fn to_channel_timeout(
        mut self,
        sender: crossbeam_channel::Sender<CapturedPacket>,
        timeout: Duration,
    ) -> Self {
        self.config.sinks.push(SinkDescriptor::Channel {
            sender,
            timeout: Some(timeout),
        });
        self
    }

    /// Call `f` for every packet, on the tap thread
    pub fn callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&CapturedPacket) + Send + Sync + 'static,
    {
        self.config.sinks.push(SinkDescriptor::callback(f));
        self
    }

    /// Add a prepared sink
    pub fn sink(mut self, sink: SinkDescriptor) -> Self {
        self.config.sinks.push(sink);
        self
    }

    /// Maximum bytes captured per packet
    pub fn length(mut self, snaplen: u32) -> Self {
        self.config.snaplen = snaplen;
        self
    }

    /// Enable or disable promiscuous mode
    pub fn promiscuous(mut self, enable: bool) -> Self {
        self.config.promiscuous = enable;
        self
    }

    /// Kernel-level libpcap filter expression
    pub fn filter_expression<S: Into<String>>(mut self, expression: S) -> Self {
        self.config.filters.push(Filter::Expression(expression.into()));
        self
    }

    /// Kernel-level BPF program
    pub fn filter_program(mut self, program: BpfProgram) -> Self {
        self.config.filters.push(Filter::Bytecode(program));
        self
    }

    /// Add a filter of any kind
    pub fn filter(mut self, filter: Filter) -> Self {
        self.config.filters.push(filter);
        self
    }

    /// Attach only to interfaces accepted by `predicate`
    ///
    /// Several calls combine with AND.
    pub fn filter_interfaces(mut self, predicate: InterfacePredicate) -> Self {
        self.config.interface_filter = Some(match self.config.interface_filter.take() {
            Some(previous) => Arc::new(move |i: &InterfaceHandle| previous(i) && predicate(i)),
            None => predicate,
        });
        self
    }

    /// Forward only packets accepted by `predicate`
    pub fn filter_packets(mut self, predicate: PacketPredicate) -> Self {
        self.config.filters.push(Filter::Predicate(predicate));
        self
    }

    /// Section comment of owned containers
    pub fn comment<S: Into<String>>(mut self, comment: S) -> Self {
        self.config.comment = Some(comment.into());
        self
    }

    /// Interface naming template inside owned containers
    pub fn interface_names(mut self, template: &str) -> Self {
        match NameTemplate::parse(template) {
            Ok(t) => self.config.interface_name = t,
            Err(e) => self.problems.push(e.to_string()),
        }
        self
    }

    /// Tap read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<CaptureConfig> {
        let mut problems = self.problems;
        problems.extend(self.config.problems());

        if problems.is_empty() {
            Ok(self.config)
        } else {
            Err(Error::InvalidConfig(problems))
        }
    }
}

/// State of a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Taps are running
    Running,
    /// Taps are detached and sinks released
    Stopped,
}

/// Shared by every tap of one capture
struct Pipeline {
    chain: FilterChain,
    sinks: Vec<Sink>,
    snaplen: usize,
    stats: StatsAccumulator,
    failures: Mutex<Vec<Error>>,
}

impl Pipeline {
    fn process(&self, interface: &Arc<InterfaceHandle>, frame: Frame) {
        self.stats.record_seen();

        let mut data: Bytes = frame.data;
        let original_len = frame.original_len.max(data.len());
        data.truncate(self.snaplen);

        let packet = CapturedPacket::new(interface.clone(), data, frame.timestamp)
            .with_original_len(original_len);

        if !self.chain.matches(&packet) {
            self.stats.record_filtered();
            return;
        }

        self.stats.record_accepted(packet.len());

        for sink in &self.sinks {
            if let Err(e) = sink.deliver(&packet) {
                self.stats.record_failure();
                debug!(interface = %interface, sink = sink.name(), error = %e, "delivery failed");
                let mut failures = self.failures.lock();
                if failures.len() < MAX_KEPT_FAILURES {
                    failures.push(e);
                }
            }
        }
    }

    fn take_failure(&self) -> Option<Error> {
        let mut failures = self.failures.lock();
        if failures.is_empty() {
            return None;
        }
        let first = failures.remove(0);
        if !failures.is_empty() {
            warn!(dropped = failures.len(), "further delivery failures since last flush");
        }
        failures.clear();
        Some(first)
    }
}

struct TapWorker {
    interface: Arc<InterfaceHandle>,
    thread: JoinHandle<()>,
}

/// Capture over a set of interfaces
pub struct Capturer {
    id: Uuid,
    settings: TapSettings,
    interface_filter: Option<InterfacePredicate>,
    pipeline: Arc<Pipeline>,
    opener: Arc<dyn TapOpener>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<TapWorker>>,
    state: Mutex<CaptureState>,
}

impl Capturer {
    /// Attach to the selected interfaces with live pcap taps
    pub fn attach(interfaces: &[InterfaceHandle], config: CaptureConfig) -> Result<Self> {
        Self::attach_with(interfaces, config, Arc::new(PcapTapOpener))
    }

    /// Attach using a custom tap opener
    ///
    /// Fails if no interface is selected, a filter does not compile, a file
    /// cannot be created or a tap cannot be opened. Nothing keeps running
    /// after a failed attach.
    pub fn attach_with(
        interfaces: &[InterfaceHandle],
        config: CaptureConfig,
        opener: Arc<dyn TapOpener>,
    ) -> Result<Self> {
        let problems = config.problems();
        if !problems.is_empty() {
            return Err(Error::InvalidConfig(problems));
        }

        let selected: Vec<&InterfaceHandle> =
            interfaces.iter().filter(|i| config.selects(i)).collect();
        if selected.is_empty() {
            return Err(Error::NoMatchingInterface);
        }

        let chain = FilterChain::compile(&config.filters, config.snaplen)?;
        let options = config.writer_options();

        let mut sinks = Vec::with_capacity(config.sinks.len());
        for descriptor in &config.sinks {
            match descriptor.open(&options) {
                Ok(sink) => sinks.push(sink),
                Err(e) => {
                    release_all(&sinks);
                    return Err(e);
                }
            }
        }

        let settings = TapSettings {
            snaplen: config.snaplen,
            promiscuous: config.promiscuous,
            read_timeout: config.read_timeout,
            kernel_filter: chain.kernel().cloned(),
        };

        let capturer = Self {
            id: Uuid::now_v7(),
            settings,
            interface_filter: config.interface_filter.clone(),
            pipeline: Arc::new(Pipeline {
                chain,
                sinks,
                snaplen: config.snaplen as usize,
                stats: StatsAccumulator::new(),
                failures: Mutex::new(Vec::new()),
            }),
            opener,
            running: Arc::new(AtomicBool::new(true)),
            workers: Mutex::new(Vec::new()),
            state: Mutex::new(CaptureState::Running),
        };

        // On error the capturer is dropped, which stops the taps already started
        let started = capturer.start_taps(&selected)?;
        info!(capture = %capturer.id, interfaces = started, sinks = config.sinks.len(), "capture attached");
        Ok(capturer)
    }

    /// Re-run interface selection and attach to newly matching interfaces
    ///
    /// Returns the number of taps started.
    pub fn reattach(&self, interfaces: &[InterfaceHandle]) -> Result<usize> {
        if self.state() == CaptureState::Stopped {
            return Err(Error::InvalidState("capture is stopped".to_string()));
        }

        let attached: HashSet<InterfaceKey> = self
            .workers
            .lock()
            .iter()
            .map(|w| w.interface.key())
            .collect();
        let selected: Vec<&InterfaceHandle> = interfaces
            .iter()
            .filter(|i| !attached.contains(&i.key()))
            .filter(|i| {
                self.interface_filter
                    .as_ref()
                    .map(|f| f(*i))
                    .unwrap_or(true)
            })
            .collect();

        let started = self.start_taps(&selected)?;
        if started > 0 {
            info!(capture = %self.id, interfaces = started, "attached new interfaces");
        }
        Ok(started)
    }

    fn start_taps(&self, interfaces: &[&InterfaceHandle]) -> Result<usize> {
        for interface in interfaces {
            for sink in &self.pipeline.sinks {
                sink.prepare(interface)?;
            }
        }

        let mut started = 0;
        for interface in interfaces {
            let interface = Arc::new((*interface).clone());
            let worker = self.spawn_tap(interface)?;
            self.workers.lock().push(worker);
            started += 1;
        }
        Ok(started)
    }

    fn spawn_tap(&self, interface: Arc<InterfaceHandle>) -> Result<TapWorker> {
        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let opener = self.opener.clone();
        let settings = self.settings.clone();
        let pipeline = self.pipeline.clone();
        let running = self.running.clone();
        let tap_interface = interface.clone();

        let thread = thread::Builder::new()
            .name(format!("tap-{}", interface))
            .spawn(move || {
                let source = match opener.open(tap_interface, &settings) {
                    Ok(source) => {
                        let _ = ready_tx.send(Ok(()));
                        source
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run_tap(source, &pipeline, &running);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(TapWorker { interface, thread }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::capture(format!("{}: tap thread exited before opening", interface)))
            }
        }
    }

    /// Capture id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of packets that passed every filter
    ///
    /// Counts packets whose delivery was attempted, whether or not every
    /// sink accepted them.
    pub fn count(&self) -> u64 {
        self.pipeline.stats.accepted()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> CaptureStats {
        self.pipeline.stats.snapshot()
    }

    /// Interfaces with a running tap
    pub fn interfaces(&self) -> Vec<Arc<InterfaceHandle>> {
        self.workers.lock().iter().map(|w| w.interface.clone()).collect()
    }

    /// Container files written by this capture
    pub fn paths(&self) -> Vec<PathBuf> {
        self.pipeline.sinks.iter().flat_map(|s| s.paths()).collect()
    }

    /// Current state
    pub fn state(&self) -> CaptureState {
        *self.state.lock()
    }

    /// Make every accepted packet durable in file sinks
    ///
    /// Reports the first delivery failure since the previous flush, or else
    /// the first sink flush failure. Every sink is flushed either way.
    pub fn flush(&self) -> Result<()> {
        let delivery = self.pipeline.take_failure();
        let flushed = first_error(self.pipeline.sinks.iter().map(|s| s.flush()));

        match delivery {
            Some(e) => Err(e),
            None => flushed,
        }
    }

    /// Detach every tap, then flush and release the sinks
    ///
    /// Packets already read finish their delivery first. Shared writers are
    /// closed only once their last owner releases them. Stopping twice is a
    /// no-op.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == CaptureState::Stopped {
                return Ok(());
            }
            *state = CaptureState::Stopped;
        }

        info!(capture = %self.id, "stopping capture");
        self.running.store(false, Ordering::SeqCst);

        let workers: Vec<TapWorker> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.thread.join().is_err() {
                error!(capture = %self.id, interface = %worker.interface, "tap thread panicked");
            }
        }

        let flushed = self.flush();
        let released = release_all(&self.pipeline.sinks);

        let stats = self.stats();
        info!(
            capture = %self.id,
            packets = stats.packets_accepted,
            filtered = stats.packets_filtered,
            failures = stats.delivery_failures,
            "capture stopped"
        );

        flushed.and(released)
    }

    /// Alias of [`Capturer::stop`]
    pub fn close(&self) -> Result<()> {
        self.stop()
    }
}

impl Drop for Capturer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(capture = %self.id, error = %e, "capture stopped with errors");
        }
    }
}

impl fmt::Debug for Capturer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capturer")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("interfaces", &self.workers.lock().len())
            .field("count", &self.count())
            .finish()
    }
}

fn run_tap(mut source: Box<dyn TapSource>, pipeline: &Pipeline, running: &AtomicBool) {
    let interface = source.interface().clone();
    debug!(interface = %interface, "tap running");

    while running.load(Ordering::SeqCst) {
        match source.next_frame() {
            Ok(Some(frame)) => pipeline.process(&interface, frame),
            Ok(None) => continue,
            Err(e) => {
                error!(interface = %interface, error = %e, "tap read failed");
                break;
            }
        }
    }

    debug!(interface = %interface, "tap finished");
}

fn release_all(sinks: &[Sink]) -> Result<()> {
    first_error(sinks.iter().map(|s| s.release()))
}
