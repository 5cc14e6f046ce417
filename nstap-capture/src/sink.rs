//! Capture sinks
//!
//! A capture delivers every accepted packet to each of its sinks in the
//! order the sinks were configured. [`SinkDescriptor`] is the user-facing
//! description; [`Sink`] is the runtime form created when a capture attaches.

use crossbeam_channel::{SendTimeoutError, Sender};
use dashmap::DashMap;
use nstap_core::{CapturedPacket, Error, InterfaceHandle, InterfaceKey, Result};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::template::NameTemplate;
use crate::writer::{MergeWriter, WriterHandle, WriterOptions};

/// Synchronous packet callback
pub type PacketCallback = Arc<dyn Fn(&CapturedPacket) + Send + Sync>;

/// Where a file sink writes to
#[derive(Debug, Clone)]
pub enum FileTarget {
    /// A container owned by the capture
    Path(PathBuf),
    /// One container per distinct rendered file name
    Template(NameTemplate),
    /// A writer shared with other owners
    Shared(WriterHandle),
}

/// A configured packet destination
#[derive(Clone)]
pub enum SinkDescriptor {
    /// pcapng container
    File(FileTarget),
    /// crossbeam channel; `timeout` bounds how long a full channel may block
    Channel {
        sender: Sender<CapturedPacket>,
        timeout: Option<Duration>,
    },
    /// Function called on the tap thread
    Callback(PacketCallback),
}

impl SinkDescriptor {
    /// File sink writing to `path`
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        SinkDescriptor::File(FileTarget::Path(path.into()))
    }

    /// File sink leasing a shared writer
    pub fn shared(handle: &WriterHandle) -> Self {
        SinkDescriptor::File(FileTarget::Shared(handle.clone()))
    }

    /// Channel sink that blocks while the channel is full
    pub fn channel(sender: Sender<CapturedPacket>) -> Self {
        SinkDescriptor::Channel {
            sender,
            timeout: None,
        }
    }

    /// Callback sink
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&CapturedPacket) + Send + Sync + 'static,
    {
        SinkDescriptor::Callback(Arc::new(f))
    }

    /// Short name used in logs and delivery errors
    pub fn name(&self) -> String {
        match self {
            SinkDescriptor::File(FileTarget::Path(p)) => format!("file:{}", p.display()),
            SinkDescriptor::File(FileTarget::Template(t)) => format!("file:{}", t),
            SinkDescriptor::File(FileTarget::Shared(h)) => format!("file:{}", h.writer().label()),
            SinkDescriptor::Channel { .. } => "channel".to_string(),
            SinkDescriptor::Callback(_) => "callback".to_string(),
        }
    }

    /// Build the runtime sink
    ///
    /// Opens owned files. Templated targets open their files in
    /// [`Sink::prepare`], once the interfaces are known.
    pub fn open(&self, options: &WriterOptions) -> Result<Sink> {
        let name = self.name();
        let kind = match self {
            SinkDescriptor::File(FileTarget::Path(path)) => {
                SinkKind::Writer(MergeWriter::create(path, options.clone())?)
            }
            SinkDescriptor::File(FileTarget::Shared(handle)) => SinkKind::Writer(handle.clone()),
            SinkDescriptor::File(FileTarget::Template(template)) => SinkKind::Templated {
                template: template.clone(),
                options: options.clone(),
                by_path: DashMap::new(),
                by_interface: DashMap::new(),
            },
            SinkDescriptor::Channel { sender, timeout } => SinkKind::Channel {
                sender: sender.clone(),
                timeout: *timeout,
            },
            SinkDescriptor::Callback(f) => SinkKind::Callback(f.clone()),
        };

        Ok(Sink { name, kind })
    }
}

impl fmt::Debug for SinkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SinkDescriptor({})", self.name())
    }
}

enum SinkKind {
    Writer(WriterHandle),
    Templated {
        template: NameTemplate,
        options: WriterOptions,
        by_path: DashMap<PathBuf, WriterHandle>,
        by_interface: DashMap<InterfaceKey, WriterHandle>,
    },
    Channel {
        sender: Sender<CapturedPacket>,
        timeout: Option<Duration>,
    },
    Callback(PacketCallback),
}

/// Runtime form of a [`SinkDescriptor`]
pub struct Sink {
    name: String,
    kind: SinkKind,
}

impl Sink {
    /// Sink name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve per-interface resources before the interface's tap starts
    ///
    /// Templated file sinks render their file name here; interfaces whose
    /// names render to the same path share one container.
    pub fn prepare(&self, interface: &InterfaceHandle) -> Result<()> {
        let SinkKind::Templated {
            template,
            options,
            by_path,
            by_interface,
        } = &self.kind
        else {
            return Ok(());
        };

        let key = interface.key();
        if by_interface.contains_key(&key) {
            return Ok(());
        }

        let path = template.render_path(interface);
        let handle = match by_path.entry(path.clone()) {
            dashmap::mapref::entry::Entry::Occupied(e) => e.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let handle = MergeWriter::create(&path, options.clone())?;
                e.insert(handle).clone()
            }
        };
        debug!(sink = %self.name, interface = %key, path = %path.display(), "resolved templated file");
        by_interface.insert(key, handle);
        Ok(())
    }

    /// Container paths opened by this sink
    pub fn paths(&self) -> Vec<PathBuf> {
        match &self.kind {
            SinkKind::Writer(handle) => vec![handle.path()],
            SinkKind::Templated { by_path, .. } => {
                let mut paths: Vec<PathBuf> = by_path.iter().map(|e| e.key().clone()).collect();
                paths.sort();
                paths
            }
            _ => Vec::new(),
        }
    }

    /// Deliver one packet
    pub fn deliver(&self, packet: &CapturedPacket) -> Result<()> {
        match &self.kind {
            SinkKind::Writer(handle) => handle.write(packet).map(|_| ()),
            SinkKind::Templated { by_interface, .. } => {
                let key = packet.interface.key();
                let handle = by_interface.get(&key).ok_or_else(|| {
                    Error::delivery(self.name.clone(), format!("no file resolved for {}", key))
                })?;
                handle.value().write(packet).map(|_| ())
            }
            SinkKind::Channel { sender, timeout } => {
                let result = match timeout {
                    Some(timeout) => sender.send_timeout(packet.clone(), *timeout),
                    None => sender
                        .send(packet.clone())
                        .map_err(|e| SendTimeoutError::Disconnected(e.into_inner())),
                };
                result.map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => {
                        Error::delivery(self.name.as_str(), "channel full, send timed out")
                    }
                    SendTimeoutError::Disconnected(_) => {
                        Error::delivery(self.name.as_str(), "receiver disconnected")
                    }
                })
            }
            SinkKind::Callback(f) => {
                f(packet);
                Ok(())
            }
        }
    }

    /// Flush file-backed sinks
    pub fn flush(&self) -> Result<()> {
        match &self.kind {
            SinkKind::Writer(handle) => handle.flush(),
            SinkKind::Templated { by_path, .. } => first_error(by_path.iter().map(|h| h.value().flush())),
            _ => Ok(()),
        }
    }

    /// Release the leases held by this sink
    pub fn release(&self) -> Result<()> {
        match &self.kind {
            SinkKind::Writer(handle) => handle.release(),
            SinkKind::Templated {
                by_path,
                by_interface,
                ..
            } => first_error(
                by_interface
                    .iter()
                    .map(|h| h.value().release())
                    .chain(by_path.iter().map(|h| h.value().release())),
            ),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sink({})", self.name)
    }
}

/// Run every operation, return the first failure
pub(crate) fn first_error<I: IntoIterator<Item = Result<()>>>(results: I) -> Result<()> {
    let mut first = None;
    for result in results {
        if let Err(e) = result {
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
