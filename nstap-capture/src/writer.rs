//! Merge writer
//!
//! A [`MergeWriter`] serialises packets from any number of concurrently
//! running taps into one pcapng container. Each distinct interface gets an
//! Interface Description Block the first time a packet for it arrives (or
//! when it is registered explicitly); ids are handed out in first-seen order
//! and never reused. Registration and append happen under the same lock, so
//! a packet can never reference an interface that is not yet in the file and
//! records appear in the order they arrived at the writer.
//!
//! Writers are shared through [`WriterHandle`] leases. Cloning a handle
//! acquires a lease; [`WriterHandle::release`] (or dropping the handle) gives
//! it back. The file is flushed and closed when the last lease is released.

use nstap_core::{CapturedPacket, Error, InterfaceHandle, InterfaceKey, Result};
use parking_lot::Mutex;
use pcap_file::pcapng::blocks::enhanced_packet::{EnhancedPacketBlock, EnhancedPacketOption};
use pcap_file::pcapng::blocks::interface_description::{
    InterfaceDescriptionBlock, InterfaceDescriptionOption,
};
use pcap_file::pcapng::blocks::section_header::{SectionHeaderBlock, SectionHeaderOption};
use pcap_file::pcapng::{PcapNgBlock, PcapNgWriter};
use pcap_file::DataLink;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::template::NameTemplate;

/// Default maximum number of bytes stored per packet
pub const DEFAULT_SNAPLEN: u32 = 65535;

/// `if_tsresol` value for nanosecond timestamps
const TS_RESOLUTION_NANOS: u8 = 9;

/// Output a container can be written to
pub trait ContainerOutput: Write + Send {
    /// Make everything written so far durable
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl ContainerOutput for File {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_data()
    }
}

impl<W: ContainerOutput> ContainerOutput for BufWriter<W> {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.get_mut().sync()
    }
}

impl ContainerOutput for Vec<u8> {}

/// Options fixed when a container is created
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Free-text comment stored in the section header
    pub comment: Option<String>,
    /// Application name stored in the section header
    pub application: String,
    /// Snap length recorded for every interface
    pub snaplen: u32,
    /// How interfaces are named inside the container
    pub interface_name: NameTemplate,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            comment: None,
            application: format!("nstap {}", env!("CARGO_PKG_VERSION")),
            snaplen: DEFAULT_SNAPLEN,
            interface_name: NameTemplate::default_interface_name(),
        }
    }
}

impl WriterOptions {
    /// Set the section comment
    pub fn with_comment<S: Into<String>>(mut self, comment: S) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Set the snap length
    pub fn with_snaplen(mut self, snaplen: u32) -> Self {
        self.snaplen = snaplen;
        self
    }

    /// Set the interface naming template
    pub fn with_interface_name(mut self, template: NameTemplate) -> Self {
        self.interface_name = template;
        self
    }

    fn section_header(&self) -> SectionHeaderBlock<'static> {
        let mut options = vec![SectionHeaderOption::UserApplication(Cow::Owned(
            self.application.clone(),
        ))];
        if let Some(comment) = &self.comment {
            options.push(SectionHeaderOption::Comment(Cow::Owned(comment.clone())));
        }

        SectionHeaderBlock {
            options,
            ..Default::default()
        }
    }
}

struct WriterState {
    out: PcapNgWriter<Box<dyn ContainerOutput>>,
    interfaces: HashMap<InterfaceKey, u32>,
    pseudo: HashMap<String, u32>,
    next_id: u32,
    packets: u64,
    /// Set once a block write failed; the file may hold a partial block
    failed: Option<String>,
}

impl WriterState {
    fn write_block<'a, B: PcapNgBlock<'a>>(&mut self, block: B) -> Result<()> {
        if let Some(reason) = &self.failed {
            return Err(Error::Container(format!(
                "container is unusable after an earlier write failure: {}",
                reason
            )));
        }
        if let Err(e) = self.out.write_pcapng_block(block) {
            let reason = e.to_string();
            self.failed = Some(reason.clone());
            return Err(Error::Container(reason));
        }
        Ok(())
    }

    fn add_interface(
        &mut self,
        name: String,
        description: Option<String>,
        linktype: DataLink,
        snaplen: u32,
    ) -> Result<u32> {
        let mut options = vec![
            InterfaceDescriptionOption::IfName(Cow::Owned(name)),
            InterfaceDescriptionOption::IfTsResol(TS_RESOLUTION_NANOS),
        ];
        if let Some(description) = description {
            options.push(InterfaceDescriptionOption::IfDescription(Cow::Owned(description)));
        }

        let idb = InterfaceDescriptionBlock {
            linktype,
            snaplen,
            options,
        };
        self.write_block(idb)?;

        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    fn append(
        &mut self,
        id: u32,
        timestamp: Duration,
        data: &[u8],
        original_len: usize,
        comment: Option<&str>,
    ) -> Result<()> {
        let options = comment
            .map(|c| vec![EnhancedPacketOption::Comment(Cow::Owned(c.to_string()))])
            .unwrap_or_default();

        let epb = EnhancedPacketBlock {
            interface_id: id,
            timestamp,
            original_len: original_len as u32,
            data: Cow::Borrowed(data),
            options,
        };
        self.write_block(epb)?;
        self.packets += 1;
        Ok(())
    }
}

fn container_error(e: pcap_file::PcapError) -> Error {
    Error::Container(e.to_string())
}

/// Shared pcapng writer
pub struct MergeWriter {
    label: String,
    options: WriterOptions,
    state: Mutex<Option<WriterState>>,
    leases: AtomicUsize,
}

impl MergeWriter {
    /// Create (truncate) a container file and return the first lease
    pub fn create<P: AsRef<Path>>(path: P, options: WriterOptions) -> Result<WriterHandle> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| {
            Error::Container(format!("cannot create {}: {}", path.display(), e))
        })?;

        let handle = Self::from_writer(path.display().to_string(), BufWriter::new(file), options)?;
        info!(path = %path.display(), "created capture container");
        Ok(handle)
    }

    /// Write a container to an arbitrary output
    ///
    /// `label` identifies the writer in logs and errors.
    pub fn from_writer<W: ContainerOutput + 'static>(
        label: impl Into<String>,
        output: W,
        options: WriterOptions,
    ) -> Result<WriterHandle> {
        let boxed: Box<dyn ContainerOutput> = Box::new(output);
        let out = PcapNgWriter::with_section_header(boxed, options.section_header())
            .map_err(container_error)?;

        let writer = Arc::new(Self {
            label: label.into(),
            options,
            state: Mutex::new(Some(WriterState {
                out,
                interfaces: HashMap::new(),
                pseudo: HashMap::new(),
                next_id: 0,
                packets: 0,
                failed: None,
            })),
            leases: AtomicUsize::new(1),
        });

        Ok(WriterHandle::from_lease(writer))
    }

    /// Writer label (usually the file path)
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Options the container was created with
    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    /// Register an interface, returning its container id
    ///
    /// Registering the same interface again returns the same id.
    pub fn register_interface(&self, handle: &InterfaceHandle) -> Result<u32> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(|| self.closed())?;
        self.interface_id(state, handle)
    }

    fn interface_id(&self, state: &mut WriterState, handle: &InterfaceHandle) -> Result<u32> {
        let key = handle.key();
        if let Some(id) = state.interfaces.get(&key) {
            return Ok(*id);
        }

        let name = self.options.interface_name.render(handle);
        let description = if handle.addresses.is_empty() {
            None
        } else {
            Some(
                handle
                    .addresses
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        };

        let id = state.add_interface(name, description, DataLink::ETHERNET, self.options.snaplen)?;
        debug!(writer = %self.label, interface = %key, id, "registered interface");
        state.interfaces.insert(key, id);
        Ok(id)
    }

    /// Append a packet, registering its interface on first sight
    ///
    /// Returns the interface id the record references.
    pub fn write(&self, packet: &CapturedPacket) -> Result<u32> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(|| self.closed())?;

        let id = self.interface_id(state, &packet.interface)?;
        state.append(id, packet.since_epoch(), packet.data(), packet.original_len, None)?;
        Ok(id)
    }

    /// Register a named pseudo-interface with its own link type
    pub fn register_pseudo(&self, name: &str, linktype: DataLink) -> Result<u32> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(|| self.closed())?;
        self.pseudo_id(state, name, linktype)
    }

    fn pseudo_id(&self, state: &mut WriterState, name: &str, linktype: DataLink) -> Result<u32> {
        if let Some(id) = state.pseudo.get(name) {
            return Ok(*id);
        }
        let id = state.add_interface(name.to_string(), None, linktype, self.options.snaplen)?;
        debug!(writer = %self.label, interface = name, id, "registered pseudo-interface");
        state.pseudo.insert(name.to_string(), id);
        Ok(id)
    }

    /// Append a record on a pseudo-interface, with an optional packet comment
    pub fn write_with_link(
        &self,
        name: &str,
        linktype: DataLink,
        timestamp: Duration,
        data: &[u8],
        comment: Option<&str>,
    ) -> Result<u32> {
        let mut guard = self.state.lock();
        let state = guard.as_mut().ok_or_else(|| self.closed())?;

        let id = self.pseudo_id(state, name, linktype)?;
        state.append(id, timestamp, data, data.len(), comment)?;
        Ok(id)
    }

    /// Make every record written so far durable
    ///
    /// Flushing a closed writer is a no-op.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.state.lock();
        match guard.as_mut() {
            Some(state) => state.out.get_mut().sync().map_err(Error::from),
            None => Ok(()),
        }
    }

    /// Number of interfaces in the container
    pub fn interface_count(&self) -> usize {
        self.state
            .lock()
            .as_ref()
            .map(|s| s.next_id as usize)
            .unwrap_or(0)
    }

    /// Number of records appended so far
    pub fn packet_count(&self) -> u64 {
        self.state.lock().as_ref().map(|s| s.packets).unwrap_or(0)
    }

    /// Whether the last lease has been released
    pub fn is_closed(&self) -> bool {
        self.state.lock().is_none()
    }

    /// Outstanding leases
    pub fn leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    fn acquire(&self) {
        self.leases.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) -> Result<()> {
        let previous = self.leases.fetch_sub(1, Ordering::SeqCst);
        if previous > 1 {
            return Ok(());
        }
        self.close()
    }

    fn close(&self) -> Result<()> {
        let Some(mut state) = self.state.lock().take() else {
            return Ok(());
        };

        let result = state.out.get_mut().sync().map_err(Error::from);
        info!(
            writer = %self.label,
            interfaces = state.next_id,
            packets = state.packets,
            "closed capture container"
        );
        result
    }

    fn closed(&self) -> Error {
        Error::WriterClosed(self.label.clone())
    }
}

impl fmt::Debug for MergeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeWriter")
            .field("label", &self.label)
            .field("leases", &self.leases())
            .finish()
    }
}

/// A lease on a [`MergeWriter`]
pub struct WriterHandle {
    writer: Arc<MergeWriter>,
    released: AtomicBool,
}

impl WriterHandle {
    fn from_lease(writer: Arc<MergeWriter>) -> Self {
        Self {
            writer,
            released: AtomicBool::new(false),
        }
    }

    /// Give the lease back
    ///
    /// Releasing the last lease flushes and closes the container; the
    /// result of that final flush is returned. Releasing twice is a no-op.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.writer.release()
    }

    /// Whether this lease has been given back
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// The shared writer
    pub fn writer(&self) -> &MergeWriter {
        &self.writer
    }

    /// Register an interface
    pub fn register_interface(&self, handle: &InterfaceHandle) -> Result<u32> {
        self.check()?;
        self.writer.register_interface(handle)
    }

    /// Append a packet
    pub fn write(&self, packet: &CapturedPacket) -> Result<u32> {
        self.check()?;
        self.writer.write(packet)
    }

    /// Append a record on a pseudo-interface
    pub fn write_with_link(
        &self,
        name: &str,
        linktype: DataLink,
        timestamp: Duration,
        data: &[u8],
        comment: Option<&str>,
    ) -> Result<u32> {
        self.check()?;
        self.writer.write_with_link(name, linktype, timestamp, data, comment)
    }

    /// Flush the container
    pub fn flush(&self) -> Result<()> {
        self.writer.flush()
    }

    /// Whether two handles lease the same writer
    pub fn same_writer(&self, other: &WriterHandle) -> bool {
        Arc::ptr_eq(&self.writer, &other.writer)
    }

    /// Container path, when the writer was created from a file
    pub fn path(&self) -> PathBuf {
        PathBuf::from(self.writer.label())
    }

    fn check(&self) -> Result<()> {
        if self.is_released() {
            return Err(self.writer.closed());
        }
        Ok(())
    }
}

impl Clone for WriterHandle {
    fn clone(&self) -> Self {
        self.writer.acquire();
        Self::from_lease(self.writer.clone())
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(writer = %self.writer.label, error = %e, "failed to close capture container");
        }
    }
}

impl fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterHandle")
            .field("writer", &self.writer.label)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::read_container;
    use bytes::Bytes;
    use std::thread;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn packet(node: &str, iface: &str, payload: &[u8]) -> CapturedPacket {
        CapturedPacket::new(
            Arc::new(InterfaceHandle::new(node, iface)),
            Bytes::copy_from_slice(payload),
            SystemTime::now(),
        )
    }

    /// Output that fails once `budget` bytes have been written
    struct Broken {
        budget: usize,
    }

    impl Write for Broken {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ContainerOutput for Broken {}

    #[test]
    fn test_registration_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let handle = MergeWriter::create(tmp.path().join("a.pcapng"), WriterOptions::default()).unwrap();

        let h1 = InterfaceHandle::new("h1", "veth0");
        let h2 = InterfaceHandle::new("h2", "veth0");
        assert_eq!(handle.register_interface(&h1).unwrap(), 0);
        assert_eq!(handle.register_interface(&h2).unwrap(), 1);
        assert_eq!(handle.register_interface(&h1).unwrap(), 0);
        assert_eq!(handle.writer().interface_count(), 2);
    }

    #[test]
    fn test_ids_assigned_first_seen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("order.pcapng");
        let handle = MergeWriter::create(&path, WriterOptions::default().with_comment("first seen")).unwrap();

        assert_eq!(handle.write(&packet("sw1", "veth-h2", b"a")).unwrap(), 0);
        assert_eq!(handle.write(&packet("h1", "veth0", b"b")).unwrap(), 1);
        assert_eq!(handle.write(&packet("sw1", "veth-h2", b"c")).unwrap(), 0);
        handle.release().unwrap();

        let container = read_container(&path).unwrap();
        assert_eq!(container.comment.as_deref(), Some("first seen"));
        assert_eq!(container.interface_names(), vec!["sw1/veth-h2", "h1/veth0"]);
        let ids: Vec<u32> = container.records.iter().map(|r| r.interface_id).collect();
        assert_eq!(ids, vec![0, 1, 0]);
    }

    #[test]
    fn test_concurrent_registration_yields_one_id() {
        let tmp = TempDir::new().unwrap();
        let handle = MergeWriter::create(tmp.path().join("race.pcapng"), WriterOptions::default()).unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                thread::spawn(move || handle.register_interface(&InterfaceHandle::new("h1", "veth0")).unwrap())
            })
            .collect();

        let ids: Vec<u32> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert!(ids.iter().all(|id| *id == 0));
        assert_eq!(handle.writer().interface_count(), 1);
    }

    #[test]
    fn test_per_interface_order_preserved_across_threads() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("merge.pcapng");
        let handle = MergeWriter::create(&path, WriterOptions::default()).unwrap();

        let threads: Vec<_> = ["veth0", "veth1", "veth2"]
            .into_iter()
            .map(|iface| {
                let handle = handle.clone();
                thread::spawn(move || {
                    for i in 0u8..50 {
                        handle.write(&packet("sw1", iface, &[i])).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        handle.release().unwrap();

        let container = read_container(&path).unwrap();
        assert_eq!(container.records.len(), 150);
        for name in ["sw1/veth0", "sw1/veth1", "sw1/veth2"] {
            let payloads: Vec<u8> = container.records_for(name).iter().map(|r| r.data[0]).collect();
            assert_eq!(payloads, (0u8..50).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_last_release_closes() {
        let tmp = TempDir::new().unwrap();
        let first = MergeWriter::create(tmp.path().join("lease.pcapng"), WriterOptions::default()).unwrap();
        let second = first.clone();
        assert_eq!(first.writer().leases(), 2);

        first.release().unwrap();
        assert!(matches!(first.write(&packet("h1", "veth0", b"x")), Err(Error::WriterClosed(_))));
        assert!(second.write(&packet("h1", "veth0", b"x")).is_ok());

        second.release().unwrap();
        assert!(second.writer().is_closed());
        assert!(matches!(second.write(&packet("h1", "veth0", b"y")), Err(Error::WriterClosed(_))));
        // releasing twice is harmless
        second.release().unwrap();
    }

    #[test]
    fn test_flush_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("flush.pcapng");
        let handle = MergeWriter::create(&path, WriterOptions::default()).unwrap();
        handle.write(&packet("h1", "veth0", b"one")).unwrap();
        handle.write(&packet("h2", "veth0", b"two")).unwrap();

        handle.flush().unwrap();
        handle.flush().unwrap();

        let container = read_container(&path).unwrap();
        assert_eq!(container.records.len(), 2);
        assert_eq!(handle.writer().packet_count(), 2);
    }

    #[test]
    fn test_pseudo_interface_records_comment() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pseudo.pcapng");
        let handle = MergeWriter::create(&path, WriterOptions::default()).unwrap();

        handle.write(&packet("h1", "veth0", b"frame")).unwrap();
        let id = handle
            .write_with_link("tracer", DataLink::USER0, Duration::from_secs(1), b"{}", Some("hello"))
            .unwrap();
        assert_eq!(id, 1);
        handle.release().unwrap();

        let container = read_container(&path).unwrap();
        assert_eq!(container.interfaces[1].name, "tracer");
        assert_eq!(container.interfaces[1].linktype, DataLink::USER0);
        assert_eq!(container.records[1].comment.as_deref(), Some("hello"));
    }

    #[test]
    fn test_unwritable_path_fails() {
        let err = MergeWriter::create("/nonexistent/dir/x.pcapng", WriterOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Container(_)));
    }

    #[test]
    fn test_header_failure_fails_creation() {
        let result = MergeWriter::from_writer("broken", Broken { budget: 0 }, WriterOptions::default());
        assert!(matches!(result, Err(Error::Container(_))));
    }

    #[test]
    fn test_append_failure_is_returned() {
        let handle = MergeWriter::from_writer("broken", Broken { budget: 200 }, WriterOptions::default()).unwrap();
        handle.register_interface(&InterfaceHandle::new("h1", "veth0")).unwrap();

        let err = handle.write(&packet("h1", "veth0", &[0u8; 1000])).unwrap_err();
        assert!(matches!(err, Error::Container(_)));
        assert_eq!(handle.writer().packet_count(), 0);
    }

    #[test]
    fn test_partial_interface_block_poisons_writer() {
        // enough for the section header, not for a whole interface block
        let handle = MergeWriter::from_writer("broken", Broken { budget: 80 }, WriterOptions::default()).unwrap();

        let err = handle.register_interface(&InterfaceHandle::new("h1", "veth0")).unwrap_err();
        assert!(matches!(err, Error::Container(_)));
        assert_eq!(handle.writer().interface_count(), 0);

        // later blocks are refused instead of landing after the partial one
        for (node, iface) in [("h1", "veth0"), ("h2", "veth0")] {
            let err = handle.write(&packet(node, iface, b"x")).unwrap_err();
            assert!(err.to_string().contains("earlier write failure"), "{err}");
        }
        assert_eq!(handle.writer().interface_count(), 0);
        assert_eq!(handle.writer().packet_count(), 0);
    }
}
