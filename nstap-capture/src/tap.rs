//! Taps
//!
//! A tap yields the frames passing one interface. Each tap runs on its own
//! worker thread; [`TapOpener::open`] is called on that thread, which lets
//! the pcap opener move the thread into the interface's network namespace
//! before opening the device.

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use nstap_core::{Error, InterfaceHandle, InterfaceKey, Result};
use parking_lot::Mutex;
use pcap::{Active, Capture};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::bpf::BpfProgram;

/// A frame read from a tap
#[derive(Debug, Clone)]
pub struct Frame {
    /// Captured bytes
    pub data: Bytes,
    /// Length on the wire
    pub original_len: usize,
    /// Capture timestamp
    pub timestamp: SystemTime,
}

impl Frame {
    /// Frame captured now
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            original_len: data.len(),
            data,
            timestamp: SystemTime::now(),
        }
    }
}

/// Settings every tap of a capture is opened with
#[derive(Debug, Clone)]
pub struct TapSettings {
    /// Maximum bytes captured per frame
    pub snaplen: u32,
    /// Enable promiscuous mode
    pub promiscuous: bool,
    /// How long a read may block before the tap checks for shutdown
    pub read_timeout: Duration,
    /// Program attached to the socket in the kernel
    pub kernel_filter: Option<BpfProgram>,
}

/// Source of frames for one interface
pub trait TapSource: Send {
    /// The interface this tap observes
    fn interface(&self) -> &Arc<InterfaceHandle>;

    /// Next frame; `None` when the read timed out
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Opens taps
pub trait TapOpener: Send + Sync {
    /// Open a tap on `interface`, on the calling worker thread
    fn open(
        &self,
        interface: Arc<InterfaceHandle>,
        settings: &TapSettings,
    ) -> Result<Box<dyn TapSource>>;
}

/// Opens live pcap captures
#[derive(Debug, Clone, Copy, Default)]
pub struct PcapTapOpener;

impl TapOpener for PcapTapOpener {
    fn open(
        &self,
        interface: Arc<InterfaceHandle>,
        settings: &TapSettings,
    ) -> Result<Box<dyn TapSource>> {
        if let Some(netns) = &interface.netns {
            enter_netns(netns)?;
        }

        let capture = Capture::from_device(interface.name.as_str())
            .map_err(|e| Error::capture(format!("{}: failed to create capture: {}", interface, e)))?
            .promisc(settings.promiscuous)
            .snaplen(settings.snaplen.min(i32::MAX as u32) as i32)
            .timeout(settings.read_timeout.as_millis().min(i32::MAX as u128) as i32)
            .immediate_mode(true)
            .open()
            .map_err(|e| Error::capture(format!("{}: failed to open capture: {}", interface, e)))?;

        if let Some(program) = &settings.kernel_filter {
            attach_socket_filter(&capture, program)?;
            debug!(interface = %interface, instructions = program.len(), "attached kernel filter");
        }

        info!(interface = %interface, "tap opened");
        Ok(Box::new(PcapTap { interface, capture }))
    }
}

struct PcapTap {
    interface: Arc<InterfaceHandle>,
    capture: Capture<Active>,
}

impl TapSource for PcapTap {
    fn interface(&self) -> &Arc<InterfaceHandle> {
        &self.interface
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.capture.next_packet() {
            Ok(packet) => Ok(Some(Frame {
                data: Bytes::copy_from_slice(packet.data),
                original_len: packet.header.len as usize,
                timestamp: timeval_to_system_time(
                    packet.header.ts.tv_sec as i64,
                    packet.header.ts.tv_usec as i64,
                ),
            })),
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(Error::capture(format!("{}: {}", self.interface, e))),
        }
    }
}

fn timeval_to_system_time(secs: i64, micros: i64) -> SystemTime {
    if secs < 0 || micros < 0 {
        return UNIX_EPOCH;
    }
    UNIX_EPOCH + Duration::from_secs(secs as u64) + Duration::from_micros(micros as u64)
}

#[cfg(target_os = "linux")]
fn enter_netns(path: &std::path::Path) -> Result<()> {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    let file = File::open(path)
        .map_err(|e| Error::capture(format!("cannot open namespace {}: {}", path.display(), e)))?;
    // SAFETY: the descriptor stays open for the duration of the call
    let rc = unsafe { libc::setns(file.as_raw_fd(), libc::CLONE_NEWNET) };
    if rc != 0 {
        return Err(Error::capture(format!(
            "cannot enter namespace {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    debug!(netns = %path.display(), "entered network namespace");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enter_netns(path: &std::path::Path) -> Result<()> {
    Err(Error::capture(format!(
        "network namespaces are not supported on this platform ({})",
        path.display()
    )))
}

#[cfg(target_os = "linux")]
fn attach_socket_filter(capture: &Capture<Active>, program: &BpfProgram) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let mut filters = program.to_sock_filters();
    let fprog = libc::sock_fprog {
        len: filters.len() as libc::c_ushort,
        filter: filters.as_mut_ptr(),
    };

    // SAFETY: fprog points into `filters`, which outlives the call; the
    // kernel copies the program
    let rc = unsafe {
        libc::setsockopt(
            capture.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &fprog as *const libc::sock_fprog as *const libc::c_void,
            std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(Error::filter(format!(
            "kernel rejected filter program: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn attach_socket_filter(_capture: &Capture<Active>, _program: &BpfProgram) -> Result<()> {
    Err(Error::filter("kernel filter programs are only supported on Linux"))
}

/// In-memory tap fed through a channel
///
/// Frames sent to the [`MemoryTapFeed`] are read by the tap in order.
/// Dropping the feed ends the tap.
pub struct MemoryTap {
    interface: Arc<InterfaceHandle>,
    frames: Receiver<Frame>,
    timeout: Duration,
}

/// Sending half of a [`MemoryTap`]
#[derive(Debug, Clone)]
pub struct MemoryTapFeed {
    sender: Sender<Frame>,
}

impl MemoryTapFeed {
    /// Queue a frame
    pub fn send(&self, frame: Frame) -> Result<()> {
        self.sender
            .send(frame)
            .map_err(|_| Error::capture("memory tap closed"))
    }
}

impl MemoryTap {
    /// Create a tap and its feed
    pub fn new(interface: Arc<InterfaceHandle>, timeout: Duration) -> (Self, MemoryTapFeed) {
        let (sender, frames) = crossbeam_channel::unbounded();
        (
            Self {
                interface,
                frames,
                timeout,
            },
            MemoryTapFeed { sender },
        )
    }
}

impl TapSource for MemoryTap {
    fn interface(&self) -> &Arc<InterfaceHandle> {
        &self.interface
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.frames.recv_timeout(self.timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::capture(format!("{}: feed closed", self.interface)))
            }
        }
    }
}

/// Opener handing out [`MemoryTap`]s
///
/// Feeds are created up front with [`MemoryTapOpener::feed`]; the tap for
/// an interface is handed out once, to the first `open` call for it.
#[derive(Default)]
pub struct MemoryTapOpener {
    taps: Mutex<HashMap<InterfaceKey, Receiver<Frame>>>,
}

impl MemoryTapOpener {
    /// Create an empty opener
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the feed for an interface
    pub fn feed(&self, interface: &InterfaceHandle) -> MemoryTapFeed {
        let (sender, frames) = crossbeam_channel::unbounded();
        self.taps.lock().insert(interface.key(), frames);
        MemoryTapFeed { sender }
    }
}

impl TapOpener for MemoryTapOpener {
    fn open(
        &self,
        interface: Arc<InterfaceHandle>,
        settings: &TapSettings,
    ) -> Result<Box<dyn TapSource>> {
        let frames = self
            .taps
            .lock()
            .remove(&interface.key())
            .ok_or_else(|| Error::InterfaceNotFound(interface.to_string()))?;

        Ok(Box::new(MemoryTap {
            interface,
            frames,
            timeout: settings.read_timeout,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TapSettings {
        TapSettings {
            snaplen: 1600,
            promiscuous: false,
            read_timeout: Duration::from_millis(10),
            kernel_filter: None,
        }
    }

    #[test]
    fn test_memory_tap_reads_in_order() {
        let iface = Arc::new(InterfaceHandle::new("h1", "veth0"));
        let (mut tap, feed) = MemoryTap::new(iface, Duration::from_millis(10));
        feed.send(Frame::new(vec![1u8])).unwrap();
        feed.send(Frame::new(vec![2u8])).unwrap();

        assert_eq!(tap.next_frame().unwrap().unwrap().data, Bytes::from_static(&[1]));
        assert_eq!(tap.next_frame().unwrap().unwrap().data, Bytes::from_static(&[2]));
        assert!(tap.next_frame().unwrap().is_none());

        drop(feed);
        assert!(tap.next_frame().is_err());
    }

    #[test]
    fn test_memory_opener_hands_out_once() {
        let opener = MemoryTapOpener::new();
        let iface = InterfaceHandle::new("sw1", "veth-h1");
        let _feed = opener.feed(&iface);

        let iface = Arc::new(iface);
        assert!(opener.open(iface.clone(), &settings()).is_ok());
        assert!(matches!(
            opener.open(iface, &settings()),
            Err(Error::InterfaceNotFound(_))
        ));
    }

    #[test]
    fn test_timeval_conversion() {
        let ts = timeval_to_system_time(1, 500);
        assert_eq!(ts.duration_since(UNIX_EPOCH).unwrap(), Duration::from_micros(1_000_500));
        assert_eq!(timeval_to_system_time(-1, 0), UNIX_EPOCH);
    }

    #[test]
    fn test_pcap_opener_unknown_device() {
        let iface = Arc::new(InterfaceHandle::new("host", "nstap-no-such-if0"));
        assert!(PcapTapOpener.open(iface, &settings()).is_err());
    }
}
