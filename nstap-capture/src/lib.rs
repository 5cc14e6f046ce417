//! Multi-interface packet capture for nstap
//!
//! This crate taps virtual interfaces spread across network namespaces,
//! filters what they see and fans accepted packets out to sinks.
//!
//! ## Features
//!
//! - **Filters**: kernel BPF programs, libpcap expressions and in-process predicates
//! - **Sinks**: pcapng files (owned, shared or templated per interface), channels, callbacks
//! - **Merge Writer**: one pcapng container fed by many concurrent taps
//! - **Statistics**: live counters for every capture
//!
//! ## Example
//!
//! ```no_run
//! use nstap_capture::{filter, Capturer, CaptureConfig};
//! use nstap_core::InterfaceHandle;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let interfaces = vec![
//!     InterfaceHandle::new("h1", "veth0").in_netns("/run/netns/nstap-lab-h1"),
//!     InterfaceHandle::new("h2", "veth0").in_netns("/run/netns/nstap-lab-h2"),
//! ];
//!
//! let config = CaptureConfig::builder()
//!     .to_file("ping.pcapng")
//!     .filter_expression(filter::icmp6_echo())
//!     .filter_interfaces(filter::interface_prefix("veth"))
//!     .length(1600)
//!     .comment("h1 pings h2")
//!     .build()?;
//!
//! let capture = Capturer::attach(&interfaces, config)?;
//! // ... run traffic ...
//! capture.flush()?;
//! println!("captured {} packets", capture.count());
//! capture.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod bpf;
pub mod capture;
pub mod filter;
pub mod reader;
pub mod sink;
pub mod stats;
pub mod tap;
pub mod template;
pub mod writer;

// Re-export main types
pub use bpf::{BpfInstruction, BpfProgram};
pub use capture::{CaptureBuilder, CaptureConfig, CaptureState, Capturer};
pub use filter::{CompiledFilter, Filter, FilterChain, InterfacePredicate, PacketPredicate};
pub use reader::{read_container, Container, ContainerInterface, ContainerRecord};
pub use sink::{FileTarget, PacketCallback, Sink, SinkDescriptor};
pub use stats::{CaptureStats, StatsAccumulator};
pub use tap::{
    Frame, MemoryTap, MemoryTapFeed, MemoryTapOpener, PcapTapOpener, TapOpener, TapSettings,
    TapSource,
};
pub use template::NameTemplate;
pub use writer::{ContainerOutput, MergeWriter, WriterHandle, WriterOptions};

pub use pcap_file::DataLink;
