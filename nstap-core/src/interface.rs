//! Interface handles
//!
//! An [`InterfaceHandle`] names one tap point: the emulated node that owns
//! the interface, the interface name inside that node's namespace, and the
//! addresses assigned to it. Handles are produced by whatever provisions the
//! namespaces and are treated as read-only identity here.

use ipnetwork::IpNetwork;
use pnet_datalink::{self, NetworkInterface};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Identity of an interface for bookkeeping purposes (node + interface name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceKey {
    /// Owning node name
    pub node: String,
    /// Interface name inside the node
    pub name: String,
}

impl fmt::Display for InterfaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.name)
    }
}

/// A virtual interface on an emulated node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceHandle {
    /// Name of the node owning the interface (e.g., "h1", "sw1")
    pub node: String,
    /// Interface name inside the node's namespace (e.g., "veth0")
    pub name: String,
    /// Addresses assigned to the interface
    pub addresses: Vec<IpNetwork>,
    /// Network namespace file to enter before opening the interface.
    /// `None` means the namespace of the calling process.
    pub netns: Option<PathBuf>,
}

impl InterfaceHandle {
    /// Create a handle for an interface in the caller's namespace
    pub fn new<N: Into<String>, I: Into<String>>(node: N, name: I) -> Self {
        Self {
            node: node.into(),
            name: name.into(),
            addresses: Vec::new(),
            netns: None,
        }
    }

    /// Attach addresses to the handle
    pub fn with_addresses<A: IntoIterator<Item = IpNetwork>>(mut self, addresses: A) -> Self {
        self.addresses.extend(addresses);
        self
    }

    /// Set the namespace file the interface lives in
    pub fn in_netns<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.netns = Some(path.as_ref().to_path_buf());
        self
    }

    /// Bookkeeping identity of this handle
    pub fn key(&self) -> InterfaceKey {
        InterfaceKey {
            node: self.node.clone(),
            name: self.name.clone(),
        }
    }

    /// First IPv4 address assigned to the interface
    pub fn primary_ipv4(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .map(|net| net.ip())
            .find(|ip| ip.is_ipv4())
    }

    /// First IPv6 address assigned to the interface
    pub fn primary_ipv6(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .map(|net| net.ip())
            .find(|ip| ip.is_ipv6())
    }

    /// Build a handle from an interface seen in the current namespace
    pub fn from_network_interface(node: &str, iface: &NetworkInterface) -> Self {
        Self {
            node: node.to_string(),
            name: iface.name.clone(),
            addresses: iface.ips.clone(),
            netns: None,
        }
    }

    /// List the interfaces of the current namespace as handles owned by `node`
    ///
    /// Loopback and interfaces that are down are skipped.
    pub fn discover(node: &str) -> Vec<Self> {
        pnet_datalink::interfaces()
            .iter()
            .filter(|iface| iface.is_up() && !iface.is_loopback())
            .map(|iface| Self::from_network_interface(node, iface))
            .collect()
    }
}

impl fmt::Display for InterfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.name)
    }
}
