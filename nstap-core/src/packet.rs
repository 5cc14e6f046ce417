//! Captured packet type
//!
//! Packets are kept as raw frames. Decoding into protocol layers is deferred
//! until something asks for it, and the result is cached on the packet so
//! several predicates or sinks can inspect the same frame cheaply.

use bytes::Bytes;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::icmp::IcmpPacket;
use pnet_packet::icmpv6::{Icmpv6Packet, Icmpv6Types};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use pnet_packet::Packet;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::InterfaceHandle;

/// A frame captured on one interface
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    /// Frame bytes (possibly truncated to the capture length)
    pub data: Bytes,
    /// Length of the frame on the wire
    pub original_len: usize,
    /// When the frame was captured
    pub timestamp: SystemTime,
    /// Interface the frame was captured on
    pub interface: Arc<InterfaceHandle>,
    summary: OnceLock<PacketSummary>,
}

impl CapturedPacket {
    /// Create a new packet
    pub fn new(interface: Arc<InterfaceHandle>, data: Bytes, timestamp: SystemTime) -> Self {
        let original_len = data.len();
        Self {
            data,
            original_len,
            timestamp,
            interface,
            summary: OnceLock::new(),
        }
    }

    /// Set the on-wire length when the captured bytes were truncated
    pub fn with_original_len(mut self, len: usize) -> Self {
        self.original_len = len.max(self.data.len());
        self
    }

    /// Get packet data as slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get captured length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if packet is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Capture timestamp as time since the Unix epoch
    pub fn since_epoch(&self) -> Duration {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }

    /// Decoded protocol summary, computed on first use
    pub fn decode(&self) -> &PacketSummary {
        self.summary.get_or_init(|| PacketSummary::decode(&self.data))
    }

    /// Whether the frame has already been decoded
    pub fn is_decoded(&self) -> bool {
        self.summary.get().is_some()
    }
}

/// Fields extracted from an Ethernet frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketSummary {
    /// EtherType of the frame
    pub ethertype: Option<u16>,
    /// Source IP address
    pub src_ip: Option<IpAddr>,
    /// Destination IP address
    pub dst_ip: Option<IpAddr>,
    /// IPv4 protocol / IPv6 next header
    pub ip_protocol: Option<u8>,
    /// ICMP or ICMPv6 message type
    pub icmp_type: Option<u8>,
    /// Transport source port
    pub src_port: Option<u16>,
    /// Transport destination port
    pub dst_port: Option<u16>,
}

impl PacketSummary {
    /// Decode an Ethernet frame as far as the transport header
    pub fn decode(frame: &[u8]) -> Self {
        let mut summary = Self::default();
        let Some(eth) = EthernetPacket::new(frame) else {
            return summary;
        };

        let ethertype = eth.get_ethertype();
        summary.ethertype = Some(ethertype.0);

        match ethertype {
            EtherTypes::Ipv4 => {
                if let Some(ip) = Ipv4Packet::new(eth.payload()) {
                    summary.src_ip = Some(IpAddr::V4(ip.get_source()));
                    summary.dst_ip = Some(IpAddr::V4(ip.get_destination()));
                    let proto = ip.get_next_level_protocol();
                    summary.ip_protocol = Some(proto.0);
                    summary.decode_transport(proto, ip.payload());
                }
            }
            EtherTypes::Ipv6 => {
                if let Some(ip) = Ipv6Packet::new(eth.payload()) {
                    summary.src_ip = Some(IpAddr::V6(ip.get_source()));
                    summary.dst_ip = Some(IpAddr::V6(ip.get_destination()));
                    let next = ip.get_next_header();
                    summary.ip_protocol = Some(next.0);
                    summary.decode_transport(next, ip.payload());
                }
            }
            _ => {}
        }

        summary
    }

    fn decode_transport(&mut self, proto: IpNextHeaderProtocol, payload: &[u8]) {
        match proto {
            IpNextHeaderProtocols::Icmp => {
                self.icmp_type = IcmpPacket::new(payload).map(|p| p.get_icmp_type().0);
            }
            IpNextHeaderProtocols::Icmpv6 => {
                self.icmp_type = Icmpv6Packet::new(payload).map(|p| p.get_icmpv6_type().0);
            }
            IpNextHeaderProtocols::Tcp => {
                if let Some(tcp) = TcpPacket::new(payload) {
                    self.src_port = Some(tcp.get_source());
                    self.dst_port = Some(tcp.get_destination());
                }
            }
            IpNextHeaderProtocols::Udp => {
                if let Some(udp) = UdpPacket::new(payload) {
                    self.src_port = Some(udp.get_source());
                    self.dst_port = Some(udp.get_destination());
                }
            }
            _ => {}
        }
    }

    /// ICMPv6 echo request or echo reply
    pub fn is_icmpv6_echo(&self) -> bool {
        self.ip_protocol == Some(IpNextHeaderProtocols::Icmpv6.0)
            && matches!(
                self.icmp_type,
                Some(t) if t == Icmpv6Types::EchoRequest.0 || t == Icmpv6Types::EchoReply.0
            )
    }
}
