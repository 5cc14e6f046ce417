//! Packet filters
//!
//! A capture can be narrowed in three ways, modelled by [`Filter`]:
//!
//! - a raw BPF program, attached to the tap socket in the kernel
//! - a libpcap expression, compiled to a BPF program at attach time
//! - an in-process predicate over the captured packet
//!
//! At most one kernel-level program is allowed per capture; predicates can be
//! stacked and are evaluated in registration order. Interface selection is a
//! separate, attach-time predicate ([`InterfacePredicate`]).
//!
//! The free functions at the bottom build common filter expressions.

use std::fmt;
use std::sync::Arc;
use nstap_core::{CapturedPacket, Error, InterfaceHandle, Result};

use crate::bpf::BpfProgram;

/// In-process packet predicate
pub type PacketPredicate = Arc<dyn Fn(&CapturedPacket) -> bool + Send + Sync>;

/// Attach-time interface selection predicate
pub type InterfacePredicate = Arc<dyn Fn(&InterfaceHandle) -> bool + Send + Sync>;

/// A filter as supplied by the user
#[derive(Clone)]
pub enum Filter {
    /// Pre-built BPF program
    Bytecode(BpfProgram),
    /// libpcap filter expression
    Expression(String),
    /// Arbitrary decision function
    Predicate(PacketPredicate),
}

impl Filter {
    /// Filter from a predicate closure
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&CapturedPacket) -> bool + Send + Sync + 'static,
    {
        Filter::Predicate(Arc::new(f))
    }

    /// Whether this filter runs at kernel level
    pub fn is_kernel(&self) -> bool {
        !matches!(self, Filter::Predicate(_))
    }

    /// Compile into an evaluable form
    ///
    /// Expression syntax errors surface here, never per packet.
    pub fn compile(&self, snaplen: u32) -> Result<CompiledFilter> {
        match self {
            Filter::Bytecode(program) => {
                let mut program = program.clone();
                program.clamp_snaplen(snaplen);
                Ok(CompiledFilter::Kernel(program))
            }
            Filter::Expression(expr) => Ok(CompiledFilter::Kernel(BpfProgram::compile(expr, snaplen)?)),
            Filter::Predicate(f) => Ok(CompiledFilter::InProcess(f.clone())),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Bytecode(p) => write!(f, "Bytecode({} instructions)", p.len()),
            Filter::Expression(e) => write!(f, "Expression({:?})", e),
            Filter::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// A filter ready for evaluation
#[derive(Clone)]
pub enum CompiledFilter {
    Kernel(BpfProgram),
    InProcess(PacketPredicate),
}

impl CompiledFilter {
    /// Evaluate against a captured packet
    pub fn matches(&self, packet: &CapturedPacket) -> bool {
        match self {
            CompiledFilter::Kernel(program) => program.matches(packet.data()),
            CompiledFilter::InProcess(f) => f(packet),
        }
    }
}

/// The complete filtering stage of one capture
#[derive(Clone, Default)]
pub struct FilterChain {
    kernel: Option<BpfProgram>,
    predicates: Vec<PacketPredicate>,
}

impl FilterChain {
    /// Compile a list of filters into a chain
    ///
    /// Fails if a filter does not compile or more than one kernel-level
    /// filter is given.
    pub fn compile(filters: &[Filter], snaplen: u32) -> Result<Self> {
        let mut chain = Self::default();

        for filter in filters {
            match filter.compile(snaplen)? {
                CompiledFilter::Kernel(program) => {
                    if chain.kernel.is_some() {
                        return Err(Error::filter("only one kernel-level filter is allowed per capture"));
                    }
                    chain.kernel = Some(program);
                }
                CompiledFilter::InProcess(f) => chain.predicates.push(f),
            }
        }

        Ok(chain)
    }

    /// Kernel-level program, if any
    pub fn kernel(&self) -> Option<&BpfProgram> {
        self.kernel.as_ref()
    }

    /// Number of in-process predicates
    pub fn predicate_count(&self) -> usize {
        self.predicates.len()
    }

    /// Whether a packet passes every stage
    ///
    /// The kernel program is re-evaluated here as well: frames queued on a
    /// socket before its filter was attached must not slip through.
    pub fn matches(&self, packet: &CapturedPacket) -> bool {
        if let Some(program) = &self.kernel {
            if !program.matches(packet.data()) {
                return false;
            }
        }
        self.predicates.iter().all(|f| f(packet))
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("kernel", &self.kernel.as_ref().map(|p| p.len()))
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

/// Select interfaces whose name starts with `prefix`
pub fn interface_prefix(prefix: &str) -> InterfacePredicate {
    let prefix = prefix.to_string();
    Arc::new(move |iface: &InterfaceHandle| iface.name.starts_with(&prefix))
}

/// Select interfaces of the named nodes
pub fn interface_nodes(nodes: &[&str]) -> InterfacePredicate {
    let nodes: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
    Arc::new(move |iface: &InterfaceHandle| nodes.iter().any(|n| *n == iface.node))
}

/// Predicate accepting ICMPv6 echo requests and replies
pub fn icmp6_echo_predicate() -> Filter {
    Filter::predicate(|packet| packet.decode().is_icmpv6_echo())
}

/// ICMPv6 echo request / reply
pub fn icmp6_echo() -> String {
    "icmp6[icmp6type]=icmp6-echo || icmp6[icmp6type]=icmp6-echoreply".to_string()
}

/// IPv6 neighbor discovery
pub fn ipv6_nd() -> String {
    "icmp6 and (ip6[40] == 133 or ip6[40] == 134 or ip6[40] == 135 or ip6[40] == 136)".to_string()
}

/// ARP
pub fn arp() -> String {
    "arp".to_string()
}

/// IPv4 ICMP
pub fn icmp() -> String {
    "icmp".to_string()
}

/// TCP port (source or destination)
pub fn tcp_port(port: u16) -> String {
    format!("tcp port {}", port)
}

/// UDP port (source or destination)
pub fn udp_port(port: u16) -> String {
    format!("udp port {}", port)
}

/// Source or destination host
pub fn host(ip: &str) -> String {
    format!("host {}", ip)
}

/// Combine multiple filters with AND logic
pub fn combine_filters(filters: &[&str]) -> String {
    join(filters, " and ")
}

/// Combine multiple filters with OR logic
pub fn combine_filters_or(filters: &[&str]) -> String {
    join(filters, " or ")
}

/// Negate a filter
pub fn not_filter(filter: &str) -> String {
    format!("not ({})", filter)
}

fn join(filters: &[&str], sep: &str) -> String {
    filters
        .iter()
        .map(|f| format!("({})", f))
        .collect::<Vec<_>>()
        .join(sep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpf::BpfInstruction;
    use bytes::Bytes;
    use std::time::SystemTime;

    fn packet(frame: Vec<u8>) -> CapturedPacket {
        CapturedPacket::new(
            Arc::new(InterfaceHandle::new("h1", "veth0")),
            Bytes::from(frame),
            SystemTime::now(),
        )
    }

    fn first_byte_is(value: u32) -> Filter {
        Filter::Bytecode(
            BpfProgram::new(vec![
                BpfInstruction::load_byte(0),
                BpfInstruction::jump_eq(value, 0, 1),
                BpfInstruction::ret(u32::MAX),
                BpfInstruction::ret(0),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn test_chain_applies_kernel_then_predicates() {
        let chain = FilterChain::compile(
            &[
                first_byte_is(7),
                Filter::predicate(|p| p.len() > 2),
            ],
            1600,
        )
        .unwrap();

        assert!(chain.kernel().is_some());
        assert_eq!(chain.predicate_count(), 1);
        assert!(chain.matches(&packet(vec![7, 0, 0])));
        assert!(!chain.matches(&packet(vec![7, 0])));
        assert!(!chain.matches(&packet(vec![8, 0, 0])));
    }

    #[test]
    fn test_predicates_short_circuit_in_order() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let chain = FilterChain::compile(
            &[
                Filter::predicate(|_| false),
                Filter::predicate(move |_| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    true
                }),
            ],
            1600,
        )
        .unwrap();

        assert!(!chain.matches(&packet(vec![0])));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_second_kernel_filter_rejected() {
        let err = FilterChain::compile(&[first_byte_is(1), first_byte_is(2)], 1600).unwrap_err();
        assert!(matches!(err, Error::Filter(_)));
    }

    #[test]
    fn test_empty_chain_accepts_everything() {
        let chain = FilterChain::compile(&[], 1600).unwrap();
        assert!(chain.matches(&packet(vec![])));
    }

    #[test]
    fn test_bad_expression_fails_compile() {
        let err = Filter::Expression("tcp port port".into()).compile(1600).err();
        assert!(matches!(err, Some(Error::Filter(_))));
    }

    #[test]
    fn test_interface_selection_helpers() {
        let veth = interface_prefix("veth");
        assert!(veth(&InterfaceHandle::new("sw1", "veth-h1")));
        assert!(!veth(&InterfaceHandle::new("h1", "eth0")));

        let nodes = interface_nodes(&["h1", "h2"]);
        assert!(nodes(&InterfaceHandle::new("h2", "veth0")));
        assert!(!nodes(&InterfaceHandle::new("sw1", "veth0")));
    }

    #[test]
    fn test_combine_filters() {
        assert_eq!(combine_filters(&["tcp", "port 80"]), "(tcp) and (port 80)");
        assert_eq!(combine_filters_or(&[&tcp_port(80), &udp_port(53)]), "(tcp port 80) or (udp port 53)");
        assert_eq!(combine_filters(&[]), "");
        assert_eq!(not_filter(&arp()), "not (arp)");
    }

    #[test]
    fn test_filter_kinds() {
        assert!(Filter::Expression(icmp6_echo()).is_kernel());
        assert!(!icmp6_echo_predicate().is_kernel());
    }
}
