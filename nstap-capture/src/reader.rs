//! Reading capture containers back
//!
//! Used by tests and the CLI to inspect what a [`MergeWriter`] produced.
//!
//! [`MergeWriter`]: crate::writer::MergeWriter

use nstap_core::{Error, Result};
use pcap_file::pcapng::blocks::enhanced_packet::EnhancedPacketOption;
use pcap_file::pcapng::blocks::interface_description::InterfaceDescriptionOption;
use pcap_file::pcapng::blocks::section_header::SectionHeaderOption;
use pcap_file::pcapng::{Block, PcapNgReader};
use pcap_file::DataLink;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::Duration;

/// One interface of a container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInterface {
    /// Container id
    pub id: u32,
    /// `if_name` option, empty if absent
    pub name: String,
    /// `if_description` option
    pub description: Option<String>,
    /// Link type
    pub linktype: DataLink,
    /// Snap length
    pub snaplen: u32,
}

/// One packet record of a container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRecord {
    /// Interface id the record references
    pub interface_id: u32,
    /// Capture timestamp
    pub timestamp: Duration,
    /// Length on the wire
    pub original_len: u32,
    /// Stored bytes
    pub data: Vec<u8>,
    /// Packet comment
    pub comment: Option<String>,
}

/// Contents of a container
#[derive(Debug, Clone, Default)]
pub struct Container {
    /// Section comment
    pub comment: Option<String>,
    /// Writing application
    pub application: Option<String>,
    /// Interfaces in id order
    pub interfaces: Vec<ContainerInterface>,
    /// Records in file order
    pub records: Vec<ContainerRecord>,
}

impl Container {
    /// Interface names in id order
    pub fn interface_names(&self) -> Vec<String> {
        self.interfaces.iter().map(|i| i.name.clone()).collect()
    }

    /// Name of the interface a record references
    pub fn interface_name(&self, record: &ContainerRecord) -> Option<&str> {
        self.interfaces
            .get(record.interface_id as usize)
            .map(|i| i.name.as_str())
    }

    /// Records of one interface, in file order
    pub fn records_for(&self, name: &str) -> Vec<&ContainerRecord> {
        self.records
            .iter()
            .filter(|r| self.interface_name(r) == Some(name))
            .collect()
    }

    /// Interface name of every record, in file order
    pub fn record_interfaces(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|r| self.interface_name(r).unwrap_or_default().to_string())
            .collect()
    }
}

/// Read a container file
pub fn read_container<P: AsRef<Path>>(path: P) -> Result<Container> {
    let file = File::open(path.as_ref())?;
    parse_container(BufReader::new(file))
}

/// Parse a container from any reader
///
/// Only the first section is read.
pub fn parse_container<R: Read>(input: R) -> Result<Container> {
    let mut reader = PcapNgReader::new(input).map_err(|e| Error::Container(e.to_string()))?;
    let mut container = Container::default();

    for option in &reader.section().options {
        match option {
            SectionHeaderOption::Comment(c) => container.comment = Some(c.to_string()),
            SectionHeaderOption::UserApplication(a) => container.application = Some(a.to_string()),
            _ => {}
        }
    }

    while let Some(block) = reader.next_block() {
        match block.map_err(|e| Error::Container(e.to_string()))? {
            Block::InterfaceDescription(idb) => {
                let mut interface = ContainerInterface {
                    id: container.interfaces.len() as u32,
                    name: String::new(),
                    description: None,
                    linktype: idb.linktype,
                    snaplen: idb.snaplen,
                };
                for option in &idb.options {
                    match option {
                        InterfaceDescriptionOption::IfName(n) => interface.name = n.to_string(),
                        InterfaceDescriptionOption::IfDescription(d) => {
                            interface.description = Some(d.to_string())
                        }
                        _ => {}
                    }
                }
                container.interfaces.push(interface);
            }
            Block::EnhancedPacket(epb) => {
                if epb.interface_id as usize >= container.interfaces.len() {
                    return Err(Error::Container(format!(
                        "record references unknown interface {}",
                        epb.interface_id
                    )));
                }
                let comment = epb.options.iter().find_map(|o| match o {
                    EnhancedPacketOption::Comment(c) => Some(c.to_string()),
                    _ => None,
                });
                container.records.push(ContainerRecord {
                    interface_id: epb.interface_id,
                    timestamp: epb.timestamp,
                    original_len: epb.original_len,
                    data: epb.data.to_vec(),
                    comment,
                });
            }
            Block::SectionHeader(_) => break,
            _ => {}
        }
    }

    Ok(container)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_is_rejected() {
        let err = parse_container(&b"definitely not pcapng"[..]).unwrap_err();
        assert!(matches!(err, Error::Container(_)));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(read_container("/nonexistent/x.pcapng"), Err(Error::Io(_))));
    }
}
