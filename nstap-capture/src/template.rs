//! Name templates
//!
//! Templates derive file names and container interface names from the
//! identity of an interface. Two variables are recognised, `{node}` and
//! `{interface}`; literal braces are written `{{` and `}}`.
//!
//! ```
//! use nstap_capture::NameTemplate;
//! use nstap_core::InterfaceHandle;
//!
//! let template = NameTemplate::parse("{node}_{interface}.pcapng").unwrap();
//! let handle = InterfaceHandle::new("h1", "veth0");
//! assert_eq!(template.render(&handle), "h1_veth0.pcapng");
//! ```

use nstap_core::{Error, InterfaceHandle, Result};
use std::fmt;
use std::path::PathBuf;

/// Interface name used inside containers when none is configured
pub const DEFAULT_INTERFACE_NAME: &str = "{node}/{interface}";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Node,
    Interface,
}

/// A parsed name template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl NameTemplate {
    /// Parse a template
    ///
    /// Unknown variables and unbalanced braces are rejected here so that
    /// rendering can never fail.
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(Error::template(source, "unterminated variable"));
                    }

                    let segment = match name.trim() {
                        "node" => Segment::Node,
                        "interface" => Segment::Interface,
                        other => {
                            return Err(Error::template(
                                source.to_string(),
                                format!("unknown variable '{}'", other),
                            ))
                        }
                    };
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                }
                '}' => return Err(Error::template(source, "unmatched '}'")),
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Template for container interface names
    pub fn default_interface_name() -> Self {
        Self {
            source: DEFAULT_INTERFACE_NAME.to_string(),
            segments: vec![
                Segment::Node,
                Segment::Literal("/".to_string()),
                Segment::Interface,
            ],
        }
    }

    /// Template text as given
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the template references any variable
    pub fn is_constant(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Expand the template for one interface
    pub fn render(&self, handle: &InterfaceHandle) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Node => out.push_str(&handle.node),
                Segment::Interface => out.push_str(&handle.name),
            }
        }
        out
    }

    /// Expand the template into a path
    pub fn render_path(&self, handle: &InterfaceHandle) -> PathBuf {
        PathBuf::from(self.render(handle))
    }
}

impl fmt::Display for NameTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for NameTemplate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_and_interface() {
        let template = NameTemplate::parse("capture-{node}-{interface}.pcapng").unwrap();
        let handle = InterfaceHandle::new("h1", "veth0");
        assert_eq!(template.render(&handle), "capture-h1-veth0.pcapng");
        assert!(!template.is_constant());
    }

    #[test]
    fn test_escaped_braces() {
        let template = NameTemplate::parse("{{{node}}}").unwrap();
        assert_eq!(template.render(&InterfaceHandle::new("sw1", "x")), "{sw1}");
    }

    #[test]
    fn test_constant_template() {
        let template = NameTemplate::parse("all.pcapng").unwrap();
        assert!(template.is_constant());
        assert_eq!(template.render(&InterfaceHandle::new("a", "b")), "all.pcapng");
    }

    #[test]
    fn test_unknown_variable_rejected() {
        let err = NameTemplate::parse("{host}.pcapng").unwrap_err();
        match err {
            Error::Template { template, reason } => {
                assert_eq!(template, "{host}.pcapng");
                assert!(reason.contains("host"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unbalanced_braces_rejected() {
        assert!(NameTemplate::parse("{node").is_err());
        assert!(NameTemplate::parse("node}").is_err());
    }

    #[test]
    fn test_default_interface_name() {
        let template = NameTemplate::default_interface_name();
        assert_eq!(template, NameTemplate::parse(DEFAULT_INTERFACE_NAME).unwrap());
        assert_eq!(template.render(&InterfaceHandle::new("sw1", "veth-h2")), "sw1/veth-h2");
    }
}
