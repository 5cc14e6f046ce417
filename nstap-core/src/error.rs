//! Error types for nstap

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for nstap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nstap
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Opening or reading from a capture handle failed
    #[error("Packet capture error: {0}")]
    Capture(String),

    /// A filter expression or bytecode program was rejected
    #[error("Invalid filter: {0}")]
    Filter(String),

    /// One or more configuration problems, collected during validation
    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    /// A name template could not be parsed or rendered
    #[error("Invalid name template '{template}': {reason}")]
    Template { template: String, reason: String },

    /// No interface passed the interface selection
    #[error("No interface matched the capture selection")]
    NoMatchingInterface,

    /// Interface not found
    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    /// Capture container could not be written or parsed
    #[error("Capture container error: {0}")]
    Container(String),

    /// The merge writer has been released by its last owner
    #[error("Capture writer for '{0}' is closed")]
    WriterClosed(String),

    /// A sink refused or failed to accept a packet
    #[error("Delivery to {sink} failed: {reason}")]
    Delivery { sink: String, reason: String },

    /// A trace submission could not be decoded
    #[error("Malformed trace event: {0}")]
    MalformedEvent(String),

    /// Listen address is already bound
    #[error("Address already in use: {0}")]
    AddressInUse(String),

    /// Listen address could not be parsed
    #[error("Invalid listen address '{0}'")]
    InvalidAddress(String),

    /// Persisted network state could not be removed
    #[error("Failed to remove network state at {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Operation is not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Create a capture error with a custom message
    pub fn capture<S: Into<String>>(msg: S) -> Self {
        Error::Capture(msg.into())
    }

    /// Create a filter error with a custom message
    pub fn filter<S: Into<String>>(msg: S) -> Self {
        Error::Filter(msg.into())
    }

    /// Create a template error
    pub fn template<S: Into<String>>(template: S, reason: S) -> Self {
        Error::Template {
            template: template.into(),
            reason: reason.into(),
        }
    }

    /// Create a delivery error for the named sink
    pub fn delivery<S: Into<String>>(sink: S, reason: S) -> Self {
        Error::Delivery {
            sink: sink.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error was produced while constructing something
    /// (as opposed to while moving packets or events)
    pub fn is_construction(&self) -> bool {
        matches!(
            self,
            Error::Filter(_)
                | Error::InvalidConfig(_)
                | Error::Template { .. }
                | Error::NoMatchingInterface
                | Error::InterfaceNotFound(_)
                | Error::AddressInUse(_)
                | Error::InvalidAddress(_)
        )
    }
}
