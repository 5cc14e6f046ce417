//! nstap core library
//!
//! This crate provides the shared types for the nstap capture and trace
//! toolkit: interface handles describing tap points inside emulated network
//! namespaces, captured packets with lazy decoding, the common error type,
//! and the on-disk state root used for bulk cleanup of emulated networks.

pub mod error;
pub mod interface;
pub mod packet;
pub mod state;

// Re-export commonly used types
pub use error::{Error, Result};
pub use interface::{InterfaceHandle, InterfaceKey};
pub use packet::{CapturedPacket, PacketSummary};
pub use state::{NamespaceRemover, NetnsDir, StateRoot, DEFAULT_STATE_DIR};
