//! CLI argument parsing

use clap::{Parser, Subcommand};
use nstap_capture::writer::DEFAULT_SNAPLEN;
use nstap_core::DEFAULT_STATE_DIR;
use nstap_trace::tracer::DEFAULT_LISTEN;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nstap")]
#[command(version, about = "Packet capture and tracing for emulated networks", long_about = None)]
pub struct Cli {
    /// Directory holding persisted network state
    #[arg(long, global = true, value_name = "DIR", default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    /// Verbose output (-v, -vv, -vvv for increasing verbosity)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List networks with persisted state
    Networks,

    /// List the nodes of a network
    Nodes {
        /// Network name
        network: String,
    },

    /// Remove networks left behind by earlier runs
    Cleanup {
        /// Network to remove
        #[arg(value_name = "NETWORK", required_unless_present = "all")]
        network: Option<String>,

        /// Remove every network
        #[arg(short, long, conflicts_with = "network")]
        all: bool,
    },

    /// List the interfaces of the current namespace
    Interfaces,

    /// Capture packets on host interfaces into a pcapng file
    Capture {
        /// Output file; `{node}` and `{interface}` give one file per interface
        #[arg(short = 'w', long, value_name = "FILE")]
        output: String,

        /// libpcap filter expression
        #[arg(short, long, value_name = "EXPR")]
        filter: Option<String>,

        /// Only capture on interfaces whose name starts with this prefix
        #[arg(short = 'i', long = "interface-prefix", value_name = "PREFIX", default_value = "")]
        prefix: String,

        /// Snap length in bytes
        #[arg(short, long, default_value_t = DEFAULT_SNAPLEN)]
        snaplen: u32,

        /// Comment stored in the capture file
        #[arg(short, long)]
        comment: Option<String>,

        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(short, long, value_name = "SECONDS")]
        duration: Option<u64>,

        /// Do not put interfaces into promiscuous mode
        #[arg(long)]
        no_promisc: bool,
    },

    /// Collect trace events until Ctrl-C
    Trace {
        /// Listen address (tcp:<host>:<port> or unix:<path>)
        #[arg(short, long, default_value = DEFAULT_LISTEN)]
        listen: String,

        /// JSON-lines event log
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Also record events into this pcapng file
        #[arg(short = 'w', long, value_name = "FILE")]
        capture: Option<PathBuf>,
    },
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Log level for the verbosity count
    pub fn log_level(&self) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}
