//! Out-of-band trace events for nstap
//!
//! Processes running inside emulated nodes report what they are doing by
//! submitting small JSON records to a [`Tracer`]. The tracer logs them in
//! arrival order and can mirror them into a capture container so that
//! application events and packets share one timeline.
//!
//! ## Example
//!
//! ```no_run
//! use nstap_trace::{TraceClient, Tracer, TracerConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TracerConfig::new("tcp:127.0.0.1:0".parse()?).with_log_path("trace.log");
//! let tracer = Tracer::start_local(config).await?;
//!
//! let mut client = TraceClient::connect(tracer.local_addr()).await?;
//! client.submit(0, "Hello from test process").await?;
//! client.close().await?;
//!
//! tracer.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod event;
pub mod tracer;

pub use client::{TraceClient, TRACE_ADDR_ENV};
pub use event::{read_log, TraceEvent, TraceRecord};
pub use tracer::{ListenAddr, Tracer, TracerConfig, TRACER_INTERFACE};
