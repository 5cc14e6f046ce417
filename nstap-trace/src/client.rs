//! Submitting trace events to a tracer

use crate::event::TraceRecord;
use crate::tracer::ListenAddr;
use nstap_core::{Error, Result};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

/// Environment variable holding the tracer address for traced processes
pub const TRACE_ADDR_ENV: &str = "NSTAP_TRACE";

/// Connection to a [`Tracer`](crate::Tracer)
pub struct TraceClient {
    stream: Box<dyn AsyncWrite + Send + Unpin>,
    addr: ListenAddr,
    source: Option<String>,
}

impl TraceClient {
    /// Connect to a tracer
    pub async fn connect(addr: &ListenAddr) -> Result<Self> {
        let stream: Box<dyn AsyncWrite + Send + Unpin> = match addr {
            ListenAddr::Tcp(host) => {
                let stream = TcpStream::connect(host.as_str()).await?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
            ListenAddr::Unix(path) => Box::new(UnixStream::connect(path).await?),
        };
        debug!(addr = %addr, "connected to tracer");

        Ok(Self {
            stream,
            addr: addr.clone(),
            source: None,
        })
    }

    /// Connect to the address in `NSTAP_TRACE`
    pub async fn from_env() -> Result<Self> {
        let value = std::env::var(TRACE_ADDR_ENV)
            .map_err(|_| Error::NotFound(format!("environment variable {TRACE_ADDR_ENV}")))?;
        Self::connect(&value.parse()?).await
    }

    /// Tag every submitted record with `source`
    pub fn with_source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Tracer address
    pub fn addr(&self) -> &ListenAddr {
        &self.addr
    }

    /// Submit a message with a caller-assigned index
    pub async fn submit<S: Into<String>>(&mut self, index: u64, message: S) -> Result<()> {
        self.send(TraceRecord::new(index, message)).await
    }

    /// Submit a message with a structured payload
    pub async fn submit_with_data<S: Into<String>, D: Serialize>(
        &mut self,
        index: u64,
        message: S,
        data: &D,
    ) -> Result<()> {
        let data = serde_json::to_value(data).map_err(|e| Error::MalformedEvent(e.to_string()))?;
        self.send(TraceRecord::new(index, message).with_data(data))
            .await
    }

    /// Submit a prepared record
    pub async fn send(&mut self, mut record: TraceRecord) -> Result<()> {
        if record.source.is_none() {
            record.source = self.source.clone();
        }
        let line = record.encode()?;
        self.stream.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Flush and close the connection
    pub async fn close(mut self) -> Result<()> {
        self.stream.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
