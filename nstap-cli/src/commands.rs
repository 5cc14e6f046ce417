//! Subcommand implementations

use crate::args::{Cli, Commands};
use nstap_capture::{
    filter, CaptureConfig, Capturer, MergeWriter, PcapTapOpener, TapOpener, WriterOptions,
};
use nstap_core::{Error, InterfaceHandle, StateRoot};
use nstap_trace::{Tracer, TracerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Node name used for interfaces of the calling namespace
pub const HOST_NODE: &str = "host";

/// Run the selected subcommand
pub async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let state = StateRoot::new(&cli.state_dir);

    match cli.command {
        Commands::Networks => {
            for network in state.network_names() {
                println!("{}", network);
            }
        }

        Commands::Nodes { network } => {
            if !state.network_dir(&network).is_dir() {
                return Err(Error::NotFound(format!("network '{}'", network)).into());
            }
            for node in state.node_names(&network) {
                println!("{}", node);
            }
        }

        Commands::Cleanup { network, all } => {
            if all {
                state.cleanup_all()?;
                println!("Removed all networks below {}", state.path().display());
            } else if let Some(network) = network {
                state.cleanup_network(&network)?;
                println!("Removed network {}", network);
            }
        }

        Commands::Interfaces => {
            for iface in InterfaceHandle::discover(HOST_NODE) {
                let addresses: Vec<String> =
                    iface.addresses.iter().map(|a| a.to_string()).collect();
                println!("{:<16} {}", iface.name, addresses.join(" "));
            }
        }

        Commands::Capture {
            output,
            filter: expression,
            prefix,
            snaplen,
            comment,
            duration,
            no_promisc,
        } => {
            let mut builder = CaptureConfig::builder()
                .length(snaplen)
                .promiscuous(!no_promisc)
                .filter_interfaces(filter::interface_prefix(&prefix));
            builder = if output.contains('{') {
                builder.to_file_template(&output)
            } else {
                builder.to_file(&output)
            };
            if let Some(expression) = expression {
                builder = builder.filter_expression(expression);
            }
            if let Some(comment) = comment {
                builder = builder.comment(comment);
            }
            let config = builder.build()?;

            let interfaces = InterfaceHandle::discover(HOST_NODE);
            let capture = attach_blocking(interfaces, config, Arc::new(PcapTapOpener)).await?;
            for iface in capture.interfaces() {
                info!(interface = %iface, "capturing");
            }
            eprintln!(
                "Capturing on {} interface(s), press Ctrl-C to stop",
                capture.interfaces().len()
            );

            wait(duration).await?;

            let (capture, result) = stop_blocking(capture).await?;
            eprintln!("{}", capture.stats().format());
            for path in capture.paths() {
                eprintln!("Wrote {}", path.display());
            }
            result?;
        }

        Commands::Trace {
            listen,
            output,
            capture,
        } => {
            let mut config = TracerConfig::new(listen.parse()?);
            if let Some(output) = output {
                config = config.with_log_path(output);
            }
            let writer = match capture {
                Some(path) => Some(MergeWriter::create(path, WriterOptions::default())?),
                None => None,
            };
            if let Some(writer) = &writer {
                config = config.with_capture(writer);
            }

            let tracer = Tracer::start_local(config).await?;
            eprintln!(
                "Collecting trace events on {}, press Ctrl-C to stop",
                tracer.local_addr()
            );

            wait(None).await?;

            let result = tracer.stop().await;
            eprintln!(
                "Received {} event(s), dropped {} malformed",
                tracer.received(),
                tracer.malformed()
            );
            if let Some(writer) = writer {
                if let Err(e) = writer.release() {
                    warn!(error = %e, "failed to close capture file");
                }
            }
            result?;
        }
    }

    Ok(())
}

/// Attach on the blocking pool; attach waits for every tap to open
pub async fn attach_blocking(
    interfaces: Vec<InterfaceHandle>,
    config: CaptureConfig,
    opener: Arc<dyn TapOpener>,
) -> Result<Capturer, Box<dyn std::error::Error>> {
    let capture =
        tokio::task::spawn_blocking(move || Capturer::attach_with(&interfaces, config, opener))
            .await??;
    Ok(capture)
}

/// Stop on the blocking pool; stop joins the tap threads
///
/// Hands the capturer back so its statistics can still be read.
pub async fn stop_blocking(
    capture: Capturer,
) -> Result<(Capturer, nstap_core::Result<()>), tokio::task::JoinError> {
    tokio::task::spawn_blocking(move || {
        let result = capture.stop();
        (capture, result)
    })
    .await
}

/// Wait for Ctrl-C, or for `seconds` if given, whichever comes first
async fn wait(seconds: Option<u64>) -> std::io::Result<()> {
    match seconds {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => Ok(()),
                res = tokio::signal::ctrl_c() => res,
            }
        }
        None => tokio::signal::ctrl_c().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nstap_capture::{CaptureState, Frame, MemoryTapOpener};
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test(flavor = "current_thread")]
    async fn test_capture_lifecycle_on_blocking_pool() {
        let h1 = InterfaceHandle::new("h1", "veth0");
        let opener = Arc::new(MemoryTapOpener::new());
        let feed = opener.feed(&h1);

        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();
        let config = CaptureConfig::builder()
            .callback(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .read_timeout(Duration::from_millis(10))
            .build()
            .unwrap();

        let capture = attach_blocking(vec![h1], config, opener).await.unwrap();
        assert_eq!(capture.interfaces().len(), 1);

        feed.send(Frame::new(vec![0u8; 60])).unwrap();
        for _ in 0..500 {
            if capture.count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (capture, result) = stop_blocking(capture).await.unwrap();
        result.unwrap();
        assert_eq!(capture.state(), CaptureState::Stopped);
        assert_eq!(capture.stats().packets_accepted, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
