use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;

use anyhow::{Context, Result};
use syncgroup::config::{Config, LogFormat};
use syncgroup::{logging, metrics};

#[derive(Debug, Default)]
pub struct Options {
    /// Logs everything the primitives emit, into the void.
    pub tracing: bool,
    /// Reports metrics to a local UDP sink, unless a statsd server is configured.
    pub metrics: bool,
}

#[derive(Default)]
pub struct Guard {
    pub udp_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// Sets up logging and metrics for the stresstest.
///
/// # Safety
/// This function modifies the environment, see [`logging::init_logging`]. It may only be called
/// before any threads are spawned.
pub unsafe fn init(config: &Config, options: Options) -> Result<Guard> {
    let mut guard = Guard::default();

    if options.tracing {
        // this should mimic the settings used in production:
        let mut config = config.clone();
        config.logging.format = LogFormat::Json;

        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        // SAFETY: Forwarded to the caller.
        unsafe { logging::init_logging_with_writer(&config, || NoopWriter) };
    } else {
        tracing_subscriber::fmt::init();
    }

    if config.metrics.statsd.is_some() {
        config.configure_metrics()?;
    } else if options.metrics {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = UdpSocket::bind(addr).context("failed to bind metrics sink")?;
        listener
            .set_nonblocking(true)
            .context("failed to configure metrics sink")?;
        let socket = listener.local_addr()?;

        guard.udp_sink = Some(Box::pin(async move {
            let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
                return;
            };
            let mut buf = Vec::with_capacity(1024);
            loop {
                buf.clear();
                if listener.recv_buf(&mut buf).await.is_err() {
                    return;
                }
            }
        }));

        // have some default tags, just to be closer to the real world config
        let mut tags = config.metrics.custom_tags.clone();
        tags.insert("host".into(), "stresstest".into());
        tags.insert("env".into(), "stresstest".into());

        metrics::configure_statsd(&config.metrics.prefix, socket, tags)?;
    }

    Ok(guard)
}

struct NoopWriter;

impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
