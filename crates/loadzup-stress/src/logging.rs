use std::env;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;

use anyhow::{Context, Result};

use loadzup::config::Config as LoadzupConfig;
use loadzup::{logging, metrics};

#[derive(Debug, Default)]
pub struct Config {
    pub tracing: bool,
    pub metrics: bool,
}

#[derive(Default)]
pub struct Guard {
    _sentry: Option<sentry::ClientInitGuard>,
    pub udp_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// Sets up logging, metrics and error reporting for the stresstest.
///
/// Without `tracing`, logs are written to the console as configured. With it, they are
/// formatted like in production but discarded. Likewise, `metrics` sends metrics to a local
/// sink instead of the configured statsd server.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. It must be called before
/// any other threads are spawned.
pub unsafe fn init(config: Config, loadzup_config: &LoadzupConfig) -> Result<Guard> {
    let mut guard = Guard {
        _sentry: logging::init_sentry(loadzup_config),
        ..Default::default()
    };

    if config.tracing {
        if loadzup_config.logging.enable_backtraces {
            // SAFETY: As documented, this function may only be called in a single-threaded context.
            unsafe { env::set_var("RUST_BACKTRACE", "1") };
        }
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void. this mimics the settings used in production.
        logging::init_json_logging("INFO,loadzup=DEBUG", || NoopWriter);
    } else {
        // SAFETY: Forwarded from the caller.
        unsafe { logging::init_logging(loadzup_config) };
    }

    let metrics_config = &loadzup_config.metrics;
    let mut tags = metrics_config.custom_tags.clone();

    let statsd = if config.metrics {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = UdpSocket::bind(addr).context("failed to bind metrics sink")?;
        listener.set_nonblocking(true)?;
        let socket = listener.local_addr()?;

        guard.udp_sink = Some(Box::pin(async move {
            let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
                return;
            };
            let mut buf = Vec::with_capacity(1024);
            while listener.recv_buf(&mut buf).await.is_ok() {
                buf.clear();
            }
        }));

        // have some default tags, just to be closer to the real world config
        tags.entry("host".into()).or_insert_with(|| "stresstest".into());
        tags.entry("env".into()).or_insert_with(|| "stresstest".into());

        Some(format!("127.0.0.1:{}", socket.port()))
    } else {
        metrics_config.statsd.clone()
    };

    if let Some(statsd) = statsd {
        metrics::configure_statsd(&metrics_config.prefix, statsd, tags)?;
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
