use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::pin::Pin;

use anyhow::{Context, Result};
use cartsync_service::config::Config as CartsyncConfig;
use cartsync_service::{logging, metrics};

#[derive(Debug, Default)]
pub struct Config {
    pub backtraces: bool,
    pub sentry: bool,
    pub tracing: bool,
    pub metrics: bool,
}

type Sink = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Default)]
pub struct Guard {
    sentry: Option<sentry::ClientInitGuard>,
    pub http_sink: Option<Sink>,
    pub udp_sink: Option<Sink>,
}

/// Sets up sentry, logging and metrics for the stresstest.
///
/// Sentry events and statsd metrics are sent to local sinks which discard them. The sinks are
/// returned in the [`Guard`] and have to be spawned on the runtime.
///
/// # Safety
/// This function uses [`std::env::set_var`] and must be called before any other thread is started.
pub unsafe fn init(config: Config, service_config: &CartsyncConfig) -> Result<Guard> {
    if config.backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let mut guard = Guard::default();

    if config.sentry {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).context("failed to bind sentry sink")?;
        listener.set_nonblocking(true)?;
        let socket = listener.local_addr()?;

        guard.http_sink = Some(Box::pin(async move {
            async fn ok() -> &'static str {
                "OK"
            }
            use axum::handler::HandlerWithoutStateExt;

            let Ok(listener) = tokio::net::TcpListener::from_std(listener) else {
                return;
            };
            axum::serve(listener, ok.into_make_service()).await.ok();
        }));

        let dsn = format!("http://some_token@127.0.0.1:{}/1234", socket.port());

        guard.sentry = Some(sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: 1.0,
                ..Default::default()
            },
        )));
    } else if let Some(ref dsn) = service_config.sentry_dsn {
        guard.sentry = Some(sentry::init((
            dsn.clone(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        )));
    }

    if config.tracing {
        // we want all the tracing machinery to be active, but not spam the console,
        // so redirect everything into the void:
        logging::init_json_logging("INFO", || NoopWriter);
    } else {
        // SAFETY: Forwarded from our own safety contract.
        unsafe { logging::init_logging(service_config) };
    }

    if config.metrics {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = UdpSocket::bind(addr).context("failed to bind metrics sink")?;
        listener.set_nonblocking(true)?;
        let socket = listener.local_addr()?;

        guard.udp_sink = Some(Box::pin(async move {
            let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
                return;
            };
            let mut buf = Vec::with_capacity(1024);
            loop {
                buf.clear();
                if listener.recv_buf(&mut buf).await.is_err() {
                    break;
                }
            }
        }));

        let host = format!("127.0.0.1:{}", socket.port());

        // have some default tags, just to be closer to the real world config
        let mut tags = BTreeMap::new();
        tags.insert("host".into(), "stresstest".into());
        tags.insert("env".into(), "stresstest".into());

        metrics::configure_statsd("cartsync", host, tags)?;
    } else {
        metrics::configure_from_config(&service_config.metrics)?;
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
