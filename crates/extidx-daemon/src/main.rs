//! extidx-daemon - external index build server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use extidx_daemon::{IndexServer, ServerConfig, TlsFiles, status};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "extidx-daemon")]
#[command(about = "Builds HNSW indexes streamed from database backends", version)]
struct Args {
    /// Host to bind to
    #[arg(long, env = "EXTIDX_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port for build sessions
    #[arg(short, long, env = "EXTIDX_PORT", default_value_t = 8998)]
    port: u16,

    /// Port for the HTTP status endpoint
    #[arg(long, env = "EXTIDX_STATUS_PORT", default_value_t = 8999)]
    status_port: u16,

    /// PEM certificate chain; enables TLS together with --key
    #[arg(long, env = "EXTIDX_CERT", requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, env = "EXTIDX_KEY", requires = "cert")]
    key: Option<PathBuf>,

    /// Maximum concurrent build sessions
    #[arg(long, env = "EXTIDX_MAX_CONNECTIONS", default_value_t = 64)]
    max_connections: usize,

    /// Timeout for each frame sent or received, in seconds
    #[arg(long, env = "EXTIDX_SOCKET_TIMEOUT_SECS", default_value_t = 30)]
    socket_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let listen_addr = resolve(&args.host, args.port).await?;
    let status_addr = resolve(&args.host, args.status_port).await?;

    let mut config = ServerConfig::new(listen_addr)
        .with_max_connections(args.max_connections)
        .with_socket_timeout(Duration::from_secs(args.socket_timeout_secs));
    if let (Some(cert), Some(key)) = (args.cert, args.key) {
        config = config.with_tls(TlsFiles::new(cert, key));
    }

    info!(
        listen_addr = %listen_addr,
        status_addr = %status_addr,
        tls = config.tls.is_some(),
        "starting extidx-daemon"
    );

    let server = IndexServer::bind(config)
        .await
        .context("failed to start indexing server")?;
    let status_listener = TcpListener::bind(status_addr)
        .await
        .context("failed to bind status listener")?;
    let status_handle = tokio::spawn(status::serve(status_listener, server.status()));

    tokio::select! {
        result = server.run() => {
            if let Err(err) = result {
                error!(error = %err, "server error");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                error!(error = %err, "failed to listen for shutdown signal");
            }
            info!("shutting down");
        }
    }

    status_handle.abort();
    Ok(())
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {host}:{port}"))?;
    match addrs.next() {
        Some(addr) => Ok(addr),
        None => bail!("{host}:{port} resolved to no addresses"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
