//! SnapTunnel - Main entry point
//!
//! Host and path rewriting TLS tunnel for local development

use anyhow::{anyhow, Result};
use clap::Parser;
use snaptunnel::config::{CliSettings, FileSettings, Settings, TunnelConfig};
use snaptunnel::Application;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// SnapTunnel - Host and path rewriting TLS tunnel
#[derive(Parser, Debug)]
#[command(name = "snaptunnel")]
#[command(author = "SnapTunnel Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Host and path rewriting TLS tunnel for local development")]
struct Args {
    /// Tunnel, e.g. http:local.test:8080>https:remote.test:443|rewritepath=^/api(.*)>/v2$1
    #[arg(short, long = "tunnel", num_args = 1..)]
    tunnels: Vec<TunnelConfig>,

    /// Map every source domain to 127.0.0.1 in the hosts file while running
    #[arg(short = 'a', long = "addtohosts")]
    add_to_hosts: bool,

    /// Create and install the root certificate if missing
    #[arg(short = 'i', long = "installrootcert")]
    install_root_cert: bool,

    /// Remove the root and domain certificates, then exit
    #[arg(short = 'u', long = "uninstallrootcert")]
    uninstall_root_cert: bool,

    /// Verbosity from 0 (trace) to 6 (off); overrides --log-level
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(0..=6))]
    verbosity: Option<u8>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// JSON settings file
    #[arg(long, env = "SNAPTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Certificates directory
    #[arg(long, env = "CERTS_DIR")]
    certs_dir: Option<PathBuf>,

    /// Hosts file to edit with --addtohosts
    #[arg(long, env = "HOSTS_FILE")]
    hosts_file: Option<PathBuf>,

    /// Address the tunnel listeners bind to
    #[arg(long, env = "BIND_ADDRESS")]
    bind: Option<IpAddr>,
}

impl Args {
    fn filter_directive(&self) -> String {
        match self.verbosity {
            Some(0) => "trace".to_string(),
            Some(1) => "debug".to_string(),
            Some(2) => "info".to_string(),
            Some(3) => "warn".to_string(),
            Some(4) | Some(5) => "error".to_string(),
            Some(_) => "off".to_string(),
            None => self.log_level.to_lowercase(),
        }
    }
}

fn init_logging(directive: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow!(e))
}

async fn run(args: Args) -> Result<()> {
    let file = args.config.as_deref().map(FileSettings::load).transpose()?;
    let settings = Settings::resolve(
        CliSettings {
            tunnels: args.tunnels,
            add_to_hosts: args.add_to_hosts,
            install_root_cert: args.install_root_cert,
            uninstall_root_cert: args.uninstall_root_cert,
            certs_dir: args.certs_dir,
            hosts_file: args.hosts_file,
            bind: args.bind,
        },
        file,
    )?;

    info!("Starting SnapTunnel v1.0.0");
    info!("Certificates directory: {}", settings.certs_dir.display());
    info!("Tunnels configured: {}", settings.tunnels.len());

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("Shutdown requested");
        shutdown.cancel();
    });

    Application::new(settings, cancel)?.run().await
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            error!("Failed to listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.filter_directive()) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
