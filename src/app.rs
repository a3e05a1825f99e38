//! Application lifecycle
//!
//! Start prepares certificates, hosts entries and the routing table, then
//! launches one relay per source port. Stop removes the hosts entries again.

use crate::buffer::BufferPool;
use crate::certificate::{
    self, CertificateLocation, CertificateManager, FileCertificateStore, DOMAIN_SUBJECT,
    ROOT_SUBJECT,
};
use crate::config::Settings;
use crate::hosts::{EtcHosts, HostsStore};
use crate::routing::RoutingTable;
use crate::tunnel::{TunnelError, TunnelRelay};
use anyhow::{bail, Context, Result};
use rustls::{ClientConfig, ServerConfig};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Address the source domains are mapped to in the hosts file
pub const LOOPBACK: &str = "127.0.0.1";

struct TlsSetup {
    server: Option<Arc<ServerConfig>>,
    client: Arc<ClientConfig>,
}

pub struct Application {
    settings: Settings,
    certificates: Arc<CertificateManager>,
    hosts: Box<dyn HostsStore>,
    pool: Arc<BufferPool>,
    cancel: CancellationToken,
}

impl Application {
    /// Application backed by the certificate directory and hosts file from `settings`
    pub fn new(settings: Settings, cancel: CancellationToken) -> Result<Self> {
        let store = FileCertificateStore::new(&settings.certs_dir).with_context(|| {
            format!(
                "Failed to open certificate store at {}",
                settings.certs_dir.display()
            )
        })?;
        let hosts = EtcHosts::new(&settings.hosts_file);
        Ok(Self::with_stores(
            settings,
            CertificateManager::new(store),
            hosts,
            cancel,
        ))
    }

    pub fn with_stores(
        settings: Settings,
        certificates: CertificateManager,
        hosts: impl HostsStore + 'static,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            certificates: Arc::new(certificates),
            hosts: Box::new(hosts),
            pool: Arc::new(BufferPool::default()),
            cancel,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run until cancelled, stopping cleanly on every path
    pub async fn run(self) -> Result<()> {
        let relays = match self.start().await {
            Ok(relays) => relays,
            Err(e) => {
                self.stop();
                return Err(e);
            }
        };

        for relay in relays {
            match relay.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Tunnel stopped with an error: {}", e),
                Err(e) => error!("Tunnel task failed: {}", e),
            }
        }

        self.stop();
        Ok(())
    }

    /// Prepare everything and start the relays; the listeners are bound on return
    pub async fn start(&self) -> Result<Vec<JoinHandle<Result<(), TunnelError>>>> {
        info!("Start Application");

        if self.settings.uninstall_root_cert {
            let certificates = Arc::clone(&self.certificates);
            tokio::task::spawn_blocking(move || remove_certificates(&certificates)).await??;
            return Ok(Vec::new());
        }

        let tunnels = &self.settings.tunnels;
        if tunnels.is_empty() {
            bail!("No tunnel configured");
        }
        RoutingTable::validate(tunnels)?;

        let tls = {
            let certificates = Arc::clone(&self.certificates);
            let settings = self.settings.clone();
            tokio::task::spawn_blocking(move || prepare_certificates(&certificates, &settings))
                .await??
        };

        if self.settings.add_to_hosts {
            for domain in self.settings.source_domains() {
                self.hosts.remove(&domain);
                if !self.hosts.add_or_update(LOOPBACK, &domain) {
                    bail!("Failed to add or update hosts file entry for {}", domain);
                }
            }
        }

        let table = tokio::select! {
            _ = self.cancel.cancelled() => {
                info!("Cancelled while resolving destinations");
                return Ok(Vec::new());
            }
            table = RoutingTable::build(tunnels.clone()) => table?,
        };

        info!("Let's Start Tunnels");

        let mut listeners = Vec::new();
        for routes in table.ports() {
            let relay = TunnelRelay::new(
                Arc::clone(routes),
                self.settings.bind,
                tls.server.clone(),
                Arc::clone(&tls.client),
                Arc::clone(&self.pool),
                self.cancel.clone(),
            )?;
            let listener = relay.bind().await?;
            listeners.push((Arc::new(relay), listener));
        }

        Ok(listeners
            .into_iter()
            .map(|(relay, listener)| tokio::spawn(relay.serve(listener)))
            .collect())
    }

    pub fn stop(&self) {
        info!("Stop Application");

        if self.settings.add_to_hosts {
            info!("Unregistering domains in the hosts file");
            for domain in self.settings.source_domains() {
                self.hosts.remove(&domain);
            }
        }
    }
}

fn remove_certificates(certificates: &CertificateManager) -> Result<()> {
    if !certificates.remove(&CertificateLocation::domain())? {
        warn!("Domain certificate could not be removed");
    }
    if !certificates.remove(&CertificateLocation::root())? {
        error!("Root certificate could not be removed");
    }
    Ok(())
}

fn prepare_certificates(certificates: &CertificateManager, settings: &Settings) -> Result<TlsSetup> {
    let root = if settings.install_root_cert {
        match certificates.get_or_create_root(ROOT_SUBJECT)? {
            Some(root) => Some(root),
            None => bail!("Failed to install the root certificate"),
        }
    } else {
        certificates.get_root(ROOT_SUBJECT)?
    };

    let server = if settings.needs_tls() {
        let Some(root) = &root else {
            bail!("Root certificate is required to create domain certificates. Please install the root certificate first.");
        };
        let domains = settings.source_domains();
        let domain = certificates.get_or_create_signed(root, DOMAIN_SUBJECT, &domains)?;
        Some(Arc::new(certificate::server_config(&domain, root)?))
    } else {
        None
    };

    let extra_roots: Vec<_> = root.into_iter().collect();
    let client = Arc::new(certificate::client_config(&extra_roots)?);

    Ok(TlsSetup { server, client })
}
