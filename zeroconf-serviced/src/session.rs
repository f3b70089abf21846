use mdns_sd::{IfKind, ServiceDaemon};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use crate::mdns::browser;
use crate::serializer::RegistryHandle;

/// Multicast membership of a network interface (`None` = all interfaces)
pub trait Membership {
    fn enable(&self, interface: Option<&str>) -> Result<()>;
    fn disable(&self, interface: Option<&str>) -> Result<()>;
}

impl Membership for ServiceDaemon {
    fn enable(&self, interface: Option<&str>) -> Result<()> {
        match interface {
            Some(name) => self
                .enable_interface(name)
                .with_context(|| format!("Failed to enable interface {}", name)),
            None => self
                .enable_interface(IfKind::All)
                .context("Failed to enable interfaces"),
        }
    }

    fn disable(&self, interface: Option<&str>) -> Result<()> {
        match interface {
            Some(name) => self
                .disable_interface(name)
                .with_context(|| format!("Failed to disable interface {}", name)),
            None => self
                .disable_interface(IfKind::All)
                .context("Failed to disable interfaces"),
        }
    }
}

/// A running discovery session. Owns the interface membership and the
/// browser task from `start` until `stop`.
pub struct DiscoverySession<M = ServiceDaemon> {
    membership: M,
    interface: Option<String>,
    cancel: CancellationToken,
    browser: JoinHandle<()>,
}

impl DiscoverySession {
    pub fn start(daemon: &ServiceDaemon, interface: Option<&str>, registry: RegistryHandle) -> Result<Self> {
        let browser_daemon = daemon.clone();
        Self::launch(daemon.clone(), interface, move |cancel| {
            tokio::spawn(async move {
                if let Err(e) = browser::run_browser(browser_daemon, registry, cancel).await {
                    tracing::error!("mDNS browser error: {}", e);
                }
            })
        })
    }
}

impl<M: Membership> DiscoverySession<M> {
    fn launch(
        membership: M,
        interface: Option<&str>,
        spawn_browser: impl FnOnce(CancellationToken) -> JoinHandle<()>,
    ) -> Result<Self> {
        tracing::info!("Starting discovery on {}", interface.unwrap_or("all interfaces"));
        membership.enable(interface)?;

        let cancel = CancellationToken::new();
        let browser = spawn_browser(cancel.clone());

        Ok(Self {
            membership,
            interface: interface.map(str::to_string),
            cancel,
            browser,
        })
    }

    /// Stop browsing, remove every record the session produced, then release
    /// the interfaces. The interfaces are released even if clearing fails.
    /// Returns the number of records removed.
    pub async fn stop(self, registry: &RegistryHandle) -> Result<usize> {
        tracing::info!("Stopping discovery");

        // The browser enqueues with `.await`, so once it has returned all of
        // its events are ahead of the clear in the queue
        self.cancel.cancel();
        if let Err(e) = self.browser.await {
            tracing::error!("mDNS browser task failed: {}", e);
        }

        let cleared = registry.clear_all().await;
        let released = self.membership.disable(self.interface.as_deref());

        let removed = cleared.context("Failed to clear registry")?;
        released?;
        tracing::info!("Discovery stopped, {} services removed", removed);
        Ok(removed)
    }
}
