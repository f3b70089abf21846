use mdns_sd::ServiceDaemon;
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use crate::config::DiscoveryConfig;
use crate::serializer::RegistryHandle;
use crate::session::DiscoverySession;

/// Whether discovery can run: the named interface (or any non-loopback one)
/// currently has an address. Takes (name, is_loopback) pairs.
fn link_up<'a>(interfaces: impl IntoIterator<Item = (&'a str, bool)>, wanted: Option<&str>) -> bool {
    interfaces.into_iter().any(|(name, loopback)| match wanted {
        Some(wanted) => name == wanted,
        None => !loopback,
    })
}

fn interface_up(wanted: Option<&str>) -> bool {
    match if_addrs::get_if_addrs() {
        Ok(addrs) => link_up(addrs.iter().map(|i| (i.name.as_str(), i.is_loopback())), wanted),
        Err(e) => {
            tracing::warn!("Failed to list network interfaces: {}", e);
            false
        }
    }
}

/// Poll interface state, starting discovery when the link comes up and
/// stopping it when the link goes away. The running session is stopped on
/// cancellation.
pub async fn run(
    daemon: ServiceDaemon,
    config: DiscoveryConfig,
    registry: RegistryHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let interface = config.interface.as_deref();
    let mut poll = tokio::time::interval(config.poll_interval());
    let mut session: Option<DiscoverySession> = None;

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let up = interface_up(interface);
                match (up, session.is_some()) {
                    (true, false) => {
                        match DiscoverySession::start(&daemon, interface, registry.clone()) {
                            Ok(started) => session = Some(started),
                            Err(e) => tracing::error!("Failed to start discovery: {:#}", e),
                        }
                    }
                    (false, true) => {
                        tracing::info!("Network link is down");
                        if let Some(running) = session.take() {
                            if let Err(e) = running.stop(&registry).await {
                                tracing::error!("Failed to stop discovery: {:#}", e);
                            }
                        }
                    }
                    _ => {}
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("Interface watcher shutting down");
                break;
            }
        }
    }

    if let Some(running) = session.take() {
        running.stop(&registry).await?;
    }
    Ok(())
}
