use std::collections::HashMap;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use anyhow::{Context, Result};
use shared::protocol::RegistrationService;
use shared::types::Record;

/// Advertises records registered by local clients.
#[derive(Clone)]
pub struct Advertiser {
    daemon: ServiceDaemon,
    hostname: String,
}

impl Advertiser {
    /// `hostname` overrides the host used for records that name no server.
    pub fn new(daemon: ServiceDaemon, hostname: Option<String>) -> Result<Self> {
        let hostname = match hostname {
            Some(name) => name,
            None => {
                let name = hostname::get()
                    .context("Failed to get system hostname")?
                    .to_string_lossy()
                    .to_string();
                format!("{}.local.", name)
            }
        };
        Ok(Self { daemon, hostname })
    }

    fn service_info(&self, record: &Record) -> Result<ServiceInfo> {
        let host = if record.server.is_empty() {
            self.hostname.as_str()
        } else {
            record.server.as_str()
        };

        let info = ServiceInfo::new(&record.service_type, &record.name, host, "", record.port, txt_properties(record))
            .with_context(|| format!("Invalid service record {}", record.full_name()))?
            .enable_addr_auto();
        Ok(info)
    }
}

/// TXT values that are not text cannot go through the string API and are skipped.
fn txt_properties(record: &Record) -> HashMap<String, String> {
    let mut txt = HashMap::new();
    for name in record.property_names() {
        match record.property_str(name) {
            Some(value) => {
                txt.insert(name.to_string(), value);
            }
            None => tracing::warn!("Skipping binary TXT property {} of {}", name, record.name),
        }
    }
    txt
}

impl RegistrationService for Advertiser {
    async fn register_service(&self, record: &Record) -> Result<()> {
        let info = self.service_info(record)?;
        self.daemon
            .register(info)
            .with_context(|| format!("Failed to register {}", record.full_name()))?;

        tracing::info!(
            "Registered {} on port {}",
            record.full_name(),
            record.port
        );
        Ok(())
    }

    async fn unregister_service(&self, record: &Record) -> Result<()> {
        let fullname = record.full_name();
        self.daemon
            .unregister(&fullname)
            .with_context(|| format!("Failed to unregister {}", fullname))?;

        tracing::info!("Unregistered {}", fullname);
        Ok(())
    }
}
