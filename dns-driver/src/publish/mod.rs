//! DNS publication with change suppression.
//!
//! Every record set is reduced to a canonical cache key before publishing;
//! if the key matches what was last pushed successfully for that FQDN,
//! nothing is sent. Score reshuffles that don't change the chosen address
//! set therefore cause no DNS churn, and two consecutive driver cycles over
//! identical input publish exactly once.

mod bind;
mod cloudflare;

pub use bind::BindBackend;
pub use cloudflare::CloudflareBackend;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::settings::DnsSettings;

/// The records desired at one FQDN: either an A/AAAA set or a single CNAME.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsRecords {
    Addresses { v4: Vec<String>, v6: Vec<String> },
    Cname(String),
}

impl DnsRecords {
    pub fn cname(target: &str) -> Self {
        DnsRecords::Cname(target.to_owned())
    }

    /// Canonical form: sorted v4 addresses, space, sorted v6 addresses, so
    /// ordering changes don't defeat the suppression cache.
    fn cache_key(&self) -> String {
        match self {
            DnsRecords::Cname(target) => format!("CNAME {target}"),
            DnsRecords::Addresses { v4, v6 } => {
                let mut v4 = v4.clone();
                let mut v6 = v6.clone();
                v4.sort();
                v6.sort();
                format!("{} {}", v4.join(" "), v6.join(" "))
            }
        }
    }
}

/// One authoritative DNS back-end.
#[async_trait]
pub trait DnsBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(
        &self,
        zone: &str,
        fqdn: &str,
        records: &DnsRecords,
        ttl: u32,
    ) -> anyhow::Result<()>;
}

/// Fans record sets out to the configured back-ends, suppressing no-change
/// updates. The cache only advances when every back-end accepted the
/// update, so a failed push is retried on the next driver cycle.
pub struct Publisher {
    zones: Vec<String>,
    ttl: u32,
    cache: HashMap<String, String>,
    backends: Vec<Box<dyn DnsBackend>>,
}

impl Publisher {
    pub fn from_settings(settings: &DnsSettings) -> anyhow::Result<Self> {
        let mut backends: Vec<Box<dyn DnsBackend>> = Vec::new();

        if let (Some(master), Some(key)) = (&settings.dns_master, &settings.dns_tsig_key) {
            backends.push(Box::new(BindBackend::new(master, key)?));
        }

        if let (Some(token), false) = (&settings.cloudflare_token, settings.cloudflare_zones.is_empty())
        {
            backends.push(Box::new(CloudflareBackend::new(
                token,
                settings.cloudflare_zones.clone(),
            )?));
        }

        Ok(Self::new(
            settings.dns_zones.clone(),
            settings.dns_ttl,
            backends,
        ))
    }

    pub fn new(zones: Vec<String>, ttl: u32, backends: Vec<Box<dyn DnsBackend>>) -> Self {
        Self {
            zones,
            ttl,
            cache: HashMap::new(),
            backends,
        }
    }

    /// Publish `records` at `fqdn` unless they match what is already out
    /// there. Errors are logged, not returned: the next cycle retries.
    pub async fn push(&mut self, logid: &str, fqdn: &str, records: DnsRecords) {
        if self.zones.is_empty() {
            return;
        }

        let key = records.cache_key();
        if self.cache.get(fqdn) == Some(&key) {
            return;
        }

        let Some(zone) = self.pick_zone(fqdn) else {
            tracing::debug!("DNS push [{logid}]: {fqdn} is not in a managed zone, not updating");
            return;
        };
        let zone = zone.to_owned();

        tracing::info!("DNS pushing [{logid}]: {fqdn}: {key}");

        let mut all_ok = true;
        for backend in &self.backends {
            if let Err(e) = backend.publish(&zone, fqdn, &records, self.ttl).await {
                tracing::error!(
                    "DNS push [{logid}]: {} update for {fqdn} failed: {e:#}",
                    backend.name()
                );
                all_ok = false;
            }
        }

        if all_ok {
            self.cache.insert(fqdn.to_owned(), key);
        }
    }

    /// The owning zone: longest dotted-suffix match against the configured
    /// zone list.
    fn pick_zone(&self, fqdn: &str) -> Option<&str> {
        self.zones
            .iter()
            .filter(|zone| fqdn.ends_with(&format!(".{zone}")))
            .max_by_key(|zone| zone.len())
            .map(String::as_str)
    }
}
