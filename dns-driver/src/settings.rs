use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use url::Url;

fn default_unmanaged() -> Vec<String> {
    [
        "hubs.aprs2.net",
        "hub-rotate.aprs2.net",
        "cwop.aprs.net",
        "rotate.aprs.net",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

/// The `[dns]` section of the shared configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsSettings {
    /// Seconds between driver cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: i64,
    /// Base URLs of the poller sites to aggregate.
    pub pollers: Vec<Url>,
    pub portal_rotates_url: Url,
    #[serde(default = "default_site_descr")]
    pub site_descr: String,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default)]
    pub graphite_server: Option<String>,

    /// Dynamic-update master, `ip` or `ip:port`.
    #[serde(default)]
    pub dns_master: Option<String>,
    /// Base64 TSIG secret for the `aprs2net-dns.` key.
    #[serde(default)]
    pub dns_tsig_key: Option<String>,
    /// Zones we are allowed to update, matched by longest suffix.
    #[serde(default)]
    pub dns_zones: Vec<String>,
    #[serde(default = "default_dns_ttl")]
    pub dns_ttl: u32,

    #[serde(default)]
    pub cloudflare_token: Option<String>,
    /// Zone name to Cloudflare zone id.
    #[serde(default)]
    pub cloudflare_zones: HashMap<String, String>,

    /// Fallback CNAME target, and the rotate with the stricter entry gate.
    pub master_rotate: String,
    #[serde(default = "default_unmanaged")]
    pub unmanaged_rotates: Vec<String>,

    #[serde(default = "default_min_polled_servers")]
    pub min_polled_servers: usize,
    #[serde(default = "default_min_polled_ok_pct")]
    pub min_polled_ok_pct: f64,
    /// Per-server poll results older than this many seconds are ignored.
    #[serde(default = "default_max_test_result_age")]
    pub max_test_result_age: i64,

    #[serde(default)]
    pub portal_login_url: Option<Url>,
    #[serde(default)]
    pub client_user: Option<String>,
    #[serde(default)]
    pub client_pass: Option<String>,
}

fn default_poll_interval() -> i64 {
    120
}

fn default_site_descr() -> String {
    "Unconfigured, CC".to_owned()
}

fn default_listen() -> SocketAddr {
    ([0, 0, 0, 0], 8038).into()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/1".to_owned()
}

fn default_dns_ttl() -> u32 {
    600
}

fn default_min_polled_servers() -> usize {
    80
}

fn default_min_polled_ok_pct() -> f64 {
    55.0
}

fn default_max_test_result_age() -> i64 {
    660
}

impl DnsSettings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct ConfigFile {
            dns: DnsSettings,
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = toml::from_str::<ConfigFile>(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config.dns)
    }

    pub fn portal_credentials(&self) -> Option<aprs2_catalog::Credentials> {
        Some(aprs2_catalog::Credentials {
            login_url: self.portal_login_url.clone()?,
            username: self.client_user.clone()?,
            password: self.client_pass.clone()?,
        })
    }

    pub fn is_unmanaged(&self, rotate: &str) -> bool {
        self.unmanaged_rotates.iter().any(|r| r == rotate)
    }
}
