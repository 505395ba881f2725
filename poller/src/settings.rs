use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use aprs2_model::Software;
use serde::Deserialize;
use url::Url;

/// The `[poller]` section of the shared configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollerSettings {
    /// Seconds between polls of the same server.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: i64,
    pub portal_rotates_url: Url,
    /// Site label shown in the web UI.
    #[serde(default = "default_site_descr")]
    pub site_descr: String,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default)]
    pub graphite_server: Option<String>,
    /// Flavor order for servers whose software is not yet known. The
    /// javAPRSSrvr 3 check must come before the others: it is recognized
    /// only by the absence of a `Server:` header.
    #[serde(default = "default_probe_order")]
    pub probe_order: Vec<Software>,
    #[serde(default)]
    pub portal_login_url: Option<Url>,
    #[serde(default)]
    pub client_user: Option<String>,
    #[serde(default)]
    pub client_pass: Option<String>,
}

fn default_poll_interval() -> i64 {
    300
}

fn default_site_descr() -> String {
    "Unconfigured, CC".to_owned()
}

fn default_listen() -> SocketAddr {
    ([0, 0, 0, 0], 8036).into()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_owned()
}

fn default_probe_order() -> Vec<Software> {
    vec![Software::Javap3, Software::Aprsc, Software::Javap4]
}

impl PollerSettings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct ConfigFile {
            poller: PollerSettings,
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = toml::from_str::<ConfigFile>(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config.poller)
    }

    pub fn portal_credentials(&self) -> Option<aprs2_catalog::Credentials> {
        Some(aprs2_catalog::Credentials {
            login_url: self.portal_login_url.clone()?,
            username: self.client_user.clone()?,
            password: self.client_pass.clone()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let settings: PollerSettings = toml::from_str::<ConfigOnly>(
            r#"
            [poller]
            portal_rotates_url = "https://portal.example.com/rotates.json"

            [dns]
            whatever = "ignored by the poller"
            "#,
        )
        .unwrap()
        .poller;

        assert_eq!(settings.poll_interval, 300);
        assert_eq!(settings.site_descr, "Unconfigured, CC");
        assert_eq!(
            settings.probe_order,
            vec![Software::Javap3, Software::Aprsc, Software::Javap4]
        );
        assert!(settings.portal_credentials().is_none());
    }

    #[test]
    fn probe_order_is_configurable() {
        let settings: PollerSettings = toml::from_str::<ConfigOnly>(
            r#"
            [poller]
            portal_rotates_url = "https://portal.example.com/rotates.json"
            probe_order = ["aprsc", "javap4", "javap3"]
            poll_interval = 120
            "#,
        )
        .unwrap()
        .poller;

        assert_eq!(settings.poll_interval, 120);
        assert_eq!(
            settings.probe_order,
            vec![Software::Aprsc, Software::Javap4, Software::Javap3]
        );
    }

    #[derive(Deserialize)]
    struct ConfigOnly {
        poller: PollerSettings,
    }
}
