//! Server probes: HTTP status pages, the APRS-IS login port and the HTTP
//! submission port.
//!
//! The three status-page probes share one contract: a server either answers
//! as the probed flavor ([`Detection::Alive`]), clearly isn't that flavor
//! ([`Detection::NotThisType`]) or is broken ([`Detection::Broken`]).

pub mod aprsc;
pub mod aprsis;
pub mod javap3;
pub mod javap4;
pub mod submit;

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use aprs2_model::{PollError, Props};
use regex::Regex;

pub const USER_AGENT: &str = "aprs2net-poller/2.0";
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Port of the HTTP status page on every supported flavor.
pub const STATUS_PORT: u16 = 14501;

/// Load percentages are computed against at most this many clients, so
/// servers configured with a huge `clients_max` don't look idle forever.
pub const CLIENT_CAP: i64 = 1000;

/// Outcome of probing one software flavor's status page.
#[derive(Debug)]
pub enum Detection {
    /// The page parsed; RTT in seconds plus the extracted properties.
    Alive { rtt: f64, props: Props },
    /// Definitely some other flavor; try the next one.
    NotThisType,
    /// This server is broken, stop probing.
    Broken(PollError),
}

/// Address family of a probe target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Af {
    Ipv4,
    Ipv6,
}

impl Af {
    pub fn as_str(&self) -> &'static str {
        match self {
            Af::Ipv4 => "ipv4",
            Af::Ipv6 => "ipv6",
        }
    }

    /// Error code prefix for APRS-IS probe failures on this family.
    pub fn is_prefix(&self) -> &'static str {
        match self {
            Af::Ipv4 => "IS4",
            Af::Ipv6 => "IS6",
        }
    }
}

impl fmt::Display for Af {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load percentage of `clients` against a capped capacity.
pub(crate) fn load_pct(clients: i64, clients_max: i64) -> f64 {
    clients as f64 / CLIENT_CAP.min(clients_max).max(1) as f64 * 100.0
}

static RE_IPV4_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+\.\d+\.\d+\.\d+):(\d+)").expect("static regex"));
static RE_IPV6_PORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9a-fA-F:]+:[0-9a-fA-F:]+):(\d+)").expect("static regex")
});

/// Resolve a remote `address:port` literal to a server id through the
/// address map. Anything that doesn't resolve becomes `"unknown"`, which
/// uplink validation then rejects as an unregistered server.
pub(crate) fn map_addr_id(address_map: &HashMap<String, String>, addr: &str) -> String {
    if let Some(m) = RE_IPV4_PORT.captures(addr) {
        return address_map
            .get(&m[1])
            .cloned()
            .unwrap_or_else(|| "unknown".to_owned());
    }

    if let Some(m) = RE_IPV6_PORT.captures(addr) {
        // Canonicalize before the lookup; the map is keyed by the compact
        // lowercase form.
        if let Ok(ip) = m[1].parse::<std::net::Ipv6Addr>() {
            return address_map
                .get(&ip.to_string())
                .cloned()
                .unwrap_or_else(|| "unknown".to_owned());
        }
    }

    "unknown".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address_map() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("85.188.1.32".to_owned(), "T2FINLAND".to_owned());
        map.insert("2001:67c:15c::32".to_owned(), "T2FINLAND".to_owned());
        map
    }

    #[test]
    fn maps_ipv4_with_port() {
        assert_eq!(map_addr_id(&address_map(), "85.188.1.32:14580"), "T2FINLAND");
    }

    #[test]
    fn maps_non_canonical_ipv6() {
        assert_eq!(
            map_addr_id(&address_map(), "2001:67C:015C:0000:0:0:0:32:14580"),
            "T2FINLAND"
        );
    }

    #[test]
    fn unknown_addresses_map_to_unknown() {
        assert_eq!(map_addr_id(&address_map(), "192.0.2.1:14580"), "unknown");
        assert_eq!(map_addr_id(&address_map(), "garbage"), "unknown");
    }

    #[test]
    fn load_is_computed_against_the_client_cap() {
        assert!((load_pct(17, 1000) - 1.7).abs() < 1e-9);
        // Capacity above the cap is clamped to it.
        assert!((load_pct(150, 5000) - 15.0).abs() < 1e-9);
        // Capacity below the cap is used as-is.
        assert!((load_pct(10, 100) - 10.0).abs() < 1e-9);
    }
}
