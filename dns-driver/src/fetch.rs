//! Fetching and gating the pollers' full status snapshots.
//!
//! A poller that is itself in trouble (few servers polled, or most of them
//! failing from its vantage point) would poison the merge, so its whole
//! snapshot is discarded.

use std::collections::HashMap;
use std::time::Duration;

use aprs2_model::{FullStatus, ServerStatus};
use url::Url;

pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-server, per-site poll results: `server id -> site id -> status`.
pub type StatusSet = HashMap<String, HashMap<String, ServerStatus>>;

pub struct FetchGates {
    pub min_polled_servers: usize,
    pub min_polled_ok_pct: f64,
    pub max_test_result_age: i64,
}

pub async fn fetch_full_status(
    client: &reqwest::Client,
    pollers: &[Url],
    gates: &FetchGates,
    now: i64,
) -> StatusSet {
    let mut set = StatusSet::new();

    for base in pollers {
        let site = site_id(base);

        let url = match base.join("api/full") {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(%site, "Bad poller URL: {e}");
                continue;
            }
        };

        tracing::info!(%site, "Fetching status");
        let response = match client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(%site, "HTTP full JSON status fetch: Connection error: {e}");
                continue;
            }
        };

        if !response.status().is_success() {
            tracing::error!(%site, "HTTP full JSON status fetch: Status code {}", response.status());
            continue;
        }

        let full: FullStatus = match response.json().await {
            Ok(full) => full,
            Err(e) => {
                tracing::error!(%site, "JSON parsing failed: {e}");
                continue;
            }
        };

        accept_snapshot(&site, full, gates, now, &mut set);
    }

    set
}

/// Validate one poller's snapshot and merge the acceptable per-server
/// results into the set.
pub(crate) fn accept_snapshot(
    site: &str,
    full: FullStatus,
    gates: &FetchGates,
    now: i64,
    set: &mut StatusSet,
) {
    if full.result != "full" && full.result != "ok" {
        tracing::error!(%site, "Full status JSON does not have result: ok/full");
        return;
    }

    if full.servers.len() < gates.min_polled_servers {
        tracing::error!(
            %site,
            "{} servers polled - too few (min {})!",
            full.servers.len(),
            gates.min_polled_servers
        );
        return;
    }

    let ok = full
        .servers
        .iter()
        .filter(|s| s.status.status.is_ok())
        .count();
    let ok_pct = 100.0 * ok as f64 / full.servers.len() as f64;
    tracing::info!(%site, "{ok}/{} ({ok_pct:.1} %) servers OK", full.servers.len());

    if ok_pct < gates.min_polled_ok_pct {
        tracing::error!(
            %site,
            "Too few servers OK ({ok_pct:.1} % < {:.0} %) - poller having trouble?",
            gates.min_polled_ok_pct
        );
        return;
    }

    for entry in full.servers {
        let age = now - entry.status.last_test;
        if age > gates.max_test_result_age {
            tracing::error!(%site, id = %entry.config.id, "test age {age} > {}", gates.max_test_result_age);
            continue;
        }

        set.entry(entry.config.id.clone())
            .or_default()
            .insert(site.to_owned(), entry.status);
    }
}

fn site_id(url: &Url) -> String {
    let host = url.host_str().unwrap_or("unknown");
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}
