//! The DNS driver loop.

use std::time::Duration;

use anyhow::Result;
use aprs2_metrics::Graphite;
use aprs2_store::Db;
use serde_json::json;

use crate::fetch::{self, FetchGates};
use crate::merge;
use crate::publish::Publisher;
use crate::rotate;
use crate::settings::DnsSettings;

pub struct DnsDriver {
    db: Db,
    client: reqwest::Client,
    settings: DnsSettings,
    publisher: Publisher,
    graphite: Graphite,
}

impl DnsDriver {
    pub fn new(db: Db, settings: DnsSettings, graphite: Graphite) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("aprs2net-dns/2.0")
            .timeout(fetch::HTTP_TIMEOUT)
            .build()?;

        let publisher = Publisher::from_settings(&settings)?;

        Ok(Self {
            db,
            client,
            settings,
            publisher,
            graphite,
        })
    }

    /// Run cycles forever. Failures are transient: log and try again on the
    /// next interval.
    pub async fn run(mut self) -> Result<()> {
        loop {
            if let Err(e) = self.cycle().await {
                tracing::warn!("DNS driver cycle failed: {e:#}");
            }

            tokio::time::sleep(Duration::from_secs(self.settings.poll_interval as u64)).await;
        }
    }

    /// One full cycle: fetch, merge, select, publish, notify.
    pub async fn cycle(&mut self) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let gates = FetchGates {
            min_polled_servers: self.settings.min_polled_servers,
            min_polled_ok_pct: self.settings.min_polled_ok_pct,
            max_test_result_age: self.settings.max_test_result_age,
        };

        let status_set =
            fetch::fetch_full_status(&self.client, &self.settings.pollers, &gates, now).await;

        // With no status at all, touching DNS would CNAME every server to
        // the master rotate. Throw in the towel instead.
        if status_set.is_empty() {
            tracing::error!("Failed to get any server status information - no pollers reachable?");
            return Ok(());
        }

        let servers = self.db.servers().await?;

        let merged = merge::merge_status(
            &self.db,
            &self.graphite,
            &servers,
            &status_set,
            self.settings.poll_interval,
            now,
        )
        .await?;

        rotate::update_dns(
            &self.db,
            &mut self.publisher,
            &self.graphite,
            &self.settings,
            &servers,
            &merged,
        )
        .await?;

        self.db.publish_dns_status(&json!({ "reload": "full" })).await?;

        Ok(())
    }
}
