//! Cloudflare API back-end.
//!
//! The API has no replace-everything primitive, so the desired record set
//! is diffed against what the zone currently holds and applied as a minimal
//! create/replace/delete plan. Records we manage carry a marker comment.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use reqwest::header;
use serde::Deserialize;
use serde_json::json;

use super::{DnsBackend, DnsRecords};

const API_BASE: &str = "https://api.cloudflare.com/client/v4";
const MANAGED_COMMENT: &str = "aprs2-dynamic";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CloudflareBackend {
    client: reqwest::Client,
    /// Zone name to Cloudflare zone id.
    zone_ids: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
    result: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CfRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Desired {
    pub kind: &'static str,
    pub content: String,
}

#[derive(Debug, Default)]
pub(crate) struct Plan {
    pub create: Vec<Desired>,
    pub replace: Vec<(String, Desired)>,
    pub delete: Vec<String>,
}

impl CloudflareBackend {
    pub fn new(token: &str, zone_ids: HashMap<String, String>) -> anyhow::Result<Self> {
        let mut headers = header::HeaderMap::new();
        let mut auth = header::HeaderValue::try_from(format!("Bearer {token}"))
            .context("cloudflare_token is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .user_agent("aprs2net-dns/2.0")
            .timeout(HTTP_TIMEOUT)
            .default_headers(headers)
            .build()?;

        Ok(Self { client, zone_ids })
    }

    async fn existing_records(&self, zone_id: &str, fqdn: &str) -> anyhow::Result<Vec<CfRecord>> {
        let response: ApiResponse<Vec<CfRecord>> = self
            .client
            .get(format!("{API_BASE}/zones/{zone_id}/dns_records"))
            .query(&[("name", fqdn)])
            .send()
            .await?
            .json()
            .await
            .context("record list response is not JSON")?;

        if !response.success {
            bail!("record list failed: {:?}", response.errors);
        }

        Ok(response.result.unwrap_or_default())
    }

    async fn apply(
        &self,
        zone_id: &str,
        fqdn: &str,
        plan: Plan,
        ttl: u32,
    ) -> anyhow::Result<()> {
        let body = |desired: &Desired| {
            json!({
                "type": desired.kind,
                "name": fqdn,
                "content": desired.content,
                "ttl": ttl,
                "comment": MANAGED_COMMENT,
            })
        };

        for (record_id, desired) in &plan.replace {
            tracing::info!("{fqdn}: replacing {record_id} with {} {}", desired.kind, desired.content);
            let response: ApiResponse<serde_json::Value> = self
                .client
                .put(format!("{API_BASE}/zones/{zone_id}/dns_records/{record_id}"))
                .json(&body(desired))
                .send()
                .await?
                .json()
                .await?;
            if !response.success {
                bail!("replace of {record_id} failed: {:?}", response.errors);
            }
        }

        for desired in &plan.create {
            tracing::info!("{fqdn}: inserting {} {}", desired.kind, desired.content);
            let response: ApiResponse<serde_json::Value> = self
                .client
                .post(format!("{API_BASE}/zones/{zone_id}/dns_records"))
                .json(&body(desired))
                .send()
                .await?
                .json()
                .await?;
            if !response.success {
                bail!("create of {} {} failed: {:?}", desired.kind, desired.content, response.errors);
            }
        }

        for record_id in &plan.delete {
            tracing::info!("{fqdn}: deleting {record_id}");
            let response: ApiResponse<serde_json::Value> = self
                .client
                .delete(format!("{API_BASE}/zones/{zone_id}/dns_records/{record_id}"))
                .send()
                .await?
                .json()
                .await?;
            if !response.success {
                bail!("delete of {record_id} failed: {:?}", response.errors);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl DnsBackend for CloudflareBackend {
    fn name(&self) -> &'static str {
        "cloudflare"
    }

    async fn publish(
        &self,
        zone: &str,
        fqdn: &str,
        records: &DnsRecords,
        ttl: u32,
    ) -> anyhow::Result<()> {
        let Some(zone_id) = self.zone_ids.get(zone) else {
            bail!("no Cloudflare zone id configured for zone {zone}");
        };

        let existing = self.existing_records(zone_id, fqdn).await?;
        let plan = plan(&existing, records);

        self.apply(zone_id, fqdn, plan, ttl).await
    }
}

/// Diff the desired record set against the zone's current state. Existing
/// record ids are reused through replaces where possible, so a member swap
/// is one API call instead of two.
pub(crate) fn plan(existing: &[CfRecord], desired: &DnsRecords) -> Plan {
    let want: Vec<Desired> = match desired {
        DnsRecords::Cname(target) => vec![Desired {
            kind: "CNAME",
            content: target.clone(),
        }],
        DnsRecords::Addresses { v4, v6 } => v4
            .iter()
            .map(|a| Desired {
                kind: "A",
                content: a.clone(),
            })
            .chain(v6.iter().map(|a| Desired {
                kind: "AAAA",
                content: a.clone(),
            }))
            .collect(),
    };

    let have: HashSet<(&str, &str)> = existing
        .iter()
        .map(|r| (r.kind.as_str(), r.content.as_str()))
        .collect();
    let keep: HashSet<(&str, &str)> = want
        .iter()
        .map(|d| (d.kind, d.content.as_str()))
        .collect();

    let need: Vec<Desired> = want
        .iter()
        .filter(|d| !have.contains(&(d.kind, d.content.as_str())))
        .cloned()
        .collect();

    let mut stale: Vec<String> = existing
        .iter()
        .filter(|r| !keep.contains(&(r.kind.as_str(), r.content.as_str())))
        .map(|r| r.id.clone())
        .collect();

    let mut plan = Plan::default();
    for desired in need {
        match stale.pop() {
            Some(record_id) => plan.replace.push((record_id, desired)),
            None => plan.create.push(desired),
        }
    }
    plan.delete = stale;

    plan
}
