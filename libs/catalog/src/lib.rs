//! Catalog management: keeps the store in sync with the portal.
//!
//! A background task fetches the rotate/server catalog from the portal with
//! ETag caching, reconciles the store (servers, rotates, the address map and
//! the poll schedule) and evicts whatever the portal no longer knows about.
//! The task never terminates; every failure is logged and retried on the
//! next interval.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod portal;

pub use portal::{Credentials, Portal, PortalError, PortalRotate, PortalServer, PortalSnapshot};

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use aprs2_model::{Rotate, Server};
use aprs2_store::{Db, StoreError};
use rand::Rng;
use url::Url;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(120);

/// Maximum random delay before a newly appearing server's first poll, so a
/// portal-side mass change doesn't produce a thundering herd.
const MAX_FIRST_POLL_OFFSET: i64 = 300;

/// Rotates with this prefix belong to the poller infrastructure itself and
/// are never managed.
const IGNORED_ROTATE_PREFIX: &str = "t2poll";
const IGNORED_SERVER_PREFIX: &str = "T2POLL-";

pub struct ConfigManager {
    db: Db,
    portal: Portal,
}

impl ConfigManager {
    pub fn new(db: Db, rotates_url: Url, credentials: Option<Credentials>) -> anyhow::Result<Self> {
        Ok(Self {
            db,
            portal: Portal::new(rotates_url, credentials)?,
        })
    }

    /// Refresh the catalog forever. Spawn this as a background task.
    pub async fn run(mut self) {
        loop {
            match self.refresh().await {
                Ok(true) => tracing::info!("Catalog refreshed from portal"),
                Ok(false) => tracing::debug!("Catalog unchanged (304)"),
                Err(e) => tracing::warn!("Catalog refresh failed: {e:#}"),
            }

            tokio::time::sleep(REFRESH_INTERVAL).await;
        }
    }

    /// One fetch-and-reconcile round. Returns `false` when the portal
    /// reported the catalog unchanged.
    pub async fn refresh(&mut self) -> anyhow::Result<bool> {
        let Some(snapshot) = self.portal.fetch_rotates().await? else {
            return Ok(false);
        };

        apply_snapshot(&self.db, &snapshot, chrono::Utc::now().timestamp()).await?;

        Ok(true)
    }
}

/// Reconcile the store against a freshly fetched portal snapshot.
pub async fn apply_snapshot(
    db: &Db,
    snapshot: &PortalSnapshot,
    now: i64,
) -> Result<(), StoreError> {
    let mut servers: HashMap<String, Server> = HashMap::new();
    let mut rotates_seen: HashSet<String> = HashSet::new();

    for (rotate_id, rotate) in snapshot {
        if rotate_id.starts_with(IGNORED_ROTATE_PREFIX) {
            continue;
        }
        rotates_seen.insert(rotate_id.clone());

        let mut members: Vec<String> = rotate
            .servers
            .keys()
            .filter(|id| !id.starts_with(IGNORED_SERVER_PREFIX))
            .cloned()
            .collect();
        members.sort();

        db.store_rotate(&Rotate {
            id: rotate_id.clone(),
            members,
        })
        .await?;

        for (id, config) in &rotate.servers {
            if id.starts_with(IGNORED_SERVER_PREFIX) {
                continue;
            }

            let server = servers.entry(id.clone()).or_insert_with(|| Server {
                id: id.clone(),
                host: config.host.clone(),
                domain: config.domain.clone(),
                ipv4: config.ipv4,
                ipv6: config.ipv6,
                member: vec![],
                deleted: config.deleted,
                out_of_service: config.out_of_service,
                email: config.email.clone(),
                email_alerts: config.email_alerts,
            });
            server.member.push(rotate_id.clone());
        }
    }

    let mut address_map: HashMap<String, String> = HashMap::new();
    let known = db.servers().await?;

    for server in servers.values_mut() {
        server.member.sort();

        // A server we cannot reach over IPv4 cannot be polled at all.
        let Some(ipv4) = server.ipv4 else {
            tracing::info!(id = %server.id, "Server has no IPv4 address, dropping");
            db.poll_queue_remove(&server.id).await?;
            db.remove_server(&server.id).await?;
            continue;
        };

        address_map.insert(ipv4.to_string(), server.id.clone());
        if let Some(ipv6) = server.ipv6 {
            // `Ipv6Addr` displays in canonical form (compressed, lowercase),
            // so every textual variant of the same address maps to one key.
            address_map.insert(ipv6.to_string(), server.id.clone());
        }

        db.store_server(server).await?;

        if db.poll_queue_time(&server.id).await?.is_none() {
            let offset = rand::thread_rng().gen_range(0..MAX_FIRST_POLL_OFFSET);
            tracing::info!(id = %server.id, offset, "New server, scheduling first poll");
            db.poll_queue_set(&server.id, now + offset).await?;
        }
    }

    // Evict servers and rotates the portal no longer lists.
    for id in known.keys() {
        if !servers.contains_key(id) {
            tracing::info!(%id, "Server removed from portal, evicting");
            db.poll_queue_remove(id).await?;
            db.remove_server(id).await?;
        }
    }
    for id in db.rotates().await?.keys() {
        if !rotates_seen.contains(id) {
            tracing::info!(%id, "Rotate removed from portal, evicting");
            db.remove_rotate(id).await?;
        }
    }

    db.set_address_map(&address_map).await?;

    Ok(())
}
