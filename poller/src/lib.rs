//! aprs2.net poller: probes every registered APRS-IS server, scores it and
//! publishes the per-server result for the DNS driver to consume.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod api;
pub mod job;
pub mod logbuf;
pub mod orchestrator;
pub mod probe;
pub mod score;
pub mod settings;
pub mod uplink;

use std::collections::HashMap;
use std::sync::Arc;

use aprs2_store::Db;
use dashmap::DashMap;
use parking_lot::RwLock;

use aprs2_model::Software;

/// Shared state of one poller process, constructed once at startup and
/// passed explicitly to everything that needs it.
pub struct PollerCtx {
    pub db: Db,
    pub client: reqwest::Client,
    pub graphite: aprs2_metrics::Graphite,
    pub settings: settings::PollerSettings,
    pub caches: Caches,
    /// Snapshot of the address map, refreshed periodically from the store.
    address_map: RwLock<Arc<HashMap<String, String>>>,
}

impl PollerCtx {
    pub fn new(
        db: Db,
        graphite: aprs2_metrics::Graphite,
        settings: settings::PollerSettings,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(probe::USER_AGENT)
            .timeout(probe::HTTP_TIMEOUT)
            .build()?;

        Ok(Self {
            db,
            client,
            graphite,
            settings,
            caches: Caches::default(),
            address_map: RwLock::new(Arc::new(HashMap::new())),
        })
    }

    pub fn address_map(&self) -> Arc<HashMap<String, String>> {
        self.address_map.read().clone()
    }

    pub fn set_address_map(&self, map: HashMap<String, String>) {
        *self.address_map.write() = Arc::new(map);
    }
}

/// Per-process caches, all keyed by server id. Only the worker currently
/// polling a server writes its entries, so no further locking is needed.
#[derive(Default)]
pub struct Caches {
    /// Last successfully detected software flavor, used to bias the next
    /// probe's flavor order.
    pub software_type: DashMap<String, Software>,
    /// Cumulative counters from the previous poll, for byte/connect rates.
    pub rates: DashMap<String, RatesEntry>,
}

#[derive(Debug, Clone, Copy)]
pub struct RatesEntry {
    /// Epoch seconds of the poll that recorded these counters.
    pub t: f64,
    pub total_bytes_in: f64,
    pub total_bytes_out: f64,
    pub connects: f64,
}
