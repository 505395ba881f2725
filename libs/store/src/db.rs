use std::collections::HashMap;
use std::sync::Arc;

use aprs2_model::{Rotate, RotateStats, Server, ServerLog};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Result, Store, avail, keys};

/// Typed facade over the store, encoding the aprs2 key layout.
///
/// Status records are generic: the poller stores [`aprs2_model::ServerStatus`]
/// and the DNS driver stores [`aprs2_model::MergedStatus`] under the same key
/// in its own database.
#[derive(Clone)]
pub struct Db {
    store: Arc<dyn Store>,
}

impl Db {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn server(&self, id: &str) -> Result<Option<Server>> {
        self.hash_get_json(keys::SERVER, id).await
    }

    pub async fn servers(&self) -> Result<HashMap<String, Server>> {
        self.hash_get_all_json(keys::SERVER).await
    }

    pub async fn store_server(&self, server: &Server) -> Result<()> {
        self.hash_set_json(keys::SERVER, &server.id, server).await
    }

    /// Remove a server and everything recorded about it, except the
    /// availability history which ages out on its own.
    pub async fn remove_server(&self, id: &str) -> Result<()> {
        self.store.hash_del(keys::SERVER, id).await?;
        self.store.hash_del(keys::SERVER_STATUS, id).await?;
        self.store.hash_del(keys::SERVER_LOG, id).await?;

        Ok(())
    }

    pub async fn server_status<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>> {
        self.hash_get_json(keys::SERVER_STATUS, id).await
    }

    pub async fn set_server_status<T: Serialize>(&self, id: &str, status: &T) -> Result<()> {
        self.hash_set_json(keys::SERVER_STATUS, id, status).await
    }

    pub async fn server_statuses<T: DeserializeOwned>(&self) -> Result<HashMap<String, T>> {
        self.hash_get_all_json(keys::SERVER_STATUS).await
    }

    pub async fn store_server_log(&self, id: &str, entry: &ServerLog) -> Result<()> {
        self.hash_set_json(keys::SERVER_LOG, id, entry).await
    }

    pub async fn rotate(&self, id: &str) -> Result<Option<Rotate>> {
        self.hash_get_json(keys::ROTATE, id).await
    }

    pub async fn rotates(&self) -> Result<HashMap<String, Rotate>> {
        self.hash_get_all_json(keys::ROTATE).await
    }

    pub async fn store_rotate(&self, rotate: &Rotate) -> Result<()> {
        self.hash_set_json(keys::ROTATE, &rotate.id, rotate).await
    }

    pub async fn remove_rotate(&self, id: &str) -> Result<()> {
        self.store.hash_del(keys::ROTATE, id).await
    }

    pub async fn address_map(&self) -> Result<HashMap<String, String>> {
        let Some(raw) = self.store.scalar_get(keys::ADDRESS_MAP).await? else {
            return Ok(HashMap::new());
        };

        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn set_address_map(&self, map: &HashMap<String, String>) -> Result<()> {
        self.store
            .scalar_set(keys::ADDRESS_MAP, &serde_json::to_string(map)?)
            .await
    }

    /// Server ids whose next poll time is due, ascending, at most `max`.
    pub async fn poll_queue_due(&self, now: i64, max: usize) -> Result<Vec<String>> {
        self.store
            .zset_range_by_score(keys::POLL_QUEUE, 0.0, now as f64, max)
            .await
    }

    pub async fn poll_queue_set(&self, id: &str, next_poll: i64) -> Result<()> {
        self.store
            .zset_add(keys::POLL_QUEUE, id, next_poll as f64)
            .await
    }

    pub async fn poll_queue_time(&self, id: &str) -> Result<Option<i64>> {
        Ok(self
            .store
            .zset_score(keys::POLL_QUEUE, id)
            .await?
            .map(|s| s as i64))
    }

    pub async fn poll_queue_remove(&self, id: &str) -> Result<()> {
        self.store.zset_remove(keys::POLL_QUEUE, id).await
    }

    /// Every queued server id, in next-poll order. The web UI renders this
    /// as the schedule.
    pub async fn poll_queue_ids(&self) -> Result<Vec<String>> {
        self.store.zset_members(keys::POLL_QUEUE).await
    }

    pub async fn store_rotate_status<T: Serialize>(&self, status: &T) -> Result<()> {
        self.store
            .scalar_set(keys::ROTATE_STATUS, &serde_json::to_string(status)?)
            .await
    }

    pub async fn store_rotate_stats(&self, rotate: &str, stats: &RotateStats) -> Result<()> {
        self.hash_set_json(keys::ROTATE_STATS, rotate, stats).await
    }

    pub async fn rotate_stats(&self, rotate: &str) -> Result<Option<RotateStats>> {
        self.hash_get_json(keys::ROTATE_STATS, rotate).await
    }

    pub async fn set_web_config<T: Serialize>(&self, config: &T) -> Result<()> {
        self.store
            .scalar_set(keys::WEB_CONFIG, &serde_json::to_string(config)?)
            .await
    }

    pub async fn publish_status<T: Serialize>(&self, message: &T) -> Result<()> {
        self.store
            .publish(keys::CH_STATUS, &serde_json::to_string(message)?)
            .await
    }

    pub async fn publish_dns_status<T: Serialize>(&self, message: &T) -> Result<()> {
        self.store
            .publish(keys::CH_STATUS_DNS, &serde_json::to_string(message)?)
            .await
    }

    /// Add `tdif` seconds of up or down time to today's bucket and return
    /// the recomputed `(avail_3, avail_30)` percentages.
    pub async fn update_avail(
        &self,
        id: &str,
        tdif: i64,
        up: bool,
        now: i64,
    ) -> Result<(Option<f64>, Option<f64>)> {
        avail::update(self.store.as_ref(), id, tdif, up, now).await
    }

    async fn hash_get_json<T: DeserializeOwned>(&self, key: &str, field: &str) -> Result<Option<T>> {
        let Some(raw) = self.store.hash_get(key, field).await? else {
            return Ok(None);
        };

        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn hash_set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        field: &str,
        value: &T,
    ) -> Result<()> {
        self.store
            .hash_set(key, field, &serde_json::to_string(value)?)
            .await
    }

    async fn hash_get_all_json<T: DeserializeOwned>(&self, key: &str) -> Result<HashMap<String, T>> {
        let mut result = HashMap::new();
        for (field, raw) in self.store.hash_get_all(key).await? {
            result.insert(field, serde_json::from_str(&raw)?);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;
    use aprs2_model::{Props, ServerState, ServerStatus};

    fn db() -> Db {
        Db::new(Arc::new(MemStore::new()))
    }

    fn server(id: &str) -> Server {
        Server {
            id: id.to_owned(),
            host: Some("finland".to_owned()),
            domain: Some("aprs2.net".to_owned()),
            ipv4: Some("85.188.1.32".parse().unwrap()),
            ipv6: None,
            member: vec!["rotate.aprs2.net".to_owned()],
            deleted: false,
            out_of_service: false,
            email: None,
            email_alerts: false,
        }
    }

    #[tokio::test]
    async fn server_round_trip() {
        let db = db();
        let s = server("T2FINLAND");

        db.store_server(&s).await.unwrap();

        assert_eq!(db.server("T2FINLAND").await.unwrap(), Some(s));
        assert_eq!(db.server("T2NOWHERE").await.unwrap(), None);
    }

    #[tokio::test]
    async fn status_round_trip() {
        let db = db();
        let status = ServerStatus {
            status: ServerState::Ok,
            last_test: 1000,
            last_change: 900,
            props: Some(Props {
                clients: Some(17),
                ..Props::default()
            }),
            errors: vec![],
            avail_3: Some(99.99),
            avail_30: Some(99.5),
        };

        db.set_server_status("T2FINLAND", &status).await.unwrap();

        let back: ServerStatus = db.server_status("T2FINLAND").await.unwrap().unwrap();
        assert_eq!(back, status);
    }

    #[tokio::test]
    async fn poll_queue_orders_by_due_time() {
        let db = db();

        db.poll_queue_set("T2LATE", 500).await.unwrap();
        db.poll_queue_set("T2EARLY", 100).await.unwrap();
        db.poll_queue_set("T2FUTURE", 9000).await.unwrap();

        let due = db.poll_queue_due(1000, 10).await.unwrap();
        assert_eq!(due, vec!["T2EARLY", "T2LATE"]);

        let due = db.poll_queue_due(1000, 1).await.unwrap();
        assert_eq!(due, vec!["T2EARLY"]);

        let all = db.poll_queue_ids().await.unwrap();
        assert_eq!(all, vec!["T2EARLY", "T2LATE", "T2FUTURE"]);
    }

    #[tokio::test]
    async fn remove_server_clears_status_and_log() {
        let db = db();
        db.store_server(&server("T2GONE")).await.unwrap();
        db.set_server_status(
            "T2GONE",
            &ServerStatus {
                status: ServerState::Fail,
                last_test: 1,
                last_change: 1,
                props: None,
                errors: vec![],
                avail_3: None,
                avail_30: None,
            },
        )
        .await
        .unwrap();

        db.remove_server("T2GONE").await.unwrap();

        assert_eq!(db.server("T2GONE").await.unwrap(), None);
        let status: Option<ServerStatus> = db.server_status("T2GONE").await.unwrap();
        assert_eq!(status, None);
    }

    #[tokio::test]
    async fn address_map_round_trip() {
        let db = db();
        let mut map = HashMap::new();
        map.insert("85.188.1.32".to_owned(), "T2FINLAND".to_owned());
        map.insert("2001:67c:15c::32".to_owned(), "T2FINLAND".to_owned());

        db.set_address_map(&map).await.unwrap();

        assert_eq!(db.address_map().await.unwrap(), map);
    }
}
