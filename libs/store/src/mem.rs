use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{Result, Store};

/// In-memory store used by tests.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    hashes: HashMap<String, BTreeMap<String, String>>,
    scalars: HashMap<String, String>,
    zsets: HashMap<String, BTreeMap<String, f64>>,
    published: Vec<(String, String)>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages published so far, as `(channel, message)` pairs.
    pub fn published(&self) -> Vec<(String, String)> {
        self.inner.lock().published.clone()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .hashes
            .entry(key.to_owned())
            .or_default()
            .insert(field.to_owned(), value.to_owned());

        Ok(())
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<()> {
        if let Some(h) = self.inner.lock().hashes.get_mut(key) {
            h.remove(field);
        }

        Ok(())
    }

    async fn hash_keys(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hash_get_many(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        let inner = self.inner.lock();
        let hash = inner.hashes.get(key);

        Ok(fields
            .iter()
            .map(|f| hash.and_then(|h| h.get(f)).cloned())
            .collect())
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut inner = self.inner.lock();
        let slot = inner
            .hashes
            .entry(key.to_owned())
            .or_default()
            .entry(field.to_owned())
            .or_insert_with(|| "0".to_owned());

        let new = slot.parse::<i64>().unwrap_or(0) + delta;
        *slot = new.to_string();

        Ok(new)
    }

    async fn scalar_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().scalars.get(key).cloned())
    }

    async fn scalar_set(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .scalars
            .insert(key.to_owned(), value.to_owned());

        Ok(())
    }

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.inner
            .lock()
            .zsets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned(), score);

        Ok(())
    }

    async fn zset_score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        Ok(self
            .inner
            .lock()
            .zsets
            .get(key)
            .and_then(|z| z.get(member))
            .copied())
    }

    async fn zset_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let Some(zset) = inner.zsets.get(key) else {
            return Ok(vec![]);
        };

        let mut matching = zset
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (*score, member.clone()))
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        matching.truncate(limit);

        Ok(matching.into_iter().map(|(_, member)| member).collect())
    }

    async fn zset_members(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let Some(zset) = inner.zsets.get(key) else {
            return Ok(vec![]);
        };

        let mut members = zset
            .iter()
            .map(|(member, score)| (*score, member.clone()))
            .collect::<Vec<_>>();
        members.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Ok(members.into_iter().map(|(_, member)| member).collect())
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<()> {
        if let Some(z) = self.inner.lock().zsets.get_mut(key) {
            z.remove(member);
        }

        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.inner
            .lock()
            .published
            .push((channel.to_owned(), message.to_owned()));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_get_many_reports_absent_fields_as_none() {
        let store = MemStore::new();
        store.hash_set("h", "a", "1").await.unwrap();

        let values = store
            .hash_get_many("h", &["a".to_owned(), "b".to_owned()])
            .await
            .unwrap();

        assert_eq!(values, vec![Some("1".to_owned()), None]);
    }

    #[tokio::test]
    async fn hash_incr_by_starts_from_zero() {
        let store = MemStore::new();

        assert_eq!(store.hash_incr_by("h", "counter", 7).await.unwrap(), 7);
        assert_eq!(store.hash_incr_by("h", "counter", 3).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn zset_ranges_are_score_ordered() {
        let store = MemStore::new();
        store.zset_add("z", "c", 3.0).await.unwrap();
        store.zset_add("z", "a", 1.0).await.unwrap();
        store.zset_add("z", "b", 2.0).await.unwrap();

        assert_eq!(store.zset_members("z").await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(
            store.zset_range_by_score("z", 0.0, 2.0, 10).await.unwrap(),
            vec!["a", "b"]
        );

        store.zset_remove("z", "a").await.unwrap();
        assert_eq!(store.zset_score("z", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn published_messages_are_recorded() {
        let store = MemStore::new();
        store.publish("ch.status", "{}").await.unwrap();

        assert_eq!(
            store.published(),
            vec![("ch.status".to_owned(), "{}".to_owned())]
        );
    }
}
