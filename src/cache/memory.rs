// In-process mock of the remote cache
//
// Lives beside the production adapter and is swapped in at construction.
// Expired keys are swept on read, so TTL behavior is observable in tests
// without a clock abstraction.

use crate::cache::RemoteCache;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    sets: HashMap<String, BTreeSet<String>>,
    queues: HashMap<String, VecDeque<String>>,
    expirations: HashMap<String, DateTime<Utc>>,
}

impl Inner {
    fn cleanup_expiry(&mut self) {
        let now = Utc::now();
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, t)| **t <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.sets.remove(&key);
            self.queues.remove(&key);
            self.expirations.remove(&key);
        }
    }
}

#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<Inner>,
}

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache::default()
    }

    /// Test hook: force a key's expiration into the past and sweep.
    pub fn expire_now(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.expirations.insert(key.to_string(), Utc::now() - chrono::Duration::seconds(1));
        inner.cleanup_expiry();
    }

    /// Test hook: the TTL attached to a key, if any.
    pub fn expiration_of(&self, key: &str) -> Option<DateTime<Utc>> {
        self.inner.lock().unwrap().expirations.get(key).copied()
    }
}

#[async_trait]
impl RemoteCache for MemoryCache {
    async fn exists(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.cleanup_expiry();
        Ok(inner.sets.contains_key(key) || inner.queues.contains_key(key))
    }

    async fn sorted_insert(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.cleanup_expiry();
        Ok(inner.sets.entry(key.to_string()).or_default().insert(member.to_string()))
    }

    async fn sorted_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        inner.cleanup_expiry();
        Ok(inner.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    async fn sorted_list(&self, key: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.cleanup_expiry();
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn expire_at(&self, key: &str, when: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.expirations.insert(key.to_string(), when);
        Ok(())
    }

    async fn queue(&self, key: &str, id: &str) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.cleanup_expiry();
        let q = inner.queues.entry(key.to_string()).or_default();
        q.push_back(id.to_string());
        Ok(q.len() as i64)
    }

    async fn pop(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        inner.cleanup_expiry();
        Ok(inner.queues.get_mut(key).and_then(|q| q.pop_front()))
    }

    async fn queue_length(&self, key: &str) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        inner.cleanup_expiry();
        Ok(inner.queues.get(key).map_or(0, |q| q.len() as i64))
    }
}
