// Remote key/value cache
//
// Fast membership tests and sorted-set accumulation live in a remote
// in-memory store; the durable document backend never sees per-serial
// membership traffic. The cache must be configured to never evict under
// memory pressure: an evicted key silently un-knows serials.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

use crate::ids::{ExpDate, Issuer};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Does the key exist at all?
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Insert into a sorted set. Returns true if the member was newly
    /// inserted, false if it was already present. This is the one atomic
    /// test-and-insert the dedup pipeline is built on.
    async fn sorted_insert(&self, key: &str, member: &str) -> Result<bool>;

    async fn sorted_contains(&self, key: &str, member: &str) -> Result<bool>;

    /// Full enumeration in sort order.
    async fn sorted_list(&self, key: &str) -> Result<Vec<String>>;

    /// Attach an absolute expiration time to a key.
    async fn expire_at(&self, key: &str, when: DateTime<Utc>) -> Result<()>;

    /// FIFO queue primitives.
    async fn queue(&self, key: &str, id: &str) -> Result<i64>;
    async fn pop(&self, key: &str) -> Result<Option<String>>;
    async fn queue_length(&self, key: &str) -> Result<i64>;
}

/// Key of the per-shard set of serials already ingested.
pub fn serials_key(exp_date: &ExpDate, issuer: &Issuer) -> String {
    format!("serials::{}::{}", exp_date, issuer.id())
}

/// Key of the per-shard set of issuer distinguished names.
pub fn issuers_key(exp_date: &ExpDate, issuer: &Issuer) -> String {
    format!("issuer::{}::{}", exp_date, issuer.id())
}

/// Key of the per-shard set of CRL distribution point URLs.
pub fn crls_key(exp_date: &ExpDate, issuer: &Issuer) -> String {
    format!("crl::{}::{}", exp_date, issuer.id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_key_shapes() {
        let exp = ExpDate::parse("2027-06-30").unwrap();
        let issuer = Issuer::from_id("aGVsbG8=");
        assert_eq!(serials_key(&exp, &issuer), "serials::2027-06-30::aGVsbG8=");
        assert_eq!(issuers_key(&exp, &issuer), "issuer::2027-06-30::aGVsbG8=");
        assert_eq!(crls_key(&exp, &issuer), "crl::2027-06-30::aGVsbG8=");
    }
}
