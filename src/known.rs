// Per-shard serial membership
//
// A thin façade over the remote cache. The only mutating operation is the
// atomic test-and-insert: there is deliberately no separate
// contains-then-insert path, which would race under concurrent ingest.

use crate::cache::{serials_key, RemoteCache};
use crate::ids::{ExpDate, Issuer, Serial};
use crate::Result;
use chrono::Duration;
use std::sync::Arc;

/// How long past a shard's expiration day its cache keys linger before the
/// TTL reclaims them.
pub const EXPIRY_SLACK_DAYS: i64 = 2;

pub struct KnownCertificates {
    exp_date: ExpDate,
    serials_key: String,
    cache: Arc<dyn RemoteCache>,
}

impl KnownCertificates {
    pub fn new(
        exp_date: ExpDate,
        issuer: &Issuer,
        cache: Arc<dyn RemoteCache>,
    ) -> KnownCertificates {
        KnownCertificates {
            exp_date,
            serials_key: serials_key(&exp_date, issuer),
            cache,
        }
    }

    /// Atomically test and insert. Returns true exactly once per serial:
    /// the caller that sees true owns the PEM write for it.
    pub async fn was_unknown(&self, serial: &Serial) -> Result<bool> {
        self.cache.sorted_insert(&self.serials_key, &serial.id()).await
    }

    /// Attach the shard TTL so expired shards vanish naturally.
    pub async fn set_expiry_flag(&self) -> Result<()> {
        let deadline = self.exp_date.expiry_deadline(Duration::days(EXPIRY_SLACK_DAYS));
        self.cache.expire_at(&self.serials_key, deadline).await
    }

    /// Every serial seen so far, in sort order.
    pub async fn known(&self) -> Result<Vec<Serial>> {
        let ids = self.cache.sorted_list(&self.serials_key).await?;
        ids.iter().map(|id| Serial::from_id_string(id)).collect()
    }
}
