// Durable document storage
//
// The backend owns PEM blobs, log checkpoints, and the shard allocation
// markers that make (expDate, issuer) enumeration possible without scanning
// the PEM space. Adapters are capability sets behind one trait; the mock
// lives beside the production ones and is swapped at construction.
//
// Document hierarchy (collections alternate with documents):
//
//   logs/<base64(host+path)>                          checkpoint
//   ct/<expDate>                                      expDate marker
//   ct/<expDate>/issuer/<issuerID>                    shard marker
//   ct/<expDate>/issuer/<issuerID>/certs/<serialID>   PEM document

pub mod firestore;
pub mod local;
pub mod memory;

pub use self::firestore::FirestoreBackend;
pub use self::local::LocalDiskBackend;
pub use self::memory::MemoryBackend;

use crate::ids::{CertificateLog, ExpDate, Issuer, Serial};
use crate::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::mpsc;

/// Page size for serial streams; the offset advances by documents actually
/// delivered, never by the limit.
pub const STREAM_PAGE_LIMIT: usize = 4096;

/// Buffer of the bounded channels backing streams.
pub const STREAM_BUFFER: usize = 2048;

// Document field names and type tags, shared by every adapter so persisted
// layouts stay interchangeable.
pub const FIELD_TYPE: &str = "type";
pub const FIELD_DATA: &str = "data";
pub const FIELD_EXP_DATE: &str = "expDate";
pub const FIELD_ISSUER: &str = "issuer";
pub const FIELD_URL: &str = "shortUrl";
pub const FIELD_UNIX_TIME: &str = "unixTime";

pub const TYPE_PEM: &str = "PEM";
pub const TYPE_LOG_STATE: &str = "LogState";
pub const TYPE_EXP_DATE: &str = "ExpDate";
pub const TYPE_METADATA: &str = "Metadata";

/// A durable document store.
///
/// Streams are bounded channels closed by the producer on exhaustion or
/// unrecoverable error; consumers must drain them. Dropping the receiver
/// cancels the producer.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Best-effort freshness flag read by external consumers.
    async fn mark_dirty(&self, id: &str) -> Result<()>;

    /// Idempotent create: a duplicate write of the same document is counted
    /// as a collision and reported as success.
    async fn store_certificate_pem(
        &self,
        serial: &Serial,
        exp_date: &ExpDate,
        issuer: &Issuer,
        pem: &[u8],
    ) -> Result<()>;

    async fn load_certificate_pem(
        &self,
        serial: &Serial,
        exp_date: &ExpDate,
        issuer: &Issuer,
    ) -> Result<Vec<u8>>;

    /// Upsert the checkpoint document.
    async fn store_log_state(&self, log: &CertificateLog) -> Result<()>;

    /// Load a checkpoint. An absent document is not an error: the zero
    /// checkpoint with the short URL populated comes back instead.
    async fn load_log_state(&self, short_url: &str) -> Result<CertificateLog>;

    /// Idempotent upsert of the expDate and shard markers. Safe to call from
    /// concurrent workers.
    async fn allocate_exp_date_and_issuer(&self, exp_date: &ExpDate, issuer: &Issuer)
        -> Result<()>;

    async fn stream_expiration_dates(&self, not_before: NaiveDate)
        -> Result<mpsc::Receiver<ExpDate>>;

    async fn stream_issuers_for_expiration_date(
        &self,
        exp_date: &ExpDate,
    ) -> Result<mpsc::Receiver<Issuer>>;

    /// Paginated stream of a shard's serials. Adapters recover from a
    /// mid-stream deadline by re-issuing the next window from the current
    /// offset; any other error closes the stream.
    async fn stream_serials_for_expiration_date_and_issuer(
        &self,
        exp_date: &ExpDate,
        issuer: &Issuer,
    ) -> Result<mpsc::Receiver<Serial>>;

    async fn list_expiration_dates(&self, not_before: NaiveDate) -> Result<Vec<ExpDate>> {
        let mut rx = self.stream_expiration_dates(not_before).await?;
        let mut dates = Vec::new();
        while let Some(d) = rx.recv().await {
            dates.push(d);
        }
        Ok(dates)
    }

    async fn list_issuers_for_expiration_date(&self, exp_date: &ExpDate) -> Result<Vec<Issuer>> {
        let mut rx = self.stream_issuers_for_expiration_date(exp_date).await?;
        let mut issuers = Vec::new();
        while let Some(i) = rx.recv().await {
            issuers.push(i);
        }
        Ok(issuers)
    }

    async fn list_serials_for_expiration_date_and_issuer(
        &self,
        exp_date: &ExpDate,
        issuer: &Issuer,
    ) -> Result<Vec<Serial>> {
        let mut rx = self
            .stream_serials_for_expiration_date_and_issuer(exp_date, issuer)
            .await?;
        let mut serials = Vec::new();
        while let Some(s) = rx.recv().await {
            serials.push(s);
        }
        Ok(serials)
    }

    /// Duplicate PEM writes observed so far. Best-effort; not exact across
    /// retries.
    fn collisions(&self) -> u64;
}

/// `ct/<expDate>/issuer/<issuerID>/certs/<serialID>`
pub fn cert_doc_id(exp_date: &ExpDate, issuer: &Issuer, serial: &Serial) -> String {
    format!("ct/{}/issuer/{}/certs/{}", exp_date, issuer.id(), serial.id())
}

/// `ct/<expDate>/issuer/<issuerID>`
pub fn shard_doc_id(exp_date: &ExpDate, issuer: &Issuer) -> String {
    format!("ct/{}/issuer/{}", exp_date, issuer.id())
}

/// `ct/<expDate>`
pub fn exp_date_doc_id(exp_date: &ExpDate) -> String {
    format!("ct/{}", exp_date)
}

/// `logs/<base64(host+path)>`
pub fn log_doc_id(short_url: &str) -> String {
    format!("logs/{}", CertificateLog::id_from_short_url(short_url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_ids_alternate_collections_and_documents() {
        let exp = ExpDate::parse("2026-05-01").unwrap();
        let issuer = Issuer::from_id("issuerB64");
        let serial = Serial::from_bytes(vec![0x01, 0x02]);

        assert_eq!(exp_date_doc_id(&exp), "ct/2026-05-01");
        assert_eq!(shard_doc_id(&exp, &issuer), "ct/2026-05-01/issuer/issuerB64");
        assert_eq!(
            cert_doc_id(&exp, &issuer, &serial),
            format!("ct/2026-05-01/issuer/issuerB64/certs/{}", serial.id())
        );
        assert!(log_doc_id("ct.example.com/log").starts_with("logs/"));
    }
}
