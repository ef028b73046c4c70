// Certificate database façade
//
// Composes the known-set, the issuer metadata, the durable backend, and the
// remote cache. `store` enforces the dedup-then-store ordering: the atomic
// test-and-insert serializes concurrent writers of the same serial down to
// exactly one PEM write, and the shard-first metadata signal drives marker
// allocation. A crash between the insert and the PEM write leaves a serial
// known-but-unstored, which downstream consumers treat as non-revoked.

use crate::cache::RemoteCache;
use crate::ids::{CertificateLog, ExpDate, Issuer, Serial};
use crate::known::KnownCertificates;
use crate::metadata::IssuerMetadata;
use crate::storage::StorageBackend;
use crate::Result;
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

pub const PEM_HEADER_LOG: &str = "Log";
pub const PEM_HEADER_RECORDED_AT: &str = "Recorded-at";
pub const PEM_HEADER_ENTRY_ID: &str = "Entry-id";

/// What `store` did with a certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOutcome {
    /// The serial was new to its shard and a PEM write happened.
    pub stored: bool,
    /// This call was the first touch of the whole shard.
    pub new_shard: bool,
    /// CRL distribution points newly accumulated.
    pub crls_added: u64,
}

pub struct CertDatabase {
    backend: Arc<dyn StorageBackend>,
    cache: Arc<dyn RemoteCache>,
    meta_handles: Mutex<HashMap<String, Arc<IssuerMetadata>>>,
    handle_cap: usize,
}

impl CertDatabase {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        cache: Arc<dyn RemoteCache>,
        handle_cap: usize,
    ) -> CertDatabase {
        CertDatabase {
            backend,
            cache,
            meta_handles: Mutex::new(HashMap::new()),
            handle_cap: handle_cap.max(1),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn known_certificates(&self, exp_date: ExpDate, issuer: &Issuer) -> KnownCertificates {
        KnownCertificates::new(exp_date, issuer, Arc::clone(&self.cache))
    }

    /// Shard metadata handles are stateless apart from their key strings, so
    /// the cache is a pure constructor with a small cap bounding concurrent
    /// allocations; eviction needs no flush.
    pub fn issuer_metadata(&self, exp_date: ExpDate, issuer: &Issuer) -> Arc<IssuerMetadata> {
        let key = format!("{}::{}", exp_date, issuer.id());
        let mut handles = self.meta_handles.lock().unwrap();
        if let Some(handle) = handles.get(&key) {
            return Arc::clone(handle);
        }
        if handles.len() >= self.handle_cap {
            let victim = handles.keys().next().cloned();
            if let Some(victim) = victim {
                handles.remove(&victim);
            }
        }
        let handle = Arc::new(IssuerMetadata::new(
            exp_date,
            issuer,
            Arc::clone(&self.cache),
        ));
        handles.insert(key, Arc::clone(&handle));
        handle
    }

    /// Ingest one certificate under its (expiration, issuer) shard.
    pub async fn store(
        &self,
        cert: &X509Certificate<'_>,
        cert_der: &[u8],
        issuer: &Issuer,
        log_url: &str,
        entry_id: u64,
    ) -> Result<StoreOutcome> {
        let exp_date = ExpDate::from_unix(cert.validity().not_after.timestamp())?;
        let serial = Serial::from_cert(cert);
        let known = self.known_certificates(exp_date, issuer);

        let mut outcome = StoreOutcome::default();

        if known.was_unknown(&serial).await? {
            outcome.stored = true;

            let meta = self.issuer_metadata(exp_date, issuer);
            let accumulated = meta.accumulate(cert).await?;
            outcome.crls_added = accumulated.crls_added;
            if !accumulated.seen_before {
                outcome.new_shard = true;
                self.backend
                    .allocate_exp_date_and_issuer(&exp_date, issuer)
                    .await?;
                known.set_expiry_flag().await?;
                meta.set_expiry_flag().await?;
            }

            let pem = encode_pem(cert_der, log_url, entry_id);
            self.backend
                .store_certificate_pem(&serial, &exp_date, issuer, pem.as_bytes())
                .await?;
        }

        self.backend.mark_dirty(&exp_date.to_string()).await?;
        Ok(outcome)
    }

    pub async fn save_log_state(&self, log: &CertificateLog) -> Result<()> {
        self.backend.store_log_state(log).await
    }

    pub async fn get_log_state(&self, url: &Url) -> Result<CertificateLog> {
        self.backend
            .load_log_state(&CertificateLog::short_url_of(url))
            .await
    }

    pub async fn list_expiration_dates(&self, not_before: NaiveDate) -> Result<Vec<ExpDate>> {
        self.backend.list_expiration_dates(not_before).await
    }

    pub async fn list_issuers_for_expiration_date(&self, exp_date: &ExpDate) -> Result<Vec<Issuer>> {
        self.backend.list_issuers_for_expiration_date(exp_date).await
    }

    pub async fn stream_serials(
        &self,
        exp_date: &ExpDate,
        issuer: &Issuer,
    ) -> Result<mpsc::Receiver<Serial>> {
        self.backend
            .stream_serials_for_expiration_date_and_issuer(exp_date, issuer)
            .await
    }

    /// Rebuild a shard's metadata and known-set from its stored PEMs.
    /// Serials that come back unknown indicate cache loss and are logged.
    pub async fn reconstruct_issuer_metadata(
        &self,
        exp_date: &ExpDate,
        issuer: &Issuer,
    ) -> Result<u64> {
        let known = self.known_certificates(*exp_date, issuer);
        let meta = self.issuer_metadata(*exp_date, issuer);
        let mut rx = self.stream_serials(exp_date, issuer).await?;
        let mut processed = 0u64;

        while let Some(serial) = rx.recv().await {
            let pem_bytes = self
                .backend
                .load_certificate_pem(&serial, exp_date, issuer)
                .await?;
            let block = pem::parse(&pem_bytes)?;
            let der = block.contents().to_vec();
            let cert = match X509Certificate::from_der(&der) {
                Ok((_, cert)) => cert,
                Err(e) => {
                    warn!(
                        "Couldn't parse stored certificate {}/{}/{}: {}",
                        exp_date,
                        issuer.id(),
                        serial,
                        e
                    );
                    continue;
                }
            };

            meta.accumulate(&cert).await?;
            if known.was_unknown(&serial).await? {
                warn!(
                    "Certificate was unknown during reconstruction: {}/{}/{}",
                    exp_date,
                    issuer.id(),
                    serial
                );
            }
            processed += 1;
        }

        Ok(processed)
    }
}

/// PEM-encode a certificate with the provenance headers downstream parsers
/// rely on.
pub fn encode_pem(cert_der: &[u8], log_url: &str, entry_id: u64) -> String {
    let mut block = pem::Pem::new("CERTIFICATE", cert_der.to_vec());
    let headers = block.headers_mut();
    // Header values are plain printable strings; failures cannot happen for
    // the formats used here, but the API insists.
    let _ = headers.add(PEM_HEADER_LOG, log_url);
    let _ = headers.add(PEM_HEADER_RECORDED_AT, &Utc::now().to_rfc3339());
    let _ = headers.add(PEM_HEADER_ENTRY_ID, &entry_id.to_string());
    pem::encode(&block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_pem_headers_round_trip() {
        let pem_text = encode_pem(b"\x30\x03\x02\x01\x00", "ct.example.com/log", 42);
        let block = pem::parse(pem_text.as_bytes()).unwrap();
        assert_eq!(block.tag(), "CERTIFICATE");
        assert_eq!(block.headers().get(PEM_HEADER_LOG), Some("ct.example.com/log"));
        assert_eq!(block.headers().get(PEM_HEADER_ENTRY_ID), Some("42"));
        let recorded = block.headers().get(PEM_HEADER_RECORDED_AT).unwrap();
        assert!(recorded.contains('T'));
        assert_eq!(block.contents(), &b"\x30\x03\x02\x01\x00"[..]);
    }

    #[test]
    fn test_store_outcome_default() {
        let outcome = StoreOutcome::default();
        assert!(!outcome.stored);
        assert!(!outcome.new_shard);
    }
}
