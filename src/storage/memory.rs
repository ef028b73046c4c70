// In-process mock of the storage backend
//
// Not performant and not meant to be: it exists so the dedup pipeline and
// the enumeration surface can be exercised hermetically. The serial stream
// goes through the same limit/offset pagination as the document-store
// adapters, with an optional injected deadline fault to exercise resumption.

use crate::error::IngestError;
use crate::ids::{CertificateLog, ExpDate, Issuer, Serial};
use crate::storage::{StorageBackend, STREAM_BUFFER, STREAM_PAGE_LIMIT};
use crate::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Default)]
struct Inner {
    // expDate -> shard issuers
    shards: BTreeMap<ExpDate, BTreeSet<Issuer>>,
    // (expDate, issuerID) -> serials in index order
    serials: HashMap<(ExpDate, Issuer), BTreeSet<Serial>>,
    pems: HashMap<String, Vec<u8>>,
    log_states: HashMap<String, CertificateLog>,
    dirty: BTreeSet<String>,
}

/// Injects one deadline-exceeded per `every` delivered documents into the
/// serial stream, mimicking a document store's per-request deadline.
#[derive(Default)]
struct StreamFault {
    every: AtomicU64,
    last_failure_at: AtomicI64,
    injected: AtomicU64,
}

impl StreamFault {
    fn should_fail(&self, delivered: u64) -> bool {
        let every = self.every.load(Ordering::Relaxed);
        if every == 0 || delivered == 0 || delivered % every != 0 {
            return false;
        }
        // Fail once per boundary; the retry at the same offset proceeds.
        if self.last_failure_at.swap(delivered as i64, Ordering::Relaxed) == delivered as i64 {
            return false;
        }
        self.injected.fetch_add(1, Ordering::Relaxed);
        true
    }
}

pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
    collisions: AtomicU64,
    fault: Arc<StreamFault>,
    // PEM write-fault hook: fail the nth write attempt (0-based), -1 off
    pem_fail_at: AtomicI64,
    pem_attempts: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend {
            inner: Arc::default(),
            collisions: AtomicU64::new(0),
            fault: Arc::default(),
            pem_fail_at: AtomicI64::new(-1),
            pem_attempts: AtomicU64::new(0),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }

    /// Test hook: inject a deadline-exceeded into serial streams after every
    /// `every` delivered documents.
    pub fn inject_stream_deadline_every(&self, every: u64) {
        self.fault.every.store(every, Ordering::Relaxed);
    }

    /// Test hook: make the nth PEM write attempt (0-based) fail, standing in
    /// for a backend outage mid-run.
    pub fn fail_pem_write_at(&self, nth: u64) {
        self.pem_fail_at.store(nth as i64, Ordering::Relaxed);
    }

    pub fn clear_pem_fault(&self) {
        self.pem_fail_at.store(-1, Ordering::Relaxed);
    }

    /// Test hook: number of deadline faults actually raised.
    pub fn injected_deadline_count(&self) -> u64 {
        self.fault.injected.load(Ordering::Relaxed)
    }

    /// Test hook: dirty flags raised so far.
    pub fn dirty_flags(&self) -> Vec<String> {
        self.inner.lock().unwrap().dirty.iter().cloned().collect()
    }

    pub fn pem_count(&self) -> usize {
        self.inner.lock().unwrap().pems.len()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn mark_dirty(&self, id: &str) -> Result<()> {
        self.inner.lock().unwrap().dirty.insert(id.to_string());
        Ok(())
    }

    async fn store_certificate_pem(
        &self,
        serial: &Serial,
        exp_date: &ExpDate,
        issuer: &Issuer,
        pem: &[u8],
    ) -> Result<()> {
        let attempt = self.pem_attempts.fetch_add(1, Ordering::Relaxed);
        if self.pem_fail_at.load(Ordering::Relaxed) == attempt as i64 {
            return Err(IngestError::backend(format!(
                "Injected write failure on attempt {}",
                attempt
            )));
        }
        let id = crate::storage::cert_doc_id(exp_date, issuer, serial);
        let mut inner = self.inner.lock().unwrap();
        if inner.pems.contains_key(&id) {
            self.collisions.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        inner.pems.insert(id, pem.to_vec());
        inner
            .serials
            .entry((*exp_date, issuer.clone()))
            .or_default()
            .insert(serial.clone());
        Ok(())
    }

    async fn load_certificate_pem(
        &self,
        serial: &Serial,
        exp_date: &ExpDate,
        issuer: &Issuer,
    ) -> Result<Vec<u8>> {
        let id = crate::storage::cert_doc_id(exp_date, issuer, serial);
        self.inner
            .lock()
            .unwrap()
            .pems
            .get(&id)
            .cloned()
            .ok_or(IngestError::NotFound { id })
    }

    async fn store_log_state(&self, log: &CertificateLog) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .log_states
            .insert(log.short_url.clone(), log.clone());
        Ok(())
    }

    async fn load_log_state(&self, short_url: &str) -> Result<CertificateLog> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .log_states
            .get(short_url)
            .cloned()
            .unwrap_or_else(|| CertificateLog::new(short_url)))
    }

    async fn allocate_exp_date_and_issuer(
        &self,
        exp_date: &ExpDate,
        issuer: &Issuer,
    ) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .shards
            .entry(*exp_date)
            .or_default()
            .insert(issuer.clone());
        Ok(())
    }

    async fn stream_expiration_dates(
        &self,
        not_before: NaiveDate,
    ) -> Result<mpsc::Receiver<ExpDate>> {
        let dates: Vec<ExpDate> = {
            let inner = self.inner.lock().unwrap();
            inner
                .shards
                .keys()
                .filter(|d| d.date() >= not_before)
                .copied()
                .collect()
        };
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            for d in dates {
                if tx.send(d).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn stream_issuers_for_expiration_date(
        &self,
        exp_date: &ExpDate,
    ) -> Result<mpsc::Receiver<Issuer>> {
        let issuers: Vec<Issuer> = {
            let inner = self.inner.lock().unwrap();
            inner
                .shards
                .get(exp_date)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        };
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            for i in issuers {
                if tx.send(i).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn stream_serials_for_expiration_date_and_issuer(
        &self,
        exp_date: &ExpDate,
        issuer: &Issuer,
    ) -> Result<mpsc::Receiver<Serial>> {
        let snapshot: Vec<Serial> = {
            let inner = self.inner.lock().unwrap();
            inner
                .serials
                .get(&(*exp_date, issuer.clone()))
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        };
        let fault = Arc::clone(&self.fault);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let mut offset = 0usize;
            'pages: loop {
                let page: Vec<Serial> = snapshot
                    .iter()
                    .skip(offset)
                    .take(STREAM_PAGE_LIMIT)
                    .cloned()
                    .collect();
                if page.is_empty() {
                    return;
                }
                for s in page {
                    if fault.should_fail(offset as u64) {
                        warn!(offset, "serial stream deadline exceeded, retrying window");
                        continue 'pages;
                    }
                    if tx.send(s).await.is_err() {
                        return;
                    }
                    offset += 1;
                }
            }
        });
        Ok(rx)
    }

    fn collisions(&self) -> u64 {
        self.collisions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> (ExpDate, Issuer) {
        (ExpDate::parse("2026-09-09").unwrap(), Issuer::from_id("iss"))
    }

    #[tokio::test]
    async fn test_pem_collision_is_success() {
        let backend = MemoryBackend::new();
        let (exp, issuer) = shard();
        let serial = Serial::from_bytes(vec![1, 2, 3]);

        backend
            .store_certificate_pem(&serial, &exp, &issuer, b"pem-a")
            .await
            .unwrap();
        backend
            .store_certificate_pem(&serial, &exp, &issuer, b"pem-b")
            .await
            .unwrap();

        assert_eq!(backend.collisions(), 1);
        // First write wins
        let loaded = backend.load_certificate_pem(&serial, &exp, &issuer).await.unwrap();
        assert_eq!(loaded, b"pem-a");
    }

    #[tokio::test]
    async fn test_load_missing_pem_is_not_found() {
        let backend = MemoryBackend::new();
        let (exp, issuer) = shard();
        let err = backend
            .load_certificate_pem(&Serial::from_bytes(vec![9]), &exp, &issuer)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_absent_log_state_is_zero_valued() {
        let backend = MemoryBackend::new();
        let state = backend.load_log_state("ct.example.com/log").await.unwrap();
        assert_eq!(state.short_url, "ct.example.com/log");
        assert_eq!(state.max_entry, None);
    }

    #[tokio::test]
    async fn test_allocation_enables_enumeration() {
        let backend = MemoryBackend::new();
        let (exp, issuer) = shard();
        backend.allocate_exp_date_and_issuer(&exp, &issuer).await.unwrap();
        backend.allocate_exp_date_and_issuer(&exp, &issuer).await.unwrap();

        let dates = backend
            .list_expiration_dates(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(dates, vec![exp]);

        let issuers = backend.list_issuers_for_expiration_date(&exp).await.unwrap();
        assert_eq!(issuers, vec![issuer]);
    }

    #[tokio::test]
    async fn test_expiration_date_not_before_filter() {
        let backend = MemoryBackend::new();
        let issuer = Issuer::from_id("iss");
        for d in ["2026-01-01", "2026-06-01", "2027-01-01"] {
            backend
                .allocate_exp_date_and_issuer(&ExpDate::parse(d).unwrap(), &issuer)
                .await
                .unwrap();
        }
        let dates = backend
            .list_expiration_dates(NaiveDate::from_ymd_opt(2026, 6, 1).unwrap())
            .await
            .unwrap();
        assert_eq!(dates.len(), 2);
    }
}
