// Local-disk document backend
//
// Documents are plain files under a configured root, laid out exactly like
// the document-store hierarchy so tooling can move between the two:
//
//   <root>/logs/<base64(host+path)>                         checkpoint (JSON)
//   <root>/ct/<expDate>/.expdate                            expDate marker
//   <root>/ct/<expDate>/dirty                               MarkDirty flag
//   <root>/ct/<expDate>/issuer/<issuerID>/.meta             shard marker
//   <root>/ct/<expDate>/issuer/<issuerID>/certs/<serialID>  PEM bytes

use crate::error::IngestError;
use crate::ids::{CertificateLog, ExpDate, Issuer, Serial};
use crate::storage::{StorageBackend, STREAM_BUFFER, STREAM_PAGE_LIMIT};
use crate::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

const EXP_DATE_MARKER: &str = ".expdate";
const SHARD_MARKER: &str = ".meta";
const DIRTY_MARKER: &str = "dirty";

pub struct LocalDiskBackend {
    root: PathBuf,
    collisions: AtomicU64,
}

impl LocalDiskBackend {
    pub fn new(root: impl Into<PathBuf>) -> LocalDiskBackend {
        LocalDiskBackend { root: root.into(), collisions: AtomicU64::new(0) }
    }

    fn shard_dir(&self, exp_date: &ExpDate, issuer: &Issuer) -> PathBuf {
        self.root
            .join("ct")
            .join(exp_date.to_string())
            .join("issuer")
            .join(issuer.id())
    }

    fn cert_path(&self, exp_date: &ExpDate, issuer: &Issuer, serial: &Serial) -> PathBuf {
        self.shard_dir(exp_date, issuer).join("certs").join(serial.id())
    }

    fn log_state_path(&self, short_url: &str) -> PathBuf {
        self.root
            .join("logs")
            .join(CertificateLog::id_from_short_url(short_url))
    }

    async fn write_file(path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn sorted_dir_entries(dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut reader = match tokio::fs::read_dir(dir).await {
            Ok(r) => r,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = reader.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl StorageBackend for LocalDiskBackend {
    async fn mark_dirty(&self, id: &str) -> Result<()> {
        let path = self.root.join("ct").join(id).join(DIRTY_MARKER);
        Self::write_file(&path, &[]).await
    }

    async fn store_certificate_pem(
        &self,
        serial: &Serial,
        exp_date: &ExpDate,
        issuer: &Issuer,
        pem: &[u8],
    ) -> Result<()> {
        let path = self.cert_path(exp_date, issuer, serial);
        if tokio::fs::try_exists(&path).await? {
            self.collisions.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        Self::write_file(&path, pem).await
    }

    async fn load_certificate_pem(
        &self,
        serial: &Serial,
        exp_date: &ExpDate,
        issuer: &Issuer,
    ) -> Result<Vec<u8>> {
        let path = self.cert_path(exp_date, issuer, serial);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(IngestError::NotFound {
                id: crate::storage::cert_doc_id(exp_date, issuer, serial),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_log_state(&self, log: &CertificateLog) -> Result<()> {
        let data = serde_json::to_vec(log)?;
        Self::write_file(&self.log_state_path(&log.short_url), &data).await
    }

    async fn load_log_state(&self, short_url: &str) -> Result<CertificateLog> {
        match tokio::fs::read(self.log_state_path(short_url)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(CertificateLog::new(short_url)),
            Err(e) => Err(e.into()),
        }
    }

    async fn allocate_exp_date_and_issuer(
        &self,
        exp_date: &ExpDate,
        issuer: &Issuer,
    ) -> Result<()> {
        let date_marker = self
            .root
            .join("ct")
            .join(exp_date.to_string())
            .join(EXP_DATE_MARKER);
        Self::write_file(&date_marker, exp_date.to_string().as_bytes()).await?;

        let shard_marker = self.shard_dir(exp_date, issuer).join(SHARD_MARKER);
        Self::write_file(&shard_marker, issuer.id().as_bytes()).await
    }

    async fn stream_expiration_dates(
        &self,
        not_before: NaiveDate,
    ) -> Result<mpsc::Receiver<ExpDate>> {
        let ct_dir = self.root.join("ct");
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let names = match Self::sorted_dir_entries(&ct_dir).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("Could not list expiration dates: {}", e);
                    return;
                }
            };
            for name in names {
                let Ok(exp) = ExpDate::parse(&name) else { continue };
                if exp.date() < not_before {
                    continue;
                }
                if tx.send(exp).await.is_err() {
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
        let issuer_dir = self.root.join("ct").join(exp_date.to_string()).join("issuer");
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let names = match Self::sorted_dir_entries(&issuer_dir).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("Could not list issuers: {}", e);
                    return;
                }
            };
            for name in names {
                if tx.send(Issuer::from_id(name)).await.is_err() {
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
        let certs_dir = self.shard_dir(exp_date, issuer).join("certs");
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let names = match Self::sorted_dir_entries(&certs_dir).await {
                Ok(n) => n,
                Err(e) => {
                    warn!("Could not list serials: {}", e);
                    return;
                }
            };
            // Same windowing as the document-store adapters; the local index
            // cannot time out, so every window succeeds.
            let mut offset = 0usize;
            while offset < names.len() {
                let page = &names[offset..(offset + STREAM_PAGE_LIMIT).min(names.len())];
                for name in page {
                    match Serial::from_id_string(name) {
                        Ok(serial) => {
                            if tx.send(serial).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Skipping invalid serial document {}: {}", name, e),
                    }
                }
                offset += page.len();
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
        (ExpDate::parse("2026-04-04").unwrap(), Issuer::from_id("issuer-id"))
    }

    #[tokio::test]
    async fn test_pem_store_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalDiskBackend::new(dir.path());
        let (exp, issuer) = shard();
        let serial = Serial::from_bytes(vec![0x00, 0xaa]);

        backend
            .store_certificate_pem(&serial, &exp, &issuer, b"pem bytes")
            .await
            .unwrap();
        let loaded = backend.load_certificate_pem(&serial, &exp, &issuer).await.unwrap();
        assert_eq!(loaded, b"pem bytes");

        // Duplicate write is a collision, first write wins
        backend
            .store_certificate_pem(&serial, &exp, &issuer, b"other")
            .await
            .unwrap();
        assert_eq!(backend.collisions(), 1);
        let loaded = backend.load_certificate_pem(&serial, &exp, &issuer).await.unwrap();
        assert_eq!(loaded, b"pem bytes");
    }

    #[tokio::test]
    async fn test_log_state_round_trip_and_default() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalDiskBackend::new(dir.path());

        let fresh = backend.load_log_state("ct.example.com/log").await.unwrap();
        assert_eq!(fresh.max_entry, None);

        let mut state = CertificateLog::new("ct.example.com/log");
        state.max_entry = Some(1234);
        state.last_entry_time = Some(chrono::Utc::now());
        backend.store_log_state(&state).await.unwrap();

        let loaded = backend.load_log_state("ct.example.com/log").await.unwrap();
        assert_eq!(loaded.max_entry, Some(1234));
    }

    #[tokio::test]
    async fn test_enumeration_via_markers() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalDiskBackend::new(dir.path());
        let (exp, issuer) = shard();

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
    async fn test_serial_stream_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalDiskBackend::new(dir.path());
        let (exp, issuer) = shard();

        let serials: Vec<Serial> = (0u8..5).map(|i| Serial::from_bytes(vec![i])).collect();
        for s in &serials {
            backend.store_certificate_pem(s, &exp, &issuer, b"x").await.unwrap();
        }

        let listed = backend
            .list_serials_for_expiration_date_and_issuer(&exp, &issuer)
            .await
            .unwrap();
        assert_eq!(listed.len(), serials.len());
        for s in &serials {
            assert!(listed.contains(s));
        }
    }

    #[tokio::test]
    async fn test_mark_dirty_creates_flag() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalDiskBackend::new(dir.path());
        backend.mark_dirty("2026-04-04").await.unwrap();
        assert!(dir.path().join("ct/2026-04-04/dirty").exists());
    }
}
