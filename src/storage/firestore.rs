// Firestore document backend over the REST v1 surface
//
// There is no Rust SDK for Firestore, so this adapter speaks the documents
// API directly. Collections alternate with documents, so the hierarchy maps
// onto URL paths:
//
//   {root}/logs/<logID>
//   {root}/ct/<expDate>/issuer/<issuerID>/certs/<serialID>
//
// PEM writes are create-only (`currentDocument.exists=false`): HTTP 409 is
// the collision path and reports success. Serial streaming pages with
// limit/offset; the offset advances by documents actually delivered, and a
// deadline-exceeded retries the same offset.

use crate::error::IngestError;
use crate::ids::{CertificateLog, ExpDate, Issuer, Serial};
use crate::storage::{
    StorageBackend, FIELD_DATA, FIELD_EXP_DATE, FIELD_ISSUER, FIELD_TYPE, FIELD_UNIX_TIME,
    FIELD_URL, STREAM_BUFFER, STREAM_PAGE_LIMIT, TYPE_EXP_DATE, TYPE_LOG_STATE, TYPE_METADATA,
    TYPE_PEM,
};
use crate::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
struct Endpoint {
    http: reqwest::Client,
    // e.g. https://firestore.googleapis.com/v1/projects/p/databases/(default)/documents
    documents_url: String,
    bearer: Option<String>,
}

impl Endpoint {
    fn doc_url(&self, doc_id: &str) -> String {
        format!("{}/{}", self.documents_url, doc_id)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

pub struct FirestoreBackend {
    endpoint: Endpoint,
    collisions: AtomicU64,
}

impl FirestoreBackend {
    /// Connect to the project's default database. `FIRESTORE_EMULATOR_HOST`
    /// switches to the emulator without credentials; otherwise a bearer token
    /// comes from `GOOGLE_ACCESS_TOKEN` or the GCE metadata server.
    pub async fn new(project_id: &str) -> Result<FirestoreBackend> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        let (base, bearer) = match std::env::var("FIRESTORE_EMULATOR_HOST") {
            Ok(host) => {
                info!("Using Firestore emulator at {}", host);
                (format!("http://{}/v1", host), None)
            }
            Err(_) => {
                let token = match std::env::var("GOOGLE_ACCESS_TOKEN") {
                    Ok(t) => t,
                    Err(_) => Self::metadata_server_token(&http).await?,
                };
                ("https://firestore.googleapis.com/v1".to_string(), Some(token))
            }
        };

        let documents_url = format!(
            "{}/projects/{}/databases/(default)/documents",
            base, project_id
        );

        Ok(FirestoreBackend {
            endpoint: Endpoint { http, documents_url, bearer },
            collisions: AtomicU64::new(0),
        })
    }

    async fn metadata_server_token(http: &reqwest::Client) -> Result<String> {
        let resp = http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(IngestError::backend(format!(
                "Metadata server refused token request: {}",
                resp.status()
            )));
        }
        let body: Value = resp.json().await?;
        body.get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IngestError::backend("Metadata server token response missing access_token"))
    }

    /// Create-only write: an explicit documentId makes the API refuse to
    /// overwrite, so `Ok(false)` means the document already existed.
    async fn create_document(&self, parent: &str, doc_id: &str, fields: Value) -> Result<bool> {
        let url = format!(
            "{}/{}?documentId={}",
            self.endpoint.documents_url, parent, doc_id
        );
        let resp = self
            .endpoint
            .request(self.endpoint.http.post(&url))
            .json(&json!({ "fields": fields }))
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::CONFLICT => Ok(false),
            s => Err(status_error(s, resp).await),
        }
    }

    /// Upsert (set) the full document.
    async fn set_document(&self, doc_id: &str, fields: Value) -> Result<()> {
        let resp = self
            .endpoint
            .request(self.endpoint.http.patch(self.endpoint.doc_url(doc_id)))
            .json(&json!({ "fields": fields }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), resp).await);
        }
        Ok(())
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<Value>> {
        let resp = self
            .endpoint
            .request(self.endpoint.http.get(self.endpoint.doc_url(doc_id)))
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(Some(resp.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            s => Err(status_error(s, resp).await),
        }
    }

    /// One page of a structured query under `parent`. Returns the documents
    /// delivered; deadline errors map to `IngestError::DeadlineExceeded` so
    /// the stream loop can retry the same offset.
    async fn run_query_page(
        endpoint: &Endpoint,
        parent: &str,
        collection: &str,
        type_tag: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Value>> {
        let url = if parent.is_empty() {
            format!("{}:runQuery", endpoint.documents_url)
        } else {
            format!("{}/{}:runQuery", endpoint.documents_url, parent)
        };
        let query = json!({
            "structuredQuery": {
                "from": [{ "collectionId": collection }],
                "where": {
                    "fieldFilter": {
                        "field": { "fieldPath": FIELD_TYPE },
                        "op": "EQUAL",
                        "value": { "stringValue": type_tag },
                    }
                },
                "limit": limit,
                "offset": offset,
            }
        });

        let resp = endpoint.request(endpoint.http.post(&url)).json(&query).send().await;
        let resp = match resp {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(IngestError::DeadlineExceeded { offset }),
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status == StatusCode::GATEWAY_TIMEOUT {
            return Err(IngestError::DeadlineExceeded { offset });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if body.contains("DEADLINE_EXCEEDED") {
                return Err(IngestError::DeadlineExceeded { offset });
            }
            return Err(IngestError::HttpError { status: status.as_u16(), details: body });
        }

        let rows: Vec<Value> = resp.json().await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.get("document").cloned())
            .collect())
    }

    fn doc_name_leaf(doc: &Value) -> Option<String> {
        doc.get("name")
            .and_then(Value::as_str)
            .and_then(|n| n.rsplit('/').next())
            .map(str::to_string)
    }

    fn string_field(doc: &Value, field: &str) -> Option<String> {
        doc.get("fields")?
            .get(field)?
            .get("stringValue")?
            .as_str()
            .map(str::to_string)
    }

    fn integer_field(doc: &Value, field: &str) -> Option<i64> {
        doc.get("fields")?
            .get(field)?
            .get("integerValue")?
            .as_str()?
            .parse()
            .ok()
    }

    fn bytes_field(doc: &Value, field: &str) -> Option<Vec<u8>> {
        let encoded = doc.get("fields")?.get(field)?.get("bytesValue")?.as_str()?;
        BASE64_STD.decode(encoded).ok()
    }
}

async fn status_error(status: StatusCode, resp: reqwest::Response) -> IngestError {
    let details = resp.text().await.unwrap_or_default();
    IngestError::HttpError { status: status.as_u16(), details }
}

#[async_trait]
impl StorageBackend for FirestoreBackend {
    async fn mark_dirty(&self, _id: &str) -> Result<()> {
        // Consumers of the document store watch shard markers instead.
        Ok(())
    }

    async fn store_certificate_pem(
        &self,
        serial: &Serial,
        exp_date: &ExpDate,
        issuer: &Issuer,
        pem: &[u8],
    ) -> Result<()> {
        let parent = format!("ct/{}/issuer/{}/certs", exp_date, issuer.id());
        let fields = json!({
            FIELD_TYPE: { "stringValue": TYPE_PEM },
            FIELD_DATA: { "bytesValue": BASE64_STD.encode(pem) },
        });
        let created = self.create_document(&parent, &serial.id(), fields).await?;
        if !created {
            debug!(
                "Attempted to write a colliding document id={}/{} len={}",
                parent,
                serial.id(),
                pem.len()
            );
            self.collisions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn load_certificate_pem(
        &self,
        serial: &Serial,
        exp_date: &ExpDate,
        issuer: &Issuer,
    ) -> Result<Vec<u8>> {
        let id = crate::storage::cert_doc_id(exp_date, issuer, serial);
        let doc = self
            .get_document(&id)
            .await?
            .ok_or_else(|| IngestError::NotFound { id: id.clone() })?;
        Self::bytes_field(&doc, FIELD_DATA)
            .ok_or_else(|| IngestError::backend(format!("PEM document {} has no data field", id)))
    }

    async fn store_log_state(&self, log: &CertificateLog) -> Result<()> {
        let fields = json!({
            FIELD_TYPE: { "stringValue": TYPE_LOG_STATE },
            FIELD_URL: { "stringValue": log.short_url },
            FIELD_DATA: { "integerValue": log.max_entry.map_or(-1, |m| m as i64).to_string() },
            FIELD_UNIX_TIME: {
                "integerValue": log.last_entry_time.map_or(0, |t| t.timestamp()).to_string()
            },
        });
        self.set_document(&crate::storage::log_doc_id(&log.short_url), fields)
            .await
    }

    async fn load_log_state(&self, short_url: &str) -> Result<CertificateLog> {
        let id = crate::storage::log_doc_id(short_url);
        let Some(doc) = self.get_document(&id).await? else {
            warn!("Allocating brand new log state for {}", short_url);
            return Ok(CertificateLog::new(short_url));
        };

        let url = Self::string_field(&doc, FIELD_URL)
            .unwrap_or_else(|| short_url.to_string());
        let max_entry = match Self::integer_field(&doc, FIELD_DATA) {
            Some(m) if m >= 0 => Some(m as u64),
            _ => None,
        };
        let last_entry_time = Self::integer_field(&doc, FIELD_UNIX_TIME)
            .filter(|t| *t > 0)
            .and_then(|t| DateTime::<Utc>::from_timestamp(t, 0));

        Ok(CertificateLog { short_url: url, max_entry, last_entry_time })
    }

    async fn allocate_exp_date_and_issuer(
        &self,
        exp_date: &ExpDate,
        issuer: &Issuer,
    ) -> Result<()> {
        let date_fields = json!({
            FIELD_TYPE: { "stringValue": TYPE_EXP_DATE },
            FIELD_EXP_DATE: { "stringValue": exp_date.to_string() },
        });
        self.set_document(&crate::storage::exp_date_doc_id(exp_date), date_fields)
            .await?;

        let shard_fields = json!({
            FIELD_TYPE: { "stringValue": TYPE_METADATA },
            FIELD_EXP_DATE: { "stringValue": exp_date.to_string() },
            FIELD_ISSUER: { "stringValue": issuer.id() },
        });
        self.set_document(&crate::storage::shard_doc_id(exp_date, issuer), shard_fields)
            .await
    }

    async fn stream_expiration_dates(
        &self,
        not_before: NaiveDate,
    ) -> Result<mpsc::Receiver<ExpDate>> {
        let endpoint = self.endpoint.clone();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut offset = 0usize;
            loop {
                let docs = match Self::run_query_page(
                    &endpoint,
                    "",
                    "ct",
                    TYPE_EXP_DATE,
                    STREAM_PAGE_LIMIT,
                    offset,
                )
                .await
                {
                    Ok(docs) => docs,
                    Err(IngestError::DeadlineExceeded { .. }) => continue,
                    Err(e) => {
                        warn!("Expiration date query failed: {}", e);
                        return;
                    }
                };
                if docs.is_empty() {
                    return;
                }
                for doc in &docs {
                    offset += 1;
                    let Some(name) = Self::doc_name_leaf(doc) else { continue };
                    let Ok(exp) = ExpDate::parse(&name) else { continue };
                    if exp.date() < not_before {
                        continue;
                    }
                    if tx.send(exp).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn stream_issuers_for_expiration_date(
        &self,
        exp_date: &ExpDate,
    ) -> Result<mpsc::Receiver<Issuer>> {
        let endpoint = self.endpoint.clone();
        let parent = crate::storage::exp_date_doc_id(exp_date);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut offset = 0usize;
            loop {
                let docs = match Self::run_query_page(
                    &endpoint,
                    &parent,
                    "issuer",
                    TYPE_METADATA,
                    STREAM_PAGE_LIMIT,
                    offset,
                )
                .await
                {
                    Ok(docs) => docs,
                    Err(IngestError::DeadlineExceeded { .. }) => continue,
                    Err(e) => {
                        warn!("Issuer query failed: {}", e);
                        return;
                    }
                };
                if docs.is_empty() {
                    return;
                }
                for doc in &docs {
                    offset += 1;
                    let Some(name) = Self::string_field(doc, FIELD_ISSUER) else {
                        warn!("Invalid issuer document: {:?}", doc.get("name"));
                        continue;
                    };
                    if tx.send(Issuer::from_id(name)).await.is_err() {
                        return;
                    }
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
        let endpoint = self.endpoint.clone();
        let parent = crate::storage::shard_doc_id(exp_date, issuer);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut offset = 0usize;
            loop {
                let docs = match Self::run_query_page(
                    &endpoint,
                    &parent,
                    "certs",
                    TYPE_PEM,
                    STREAM_PAGE_LIMIT,
                    offset,
                )
                .await
                {
                    Ok(docs) => docs,
                    Err(IngestError::DeadlineExceeded { offset }) => {
                        debug!(offset, "Serial stream deadline exceeded, retrying window");
                        continue;
                    }
                    Err(e) => {
                        warn!("Serial stream for {} failed: {}", parent, e);
                        return;
                    }
                };
                if docs.is_empty() {
                    return;
                }
                // The offset advances by documents delivered, not by the
                // limit: a short page shifts the next window accordingly.
                for doc in &docs {
                    offset += 1;
                    let Some(name) = Self::doc_name_leaf(doc) else { continue };
                    match Serial::from_id_string(&name) {
                        Ok(serial) => {
                            if tx.send(serial).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Invalid serial document id {}: {}", name, e),
                    }
                }
            }
        });
        Ok(rx)
    }

    fn collisions(&self) -> u64 {
        self.collisions.load(Ordering::Relaxed)
    }
}
