// End-to-end follower tests against an in-process CT log.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64_STD;
use base64::Engine;
use certshard::cache::{serials_key, MemoryCache, RemoteCache};
use certshard::db::CertDatabase;
use certshard::follower::{FollowerConfig, LogFollower};
use certshard::ids::{ExpDate, Issuer};
use certshard::stats::StatsTracker;
use certshard::storage::{MemoryBackend, StorageBackend};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use url::Url;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

// RFC 6962 leaf construction

fn u24(len: usize) -> [u8; 3] {
    let b = (len as u32).to_be_bytes();
    [b[1], b[2], b[3]]
}

fn x509_leaf(timestamp_ms: u64, cert: &[u8]) -> Vec<u8> {
    let mut leaf = vec![0u8, 0u8];
    leaf.extend_from_slice(&timestamp_ms.to_be_bytes());
    leaf.extend_from_slice(&0u16.to_be_bytes());
    leaf.extend_from_slice(&u24(cert.len()));
    leaf.extend_from_slice(cert);
    leaf.extend_from_slice(&[0, 0]);
    leaf
}

fn chain_bytes(certs: &[&[u8]]) -> Vec<u8> {
    let mut body = Vec::new();
    for c in certs {
        body.extend_from_slice(&u24(c.len()));
        body.extend_from_slice(c);
    }
    let mut out = u24(body.len()).to_vec();
    out.extend_from_slice(&body);
    out
}

#[derive(Clone)]
struct LogEntry {
    leaf_input: String,
    extra_data: String,
}

fn log_entry(cert_der: &[u8], issuer_der: &[u8]) -> LogEntry {
    LogEntry {
        leaf_input: BASE64_STD.encode(x509_leaf(1_700_000_000_000, cert_der)),
        extra_data: BASE64_STD.encode(chain_bytes(&[issuer_der])),
    }
}

// Minimal CT log server

struct MockLog {
    entries: Vec<LogEntry>,
    page_cap: usize,
}

async fn get_sth(State(log): State<Arc<MockLog>>) -> Json<Value> {
    Json(json!({
        "tree_size": log.entries.len() as u64,
        "timestamp": 1_700_000_000_000u64,
        "sha256_root_hash": "",
        "tree_head_signature": "",
    }))
}

#[derive(Deserialize)]
struct EntriesQuery {
    start: u64,
    end: u64,
}

async fn get_entries(
    State(log): State<Arc<MockLog>>,
    Query(q): Query<EntriesQuery>,
) -> Json<Value> {
    let start = q.start as usize;
    let end = (q.end as usize + 1).min(log.entries.len());
    let capped_end = end.min(start + log.page_cap);
    let entries: Vec<Value> = log.entries[start.min(end)..capped_end]
        .iter()
        .map(|e| json!({ "leaf_input": e.leaf_input, "extra_data": e.extra_data }))
        .collect();
    Json(json!({ "entries": entries }))
}

async fn serve_log(entries: Vec<LogEntry>, page_cap: usize) -> Url {
    let state = Arc::new(MockLog { entries, page_cap });
    let app = Router::new()
        .route("/ct/v1/get-sth", get(get_sth))
        .route("/ct/v1/get-entries", get(get_entries))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{}/", addr)).unwrap()
}

// Certificate material

struct TestCa {
    cert: rcgen::Certificate,
    key: rcgen::KeyPair,
}

fn make_ca(cn: &str) -> TestCa {
    let mut params = rcgen::CertificateParams::new(vec![]).unwrap();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.distinguished_name.push(rcgen::DnType::CommonName, cn);
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    TestCa { cert, key }
}

fn make_leaf(ca: &TestCa, cn: &str, days_valid: i64) -> Vec<u8> {
    let mut params = rcgen::CertificateParams::new(vec![]).unwrap();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.distinguished_name.push(rcgen::DnType::CommonName, cn);
    params.is_ca = rcgen::IsCa::NoCa;
    params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(30);
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(days_valid);
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();
    cert.der().to_vec()
}

struct Fixture {
    backend: Arc<MemoryBackend>,
    cache: Arc<MemoryCache>,
    db: Arc<CertDatabase>,
    stats: Arc<StatsTracker>,
}

fn fixture() -> Fixture {
    let backend = Arc::new(MemoryBackend::new());
    let cache = Arc::new(MemoryCache::new());
    let db = Arc::new(CertDatabase::new(
        Arc::clone(&backend) as Arc<dyn StorageBackend>,
        Arc::clone(&cache) as Arc<dyn RemoteCache>,
        16,
    ));
    Fixture { backend, cache, db, stats: Arc::new(StatsTracker::new()) }
}

fn test_config() -> FollowerConfig {
    FollowerConfig {
        batch_size: 16,
        max_retries: 2,
        num_fetchers: 2,
        num_ingesters: 2,
        ..Default::default()
    }
}

fn follower(fx: &Fixture, url: &Url, config: FollowerConfig) -> LogFollower {
    LogFollower::new(
        url.clone(),
        Arc::clone(&fx.db),
        Arc::clone(&fx.stats),
        config,
        Arc::new(AtomicBool::new(false)),
    )
}

// E1: a log with tree_size 0 yields no writes and an unset checkpoint.
#[tokio::test]
async fn test_empty_log_ingest() {
    let url = serve_log(Vec::new(), 1000).await;
    let fx = fixture();

    let result = follower(&fx, &url, test_config()).run_once().await.unwrap();
    assert_eq!(result, None);
    assert_eq!(fx.backend.pem_count(), 0);

    let state = fx.db.get_log_state(&url).await.unwrap();
    assert_eq!(state.max_entry, None);

    // A second resume observes the identical checkpoint
    let again = follower(&fx, &url, test_config()).run_once().await.unwrap();
    assert_eq!(again, None);
}

// Basic full ingest with deduplication across duplicate log entries.
#[tokio::test]
async fn test_full_ingest_dedups_repeated_entries() {
    let ca = make_ca("Pipeline CA");
    let ca_der = ca.cert.der().to_vec();

    let unique: Vec<Vec<u8>> = (0..20)
        .map(|i| make_leaf(&ca, &format!("site{}.example.com", i), 60))
        .collect();
    let mut entries: Vec<LogEntry> = unique.iter().map(|d| log_entry(d, &ca_der)).collect();
    // The log recorded five of them twice
    for der in unique.iter().take(5) {
        entries.push(log_entry(der, &ca_der));
    }

    let total = entries.len() as u64;
    let url = serve_log(entries, 1000).await;
    let fx = fixture();

    let result = follower(&fx, &url, test_config()).run_once().await.unwrap();
    assert_eq!(result, Some(total - 1));
    assert_eq!(fx.backend.pem_count(), 20);

    let snap = fx.stats.snapshot();
    assert_eq!(snap.stored, 20);
    assert_eq!(snap.duplicates, 5);
}

// E4 + P4: interrupt at the halfway point, restart, and observe a complete
// dedup-consistent result with a monotone checkpoint.
#[tokio::test]
async fn test_resume_after_interruption() {
    let ca = make_ca("Resume CA");
    let ca_der = ca.cert.der().to_vec();

    let unique: Vec<Vec<u8>> = (0..50)
        .map(|i| make_leaf(&ca, &format!("r{}.example.com", i), 45))
        .collect();
    let mut entries: Vec<LogEntry> = unique.iter().map(|d| log_entry(d, &ca_der)).collect();
    // Ten repeats scattered at the end
    for der in unique.iter().take(10) {
        entries.push(log_entry(der, &ca_der));
    }

    let url = serve_log(entries, 1000).await;
    let fx = fixture();

    // First run is cut short by an entry limit, standing in for a crash
    let limited = FollowerConfig { entry_limit: Some(32), ..test_config() };
    let first = follower(&fx, &url, limited).run_once().await.unwrap();
    assert_eq!(first, Some(31));

    let after_first = fx.db.get_log_state(&url).await.unwrap().max_entry.unwrap();
    assert_eq!(after_first, 31);

    // Restart resumes from MaxEntry+1 and finishes the log
    let second = follower(&fx, &url, test_config()).run_once().await.unwrap();
    assert_eq!(second, Some(59));
    assert!(second.unwrap() >= after_first, "checkpoint must be monotone");

    assert_eq!(fx.backend.pem_count(), 50);
}

// E5: the issuer CN filter keeps filtered certificates out of the PEM store
// AND out of the known-set.
#[tokio::test]
async fn test_issuer_cn_filter_applies_before_dedup() {
    let wanted_ca = make_ca("Let's Encrypt Fake R3");
    let other_ca = make_ca("Rival Trust Services");
    let wanted_der = wanted_ca.cert.der().to_vec();
    let other_der = other_ca.cert.der().to_vec();

    let mut entries = Vec::new();
    let mut wanted_leaves = Vec::new();
    for i in 0..4 {
        let der = make_leaf(&wanted_ca, &format!("w{}.example.com", i), 30);
        entries.push(log_entry(&der, &wanted_der));
        wanted_leaves.push(der);
    }
    for i in 0..6 {
        let der = make_leaf(&other_ca, &format!("o{}.example.com", i), 30);
        entries.push(log_entry(&der, &other_der));
    }

    let url = serve_log(entries, 1000).await;
    let fx = fixture();

    let config = FollowerConfig {
        issuer_cn_filter: vec!["Let's Encrypt".to_string()],
        ..test_config()
    };
    follower(&fx, &url, config).run_once().await.unwrap();

    assert_eq!(fx.backend.pem_count(), 4);
    let snap = fx.stats.snapshot();
    assert_eq!(snap.filtered, 6);

    // The rival shard never touched the known-set
    let (_, other_cert) = X509Certificate::from_der(&other_der).unwrap();
    let other_issuer = Issuer::from_cert(&other_cert);
    let (_, any_leaf) = X509Certificate::from_der(&wanted_leaves[0]).unwrap();
    let exp_date = ExpDate::from_unix(any_leaf.validity().not_after.timestamp()).unwrap();
    assert!(!fx
        .cache
        .exists(&serials_key(&exp_date, &other_issuer))
        .await
        .unwrap());

    let issuers = fx.db.list_issuers_for_expiration_date(&exp_date).await.unwrap();
    let (_, wanted_cert) = X509Certificate::from_der(&wanted_der).unwrap();
    assert_eq!(issuers, vec![Issuer::from_cert(&wanted_cert)]);
}

// Short get-entries pages are authoritative; the follower continues from
// start + returned and still drains the log.
#[tokio::test]
async fn test_partial_responses_are_authoritative() {
    let ca = make_ca("Short Page CA");
    let ca_der = ca.cert.der().to_vec();
    let entries: Vec<LogEntry> = (0..40)
        .map(|i| log_entry(&make_leaf(&ca, &format!("p{}.example.com", i), 30), &ca_der))
        .collect();

    // The log refuses to serve more than 7 entries per response
    let url = serve_log(entries, 7).await;
    let fx = fixture();

    let result = follower(&fx, &url, test_config()).run_once().await.unwrap();
    assert_eq!(result, Some(39));
    assert_eq!(fx.backend.pem_count(), 40);
}

// Expired certificates are dropped unless logExpiredEntries is set.
#[tokio::test]
async fn test_expired_entries_filtered_by_default() {
    let ca = make_ca("Expiry CA");
    let ca_der = ca.cert.der().to_vec();
    let expired = make_leaf(&ca, "old.example.com", -5);
    let current = make_leaf(&ca, "new.example.com", 30);
    let entries = vec![log_entry(&expired, &ca_der), log_entry(&current, &ca_der)];

    let url = serve_log(entries.clone(), 1000).await;
    let fx = fixture();
    follower(&fx, &url, test_config()).run_once().await.unwrap();
    assert_eq!(fx.backend.pem_count(), 1);

    let url2 = serve_log(entries, 1000).await;
    let fx2 = fixture();
    let config = FollowerConfig { log_expired_entries: true, ..test_config() };
    follower(&fx2, &url2, config).run_once().await.unwrap();
    assert_eq!(fx2.backend.pem_count(), 2);
}

// P4 under failure: a backend write error mid-window must leave the
// persisted checkpoint at or below the last durably stored index, and the
// failed window must be re-fetched on the next run.
#[tokio::test]
async fn test_checkpoint_never_covers_failed_store() {
    let ca = make_ca("Fault CA");
    let ca_der = ca.cert.der().to_vec();
    let entries: Vec<LogEntry> = (0..32)
        .map(|i| log_entry(&make_leaf(&ca, &format!("f{}.example.com", i), 30), &ca_der))
        .collect();

    let url = serve_log(entries, 1000).await;
    let fx = fixture();

    // Single fetcher and ingester keep ingest in entry order, so the nth
    // write attempt is entry n. Entry 20 sits mid-way through the second
    // window of [0,16), [16,32).
    let serial_config = FollowerConfig {
        batch_size: 16,
        max_retries: 2,
        num_fetchers: 1,
        num_ingesters: 1,
        ..Default::default()
    };
    fx.backend.fail_pem_write_at(20);

    let err = follower(&fx, &url, serial_config.clone()).run_once().await;
    assert!(err.is_err(), "the store failure must surface");
    assert_eq!(fx.backend.pem_count(), 20, "entries 0..=19 stored, 20 failed");

    // The persisted checkpoint must not cover the unstored entry 20
    let state = fx.db.get_log_state(&url).await.unwrap();
    assert!(
        state.max_entry.map_or(true, |m| m < 20),
        "checkpoint {:?} covers an entry that was never written",
        state.max_entry
    );

    // With the outage over, the restart re-fetches from the checkpoint and
    // finishes the log. Entry 20's serial was marked known before its write
    // failed, so the re-run observes it as known and skips the PEM; the
    // revocation pipeline tolerates known-without-PEM.
    fx.backend.clear_pem_fault();
    let final_entry = follower(&fx, &url, serial_config).run_once().await.unwrap();
    assert_eq!(final_entry, Some(31));
    assert_eq!(fx.backend.pem_count(), 31);
    assert_eq!(fx.db.get_log_state(&url).await.unwrap().max_entry, Some(31));
}

// --offset skips the head of the log.
#[tokio::test]
async fn test_start_offset_skips_entries() {
    let ca = make_ca("Offset CA");
    let ca_der = ca.cert.der().to_vec();
    let entries: Vec<LogEntry> = (0..20)
        .map(|i| log_entry(&make_leaf(&ca, &format!("s{}.example.com", i), 30), &ca_der))
        .collect();

    let url = serve_log(entries, 1000).await;
    let fx = fixture();
    let config = FollowerConfig { start_offset: Some(15), ..test_config() };
    let result = follower(&fx, &url, config).run_once().await.unwrap();

    assert_eq!(result, Some(19));
    assert_eq!(fx.backend.pem_count(), 5);
}
