// Per-log ingestion pipeline
//
// One pass walks the log from its checkpoint to the current tree head:
//
//   planner -> window queue -> fetch pool -> ingest queue -> ingest pool
//                                   \________ completions ________/
//                                              checkpointer
//
// Bounded queues provide backpressure end to end. Windows complete out of
// order; the checkpointer only ever persists the contiguous frontier, so a
// crash at any point resumes from MaxEntry+1 without loss. A store failure
// freezes the frontier: the failed entry's window never completes and no
// further checkpoint is written, so the restart re-fetches it. The error
// slot doubles as the run-local abort signal; the process-wide shutdown
// flag belongs to signals and fatal errors only.

use crate::db::CertDatabase;
use crate::error::IngestError;
use crate::follower::client::LogClient;
use crate::follower::leaf::{self, ParsedEntry};
use crate::follower::windows::{plan_windows, ReorderBuffer, Window};
use crate::ids::{CertificateLog, Issuer};
use crate::stats::StatsTracker;
use crate::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};
use url::Url;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// Persist the checkpoint whenever the frontier advances by this many
/// entries (plus on IDLE transition and on shutdown).
pub const CHECKPOINT_STRIDE: u64 = 4096;

/// Consecutive checkpoint write failures tolerated before the log worker
/// shuts down to prevent unbounded re-fetching.
const MAX_CHECKPOINT_FAILURES: u32 = 3;

const INGEST_BUFFER: usize = 4096;

#[derive(Debug, Clone)]
pub struct FollowerConfig {
    pub batch_size: u64,
    pub max_retries: u32,
    pub num_fetchers: usize,
    pub num_ingesters: usize,
    /// CN prefixes; empty accepts all issuers.
    pub issuer_cn_filter: Vec<String>,
    /// Keep certificates that have already expired.
    pub log_expired_entries: bool,
    /// Skip all entries below this index.
    pub start_offset: Option<u64>,
    /// Stop after roughly this many entries.
    pub entry_limit: Option<u64>,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        FollowerConfig {
            batch_size: 1000,
            max_retries: 10,
            num_fetchers: 2,
            num_ingesters: 4,
            issuer_cn_filter: Vec::new(),
            log_expired_entries: false,
            start_offset: None,
            entry_limit: None,
        }
    }
}

/// First error wins; everything after it drains without storing.
#[derive(Clone, Default)]
struct ErrorSlot(Arc<Mutex<Option<IngestError>>>);

impl ErrorSlot {
    fn record(&self, err: IngestError) {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn has(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }

    fn take(&self) -> Option<IngestError> {
        self.0.lock().unwrap().take()
    }
}

/// Counts down a window's entries; the last one reports the window done.
struct WindowTracker {
    window: Window,
    remaining: AtomicU64,
    completions: mpsc::UnboundedSender<Window>,
}

impl WindowTracker {
    fn mark_done(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = self.completions.send(self.window);
        }
    }
}

struct IngestItem {
    index: u64,
    parsed: ParsedEntry,
    tracker: Arc<WindowTracker>,
}

pub struct LogFollower {
    log_url: Url,
    short_url: String,
    client: Arc<LogClient>,
    db: Arc<CertDatabase>,
    stats: Arc<StatsTracker>,
    config: Arc<FollowerConfig>,
    shutdown: Arc<AtomicBool>,
}

impl LogFollower {
    pub fn new(
        log_url: Url,
        db: Arc<CertDatabase>,
        stats: Arc<StatsTracker>,
        config: FollowerConfig,
        shutdown: Arc<AtomicBool>,
    ) -> LogFollower {
        let short_url = CertificateLog::short_url_of(&log_url);
        let client = Arc::new(LogClient::new(log_url.as_str(), config.max_retries));
        LogFollower {
            log_url,
            short_url,
            client,
            db,
            stats,
            config: Arc::new(config),
            shutdown,
        }
    }

    pub fn short_url(&self) -> &str {
        &self.short_url
    }

    /// One pass from the saved checkpoint to the current tree head. Returns
    /// the final MaxEntry (None when nothing has ever been ingested).
    pub async fn run_once(&self) -> Result<Option<u64>> {
        let checkpoint = self.db.get_log_state(&self.log_url).await?;
        let sth = self.client.get_sth().await?;
        self.stats
            .update_log(&self.short_url, sth.tree_size, checkpoint.max_entry);

        let mut next = checkpoint.next_entry();
        if let Some(offset) = self.config.start_offset {
            next = next.max(offset);
        }
        let mut target = sth.tree_size;
        if let Some(limit) = self.config.entry_limit {
            target = target.min(next.saturating_add(limit));
        }

        if next >= target {
            debug!(
                "{}: caught up (next={}, tree_size={})",
                self.short_url, next, sth.tree_size
            );
            return Ok(checkpoint.max_entry);
        }

        info!(
            "{}: ingesting entries [{}, {}) of tree size {}",
            self.short_url, next, target, sth.tree_size
        );

        let (window_tx, window_rx) = mpsc::channel::<Window>(self.config.num_fetchers * 2);
        let window_rx = Arc::new(AsyncMutex::new(window_rx));
        let (ingest_tx, ingest_rx) = mpsc::channel::<IngestItem>(INGEST_BUFFER);
        let ingest_rx = Arc::new(AsyncMutex::new(ingest_rx));
        let (completions_tx, completions_rx) = mpsc::unbounded_channel::<Window>();

        let effective_batch = Arc::new(AtomicU64::new(self.config.batch_size.max(1)));
        let errors = ErrorSlot::default();

        // Planner: stops queueing new windows the moment shutdown or a
        // pipeline error is raised.
        let planner = {
            let shutdown = Arc::clone(&self.shutdown);
            let stats = Arc::clone(&self.stats);
            let errors = errors.clone();
            let batch = self.config.batch_size;
            tokio::spawn(async move {
                for window in plan_windows(next, target, batch) {
                    if shutdown.load(Ordering::Relaxed) || errors.has() {
                        break;
                    }
                    stats.window_queued();
                    if window_tx.send(window).await.is_err() {
                        break;
                    }
                }
            })
        };

        let mut fetchers = Vec::with_capacity(self.config.num_fetchers);
        for _ in 0..self.config.num_fetchers {
            fetchers.push(tokio::spawn(Self::fetch_worker(
                Arc::clone(&self.client),
                Arc::clone(&window_rx),
                ingest_tx.clone(),
                completions_tx.clone(),
                Arc::clone(&effective_batch),
                Arc::clone(&self.stats),
                Arc::clone(&self.shutdown),
                errors.clone(),
            )));
        }
        drop(ingest_tx);
        drop(completions_tx);
        // Workers hold the only receiver refs from here on, so a pipeline
        // where every worker has exited closes its channels and unblocks the
        // stages upstream.
        drop(window_rx);

        let mut ingesters = Vec::with_capacity(self.config.num_ingesters);
        for _ in 0..self.config.num_ingesters {
            ingesters.push(tokio::spawn(Self::ingest_worker(
                Arc::clone(&self.db),
                Arc::clone(&ingest_rx),
                self.log_url.as_str().to_string(),
                Arc::clone(&self.config),
                Arc::clone(&self.stats),
                errors.clone(),
            )));
        }
        drop(ingest_rx);

        let checkpointer = tokio::spawn(Self::checkpointer(
            Arc::clone(&self.db),
            self.short_url.clone(),
            checkpoint,
            next,
            completions_rx,
            Arc::clone(&self.stats),
            errors.clone(),
        ));

        planner.await?;
        for handle in fetchers {
            handle.await?;
        }
        for handle in ingesters {
            handle.await?;
        }
        let final_entry = checkpointer.await??;

        if let Some(err) = errors.take() {
            return Err(err);
        }
        Ok(final_entry)
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_worker(
        client: Arc<LogClient>,
        window_rx: Arc<AsyncMutex<mpsc::Receiver<Window>>>,
        ingest_tx: mpsc::Sender<IngestItem>,
        completions: mpsc::UnboundedSender<Window>,
        effective_batch: Arc<AtomicU64>,
        stats: Arc<StatsTracker>,
        shutdown: Arc<AtomicBool>,
        errors: ErrorSlot,
    ) {
        loop {
            if shutdown.load(Ordering::Relaxed) || errors.has() {
                return;
            }
            let window = { window_rx.lock().await.recv().await };
            let Some(window) = window else { return };

            let result = Self::fetch_window(
                &client,
                window,
                &ingest_tx,
                &completions,
                &effective_batch,
                &stats,
                &errors,
            )
            .await;
            stats.window_done();

            if let Err(e) = result {
                if !matches!(e, IngestError::Shutdown) {
                    error!("Fetch of [{}, {}) failed: {}", window.start, window.end, e);
                    errors.record(e);
                }
                return;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_window(
        client: &LogClient,
        window: Window,
        ingest_tx: &mpsc::Sender<IngestItem>,
        completions: &mpsc::UnboundedSender<Window>,
        effective_batch: &AtomicU64,
        stats: &StatsTracker,
        errors: &ErrorSlot,
    ) -> Result<()> {
        let tracker = Arc::new(WindowTracker {
            window,
            remaining: AtomicU64::new(window.len()),
            completions: completions.clone(),
        });

        let mut cursor = window.start;
        while cursor < window.end {
            if errors.has() {
                // Abandon the window: its tracker never fires, so the
                // frontier cannot advance over it.
                return Err(IngestError::Shutdown);
            }
            let want = (window.end - cursor).min(effective_batch.load(Ordering::Relaxed)).max(1);
            let entries = client.get_entries(cursor, cursor + want - 1).await?;
            if entries.is_empty() {
                return Err(IngestError::Other(format!(
                    "Log returned no entries for [{}, {})",
                    cursor,
                    cursor + want
                )));
            }

            let got = (entries.len() as u64).min(want);
            if got < want {
                // Short pages are authoritative: ask for what the log serves.
                let prev = effective_batch.load(Ordering::Relaxed);
                if got < prev {
                    effective_batch.store(got, Ordering::Relaxed);
                    debug!("Log serves short pages; batch size now {}", got);
                }
            }

            for (i, raw) in entries.iter().take(got as usize).enumerate() {
                let index = cursor + i as u64;
                match leaf::parse_entry(raw) {
                    Ok(parsed) => {
                        stats.entry_queued();
                        let item = IngestItem { index, parsed, tracker: Arc::clone(&tracker) };
                        if ingest_tx.send(item).await.is_err() {
                            return Err(IngestError::Shutdown);
                        }
                    }
                    Err(e) => {
                        // Single-entry corruption must not stall ingest.
                        warn!("Failed to parse entry {}: {}", index, e);
                        stats.incr_parse_errors();
                        tracker.mark_done();
                    }
                }
            }
            cursor += got;
        }
        Ok(())
    }

    async fn ingest_worker(
        db: Arc<CertDatabase>,
        ingest_rx: Arc<AsyncMutex<mpsc::Receiver<IngestItem>>>,
        log_url: String,
        config: Arc<FollowerConfig>,
        stats: Arc<StatsTracker>,
        errors: ErrorSlot,
    ) {
        loop {
            let item = { ingest_rx.lock().await.recv().await };
            let Some(item) = item else { return };

            // After an error the pipeline drains without storing, so
            // upstream senders never deadlock on a full queue. Drained and
            // failed entries are NOT marked done: their windows must never
            // complete, or the checkpoint frontier would cover entries that
            // were never durably written.
            if errors.has() {
                stats.entry_done();
                continue;
            }
            match Self::ingest_one(&db, &log_url, &config, &stats, &item).await {
                Ok(()) => {
                    stats.entry_done();
                    item.tracker.mark_done();
                }
                Err(e) => {
                    error!("Ingest of entry {} failed: {}", item.index, e);
                    errors.record(e);
                    stats.entry_done();
                }
            }
        }
    }

    async fn ingest_one(
        db: &CertDatabase,
        log_url: &str,
        config: &FollowerConfig,
        stats: &StatsTracker,
        item: &IngestItem,
    ) -> Result<()> {
        let cert = match X509Certificate::from_der(&item.parsed.cert_der) {
            Ok((_, cert)) => cert,
            Err(e) => {
                warn!("Entry {} is not a valid certificate: {}", item.index, e);
                stats.incr_parse_errors();
                return Ok(());
            }
        };

        if !config.issuer_cn_filter.is_empty() {
            let cn = cert
                .issuer()
                .iter_common_name()
                .next()
                .and_then(|attr| attr.as_str().ok())
                .unwrap_or_default();
            if !config.issuer_cn_filter.iter().any(|prefix| cn.starts_with(prefix)) {
                stats.incr_filtered();
                return Ok(());
            }
        }

        if !config.log_expired_entries
            && cert.validity().not_after.timestamp() < Utc::now().timestamp()
        {
            stats.incr_filtered();
            return Ok(());
        }

        stats.incr_processed();

        let issuer = match &item.parsed.issuer_der {
            Some(der) => match X509Certificate::from_der(der) {
                Ok((_, issuer_cert)) => Issuer::from_cert(&issuer_cert),
                Err(e) => {
                    warn!("Entry {} has unparseable issuer, using leaf fallback: {}", item.index, e);
                    Issuer::from_leaf_fallback(&cert)
                }
            },
            None => Issuer::from_leaf_fallback(&cert),
        };

        let outcome = db
            .store(&cert, &item.parsed.cert_der, &issuer, log_url, item.index)
            .await?;

        if outcome.stored {
            stats.incr_stored();
        } else {
            stats.incr_duplicates();
        }
        if outcome.new_shard {
            stats.incr_new_shards();
        }
        stats.add_crls(outcome.crls_added);
        Ok(())
    }

    /// Single writer of the checkpoint document.
    async fn checkpointer(
        db: Arc<CertDatabase>,
        short_url: String,
        mut checkpoint: CertificateLog,
        next: u64,
        mut completions_rx: mpsc::UnboundedReceiver<Window>,
        stats: Arc<StatsTracker>,
        errors: ErrorSlot,
    ) -> Result<Option<u64>> {
        let mut buffer = ReorderBuffer::new(next);
        let mut persisted = checkpoint.max_entry;
        let mut failures = 0u32;

        while let Some(window) = completions_rx.recv().await {
            // Once an error is pending the frontier is frozen: completions
            // still drain, but nothing advances or persists.
            if errors.has() {
                continue;
            }
            let Some(frontier) = buffer.complete(window) else { continue };
            checkpoint.max_entry = Some(frontier);

            let advanced = frontier - persisted.map_or(0, |p| p + 1) + 1;
            if advanced < CHECKPOINT_STRIDE {
                continue;
            }
            match Self::persist(&db, &mut checkpoint, &stats).await {
                Ok(()) => {
                    persisted = Some(frontier);
                    failures = 0;
                }
                Err(e) => {
                    failures += 1;
                    error!(
                        "Checkpoint write for {} failed ({} consecutive): {}",
                        short_url, failures, e
                    );
                    if failures >= MAX_CHECKPOINT_FAILURES {
                        return Err(e);
                    }
                }
            }
        }

        // Pipeline drained: one final persist covers stride remainders,
        // graceful shutdown, and the IDLE transition alike. Not on the
        // error path: run_once is about to return Err, and the restart
        // must re-fetch everything past the last clean checkpoint.
        if !errors.has() && checkpoint.max_entry > persisted {
            Self::persist(&db, &mut checkpoint, &stats).await?;
        }
        Ok(checkpoint.max_entry)
    }

    async fn persist(
        db: &CertDatabase,
        checkpoint: &mut CertificateLog,
        stats: &StatsTracker,
    ) -> Result<()> {
        checkpoint.last_entry_time = Some(Utc::now());
        db.save_log_state(checkpoint).await?;
        stats.update_log(&checkpoint.short_url, 0, checkpoint.max_entry);
        debug!("Checkpoint persisted: {}", checkpoint);
        Ok(())
    }
}
