// Process-level orchestration
//
// Builds the configured storage, spawns one follower task per log, and owns
// signal handling, periodic stats emission, the progress display, and the
// long-lived polling mode. Shard metadata reprocessing also lives here
// since it drives the same database façade with the same worker-pool shape.

use crate::cache::{MemoryCache, RedisCache, RemoteCache};
use crate::cli::Args;
use crate::config::CTConfig;
use crate::db::CertDatabase;
use crate::error::IngestError;
use crate::follower::{FollowerConfig, LogFollower};
use crate::stats::StatsTracker;
use crate::storage::{FirestoreBackend, LocalDiskBackend, StorageBackend};
use crate::Result;
use chrono::Utc;
use futures::stream::{self, TryStreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rand_distr::{Distribution, Normal};
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Umbrella timeout for administrative operations such as reprocessing.
const ADMIN_OP_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// How long graceful shutdown may take before the process gives up waiting.
const HARD_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Construct the cache, the selected backend, and the database façade.
/// Config validation has already rejected conflicting backends.
pub async fn configured_storage(
    config: &CTConfig,
) -> Result<(Arc<CertDatabase>, Arc<dyn StorageBackend>)> {
    let cache: Arc<dyn RemoteCache> = if config.redis_host == "memory" {
        // Hermetic runs (tests, dry runs) opt out of a live Redis.
        info!("Using in-process cache");
        Arc::new(MemoryCache::new())
    } else {
        Arc::new(RedisCache::new(&config.redis_host, config.redis_timeout).await?)
    };

    let backend: Arc<dyn StorageBackend> = match (&config.cert_path, &config.google_project_id) {
        (Some(path), _) if !path.is_empty() => {
            info!("Using local disk backend at {}", path);
            Arc::new(LocalDiskBackend::new(path))
        }
        (_, Some(project)) if !project.is_empty() => {
            info!("Using Firestore backend for project {}", project);
            Arc::new(FirestoreBackend::new(project).await?)
        }
        _ => return Err(IngestError::config("No storage backend configured")),
    };

    let db = Arc::new(CertDatabase::new(
        Arc::clone(&backend),
        cache,
        config.cache_size,
    ));
    Ok((db, backend))
}

pub async fn run(args: Args, config: CTConfig) -> Result<()> {
    let (db, backend) = configured_storage(&config).await?;
    let stats = Arc::new(StatsTracker::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(Arc::clone(&shutdown));

    if args.reprocess {
        return reprocess(&args, &config, db).await;
    }

    if config.log_list.is_empty() {
        return Err(IngestError::config("logList is empty; nothing to follow"));
    }

    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let num_fetchers = config.num_threads * cores;
    let follower_config = FollowerConfig {
        batch_size: config.batch_size,
        max_retries: config.max_retries,
        num_fetchers,
        num_ingesters: num_fetchers * 2,
        issuer_cn_filter: config.issuer_cn_filter.clone(),
        log_expired_entries: config.log_expired_entries,
        start_offset: args.offset,
        entry_limit: args.limit,
    };

    let progress = spawn_progress_display(
        Arc::clone(&stats),
        Arc::clone(&shutdown),
        config.output_refresh_period,
    );
    let reporter = spawn_stats_reporter(
        Arc::clone(&stats),
        Arc::clone(&shutdown),
        config.stats_refresh_period,
    );

    let mut handles = Vec::new();
    for url in &config.log_list {
        let follower = LogFollower::new(
            url.clone(),
            Arc::clone(&db),
            Arc::clone(&stats),
            follower_config.clone(),
            Arc::clone(&shutdown),
        );
        let run_forever = config.run_forever;
        let mean = config.polling_delay_mean;
        let std_dev = config.polling_delay_std_dev;
        let shutdown = Arc::clone(&shutdown);
        handles.push(tokio::spawn(async move {
            follow_log(follower, run_forever, mean, std_dev, shutdown).await
        }));
    }

    let joined = futures::future::join_all(handles);
    let results = tokio::select! {
        results = joined => Some(results),
        () = forced_exit_after_signal(Arc::clone(&shutdown)) => None,
    };

    shutdown.store(true, Ordering::Relaxed);
    let _ = progress.await;
    let _ = reporter.await;

    println!("{}", stats.summary_line());
    info!("Backend collisions observed: {}", backend.collisions());

    match results {
        None => {
            warn!("Hard shutdown deadline reached; exiting without a full drain");
            Ok(())
        }
        Some(results) => {
            let mut first_error = None;
            for result in results {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("Log worker failed: {}", e);
                        first_error.get_or_insert(e);
                    }
                    Err(join_err) => {
                        error!("Log worker panicked: {}", join_err);
                        first_error.get_or_insert(IngestError::from(join_err));
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }
}

/// One log's lifetime: run to the tree head, then either stop or keep
/// polling with a jittered delay.
async fn follow_log(
    follower: LogFollower,
    run_forever: bool,
    delay_mean: f64,
    delay_std_dev: f64,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        let max_entry = match follower.run_once().await {
            Ok(m) => m,
            Err(e) => {
                if e.is_fatal() {
                    // Cache OOM loses membership on retry; stop the world.
                    error!("{}: fatal error, stopping all ingestion: {}", follower.short_url(), e);
                    shutdown.store(true, Ordering::Relaxed);
                }
                return Err(e);
            }
        };
        match max_entry {
            Some(m) => info!("{}: pass complete, MaxEntry={}", follower.short_url(), m),
            None => info!("{}: pass complete, nothing ingested", follower.short_url()),
        }

        if !run_forever || shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
        let delay = sample_polling_delay(delay_mean, delay_std_dev);
        info!("{}: sleeping {:?} before next poll", follower.short_url(), delay);
        sleep_unless_shutdown(delay, &shutdown).await;
        if shutdown.load(Ordering::Relaxed) {
            return Ok(());
        }
    }
}

/// Normal-distributed polling delay, clamped at zero.
fn sample_polling_delay(mean: f64, std_dev: f64) -> Duration {
    let seconds = match Normal::new(mean, std_dev.abs()) {
        Ok(dist) => dist.sample(&mut rand::thread_rng()),
        Err(_) => mean,
    };
    Duration::from_secs_f64(seconds.max(0.0))
}

async fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let tick = Duration::from_millis(250);
    let mut slept = Duration::ZERO;
    while slept < total {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let step = tick.min(total - slept);
        tokio::time::sleep(step).await;
        slept += step;
    }
}

fn spawn_signal_handler(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("Shutdown signal received, stopping at the next opportunity");
        shutdown.store(true, Ordering::Relaxed);
    });
}

/// Resolves only if a shutdown signal arrives and the drain overruns the
/// hard deadline.
async fn forced_exit_after_signal(shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    tokio::time::sleep(HARD_SHUTDOWN_DEADLINE).await;
}

/// Two bars: windows through the fetch queue, entries through the ingest
/// queue. indicatif suppresses drawing when stderr is not a terminal.
fn spawn_progress_display(
    stats: Arc<StatsTracker>,
    shutdown: Arc<AtomicBool>,
    refresh: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let multi = MultiProgress::new();
        let style = ProgressStyle::with_template("{prefix:>7} [{bar:40}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());

        let fetch = multi.add(ProgressBar::new(0));
        fetch.set_style(style.clone());
        fetch.set_prefix("fetch");
        let ingest = multi.add(ProgressBar::new(0));
        ingest.set_style(style);
        ingest.set_prefix("ingest");

        let mut interval = tokio::time::interval(refresh.max(Duration::from_millis(50)));
        while !shutdown.load(Ordering::Relaxed) {
            interval.tick().await;
            let snap = stats.snapshot();
            fetch.set_length(snap.fetch_queued);
            fetch.set_position(snap.fetch_done.min(snap.fetch_queued));
            ingest.set_length(snap.ingest_queued);
            ingest.set_position(snap.ingest_done.min(snap.ingest_queued));
        }
        fetch.finish_and_clear();
        ingest.finish_and_clear();
    })
}

fn spawn_stats_reporter(
    stats: Arc<StatsTracker>,
    shutdown: Arc<AtomicBool>,
    refresh: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(refresh.max(Duration::from_secs(1)));
        interval.tick().await; // the immediate first tick carries no data
        while !shutdown.load(Ordering::Relaxed) {
            interval.tick().await;
            let snap = stats.snapshot();
            info!(
                "processed={} stored={} duplicates={} filtered={} new_shards={} crls={} ({}s elapsed)",
                snap.processed,
                snap.stored,
                snap.duplicates,
                snap.filtered,
                snap.new_shards,
                snap.crls_added,
                snap.elapsed_secs,
            );
        }
    })
}

/// Rebuild shard metadata and known-sets from stored PEMs, optionally
/// narrowed by regexes matching the expDate, the issuer, or
/// `expDate/issuer`.
async fn reprocess(args: &Args, config: &CTConfig, db: Arc<CertDatabase>) -> Result<()> {
    let regexes = args
        .patterns
        .iter()
        .map(|p| {
            Regex::new(p)
                .map_err(|e| IngestError::config(format!("Could not compile regex [{}]: {}", p, e)))
        })
        .collect::<Result<Vec<Regex>>>()?;

    let should_process = |exp_date: &str, issuer: &str| -> bool {
        if regexes.is_empty() {
            return true;
        }
        let combined = format!("{}/{}", exp_date, issuer);
        regexes
            .iter()
            .any(|rx| rx.is_match(exp_date) || rx.is_match(issuer) || rx.is_match(&combined))
    };

    let work = tokio::time::timeout(ADMIN_OP_TIMEOUT, async {
        let mut selected = Vec::new();
        let exp_dates = db.list_expiration_dates(Utc::now().date_naive()).await?;
        for exp_date in exp_dates {
            for issuer in db.list_issuers_for_expiration_date(&exp_date).await? {
                if should_process(&exp_date.to_string(), issuer.id()) {
                    selected.push((exp_date, issuer));
                }
            }
        }
        Ok::<_, IngestError>(selected)
    })
    .await??;

    info!("Reprocessing {} shards", work.len());
    let bar = ProgressBar::new(work.len() as u64);
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    let workers = config.num_threads * cores;

    tokio::time::timeout(
        ADMIN_OP_TIMEOUT,
        stream::iter(work.into_iter().map(Ok::<_, IngestError>)).try_for_each_concurrent(
            workers,
            |(exp_date, issuer)| {
                let db = Arc::clone(&db);
                let bar = bar.clone();
                async move {
                    let n = db.reconstruct_issuer_metadata(&exp_date, &issuer).await?;
                    bar.inc(1);
                    info!("Reprocessed {}/{}: {} certificates", exp_date, issuer.id(), n);
                    Ok(())
                }
            },
        ),
    )
    .await??;

    bar.finish();
    Ok(())
}
