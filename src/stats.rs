// Ingestion statistics
//
// One process-global tracker shared by every log worker. Counters are
// updated from hot paths, so everything here is lock-free except the
// per-log table.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Default, Clone, Serialize)]
pub struct LogProgress {
    pub short_url: String,
    pub tree_size: u64,
    pub max_entry: Option<u64>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub processed: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub filtered: u64,
    pub parse_errors: u64,
    pub new_shards: u64,
    pub crls_added: u64,
    pub fetch_queued: u64,
    pub fetch_done: u64,
    pub ingest_queued: u64,
    pub ingest_done: u64,
    pub per_log: HashMap<String, LogProgress>,
    pub elapsed_secs: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    stored: AtomicU64,
    duplicates: AtomicU64,
    filtered: AtomicU64,
    parse_errors: AtomicU64,
    new_shards: AtomicU64,
    crls_added: AtomicU64,
    fetch_queued: AtomicU64,
    fetch_done: AtomicU64,
    ingest_queued: AtomicU64,
    ingest_done: AtomicU64,
}

pub struct StatsTracker {
    counters: Counters,
    per_log: Mutex<HashMap<String, LogProgress>>,
    started: Instant,
}

impl StatsTracker {
    pub fn new() -> StatsTracker {
        StatsTracker {
            counters: Counters::default(),
            per_log: Mutex::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    pub fn incr_processed(&self) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_stored(&self) {
        self.counters.stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_duplicates(&self) {
        self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_filtered(&self) {
        self.counters.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_parse_errors(&self) {
        self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_new_shards(&self) {
        self.counters.new_shards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_crls(&self, n: u64) {
        self.counters.crls_added.fetch_add(n, Ordering::Relaxed);
    }

    pub fn window_queued(&self) {
        self.counters.fetch_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn window_done(&self) {
        self.counters.fetch_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entry_queued(&self) {
        self.counters.ingest_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entry_done(&self) {
        self.counters.ingest_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_log(&self, short_url: &str, tree_size: u64, max_entry: Option<u64>) {
        let mut per_log = self.per_log.lock().unwrap();
        let entry = per_log
            .entry(short_url.to_string())
            .or_insert_with(|| LogProgress {
                short_url: short_url.to_string(),
                ..Default::default()
            });
        if tree_size > 0 {
            entry.tree_size = tree_size;
        }
        if max_entry.is_some() {
            entry.max_entry = max_entry;
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let c = &self.counters;
        Snapshot {
            processed: c.processed.load(Ordering::Relaxed),
            stored: c.stored.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            filtered: c.filtered.load(Ordering::Relaxed),
            parse_errors: c.parse_errors.load(Ordering::Relaxed),
            new_shards: c.new_shards.load(Ordering::Relaxed),
            crls_added: c.crls_added.load(Ordering::Relaxed),
            fetch_queued: c.fetch_queued.load(Ordering::Relaxed),
            fetch_done: c.fetch_done.load(Ordering::Relaxed),
            ingest_queued: c.ingest_queued.load(Ordering::Relaxed),
            ingest_done: c.ingest_done.load(Ordering::Relaxed),
            per_log: self.per_log.lock().unwrap().clone(),
            elapsed_secs: self.started.elapsed().as_secs(),
        }
    }

    /// The one-line totals emitted at exit.
    pub fn summary_line(&self) -> String {
        let snap = self.snapshot();
        let mut line = format!(
            "Done. issuers={} serials={} crls={} (processed={} duplicates={} filtered={} parse_errors={})",
            snap.new_shards,
            snap.stored,
            snap.crls_added,
            snap.processed,
            snap.duplicates,
            snap.filtered,
            snap.parse_errors,
        );
        let mut logs: Vec<&LogProgress> = snap.per_log.values().collect();
        logs.sort_by(|a, b| a.short_url.cmp(&b.short_url));
        for log in logs {
            match log.max_entry {
                Some(m) => line.push_str(&format!(" [{} MaxEntry={}]", log.short_url, m)),
                None => line.push_str(&format!(" [{} MaxEntry=unset]", log.short_url)),
            }
        }
        line
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = StatsTracker::new();
        stats.incr_processed();
        stats.incr_processed();
        stats.incr_stored();
        stats.incr_duplicates();
        stats.add_crls(3);

        let snap = stats.snapshot();
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.stored, 1);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.crls_added, 3);
    }

    #[test]
    fn test_per_log_progress_keeps_max_entry() {
        let stats = StatsTracker::new();
        stats.update_log("ct.example.com/a", 100, None);
        stats.update_log("ct.example.com/a", 120, Some(99));
        stats.update_log("ct.example.com/a", 130, None);

        let snap = stats.snapshot();
        let log = &snap.per_log["ct.example.com/a"];
        assert_eq!(log.tree_size, 130);
        assert_eq!(log.max_entry, Some(99));
    }

    #[test]
    fn test_summary_line_mentions_each_log() {
        let stats = StatsTracker::new();
        stats.update_log("ct.example.com/a", 10, Some(9));
        stats.update_log("ct.example.com/b", 0, None);
        let line = stats.summary_line();
        assert!(line.contains("[ct.example.com/a MaxEntry=9]"));
        assert!(line.contains("[ct.example.com/b MaxEntry=unset]"));
    }
}
