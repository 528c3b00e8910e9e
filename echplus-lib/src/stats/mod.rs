use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EchError, Result};

/// Snapshot file name under the store directory.
pub const STATS_FILE: &str = "traffic_stats.json";
/// Sites below this combined volume are not persisted.
const MIN_PERSIST_BYTES: u64 = 10 * 1024;
/// Snapshot cadence while running.
pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Per-host traffic counters. Timestamps are unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteStats {
    pub host: String,
    pub upload: u64,
    pub download: u64,
    pub connections: u64,
    pub first_access: u64,
    pub last_access: u64,
}

impl SiteStats {
    fn new(host: &str, now: u64) -> Self {
        Self {
            host: host.to_string(),
            upload: 0,
            download: 0,
            connections: 0,
            first_access: now,
            last_access: now,
        }
    }

    pub fn total(&self) -> u64 {
        self.upload.saturating_add(self.download)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TotalStats {
    pub upload: u64,
    pub download: u64,
}

/// Bytes per second over the last sampling interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct Speed {
    pub upload_bps: u64,
    pub download_bps: u64,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    sites: BTreeMap<String, SiteStats>,
    total_upload: u64,
    total_download: u64,
    saved_at: u64,
}

#[derive(Default)]
struct Inner {
    sites: HashMap<String, SiteStats>,
    total_upload: u64,
    total_download: u64,
    last_sample: Option<(Instant, u64, u64)>,
    speed: Speed,
}

/// Per-host traffic accounting. The in-memory map is authoritative; the
/// JSON file is a periodic snapshot. All mutation goes through one lock and
/// reads return copies.
pub struct TrafficStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl TrafficStore {
    /// Open the store, absorbing a previous snapshot when one exists.
    pub fn open(store_dir: &Path) -> Self {
        let path = store_dir.join(STATS_FILE);
        let mut inner = Inner::default();
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snap) => {
                    inner.total_upload = snap.total_upload;
                    inner.total_download = snap.total_download;
                    inner.sites = snap.sites.into_iter().collect();
                    debug!(sites = inner.sites.len(), "traffic snapshot loaded");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "ignoring corrupt traffic snapshot"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to read traffic snapshot"),
        }
        Self { path, inner: Mutex::new(inner) }
    }

    pub fn record_connection(&self, host: &str) {
        let now = now_unix();
        let mut inner = self.lock();
        let site = inner.sites.entry(host.to_string()).or_insert_with(|| SiteStats::new(host, now));
        site.connections += 1;
        site.last_access = now;
    }

    pub fn record_upload(&self, host: &str, n: u64) {
        let now = now_unix();
        let mut inner = self.lock();
        let site = inner.sites.entry(host.to_string()).or_insert_with(|| SiteStats::new(host, now));
        site.upload = site.upload.saturating_add(n);
        site.last_access = now;
        inner.total_upload = inner.total_upload.saturating_add(n);
    }

    pub fn record_download(&self, host: &str, n: u64) {
        let now = now_unix();
        let mut inner = self.lock();
        let site = inner.sites.entry(host.to_string()).or_insert_with(|| SiteStats::new(host, now));
        site.download = site.download.saturating_add(n);
        site.last_access = now;
        inner.total_download = inner.total_download.saturating_add(n);
    }

    pub fn site_stats(&self, host: &str) -> Option<SiteStats> {
        self.lock().sites.get(host).cloned()
    }

    pub fn total_stats(&self) -> TotalStats {
        let inner = self.lock();
        TotalStats { upload: inner.total_upload, download: inner.total_download }
    }

    /// Top `k` sites by combined volume, descending.
    pub fn top_sites(&self, k: usize) -> Vec<SiteStats> {
        let inner = self.lock();
        let mut sites: Vec<SiteStats> = inner.sites.values().cloned().collect();
        sites.sort_by(|a, b| b.total().cmp(&a.total()));
        sites.truncate(k);
        sites
    }

    /// Record one cadence sample and derive bytes/sec since the previous
    /// one. Driven by the engine's sampler task.
    pub fn sample_speed(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        let (up, down) = (inner.total_upload, inner.total_download);
        if let Some((at, prev_up, prev_down)) = inner.last_sample {
            let secs = now.duration_since(at).as_secs_f64();
            if secs > 0.0 {
                inner.speed = Speed {
                    upload_bps: ((up - prev_up) as f64 / secs) as u64,
                    download_bps: ((down - prev_down) as f64 / secs) as u64,
                };
            }
        }
        inner.last_sample = Some((now, up, down));
    }

    pub fn speed(&self) -> Speed {
        self.lock().speed
    }

    /// Write the JSON snapshot, omitting sites under the persistence
    /// threshold to bound file size.
    pub fn save(&self) -> Result<()> {
        let snapshot = {
            let inner = self.lock();
            Snapshot {
                sites: inner
                    .sites
                    .iter()
                    .filter(|(_, s)| s.total() >= MIN_PERSIST_BYTES)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                total_upload: inner.total_upload,
                total_download: inner.total_download,
                saved_at: now_unix(),
            }
        };
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| EchError::Persistence(format!("encode traffic snapshot: {e}")))?;
        std::fs::write(&self.path, json)
            .map_err(|e| EchError::Persistence(format!("write {}: {e}", self.path.display())))?;
        info!(path = %self.path.display(), sites = snapshot.sites.len(), "traffic snapshot saved");
        Ok(())
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.sites.clear();
        inner.total_upload = 0;
        inner.total_download = 0;
        inner.speed = Speed::default();
        inner.last_sample = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned stats lock only ever means a panicking reader; the
        // counters themselves stay consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, TrafficStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TrafficStore::open(dir.path());
        (dir, store)
    }

    #[test]
    fn accounting_sums_match_totals() {
        let (_dir, s) = store();
        s.record_connection("a.example:443");
        s.record_upload("a.example:443", 100);
        s.record_download("a.example:443", 250);
        s.record_connection("b.example:80");
        s.record_upload("b.example:80", 40);

        let a = s.site_stats("a.example:443").unwrap();
        assert_eq!(a.upload, 100);
        assert_eq!(a.download, 250);
        assert!(a.connections >= 1);

        let totals = s.total_stats();
        assert_eq!(totals.upload, 140);
        assert_eq!(totals.download, 250);
    }

    #[test]
    fn persistence_filter_drops_small_sites() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let s = TrafficStore::open(dir.path());
            s.record_upload("tiny.example", 1024);
            s.record_upload("big.example", 20 * 1024);
            s.save().unwrap();
        }
        let json = std::fs::read_to_string(dir.path().join(STATS_FILE)).unwrap();
        assert!(!json.contains("tiny.example"));
        assert!(json.contains("big.example"));

        // Totals survive the reload even when small sites are dropped.
        let s = TrafficStore::open(dir.path());
        assert_eq!(s.total_stats().upload, 21 * 1024);
        assert!(s.site_stats("tiny.example").is_none());
        assert_eq!(s.site_stats("big.example").unwrap().upload, 20 * 1024);
    }

    #[test]
    fn top_sites_orders_by_volume() {
        let (_dir, s) = store();
        s.record_upload("small", 10);
        s.record_download("large", 1000);
        s.record_upload("mid", 100);
        let top = s.top_sites(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].host, "large");
        assert_eq!(top[1].host, "mid");
    }

    #[test]
    fn speed_derives_from_samples() {
        let (_dir, s) = store();
        s.sample_speed();
        s.record_download("x", 5000);
        std::thread::sleep(Duration::from_millis(30));
        s.sample_speed();
        assert!(s.speed().download_bps > 0);
        assert_eq!(s.speed().upload_bps, 0);
    }

    #[test]
    fn reset_clears_everything() {
        let (_dir, s) = store();
        s.record_upload("x", 50_000);
        s.reset();
        assert!(s.site_stats("x").is_none());
        assert_eq!(s.total_stats().upload, 0);
    }

    #[test]
    fn corrupt_snapshot_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(STATS_FILE), b"{not json").unwrap();
        let s = TrafficStore::open(dir.path());
        assert_eq!(s.total_stats().upload, 0);
    }
}
