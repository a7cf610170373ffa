//! Revalidating on-disk cache of hourly archive files.
//!
//! Each cached hour is a `<stem>.json.gz` file plus a `<stem>.json.gz.meta`
//! sidecar holding validators and bookkeeping timestamps. Writes go through a
//! `.part` file and an atomic rename, so a crashed download never leaves a
//! truncated archive behind.
//!
//! Hours close to the wall clock may still be rewritten upstream, so those
//! are revalidated with a conditional GET before serving the local copy.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::Scope;
use crate::clock::Clock;
use crate::error::ArchiveError;
use crate::hour::HourKey;

use super::fetch::{FetchOutcome, HourFetcher, Validators};

/// Minimum spacing between retention sweeps.
const RETENTION_INTERVAL: Duration = Duration::from_secs(600);

/// Sidecar metadata persisted next to each cached hour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub size: u64,
    pub fetched_at: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
}

/// Size and age ceilings for the cache directory.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub max_bytes: u64,
}

/// Disk cache in front of an [`HourFetcher`].
pub struct ArchiveCache {
    dir: PathBuf,
    fetcher: Arc<dyn HourFetcher>,
    clock: Arc<dyn Clock>,
    refresh_recent: Duration,
    retention: RetentionPolicy,
    /// Monotonic millis of the last retention sweep; CAS-guarded so only one
    /// task runs a sweep per interval.
    last_retention_ms: AtomicU64,
}

impl ArchiveCache {
    pub fn new(
        dir: impl Into<PathBuf>,
        fetcher: Arc<dyn HourFetcher>,
        clock: Arc<dyn Clock>,
        refresh_recent: Duration,
        retention: RetentionPolicy,
    ) -> Result<Self, ArchiveError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            fetcher,
            clock,
            refresh_recent,
            retention,
            last_retention_ms: AtomicU64::new(0),
        })
    }

    fn archive_path(&self, hour: HourKey) -> PathBuf {
        self.dir.join(format!("{}.json.gz", hour.archive_stem()))
    }

    fn meta_path(&self, hour: HourKey) -> PathBuf {
        self.dir.join(format!("{}.json.gz.meta", hour.archive_stem()))
    }

    /// Opens the raw `.json.gz` stream for an hour, fetching or revalidating
    /// as needed. The returned file reads the complete, committed archive.
    pub async fn open_hour(&self, hour: HourKey, scope: &Scope) -> Result<File, ArchiveError> {
        if scope.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        self.maybe_run_retention();

        let path = self.archive_path(hour);
        if path.is_file() {
            if self.is_recent(hour) {
                self.revalidate(hour, scope).await?;
            }
            return Ok(File::open(&path)?);
        }

        match self.fetcher.fetch(hour, None, scope).await? {
            FetchOutcome::Fetched {
                bytes,
                etag,
                last_modified,
            } => {
                self.commit(hour, &bytes, etag, last_modified)?;
                Ok(File::open(&path)?)
            }
            // Unconditional requests have nothing to revalidate against; a
            // 304 here means the fetcher misbehaved.
            FetchOutcome::NotModified => Err(ArchiveError::Http(
                "unconditional fetch answered 304".to_string(),
            )),
        }
    }

    fn is_recent(&self, hour: HourKey) -> bool {
        let age = self.clock.now_utc() - hour.start();
        match age.to_std() {
            Ok(age) => age <= self.refresh_recent,
            // Hour starts in the future relative to our clock; treat as recent.
            Err(_) => true,
        }
    }

    /// Conditional GET for a cached recent hour. Failures degrade to the
    /// cached copy; only a 200 replaces it.
    async fn revalidate(&self, hour: HourKey, scope: &Scope) -> Result<(), ArchiveError> {
        let mut meta = match self.read_meta(hour) {
            Some(meta) => meta,
            None => {
                // Sidecar lost; nothing to validate with, keep the file.
                debug!(hour = %hour, "cache sidecar missing, skipping revalidation");
                return Ok(());
            }
        };
        let validators = Validators {
            etag: meta.etag.clone(),
            last_modified: meta.last_modified.clone(),
        };
        if validators.is_empty() {
            return Ok(());
        }

        match self.fetcher.fetch(hour, Some(&validators), scope).await {
            Ok(FetchOutcome::NotModified) => {
                meta.last_checked = self.clock.now_utc();
                self.write_meta(hour, &meta)?;
                debug!(hour = %hour, "archive revalidated, serving cached copy");
                Ok(())
            }
            Ok(FetchOutcome::Fetched {
                bytes,
                etag,
                last_modified,
            }) => {
                info!(hour = %hour, bytes = bytes.len(), "archive changed upstream, replacing cached copy");
                self.commit(hour, &bytes, etag, last_modified)?;
                Ok(())
            }
            Err(ArchiveError::Cancelled) => Err(ArchiveError::Cancelled),
            Err(err) => {
                warn!(hour = %hour, error = %err, "revalidation failed, serving cached copy");
                Ok(())
            }
        }
    }

    /// Writes archive bytes through a `.part` file and renames into place.
    fn commit(
        &self,
        hour: HourKey,
        bytes: &[u8],
        etag: Option<String>,
        last_modified: Option<String>,
    ) -> Result<(), ArchiveError> {
        let path = self.archive_path(hour);
        let part = self.dir.join(format!("{}.json.gz.part", hour.archive_stem()));
        {
            let mut file = File::create(&part)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&part, &path)?;

        let now = self.clock.now_utc();
        let meta = CacheMeta {
            etag,
            last_modified,
            size: bytes.len() as u64,
            fetched_at: now,
            last_checked: now,
        };
        self.write_meta(hour, &meta)
    }

    /// Reads the sidecar; a corrupt sidecar reads as absent.
    pub fn read_meta(&self, hour: HourKey) -> Option<CacheMeta> {
        let raw = fs::read_to_string(self.meta_path(hour)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn write_meta(&self, hour: HourKey, meta: &CacheMeta) -> Result<(), ArchiveError> {
        let path = self.meta_path(hour);
        let part = path.with_extension("meta.part");
        fs::write(&part, serde_json::to_string_pretty(meta)?)?;
        fs::rename(&part, &path)?;
        Ok(())
    }

    /// Runs a retention sweep if one has not run within the interval. The CAS
    /// guarantees a single winner when hours are processed concurrently.
    fn maybe_run_retention(&self) {
        let now_ms = self.clock.monotonic().as_millis() as u64;
        let prev = self.last_retention_ms.load(Ordering::Acquire);
        if prev != 0 && now_ms.saturating_sub(prev) < RETENTION_INTERVAL.as_millis() as u64 {
            return;
        }
        if self
            .last_retention_ms
            .compare_exchange(prev, now_ms.max(1), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Err(err) = self.run_retention() {
            warn!(error = %err, "cache retention sweep failed");
        }
    }

    /// Deletes hours past the age limit, then oldest-first until the
    /// directory fits under the byte ceiling.
    pub fn run_retention(&self) -> Result<(), ArchiveError> {
        let now = self.clock.now_utc();
        let mut entries = self.scan_entries()?;

        let mut removed = 0usize;
        entries.retain(|entry| {
            let age = (now - entry.fetched_at).to_std().unwrap_or(Duration::ZERO);
            if age > self.retention.max_age {
                if self.remove_entry(entry) {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });

        // Oldest hour first once the total exceeds the ceiling.
        entries.sort_by_key(|e| e.hour);
        let mut total: u64 = entries.iter().map(|e| e.size).sum();
        let mut cursor = entries.iter();
        while total > self.retention.max_bytes {
            let Some(entry) = cursor.next() else { break };
            if self.remove_entry(entry) {
                removed += 1;
            }
            total = total.saturating_sub(entry.size);
        }

        if removed > 0 {
            info!(removed, "cache retention removed files");
        }
        Ok(())
    }

    fn scan_entries(&self) -> Result<Vec<CacheEntry>, ArchiveError> {
        let mut entries = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json.gz")) else {
                continue;
            };
            let Some(hour) = parse_stem(stem) else {
                continue;
            };
            let size = dirent.metadata().map(|m| m.len()).unwrap_or(0);
            let fetched_at = self
                .read_meta(hour)
                .map(|m| m.fetched_at)
                .unwrap_or_else(|| hour.start());
            entries.push(CacheEntry {
                hour,
                size,
                fetched_at,
            });
        }
        Ok(entries)
    }

    fn remove_entry(&self, entry: &CacheEntry) -> bool {
        let removed = fs::remove_file(self.archive_path(entry.hour)).is_ok();
        let _ = fs::remove_file(self.meta_path(entry.hour));
        if removed {
            debug!(hour = %entry.hour, size = entry.size, "cache retention removed hour");
        }
        removed
    }
}

struct CacheEntry {
    hour: HourKey,
    size: u64,
    fetched_at: DateTime<Utc>,
}

/// Parses `YYYY-MM-DD-H` back into a key.
fn parse_stem(stem: &str) -> Option<HourKey> {
    let mut parts = stem.splitn(4, '-');
    let year = parts.next()?.parse().ok()?;
    let month = parts.next()?.parse().ok()?;
    let day = parts.next()?.parse().ok()?;
    let hour = parts.next()?.parse().ok()?;
    HourKey::new(year, month, day, hour)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use std::io::Read;
    use std::path::Path;
    use std::sync::Mutex;

    /// Scripted fetcher: pops the next outcome per call.
    struct ScriptedFetcher {
        script: Mutex<Vec<Result<FetchOutcome, ArchiveError>>>,
        conditional_calls: Mutex<Vec<bool>>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<FetchOutcome, ArchiveError>>) -> Self {
            Self {
                script: Mutex::new(script),
                conditional_calls: Mutex::new(Vec::new()),
            }
        }

        fn fetched(bytes: &[u8], etag: &str) -> Result<FetchOutcome, ArchiveError> {
            Ok(FetchOutcome::Fetched {
                bytes: bytes.to_vec(),
                etag: Some(etag.to_string()),
                last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
            })
        }
    }

    #[async_trait::async_trait]
    impl HourFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            hour: HourKey,
            validators: Option<&Validators>,
            _scope: &Scope,
        ) -> Result<FetchOutcome, ArchiveError> {
            self.conditional_calls
                .lock()
                .unwrap()
                .push(validators.is_some());
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| panic!("unexpected fetch for {}", hour))
        }
    }

    fn cache_with(
        dir: &Path,
        clock: Arc<dyn Clock>,
        fetcher: Arc<dyn HourFetcher>,
        refresh_recent: Duration,
    ) -> ArchiveCache {
        ArchiveCache::new(
            dir,
            fetcher,
            clock,
            refresh_recent,
            RetentionPolicy {
                max_age: Duration::from_secs(86400 * 365 * 100),
                max_bytes: u64::MAX,
            },
        )
        .unwrap()
    }

    fn read_all(mut file: File) -> Vec<u8> {
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).unwrap();
        buf
    }

    #[tokio::test]
    async fn first_fetch_commits_file_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let hour: HourKey = "2015-01-02T03".parse().unwrap();
        let clock = Arc::new(ManualClock::at("2015-06-01T00:00:00Z".parse().unwrap()));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![ScriptedFetcher::fetched(
            b"gzbytes", "\"v1\"",
        )]));
        let cache = cache_with(dir.path(), clock, fetcher.clone(), Duration::from_secs(3600));

        let file = cache.open_hour(hour, &Scope::root()).await.unwrap();
        assert_eq!(read_all(file), b"gzbytes");

        let meta = cache.read_meta(hour).unwrap();
        assert_eq!(meta.etag.as_deref(), Some("\"v1\""));
        assert_eq!(meta.size, 7);
        // Old hour, no revalidation: the single call was unconditional.
        assert_eq!(*fetcher.conditional_calls.lock().unwrap(), vec![false]);
        assert!(!dir.path().join("2015-01-02-3.json.gz.part").exists());
    }

    #[tokio::test]
    async fn recent_hour_revalidates_304_serves_cached_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let hour: HourKey = "2025-09-19T10".parse().unwrap();
        let clock = Arc::new(ManualClock::at("2025-09-19T12:00:00Z".parse().unwrap()));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Ok(FetchOutcome::NotModified),
            ScriptedFetcher::fetched(b"cached-hour", "\"v1\""),
        ]));
        let cache = cache_with(
            dir.path(),
            clock.clone(),
            fetcher.clone(),
            Duration::from_secs(48 * 3600),
        );

        let first = cache.open_hour(hour, &Scope::root()).await.unwrap();
        assert_eq!(read_all(first), b"cached-hour");
        let checked_before = cache.read_meta(hour).unwrap().last_checked;

        clock.advance(Duration::from_secs(1800));
        let second = cache.open_hour(hour, &Scope::root()).await.unwrap();
        assert_eq!(read_all(second), b"cached-hour");

        let meta = cache.read_meta(hour).unwrap();
        assert!(meta.last_checked > checked_before);
        assert_eq!(*fetcher.conditional_calls.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test]
    async fn revalidation_200_replaces_cached_copy() {
        let dir = tempfile::tempdir().unwrap();
        let hour: HourKey = "2025-09-19T10".parse().unwrap();
        let clock = Arc::new(ManualClock::at("2025-09-19T12:00:00Z".parse().unwrap()));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            ScriptedFetcher::fetched(b"rewritten", "\"v2\""),
            ScriptedFetcher::fetched(b"original", "\"v1\""),
        ]));
        let cache = cache_with(
            dir.path(),
            clock,
            fetcher,
            Duration::from_secs(48 * 3600),
        );

        let first = cache.open_hour(hour, &Scope::root()).await.unwrap();
        assert_eq!(read_all(first), b"original");
        let second = cache.open_hour(hour, &Scope::root()).await.unwrap();
        assert_eq!(read_all(second), b"rewritten");
        assert_eq!(cache.read_meta(hour).unwrap().etag.as_deref(), Some("\"v2\""));
    }

    #[tokio::test]
    async fn revalidation_failure_degrades_to_cached_copy() {
        let dir = tempfile::tempdir().unwrap();
        let hour: HourKey = "2025-09-19T10".parse().unwrap();
        let clock = Arc::new(ManualClock::at("2025-09-19T12:00:00Z".parse().unwrap()));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            Err(ArchiveError::Http("connection reset".to_string())),
            ScriptedFetcher::fetched(b"kept", "\"v1\""),
        ]));
        let cache = cache_with(
            dir.path(),
            clock,
            fetcher,
            Duration::from_secs(48 * 3600),
        );

        let first = cache.open_hour(hour, &Scope::root()).await.unwrap();
        assert_eq!(read_all(first), b"kept");
        let second = cache.open_hour(hour, &Scope::root()).await.unwrap();
        assert_eq!(read_all(second), b"kept");
    }

    #[tokio::test]
    async fn old_hour_served_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let hour: HourKey = "2015-01-02T03".parse().unwrap();
        let clock = Arc::new(ManualClock::at("2025-01-01T00:00:00Z".parse().unwrap()));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![ScriptedFetcher::fetched(
            b"old", "\"v1\"",
        )]));
        let cache = cache_with(dir.path(), clock, fetcher.clone(), Duration::from_secs(3600));

        cache.open_hour(hour, &Scope::root()).await.unwrap();
        // Second open: no fetch script entries remain, so any network call
        // would panic inside the stub.
        let file = cache.open_hour(hour, &Scope::root()).await.unwrap();
        assert_eq!(read_all(file), b"old");
        assert_eq!(fetcher.conditional_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retention_removes_by_age_then_oldest_first_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::at("2025-06-10T00:00:00Z".parse().unwrap()));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
        let cache = ArchiveCache::new(
            dir.path(),
            fetcher,
            clock.clone(),
            Duration::from_secs(0),
            RetentionPolicy {
                max_age: Duration::from_secs(86400 * 30),
                max_bytes: 25,
            },
        )
        .unwrap();

        // Hand-plant three cached hours with controlled sidecars.
        let plant = |hour: &str, bytes: &[u8], fetched_at: &str| {
            let hour: HourKey = hour.parse().unwrap();
            std::fs::write(cache.archive_path(hour), bytes).unwrap();
            let at: DateTime<Utc> = fetched_at.parse().unwrap();
            cache
                .write_meta(
                    hour,
                    &CacheMeta {
                        etag: None,
                        last_modified: None,
                        size: bytes.len() as u64,
                        fetched_at: at,
                        last_checked: at,
                    },
                )
                .unwrap();
        };
        // Ancient: removed by age regardless of size budget.
        plant("2025-01-01T00", &[0u8; 10], "2025-01-01T01:00:00Z");
        // Two fresh hours totalling 40 bytes against a 25-byte ceiling:
        // the older hour goes first.
        plant("2025-06-08T00", &[0u8; 20], "2025-06-08T01:00:00Z");
        plant("2025-06-09T00", &[0u8; 20], "2025-06-09T01:00:00Z");

        cache.run_retention().unwrap();

        let old: HourKey = "2025-01-01T00".parse().unwrap();
        let mid: HourKey = "2025-06-08T00".parse().unwrap();
        let new: HourKey = "2025-06-09T00".parse().unwrap();
        assert!(!cache.archive_path(old).exists(), "aged out");
        assert!(!cache.archive_path(mid).exists(), "oldest evicted for size");
        assert!(cache.archive_path(new).exists(), "newest survives");
        assert!(!cache.meta_path(mid).exists(), "sidecar removed with file");
    }

    #[tokio::test]
    async fn retention_sweep_is_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::at("2025-06-10T00:00:00Z".parse().unwrap()));
        let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
        let cache = cache_with(dir.path(), clock.clone(), fetcher, Duration::from_secs(0));

        cache.maybe_run_retention();
        let first = cache.last_retention_ms.load(Ordering::Acquire);
        assert!(first > 0);

        clock.advance(Duration::from_secs(60));
        cache.maybe_run_retention();
        assert_eq!(cache.last_retention_ms.load(Ordering::Acquire), first);

        clock.advance(Duration::from_secs(600));
        cache.maybe_run_retention();
        assert!(cache.last_retention_ms.load(Ordering::Acquire) > first);
    }

    #[test]
    fn stem_parse_round_trip() {
        let hour: HourKey = "2015-01-02T03".parse().unwrap();
        assert_eq!(parse_stem(&hour.archive_stem()), Some(hour));
        assert_eq!(parse_stem("not-a-stem"), None);
    }
}
