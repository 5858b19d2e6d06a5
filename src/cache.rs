use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

use crate::fetcher::{self, FetchError, MediaFetcher, TrackMeta};

/// How long a caller waits on someone else's in-flight fetch before giving
/// up and attempting its own fetch as a fallback.
const DEFAULT_FETCH_WAIT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Download cache
// ---------------------------------------------------------------------------

/// Content-addressed store of fetched audio files, keyed by a hash of the
/// source locator.
///
/// Deduplication: a file already on disk is returned without any fetch; a
/// fetch already in flight for the same locator is joined (bounded wait)
/// instead of duplicated. The in-flight registry entry is created before the
/// first suspension point and removed by a drop guard, so a cancelled or
/// failed fetch can never wedge later callers.
///
/// Deletion policy is the caller's: reference counts are computed by
/// scanning the queue and current track, then `delete` is invoked for
/// unreferenced files. Nothing here survives a restart — the directory is
/// wiped at construction.
pub struct DownloadCache<F> {
    dir: PathBuf,
    fetcher: F,
    fetch_wait: Duration,
    inflight: Mutex<HashMap<String, watch::Sender<()>>>,
}

/// Stable cache key for a source locator: first 10 hex chars of its md5.
pub fn cache_key(locator: &str) -> String {
    let digest = md5::compute(locator.as_bytes());
    format!("{digest:x}")[..10].to_string()
}

impl<F: MediaFetcher> DownloadCache<F> {
    /// Create the cache, wiping any files left over from a previous run.
    pub fn new(dir: PathBuf, fetcher: F) -> io::Result<Self> {
        std::fs::create_dir_all(&dir)?;

        let mut removed = 0usize;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("[cache] cleared {removed} stale file(s) from {}", dir.display());
        }

        Ok(Self {
            dir,
            fetcher,
            fetch_wait: DEFAULT_FETCH_WAIT,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    #[cfg(test)]
    pub fn with_fetch_wait(mut self, wait: Duration) -> Self {
        self.fetch_wait = wait;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve metadata for a locator without materializing a file.
    pub async fn metadata(&self, locator: &str) -> fetcher::Result<TrackMeta> {
        self.fetcher.metadata(locator).await
    }

    /// Materialize the audio file for a locator, deduplicating against both
    /// the on-disk store and fetches already in flight.
    pub async fn fetch(&self, locator: &str) -> fetcher::Result<PathBuf> {
        let key = cache_key(locator);
        let stem = self.dir.join(&key);

        if let Some(path) = fetcher::find_output(&stem) {
            tracing::debug!("[cache] hit for {key}");
            return Ok(path);
        }

        // Join an in-flight fetch for the same locator instead of starting
        // a second one. On timeout, fall through and fetch directly.
        let waiter = self
            .inflight
            .lock()
            .unwrap()
            .get(&key)
            .map(|tx| tx.subscribe());
        if let Some(mut rx) = waiter {
            tracing::debug!("[cache] waiting on in-flight fetch for {key}");
            if tokio::time::timeout(self.fetch_wait, rx.changed())
                .await
                .is_err()
            {
                tracing::warn!(
                    "[cache] wait on in-flight fetch for {key} timed out after {}s, fetching directly",
                    self.fetch_wait.as_secs()
                );
            }
            if let Some(path) = fetcher::find_output(&stem) {
                return Ok(path);
            }
        }

        // Claim the fetch. The registry entry is inserted before the first
        // await and removed by the guard on every exit path.
        let guard = {
            let mut map = self.inflight.lock().unwrap();
            if map.contains_key(&key) {
                // Lost the claim after a wait timeout; fetch anyway without
                // registering so the winner's waiters are not disturbed.
                None
            } else {
                let (tx, _rx) = watch::channel(());
                map.insert(key.clone(), tx);
                Some(InflightGuard {
                    key: key.clone(),
                    registry: &self.inflight,
                })
            }
        };

        tracing::info!("[cache] fetching {locator} -> {key}");
        let result = self.fetcher.fetch(locator, &stem).await;
        drop(guard);

        match &result {
            Ok(path) => tracing::info!("[cache] ready: {}", path.display()),
            Err(e) => tracing::warn!("[cache] fetch for {key} failed: {e}"),
        }
        result
    }

    /// Delete a cached file. The caller has already established that no
    /// track references it.
    pub fn delete(&self, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::info!("[cache] deleted {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("[cache] could not delete {}: {e}", path.display()),
        }
    }

    #[cfg(test)]
    pub fn insert_stale_inflight(&self, locator: &str) {
        let (tx, _rx) = watch::channel(());
        self.inflight
            .lock()
            .unwrap()
            .insert(cache_key(locator), tx);
    }
}

/// Removes the in-flight registry entry and wakes all waiters, whether the
/// fetch succeeded, failed, or was cancelled.
struct InflightGuard<'a> {
    key: String,
    registry: &'a Mutex<HashMap<String, watch::Sender<()>>>,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if let Some(tx) = self.registry.lock().unwrap().remove(&self.key) {
            tx.send_replace(());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
