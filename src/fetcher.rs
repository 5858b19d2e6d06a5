use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

pub type Result<T> = std::result::Result<T, FetchError>;

/// Audio container extensions the fetcher may produce, in lookup order.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "opus", "webm", "ogg"];

/// Bound on the metadata probe; a dead source should not stall enqueue.
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on a full download.
const FETCH_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum FetchError {
    /// The fetcher binary could not be started.
    Spawn(io::Error),
    /// The source was unreachable or unsupported (non-zero exit).
    Source(String),
    /// The fetcher ran past its time bound.
    Timeout,
    /// The tool finished but produced unusable output.
    BadOutput(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Spawn(e) => write!(f, "fetch spawn: {e}"),
            FetchError::Source(msg) => write!(f, "fetch source: {msg}"),
            FetchError::Timeout => write!(f, "fetch timed out"),
            FetchError::BadOutput(msg) => write!(f, "fetch output: {msg}"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FetchError {
    fn from(e: io::Error) -> Self {
        FetchError::Spawn(e)
    }
}

// ---------------------------------------------------------------------------
// Collaborator contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMeta {
    pub title: String,
    pub duration_seconds: u64,
}

/// Media fetcher collaborator: resolves metadata without materializing a
/// file, and materializes a local playable file for a source locator.
///
/// `fetch` receives the extensionless output stem (directory + cache key);
/// the implementation appends a format-dependent extension and returns the
/// final path.
pub trait MediaFetcher: Send + Sync + 'static {
    fn metadata(&self, locator: &str) -> impl Future<Output = Result<TrackMeta>> + Send;
    fn fetch(&self, locator: &str, output_stem: &Path) -> impl Future<Output = Result<PathBuf>> + Send;
}

// ---------------------------------------------------------------------------
// yt-dlp implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct YtDlp {
    bin: String,
}

impl YtDlp {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

impl MediaFetcher for YtDlp {
    async fn metadata(&self, locator: &str) -> Result<TrackMeta> {
        let output = run_bounded(
            Command::new(&self.bin)
                .arg("--no-download")
                .args(["--print", "%(title)s"])
                .args(["--print", "%(duration)s"])
                .arg("--no-warnings")
                .arg("--no-playlist")
                .args(["--encoding", "utf-8"])
                .arg(locator),
            METADATA_TIMEOUT,
        )
        .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();
        let title = lines
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| FetchError::BadOutput("missing title line".into()))?
            .to_string();
        let duration_seconds = lines
            .next()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .map(|d| d as u64)
            .unwrap_or(0);

        Ok(TrackMeta {
            title,
            duration_seconds,
        })
    }

    async fn fetch(&self, locator: &str, output_stem: &Path) -> Result<PathBuf> {
        // The fetch may be a no-op if an earlier run already produced the file.
        if let Some(existing) = find_output(output_stem) {
            return Ok(existing);
        }

        let template = format!("{}.%(ext)s", output_stem.display());
        run_bounded(
            Command::new(&self.bin)
                .arg("-x")
                .args(["--audio-format", "mp3"])
                .args(["--audio-quality", "0"])
                .args(["-o", &template])
                .arg("--no-playlist")
                .arg("--no-warnings")
                .arg(locator),
            FETCH_TIMEOUT,
        )
        .await?;

        find_output(output_stem)
            .ok_or_else(|| FetchError::BadOutput("download finished but no file found".into()))
    }
}

/// Look for `<stem>.<ext>` across the known audio extensions.
pub fn find_output(stem: &Path) -> Option<PathBuf> {
    AUDIO_EXTENSIONS
        .iter()
        .map(|ext| stem.with_extension(ext))
        .find(|candidate| candidate.is_file())
}

async fn run_bounded(cmd: &mut Command, bound: Duration) -> Result<std::process::Output> {
    let child = cmd
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::time::timeout(bound, child.wait_with_output())
        .await
        .map_err(|_| FetchError::Timeout)??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FetchError::Source(stderr.trim().to_string()));
    }
    Ok(output)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_output_prefers_known_extensions() {
        let dir = std::env::temp_dir().join(format!("meetjam-fetch-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let stem = dir.join("abc123");

        assert!(find_output(&stem).is_none());

        std::fs::write(stem.with_extension("m4a"), b"x").unwrap();
        assert_eq!(find_output(&stem).unwrap(), stem.with_extension("m4a"));

        std::fs::write(stem.with_extension("mp3"), b"x").unwrap();
        assert_eq!(find_output(&stem).unwrap(), stem.with_extension("mp3"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
