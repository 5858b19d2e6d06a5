use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Json(serde_json::Error),
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config io: {e}"),
            ConfigError::Json(e) => write!(f, "config json: {e}"),
            ConfigError::NoConfigDir => write!(f, "could not determine config directory"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Json(e)
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn default_http_port() -> u16 {
    8000
}

fn default_cdp_port() -> u16 {
    9222
}

fn default_fetcher_bin() -> String {
    "yt-dlp".into()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// Port for the control-channel / downloads HTTP server.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Chrome DevTools debugging port the session driver attaches to.
    #[serde(default = "default_cdp_port")]
    pub cdp_port: u16,
    /// Binary used to resolve metadata and materialize audio files.
    #[serde(default = "default_fetcher_bin")]
    pub fetcher_bin: String,
    /// Explicit browser binary path; autodetected when absent.
    #[serde(default)]
    pub browser_path: Option<String>,
    /// Where fetched audio files live; defaults to ./downloads.
    #[serde(default)]
    pub downloads_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            cdp_port: default_cdp_port(),
            fetcher_bin: default_fetcher_bin(),
            browser_path: None,
            downloads_dir: None,
        }
    }
}

impl Config {
    /// Load config from disk, or create a new one with defaults if the file
    /// does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::path()?;

        match std::fs::read_to_string(&path) {
            Ok(data) => {
                let config: Config = serde_json::from_str(&data)?;
                tracing::info!("loaded config from {}", path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Config::default();
                config.save()?;
                tracing::info!("created new config at {}", path.display());
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Save config atomically: write to temp file, then rename.
    /// Prevents corruption if the process dies mid-write.
    pub fn save(&self) -> Result<()> {
        let path = Self::path()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Get the config file path: `~/.config/meetjam.json`
    fn path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("meetjam.json"))
    }
}
