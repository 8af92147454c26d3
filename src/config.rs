//! Configuration types for manuscript-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};

/// Download behavior configuration (concurrency, part sizing, image encoding)
///
/// Groups settings related to how pages are fetched and assembled.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Concurrent page downloads per part (default: 4)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Concurrent tile fetches within one page (default: 8)
    #[serde(default = "default_tile_concurrency")]
    pub tile_concurrency: usize,

    /// Global cap on simultaneous HTTP requests across all parts and tile
    /// fetches (default: 16)
    #[serde(default = "default_global_request_limit")]
    pub global_request_limit: usize,

    /// Estimated download size above which a job is split into parts
    /// (default: 300 MB)
    #[serde(default = "default_size_threshold")]
    pub size_threshold_bytes: u64,

    /// Fallback per-page size estimate when no per-source estimate is
    /// configured (default: 8 MB)
    #[serde(default = "default_bytes_per_page")]
    pub default_bytes_per_page: u64,

    /// JPEG quality for stitched tile pages, 1-100 (default: 85)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            tile_concurrency: default_tile_concurrency(),
            global_request_limit: default_global_request_limit(),
            size_threshold_bytes: default_size_threshold(),
            default_bytes_per_page: default_bytes_per_page(),
            jpeg_quality: default_jpeg_quality(),
            user_agent: default_user_agent(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial one (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Escalating timeout monitor and stall detection configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Window in which a transfer must produce its first byte, and the
    /// maximum silence tolerated between chunks (default: 30 seconds)
    #[serde(default = "default_initial_timeout", with = "duration_serde")]
    pub initial_timeout: Duration,

    /// Hard ceiling on one transfer, reached only while bytes keep arriving
    /// (default: 5 minutes)
    #[serde(default = "default_max_timeout", with = "duration_serde")]
    pub max_timeout: Duration,

    /// Quiet window after which a job with work remaining is flagged stalled
    /// (default: 2 minutes)
    #[serde(default = "default_stall_window", with = "duration_serde")]
    pub stall_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_timeout: default_initial_timeout(),
            max_timeout: default_max_timeout(),
            stall_window: default_stall_window(),
        }
    }
}

/// Download planner configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Fraction of the size threshold a part is allowed to fill, in (0, 1]
    /// (default: 1.0)
    ///
    /// At 1.0 the planner produces the canonical `ceil(total / threshold)`
    /// split; lower values under-fill parts, producing more and smaller ones.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            safety_margin: default_safety_margin(),
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path for the manifest cache (default: "./manuscript-dl.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Per-source tuning overrides, keyed by a host fragment in [`Config::sources`]
///
/// Any field left as None falls back to the global defaults. Archives differ
/// widely in how much parallelism they tolerate and how large their page
/// images are; these knobs replace hard-coded per-archive constants.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SourceTuning {
    /// Concurrent page downloads per part for this source
    #[serde(default)]
    pub concurrency: Option<usize>,

    /// Concurrent tile fetches within one page for this source
    #[serde(default)]
    pub tile_concurrency: Option<usize>,

    /// Estimated bytes per page for this source, used by the planner
    #[serde(default)]
    pub bytes_per_page: Option<u64>,

    /// Retry policy override
    #[serde(default)]
    pub retry: Option<RetryConfig>,

    /// Timeout monitor override
    #[serde(default)]
    pub monitor: Option<MonitorConfig>,
}

/// Main configuration for [`crate::ManuscriptDownloader`]
///
/// Fields are organized into logical sub-configs:
/// - [`download`](DownloadConfig) — concurrency, part sizing, image encoding
/// - [`retry`](RetryConfig) — backoff policy for transient failures
/// - [`monitor`](MonitorConfig) — escalating timeouts and stall detection
/// - [`planner`](PlannerConfig) — part sizing behavior
/// - [`persistence`](PersistenceConfig) — manifest cache storage
/// - `sources` — per-source overrides keyed by host fragment
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Download behavior settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Escalating timeout and stall detection settings
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Part sizing behavior
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Data storage and state management
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Per-source tuning, keyed by a fragment of the source host
    /// (e.g. "themorgan.org")
    #[serde(default)]
    pub sources: HashMap<String, SourceTuning>,
}

/// Effective per-source settings after merging [`SourceTuning`] over the
/// global defaults
#[derive(Clone, Debug)]
pub struct ResolvedTuning {
    /// Concurrent page downloads per part
    pub concurrency: usize,
    /// Concurrent tile fetches within one page
    pub tile_concurrency: usize,
    /// Estimated bytes per page for planning
    pub bytes_per_page: u64,
    /// JPEG quality for stitched pages
    pub jpeg_quality: u8,
    /// Retry policy
    pub retry: RetryConfig,
    /// Timeout monitor settings
    pub monitor: MonitorConfig,
}

impl Config {
    /// Validate the configuration, returning an error naming the offending key
    pub fn validate(&self) -> Result<()> {
        if self.download.concurrency == 0 {
            return Err(Error::Config {
                message: "concurrency must be at least 1".to_string(),
                key: Some("download.concurrency".to_string()),
            });
        }
        if self.download.tile_concurrency == 0 {
            return Err(Error::Config {
                message: "tile_concurrency must be at least 1".to_string(),
                key: Some("download.tile_concurrency".to_string()),
            });
        }
        if self.download.global_request_limit == 0 {
            return Err(Error::Config {
                message: "global_request_limit must be at least 1".to_string(),
                key: Some("download.global_request_limit".to_string()),
            });
        }
        if self.download.size_threshold_bytes == 0 {
            return Err(Error::Config {
                message: "size_threshold_bytes must be positive".to_string(),
                key: Some("download.size_threshold_bytes".to_string()),
            });
        }
        if self.download.default_bytes_per_page == 0 {
            return Err(Error::Config {
                message: "default_bytes_per_page must be positive".to_string(),
                key: Some("download.default_bytes_per_page".to_string()),
            });
        }
        if !(1..=100).contains(&self.download.jpeg_quality) {
            return Err(Error::Config {
                message: format!(
                    "jpeg_quality must be in 1..=100, got {}",
                    self.download.jpeg_quality
                ),
                key: Some("download.jpeg_quality".to_string()),
            });
        }
        if !(self.planner.safety_margin > 0.0 && self.planner.safety_margin <= 1.0) {
            return Err(Error::Config {
                message: format!(
                    "safety_margin must be in (0, 1], got {}",
                    self.planner.safety_margin
                ),
                key: Some("planner.safety_margin".to_string()),
            });
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config {
                message: "backoff_multiplier must be at least 1.0".to_string(),
                key: Some("retry.backoff_multiplier".to_string()),
            });
        }
        if self.monitor.max_timeout < self.monitor.initial_timeout {
            return Err(Error::Config {
                message: "max_timeout must be at least initial_timeout".to_string(),
                key: Some("monitor.max_timeout".to_string()),
            });
        }
        Ok(())
    }

    /// Resolve the effective tuning for a source URL.
    ///
    /// The first configured source key that appears in the URL's host wins;
    /// unset fields fall back to the global defaults.
    pub fn tuning_for(&self, source_url: &str) -> ResolvedTuning {
        let host = url::Url::parse(source_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();

        let tuning = self
            .sources
            .iter()
            .find(|(fragment, _)| !fragment.is_empty() && host.contains(fragment.as_str()))
            .map(|(_, tuning)| tuning.clone())
            .unwrap_or_default();

        ResolvedTuning {
            concurrency: tuning.concurrency.unwrap_or(self.download.concurrency),
            tile_concurrency: tuning
                .tile_concurrency
                .unwrap_or(self.download.tile_concurrency),
            bytes_per_page: tuning
                .bytes_per_page
                .unwrap_or(self.download.default_bytes_per_page),
            jpeg_quality: self.download.jpeg_quality,
            retry: tuning.retry.unwrap_or_else(|| self.retry.clone()),
            monitor: tuning.monitor.unwrap_or_else(|| self.monitor.clone()),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_tile_concurrency() -> usize {
    8
}

fn default_global_request_limit() -> usize {
    16
}

fn default_size_threshold() -> u64 {
    300 * 1024 * 1024
}

fn default_bytes_per_page() -> u64 {
    8 * 1024 * 1024
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_user_agent() -> String {
    format!("manuscript-dl/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_initial_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_stall_window() -> Duration {
    Duration::from_secs(120)
}

fn default_safety_margin() -> f64 {
    1.0
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./manuscript-dl.db")
}

// Duration serialization helper (seconds as u64)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
