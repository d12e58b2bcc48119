//! Configuration types for tidal-dl
//!
//! Configuration is plain data supplied by the embedding application. Loading
//! it from disk is the caller's concern; every field has a default so an empty
//! JSON object deserializes to a working [`Config`].

use crate::error::{Error, Result};
use crate::types::{AudioQuality, ItemKind, QualitySelection, VideoQuality};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Main configuration for [`Acquirer`](crate::Acquirer)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Destination and worker-pool settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Default quality tiers and downgrade policy
    #[serde(default)]
    pub quality: QualityConfig,

    /// Segment fetching and network limits
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Retry policies for manifest resolution and segment fetches
    #[serde(default)]
    pub retry: RetryPolicies,

    /// Lossless container normalisation
    #[serde(default)]
    pub transcode: TranscodeConfig,

    /// Service endpoint and credentials
    #[serde(default)]
    pub api: ApiConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Default quality for an item kind, `None` for collection kinds
    pub fn default_quality(&self, kind: ItemKind) -> Option<QualitySelection> {
        match kind {
            ItemKind::Track => Some(QualitySelection::Audio(self.quality.audio)),
            ItemKind::Video => Some(QualitySelection::Video(self.quality.video)),
            ItemKind::Album | ItemKind::Playlist | ItemKind::Artist => None,
        }
    }

    /// Reject settings that would stall or break the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_items == 0 {
            return Err(config_error(
                "max_concurrent_items must be at least 1",
                "download.max_concurrent_items",
            ));
        }
        if self.fetch.segment_concurrency == 0 {
            return Err(config_error(
                "segment_concurrency must be at least 1",
                "fetch.segment_concurrency",
            ));
        }
        if self.fetch.max_in_flight_requests == 0 {
            return Err(config_error(
                "max_in_flight_requests must be at least 1",
                "fetch.max_in_flight_requests",
            ));
        }
        if self.fetch.part_size == 0 {
            return Err(config_error(
                "part_size must be greater than zero",
                "fetch.part_size",
            ));
        }
        if self.fetch.max_manifest_attempts == 0 {
            return Err(config_error(
                "max_manifest_attempts must be at least 1",
                "fetch.max_manifest_attempts",
            ));
        }
        if self.transcode.max_concurrent == 0 {
            return Err(config_error(
                "max_concurrent must be at least 1",
                "transcode.max_concurrent",
            ));
        }
        if self.api.base_url.trim().is_empty() {
            return Err(config_error("base_url must not be empty", "api.base_url"));
        }
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

/// Destination and worker-pool settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Download directory (default: "./download")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Maximum items processed concurrently (default: 3)
    #[serde(default = "default_max_concurrent_items")]
    pub max_concurrent_items: usize,

    /// Skip items whose destination already exists (default: true)
    #[serde(default = "default_true")]
    pub skip_existing: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_items: default_max_concurrent_items(),
            skip_existing: true,
        }
    }
}

/// What to do when the requested quality is not available
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DowngradePolicy {
    /// Retry once at the next lower tier (default)
    #[default]
    Automatic,
    /// Fail the item with `NotAvailable`
    Disabled,
}

/// Default quality tiers and downgrade policy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Audio tier for tracks (default: normal)
    #[serde(default)]
    pub audio: AudioQuality,

    /// Resolution for videos (default: 360p)
    #[serde(default)]
    pub video: VideoQuality,

    /// Downgrade behaviour on `NotAvailable`
    #[serde(default)]
    pub downgrade: DowngradePolicy,
}

/// Segment fetching and network limits
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Concurrent range requests per item (default: 4)
    #[serde(default = "default_segment_concurrency")]
    pub segment_concurrency: usize,

    /// Cap on in-flight network requests across all items (default: 16)
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests: usize,

    /// Timeout applied to every network call (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Byte range size used when splitting a single-URL stream (default: 1 MiB)
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Speed limit in bytes per second (None = unlimited)
    #[serde(default)]
    pub speed_limit_bps: Option<u64>,

    /// Manifests resolved per item before giving up on stale ones (default: 3)
    #[serde(default = "default_max_manifest_attempts")]
    pub max_manifest_attempts: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            segment_concurrency: default_segment_concurrency(),
            max_in_flight_requests: default_max_in_flight(),
            request_timeout: default_request_timeout(),
            part_size: default_part_size(),
            speed_limit_bps: None,
            max_manifest_attempts: default_max_manifest_attempts(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry (default: 500 ms)
    #[serde(default = "default_initial_delay", with = "duration_ms_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
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
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Retry policies at the two granularities the pipeline retries at
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetryPolicies {
    /// Manifest-level retries for transient resolve failures
    #[serde(default)]
    pub resolve: RetryConfig,

    /// Segment-level retries inside the chunk fetcher
    #[serde(default)]
    pub segment: RetryConfig,
}

/// Target container of the transcode stage
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeTarget {
    /// Native FLAC stream
    #[default]
    Flac,
}

/// Lossless container normalisation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// Convert FLAC-in-MP4 to native FLAC (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Target container (default: flac)
    #[serde(default)]
    pub target: TranscodeTarget,

    /// Audio tiers the conversion applies to (default: [max])
    #[serde(default = "default_transcode_qualities")]
    pub apply_to: Vec<AudioQuality>,

    /// Path to ffmpeg executable (auto-detected if None)
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Search PATH for ffmpeg if no explicit path is set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,

    /// Concurrent transcodes, separate from the item pool (default: 2)
    #[serde(default = "default_max_concurrent_transcodes")]
    pub max_concurrent: usize,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: TranscodeTarget::default(),
            apply_to: default_transcode_qualities(),
            ffmpeg_path: None,
            search_path: true,
            max_concurrent: default_max_concurrent_transcodes(),
        }
    }
}

/// Service endpoint and credentials
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API base URL, with trailing slash
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// OAuth access token of an already-authorized session
    #[serde(default)]
    pub access_token: Option<String>,

    /// Country code sent with every request (default: "US")
    #[serde(default = "default_country_code")]
    pub country_code: String,

    /// Base64 key that unwraps per-item security tokens
    #[serde(default)]
    pub master_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            access_token: None,
            country_code: default_country_code(),
            master_key: None,
        }
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines (default)
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Log output
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter directive, overridden by `RUST_LOG` (default: "tidal_dl=info")
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./download")
}

fn default_max_concurrent_items() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_segment_concurrency() -> usize {
    4
}

fn default_max_in_flight() -> usize {
    16
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_part_size() -> u64 {
    1024 * 1024
}

fn default_max_manifest_attempts() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_transcode_qualities() -> Vec<AudioQuality> {
    vec![AudioQuality::Max]
}

fn default_max_concurrent_transcodes() -> usize {
    2
}

fn default_base_url() -> String {
    "https://api.tidalhifi.com/v1/".to_string()
}

fn default_country_code() -> String {
    "US".to_string()
}

fn default_log_filter() -> String {
    "tidal_dl=info".to_string()
}

// Duration serialization helper
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

// Millisecond Duration serialization helper (retry delays are sub-second)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
