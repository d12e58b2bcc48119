//! Core types for tidal-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::ErrorKind;

/// Kind of item addressed by an identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// A single audio track
    Track,
    /// A single music video
    Video,
    /// An album (expands to its tracks and videos)
    Album,
    /// A playlist (expands to its tracks and videos)
    Playlist,
    /// An artist (expands to the items of every album)
    Artist,
}

impl ItemKind {
    /// Whether this kind names a single downloadable stream
    pub fn is_media(&self) -> bool {
        matches!(self, ItemKind::Track | ItemKind::Video)
    }

    /// Path segment used by the service API and item URLs
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Track => "track",
            ItemKind::Video => "video",
            ItemKind::Album => "album",
            ItemKind::Playlist => "playlist",
            ItemKind::Artist => "artist",
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "track" | "tracks" => Ok(ItemKind::Track),
            "video" | "videos" => Ok(ItemKind::Video),
            "album" | "albums" => Ok(ItemKind::Album),
            "playlist" | "playlists" => Ok(ItemKind::Playlist),
            "artist" | "artists" => Ok(ItemKind::Artist),
            other => Err(crate::error::Error::InvalidIdentifier(format!(
                "unknown item kind '{other}'"
            ))),
        }
    }
}

/// Immutable reference to an item on the service
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemDescriptor {
    /// What the id refers to
    pub kind: ItemKind,
    /// Opaque service identifier (numeric for most kinds, UUID for playlists)
    pub id: String,
}

impl ItemDescriptor {
    /// Create a new descriptor
    pub fn new(kind: ItemKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for a track descriptor
    pub fn track(id: impl Into<String>) -> Self {
        Self::new(ItemKind::Track, id)
    }

    /// Shorthand for a video descriptor
    pub fn video(id: impl Into<String>) -> Self {
        Self::new(ItemKind::Video, id)
    }
}

impl std::fmt::Display for ItemDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Audio quality tiers, lowest first
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    /// 96 kbps AAC
    #[default]
    Normal,
    /// 320 kbps AAC
    High,
    /// 16-bit/44.1 kHz FLAC
    HiFi,
    /// MQA / hi-res
    Master,
    /// Hi-res lossless (FLAC, possibly in an MP4 container)
    Max,
}

impl AudioQuality {
    /// Value of the `audioquality` query parameter
    pub fn api_name(&self) -> &'static str {
        match self {
            AudioQuality::Normal => "LOW",
            AudioQuality::High => "HIGH",
            AudioQuality::HiFi => "LOSSLESS",
            AudioQuality::Master => "HI_RES",
            AudioQuality::Max => "HI_RES_LOSSLESS",
        }
    }

    /// The next lower tier, if any
    pub fn downgrade(&self) -> Option<Self> {
        match self {
            AudioQuality::Max => Some(AudioQuality::Master),
            AudioQuality::Master => Some(AudioQuality::HiFi),
            AudioQuality::HiFi => Some(AudioQuality::High),
            AudioQuality::High => Some(AudioQuality::Normal),
            AudioQuality::Normal => None,
        }
    }

    /// Whether the tier is delivered as a lossless stream
    pub fn is_lossless(&self) -> bool {
        matches!(
            self,
            AudioQuality::HiFi | AudioQuality::Master | AudioQuality::Max
        )
    }
}

/// Video resolutions, lowest first
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum VideoQuality {
    /// 240p
    #[serde(rename = "240")]
    P240,
    /// 360p
    #[default]
    #[serde(rename = "360")]
    P360,
    /// 480p
    #[serde(rename = "480")]
    P480,
    /// 720p
    #[serde(rename = "720")]
    P720,
    /// 1080p
    #[serde(rename = "1080")]
    P1080,
}

impl VideoQuality {
    /// Vertical resolution in pixels
    pub fn height(&self) -> u64 {
        match self {
            VideoQuality::P240 => 240,
            VideoQuality::P360 => 360,
            VideoQuality::P480 => 480,
            VideoQuality::P720 => 720,
            VideoQuality::P1080 => 1080,
        }
    }

    /// The next lower resolution, if any
    pub fn downgrade(&self) -> Option<Self> {
        match self {
            VideoQuality::P1080 => Some(VideoQuality::P720),
            VideoQuality::P720 => Some(VideoQuality::P480),
            VideoQuality::P480 => Some(VideoQuality::P360),
            VideoQuality::P360 => Some(VideoQuality::P240),
            VideoQuality::P240 => None,
        }
    }
}

/// Requested quality; exactly one axis applies per item kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "axis", content = "tier", rename_all = "lowercase")]
pub enum QualitySelection {
    /// Audio tier for tracks
    Audio(AudioQuality),
    /// Resolution for videos
    Video(VideoQuality),
}

impl QualitySelection {
    /// The next lower selection on the same axis
    pub fn downgrade(&self) -> Option<Self> {
        match self {
            QualitySelection::Audio(q) => q.downgrade().map(QualitySelection::Audio),
            QualitySelection::Video(q) => q.downgrade().map(QualitySelection::Video),
        }
    }

    /// Whether this selection is valid for the given item kind
    pub fn applies_to(&self, kind: ItemKind) -> bool {
        matches!(
            (self, kind),
            (QualitySelection::Audio(_), ItemKind::Track)
                | (QualitySelection::Video(_), ItemKind::Video)
        )
    }

    /// Audio tier, if this is an audio selection
    pub fn audio(&self) -> Option<AudioQuality> {
        match self {
            QualitySelection::Audio(q) => Some(*q),
            QualitySelection::Video(_) => None,
        }
    }
}

impl std::fmt::Display for QualitySelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualitySelection::Audio(q) => write!(f, "{}", q.api_name()),
            QualitySelection::Video(q) => write!(f, "{}p", q.height()),
        }
    }
}

/// Unique identifier for an acquisition task
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Get the inner value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a single acquisition task
///
/// `Pending -> Resolving -> Fetching -> Decrypting -> (Transcoding) -> Finalizing -> Completed`,
/// with `Skipped` reachable from `Pending` and `Failed` from any non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Submitted, waiting for a worker
    Pending,
    /// Negotiating a stream manifest
    Resolving,
    /// Fetching segments
    Fetching,
    /// Finishing decryption and verifying the container
    Decrypting,
    /// Normalising the lossless container
    Transcoding,
    /// Moving the output into place
    Finalizing,
    /// Output is at its destination
    Completed,
    /// Destination already existed
    Skipped,
    /// Gave up; see the task's error
    Failed,
}

impl LifecycleState {
    /// Whether no further transitions can happen
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Completed | LifecycleState::Skipped | LifecycleState::Failed
        )
    }

    /// Whether the task currently occupies a worker
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != LifecycleState::Pending
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Resolving => "resolving",
            LifecycleState::Fetching => "fetching",
            LifecycleState::Decrypting => "decrypting",
            LifecycleState::Transcoding => "transcoding",
            LifecycleState::Finalizing => "finalizing",
            LifecycleState::Completed => "completed",
            LifecycleState::Skipped => "skipped",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Event emitted during the acquisition lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Task accepted
    Submitted {
        /// Task ID
        id: TaskId,
        /// Requested item
        descriptor: ItemDescriptor,
    },

    /// Task moved to a new lifecycle state
    StateChanged {
        /// Task ID
        id: TaskId,
        /// Previous state
        from: LifecycleState,
        /// New state
        to: LifecycleState,
    },

    /// The requested quality was not available and a lower one is tried
    QualityDowngraded {
        /// Task ID
        id: TaskId,
        /// Quality that was not available
        from: QualitySelection,
        /// Quality tried next
        to: QualitySelection,
    },

    /// A fresh manifest is resolved after the previous one went stale
    ManifestRefreshed {
        /// Task ID
        id: TaskId,
        /// Why the previous manifest was abandoned
        reason: String,
    },

    /// Byte progress
    Progress {
        /// Task ID
        id: TaskId,
        /// Ciphertext bytes fetched so far
        bytes_fetched: u64,
        /// Expected total, when the manifest knows it
        #[serde(skip_serializing_if = "Option::is_none")]
        total_bytes: Option<u64>,
    },

    /// A segment fetch failed transiently and was retried
    SegmentRetried {
        /// Task ID
        id: TaskId,
        /// Segment index
        segment: usize,
        /// Retry number (1 = first retry)
        retry: u32,
    },

    /// Output placed at its destination
    Completed {
        /// Task ID
        id: TaskId,
        /// Final path
        path: PathBuf,
        /// Final size in bytes
        bytes: u64,
    },

    /// Destination already existed
    Skipped {
        /// Task ID
        id: TaskId,
        /// Existing path
        path: PathBuf,
    },

    /// Task failed
    Failed {
        /// Task ID
        id: TaskId,
        /// State in which the failure occurred
        stage: LifecycleState,
        /// Error classification
        kind: ErrorKind,
        /// Error message
        error: String,
    },

    /// Tagging collaborator failed after completion (the file is kept)
    TaggingFailed {
        /// Task ID
        id: TaskId,
        /// Error message
        error: String,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

/// Point-in-time view of a task
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Task ID
    pub id: TaskId,
    /// Requested item
    pub descriptor: ItemDescriptor,
    /// Quality as submitted
    pub requested_quality: QualitySelection,
    /// Quality currently being acquired (differs after a downgrade)
    pub quality: QualitySelection,
    /// Current lifecycle state
    pub state: LifecycleState,
    /// Number of manifests resolved so far
    pub manifests_resolved: u32,
    /// Ciphertext bytes fetched for the current manifest
    pub bytes_fetched: u64,
    /// Expected total for the current manifest
    pub total_bytes: Option<u64>,
    /// Segments fetched for the current manifest
    pub segments_done: usize,
    /// Segment count of the current manifest
    pub segments_total: usize,
    /// Retries per segment index for the current manifest
    pub segment_retries: BTreeMap<usize, u32>,
    /// Destination path, once known
    pub destination: Option<PathBuf>,
    /// When the task was submitted
    pub submitted_at: DateTime<Utc>,
    /// When the task reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

/// Terminal outcome of a task
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Output is at `path`
    Completed {
        /// Final path
        path: PathBuf,
        /// Final size in bytes
        bytes: u64,
    },
    /// Destination already existed
    Skipped {
        /// Existing path
        path: PathBuf,
    },
    /// Gave up
    Failed {
        /// State in which the failure occurred
        stage: LifecycleState,
        /// Error classification
        kind: ErrorKind,
        /// Error message
        message: String,
    },
}

/// Per-item record reported at batch end
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task ID
    pub id: TaskId,
    /// Requested item
    pub descriptor: ItemDescriptor,
    /// Quality actually acquired (or last attempted)
    pub quality: QualitySelection,
    /// What happened
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

/// Summary of a batch of tasks
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Number of completed items
    pub completed: usize,
    /// Number of skipped items
    pub skipped: usize,
    /// Number of failed items
    pub failed: usize,
    /// Per-item records in submission order
    pub results: Vec<TaskResult>,
}

impl BatchSummary {
    /// Build a summary from terminal task results
    pub fn from_results(results: Vec<TaskResult>) -> Self {
        let mut summary = Self::default();
        for result in &results {
            match result.outcome {
                TaskOutcome::Completed { .. } => summary.completed += 1,
                TaskOutcome::Skipped { .. } => summary.skipped += 1,
                TaskOutcome::Failed { .. } => summary.failed += 1,
            }
        }
        summary.results = results;
        summary
    }

    /// Render the summary as pretty JSON for JSON mode
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_downgrade_walks_down_to_normal() {
        let mut q = AudioQuality::Max;
        let mut seen = vec![q];
        while let Some(next) = q.downgrade() {
            seen.push(next);
            q = next;
        }
        assert_eq!(
            seen,
            vec![
                AudioQuality::Max,
                AudioQuality::Master,
                AudioQuality::HiFi,
                AudioQuality::High,
                AudioQuality::Normal
            ]
        );
    }

    #[test]
    fn quality_axis_matches_item_kind() {
        let audio = QualitySelection::Audio(AudioQuality::HiFi);
        let video = QualitySelection::Video(VideoQuality::P720);
        assert!(audio.applies_to(ItemKind::Track));
        assert!(!audio.applies_to(ItemKind::Video));
        assert!(video.applies_to(ItemKind::Video));
        assert!(!video.applies_to(ItemKind::Album));
    }

    #[test]
    fn lifecycle_active_excludes_pending_and_terminal() {
        assert!(!LifecycleState::Pending.is_active());
        assert!(LifecycleState::Fetching.is_active());
        assert!(LifecycleState::Transcoding.is_active());
        assert!(!LifecycleState::Skipped.is_active());
        assert!(LifecycleState::Failed.is_terminal());
    }

    #[test]
    fn item_kind_parses_plural_forms() {
        assert_eq!("albums".parse::<ItemKind>().unwrap(), ItemKind::Album);
        assert_eq!("Track".parse::<ItemKind>().unwrap(), ItemKind::Track);
        assert!("podcast".parse::<ItemKind>().is_err());
    }

    #[test]
    fn summary_counts_outcomes_and_serializes_error_kind() {
        let results = vec![
            TaskResult {
                id: TaskId(1),
                descriptor: ItemDescriptor::track("1"),
                quality: QualitySelection::Audio(AudioQuality::HiFi),
                outcome: TaskOutcome::Completed {
                    path: PathBuf::from("/music/1.flac"),
                    bytes: 2500,
                },
            },
            TaskResult {
                id: TaskId(2),
                descriptor: ItemDescriptor::track("2"),
                quality: QualitySelection::Audio(AudioQuality::HiFi),
                outcome: TaskOutcome::Failed {
                    stage: LifecycleState::Resolving,
                    kind: ErrorKind::Unauthorized,
                    message: "unauthorized: token expired".into(),
                },
            },
        ];

        let summary = BatchSummary::from_results(results);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);

        let json: serde_json::Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();
        assert_eq!(json["results"][1]["outcome"], "failed");
        assert_eq!(json["results"][1]["kind"], "unauthorized");
        assert_eq!(json["results"][1]["stage"], "resolving");
        assert_eq!(json["results"][0]["bytes"], 2500);
    }
}
