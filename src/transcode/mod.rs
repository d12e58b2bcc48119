//! Lossless container normalisation
//!
//! The only conversion is FLAC-in-MP4 to a native FLAC stream. Whether it runs
//! is decided by [`plan_transcode`]; how it runs is behind the [`Transcoder`]
//! trait so the orchestrator can be tested without ffmpeg.

mod ffmpeg;

pub use ffmpeg::FfmpegTranscoder;

use crate::config::{TranscodeConfig, TranscodeTarget};
use crate::decrypt::ContainerFormat;
use crate::error::{Error, Result};
use crate::types::QualitySelection;
use async_trait::async_trait;
use std::path::Path;

impl TranscodeTarget {
    /// Container produced by this target
    pub fn container(&self) -> ContainerFormat {
        match self {
            TranscodeTarget::Flac => ContainerFormat::Flac,
        }
    }
}

/// Converts a finished plaintext file into the target container
///
/// Failures are terminal for the item: the input is deterministic, so a retry
/// would fail the same way.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Convert `input` (in `source` format) into `output` (in `target` format)
    async fn transcode(
        &self,
        input: &Path,
        source: ContainerFormat,
        target: TranscodeTarget,
        output: &Path,
    ) -> Result<()>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Transcoder used when no ffmpeg binary is available
pub struct NoOpTranscoder;

#[async_trait]
impl Transcoder for NoOpTranscoder {
    async fn transcode(
        &self,
        _input: &Path,
        source: ContainerFormat,
        target: TranscodeTarget,
        _output: &Path,
    ) -> Result<()> {
        Err(Error::UnsupportedFormat(format!(
            "converting {source} to {} requires ffmpeg; set transcode.ffmpeg_path \
             or disable transcode.enabled",
            target.container()
        )))
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Decide whether an item needs the transcode stage
///
/// Returns the target when the quality is listed in `apply_to` and the
/// decrypted container differs from the target. Fails with
/// `UnsupportedFormat` when the stream's codec cannot be stream-copied into
/// the target losslessly.
pub fn plan_transcode(
    config: &TranscodeConfig,
    quality: QualitySelection,
    detected: ContainerFormat,
    codec: &str,
) -> Result<Option<TranscodeTarget>> {
    if !config.enabled {
        return Ok(None);
    }
    let Some(tier) = quality.audio() else {
        return Ok(None);
    };
    if !config.apply_to.contains(&tier) || detected == config.target.container() {
        return Ok(None);
    }

    let codec = codec.to_ascii_lowercase();
    if !codec.is_empty() && !codec.contains("flac") {
        return Err(Error::UnsupportedFormat(format!(
            "codec {codec} in {detected} cannot be copied into {}",
            config.target.container()
        )));
    }
    Ok(Some(config.target))
}
