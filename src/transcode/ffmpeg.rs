//! ffmpeg-backed transcoder

use super::Transcoder;
use crate::config::{TranscodeConfig, TranscodeTarget};
use crate::decrypt::{ContainerFormat, SNIFF_LEN};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Stream-copies FLAC audio out of an MP4 container with `ffmpeg`
///
/// No re-encoding happens (`-c:a copy`), so the conversion is lossless.
///
/// # Examples
///
/// ```no_run
/// use tidal_dl::transcode::FfmpegTranscoder;
///
/// let transcoder = FfmpegTranscoder::from_path().expect("ffmpeg not found in PATH");
/// ```
#[derive(Clone, Debug)]
pub struct FfmpegTranscoder {
    binary_path: PathBuf,
}

impl FfmpegTranscoder {
    /// Create a transcoder with an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Attempt to find ffmpeg in PATH
    pub fn from_path() -> Option<Self> {
        which::which("ffmpeg").ok().map(Self::new)
    }

    /// Use `ffmpeg_path` if configured, otherwise search PATH when allowed
    pub fn from_config(config: &TranscodeConfig) -> Option<Self> {
        match &config.ffmpeg_path {
            Some(path) => Some(Self::new(path.clone())),
            None if config.search_path => Self::from_path(),
            None => None,
        }
    }

    /// Path of the ffmpeg binary in use
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        source: ContainerFormat,
        target: TranscodeTarget,
        output: &Path,
    ) -> Result<()> {
        if source != ContainerFormat::Mp4 {
            return Err(Error::UnsupportedFormat(format!(
                "ffmpeg conversion from {source} to {} is not supported",
                target.container()
            )));
        }

        let format = match target {
            TranscodeTarget::Flac => "flac",
        };

        tracing::debug!(
            input = %input.display(),
            output = %output.display(),
            "running ffmpeg"
        );

        let result = Command::new(&self.binary_path)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(input)
            .args(["-vn", "-c:a", "copy", "-f", format])
            .arg(output)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::ExternalTool(format!("failed to execute ffmpeg: {e}")))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(Error::TranscodeFailure(format!(
                "ffmpeg exited with {}: {}",
                result.status,
                stderr.trim()
            )));
        }

        let mut header = Vec::with_capacity(SNIFF_LEN);
        let mut file = tokio::fs::File::open(output)
            .await
            .map_err(|e| Error::TranscodeFailure(format!("ffmpeg produced no output: {e}")))?;
        (&mut file)
            .take(SNIFF_LEN as u64)
            .read_to_end(&mut header)
            .await?;
        if !target.container().matches_header(&header) {
            return Err(Error::TranscodeFailure(format!(
                "ffmpeg output is not {}",
                target.container()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_path_agrees_with_which() {
        assert_eq!(
            which::which("ffmpeg").is_ok(),
            FfmpegTranscoder::from_path().is_some()
        );
    }

    #[test]
    fn explicit_path_wins_over_search() {
        let config = TranscodeConfig {
            ffmpeg_path: Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg")),
            search_path: false,
            ..TranscodeConfig::default()
        };
        let transcoder = FfmpegTranscoder::from_config(&config).unwrap();
        assert_eq!(transcoder.binary_path(), Path::new("/opt/ffmpeg/bin/ffmpeg"));

        let config = TranscodeConfig {
            ffmpeg_path: None,
            search_path: false,
            ..TranscodeConfig::default()
        };
        assert!(FfmpegTranscoder::from_config(&config).is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_external_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = FfmpegTranscoder::new(dir.path().join("no-such-ffmpeg"));
        let result = transcoder
            .transcode(
                &dir.path().join("in.m4a"),
                ContainerFormat::Mp4,
                TranscodeTarget::Flac,
                &dir.path().join("out.flac"),
            )
            .await;
        assert!(matches!(result, Err(Error::ExternalTool(_))), "{result:?}");
    }

    #[tokio::test]
    async fn non_mp4_source_is_unsupported() {
        let transcoder = FfmpegTranscoder::new(PathBuf::from("ffmpeg"));
        let result = transcoder
            .transcode(
                Path::new("in.ts"),
                ContainerFormat::MpegTs,
                TranscodeTarget::Flac,
                Path::new("out.flac"),
            )
            .await;
        assert!(matches!(result, Err(Error::UnsupportedFormat(_))));
    }

    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn checks_output_header() {
        let dir = tempfile::tempdir().unwrap();
        // The output path is the last argument
        let good = fake_ffmpeg(
            dir.path(),
            r#"for last; do :; done; printf 'fLaC\000\000\000\042' > "$last""#,
        );
        let output = dir.path().join("out.flac");
        FfmpegTranscoder::new(good)
            .transcode(
                &dir.path().join("in.m4a"),
                ContainerFormat::Mp4,
                TranscodeTarget::Flac,
                &output,
            )
            .await
            .unwrap();
        assert!(std::fs::read(&output).unwrap().starts_with(b"fLaC"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_transcode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let bad = fake_ffmpeg(dir.path(), "echo 'Invalid data found' >&2; exit 1");
        let result = FfmpegTranscoder::new(bad)
            .transcode(
                &dir.path().join("in.m4a"),
                ContainerFormat::Mp4,
                TranscodeTarget::Flac,
                &dir.path().join("out.flac"),
            )
            .await;
        match result {
            Err(Error::TranscodeFailure(msg)) => assert!(msg.contains("Invalid data")),
            other => panic!("expected TranscodeFailure, got {other:?}"),
        }
    }
}
