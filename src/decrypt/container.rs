//! Container detection and header sanity checks

use serde::{Deserialize, Serialize};

/// Media container of a decrypted stream
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    /// Native FLAC stream (`fLaC` magic)
    Flac,
    /// ISO base media file (`ftyp` box at offset 4)
    Mp4,
    /// MPEG transport stream (0x47 sync byte every 188 bytes)
    MpegTs,
    /// Anything else; no header check is applied
    #[default]
    Unknown,
}

/// Bytes needed before [`ContainerFormat::sniff`] can decide
pub const SNIFF_LEN: usize = 8;

const TS_PACKET: usize = 188;

impl ContainerFormat {
    /// Map a manifest mime type to a container
    pub fn from_mime(mime: &str) -> Self {
        match mime.split(';').next().unwrap_or_default().trim() {
            "audio/flac" | "audio/x-flac" => ContainerFormat::Flac,
            "audio/mp4" | "video/mp4" | "audio/m4a" => ContainerFormat::Mp4,
            "video/mp2t" | "video/MP2T" => ContainerFormat::MpegTs,
            _ => ContainerFormat::Unknown,
        }
    }

    /// Identify a container from its leading bytes
    pub fn sniff(header: &[u8]) -> ContainerFormat {
        if header.starts_with(b"fLaC") {
            ContainerFormat::Flac
        } else if header.len() >= 8 && &header[4..8] == b"ftyp" {
            ContainerFormat::Mp4
        } else if header.first() == Some(&0x47)
            && (header.len() <= TS_PACKET || header[TS_PACKET] == 0x47)
        {
            ContainerFormat::MpegTs
        } else {
            ContainerFormat::Unknown
        }
    }

    /// Whether `header` plausibly starts a stream of this container
    ///
    /// `Unknown` accepts anything.
    pub fn matches_header(&self, header: &[u8]) -> bool {
        match self {
            ContainerFormat::Unknown => true,
            expected => ContainerFormat::sniff(header) == *expected,
        }
    }

    /// File extension, including the dot
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Flac => ".flac",
            ContainerFormat::Mp4 => ".m4a",
            ContainerFormat::MpegTs => ".ts",
            ContainerFormat::Unknown => "",
        }
    }
}

impl std::fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContainerFormat::Flac => "flac",
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::MpegTs => "mpegts",
            ContainerFormat::Unknown => "unknown",
        };
        f.write_str(name)
    }
}
