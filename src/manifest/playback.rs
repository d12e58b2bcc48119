//! Decoding of playback-info responses
//!
//! The service wraps the real manifest as base64 inside a JSON envelope. Audio
//! uses the BTS form (direct URLs plus optional key material); video uses the
//! EMU form, which points at an HLS master playlist.

use super::{CipherAlgorithm, CipherParams, KeyEncoding};
use crate::decrypt::ContainerFormat;
use crate::error::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use m3u8_rs::{MasterPlaylist, VariantStream};
use serde::Deserialize;

const MIME_BTS: &str = "application/vnd.tidal.bts";
const MIME_EMU: &str = "application/vnd.tidal.emu";
const MIME_DASH: &str = "application/dash+xml";

/// Envelope returned by `playbackinfopostpaywall`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PlaybackInfo {
    pub manifest_mime_type: String,
    pub manifest: String,
    #[serde(default)]
    pub audio_quality: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BtsManifest {
    mime_type: String,
    #[serde(default)]
    codecs: String,
    #[serde(default)]
    encryption_type: Option<String>,
    #[serde(default)]
    key_id: Option<String>,
    urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmuManifest {
    urls: Vec<String>,
}

/// What a playback-info envelope decodes to
#[derive(Debug, PartialEq, Eq)]
pub enum PlaybackManifest {
    /// One or more direct media URLs
    Direct {
        /// Media URLs in order; a single URL is split into ranges later
        urls: Vec<String>,
        /// Container derived from the manifest mime type
        container: ContainerFormat,
        /// Codec string
        codec: String,
        /// Cipher parameters for encrypted streams
        cipher: Option<CipherParams>,
    },
    /// An HLS master playlist (videos)
    Hls {
        /// URL of the master playlist
        master_url: String,
    },
}

/// Decode a playback-info JSON body
pub fn decode_playback_info(body: &[u8]) -> Result<PlaybackManifest> {
    let info: PlaybackInfo = serde_json::from_slice(body)
        .map_err(|e| Error::InvalidManifest(format!("playback info: {e}")))?;
    decode_envelope(&info)
}

pub(crate) fn decode_envelope(info: &PlaybackInfo) -> Result<PlaybackManifest> {
    tracing::debug!(
        mime_type = %info.manifest_mime_type,
        audio_quality = info.audio_quality.as_deref().unwrap_or("unknown"),
        "decoding playback manifest"
    );
    let raw = STANDARD
        .decode(info.manifest.trim())
        .map_err(|e| Error::InvalidManifest(format!("manifest is not base64: {e}")))?;

    match info.manifest_mime_type.as_str() {
        MIME_BTS => {
            let bts: BtsManifest = serde_json::from_slice(&raw)
                .map_err(|e| Error::InvalidManifest(format!("bts manifest: {e}")))?;
            if bts.urls.is_empty() {
                return Err(Error::InvalidManifest("bts manifest has no urls".into()));
            }
            let cipher = match bts.encryption_type.as_deref() {
                None | Some("NONE") => None,
                Some("OLD_AES") => {
                    let key_id = bts.key_id.ok_or_else(|| {
                        Error::InvalidManifest("OLD_AES manifest without keyId".into())
                    })?;
                    Some(CipherParams {
                        algorithm: CipherAlgorithm::Aes128Ctr,
                        key_material: key_id.into_bytes(),
                        key_encoding: KeyEncoding::SecurityToken,
                    })
                }
                Some(other) => {
                    return Err(Error::UnsupportedFormat(format!(
                        "encryption type {other}"
                    )));
                }
            };
            Ok(PlaybackManifest::Direct {
                container: ContainerFormat::from_mime(&bts.mime_type),
                codec: bts.codecs,
                urls: bts.urls,
                cipher,
            })
        }
        MIME_EMU => {
            let emu: EmuManifest = serde_json::from_slice(&raw)
                .map_err(|e| Error::InvalidManifest(format!("emu manifest: {e}")))?;
            let master_url = emu
                .urls
                .into_iter()
                .next()
                .ok_or_else(|| Error::InvalidManifest("emu manifest has no urls".into()))?;
            Ok(PlaybackManifest::Hls { master_url })
        }
        MIME_DASH => Err(Error::UnsupportedFormat(
            "DASH manifests are not supported".into(),
        )),
        other => Err(Error::InvalidManifest(format!(
            "unknown manifest mime type {other}"
        ))),
    }
}

/// Pick the best variant not taller than `max_height`
///
/// Falls back to the lowest variant when every variant is taller. Variants
/// without a resolution attribute only win when nothing else is listed.
pub fn select_variant(master: &MasterPlaylist, max_height: u64) -> Option<&VariantStream> {
    let height = |v: &VariantStream| v.resolution.map(|r| r.height);

    let fitting = master
        .variants
        .iter()
        .filter(|v| height(v).is_some_and(|h| h <= max_height))
        .max_by_key(|v| (height(v), v.bandwidth));
    if fitting.is_some() {
        return fitting;
    }

    master
        .variants
        .iter()
        .filter(|v| height(v).is_some())
        .min_by_key(|v| (height(v), v.bandwidth))
        .or_else(|| master.variants.first())
}
