//! Stream manifests and the resolver seam
//!
//! A [`StreamManifest`] says where an item's bytes live and how to decrypt
//! them. Manifests embed time-limited authorization, so resolvers never cache
//! them and the orchestrator re-resolves instead of retrying stale URLs.

mod http;
mod playback;

pub use http::HttpManifestResolver;
pub use playback::{decode_playback_info, select_variant};

use crate::decrypt::ContainerFormat;
use crate::error::Result;
use crate::types::{ItemDescriptor, QualitySelection};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One unit of network fetch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Position in the reassembled stream, starting at 0
    pub index: usize,
    /// Signed URL to fetch
    pub url: String,
    /// Inclusive byte range within `url`, if the segment is a slice of it
    pub range: Option<(u64, u64)>,
}

impl Segment {
    /// Segment covering a whole URL
    pub fn whole(index: usize, url: impl Into<String>) -> Self {
        Self {
            index,
            url: url.into(),
            range: None,
        }
    }

    /// Segment covering `start..=end` of a URL
    pub fn ranged(index: usize, url: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            index,
            url: url.into(),
            range: Some((start, end)),
        }
    }

    /// Length implied by the range, if any
    pub fn len_hint(&self) -> Option<u64> {
        self.range.map(|(start, end)| end - start + 1)
    }
}

/// Block cipher mode applied to the media bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherAlgorithm {
    /// AES-128 in counter mode; no padding
    Aes128Ctr,
    /// AES-128 in CBC mode with PKCS#7 padding on the final block
    Aes128Cbc,
}

/// How `key_material` must be interpreted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyEncoding {
    /// Base64 `iv(16) | ciphertext` wrapped with the configured master key
    SecurityToken,
    /// Raw `key(16) | nonce(8)` for CTR or `key(16) | iv(16)` for CBC
    Raw,
}

/// Cipher parameters carried by an encrypted manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherParams {
    /// Mode of the media cipher
    pub algorithm: CipherAlgorithm,
    /// Encoded key material, see [`KeyEncoding`]
    pub key_material: Vec<u8>,
    /// Encoding of `key_material`
    pub key_encoding: KeyEncoding,
}

/// Where to fetch an item and how to decrypt it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamManifest {
    /// Segments in stream order; indices are `0..segments.len()`
    pub segments: Vec<Segment>,
    /// Cipher parameters, `None` for clear streams
    pub cipher: Option<CipherParams>,
    /// Container of the decrypted bytes
    pub container: ContainerFormat,
    /// Codec string reported by the service (e.g. "flac", "mp4a.40.2")
    pub codec: String,
    /// Total plaintext size when known up front
    pub total_size: Option<u64>,
}

impl StreamManifest {
    /// Split a single URL of `total_size` bytes into `part_size` ranges
    pub fn split_ranges(url: &str, total_size: u64, part_size: u64) -> Vec<Segment> {
        let part_size = part_size.max(1);
        let mut segments = Vec::new();
        let mut start = 0;
        while start < total_size {
            let end = (start + part_size).min(total_size) - 1;
            segments.push(Segment::ranged(segments.len(), url, start, end));
            start = end + 1;
        }
        segments
    }
}

/// Turns an item plus a quality into a fresh manifest
///
/// Implementations are stateless request/response and must not cache.
#[async_trait]
pub trait ManifestResolver: Send + Sync {
    /// Resolve a Track or Video at `quality`
    ///
    /// Fails with `NotAvailable`, `Unauthorized` or `TransientService`.
    async fn resolve(
        &self,
        descriptor: &ItemDescriptor,
        quality: QualitySelection,
    ) -> Result<StreamManifest>;

    /// Expand a collection into its Track and Video descriptors
    ///
    /// Media descriptors expand to themselves.
    async fn expand(&self, descriptor: &ItemDescriptor) -> Result<Vec<ItemDescriptor>> {
        if descriptor.kind.is_media() {
            return Ok(vec![descriptor.clone()]);
        }
        Err(crate::error::Error::UnsupportedFormat(format!(
            "{descriptor} cannot be expanded by this resolver"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_ranges_covers_every_byte_once() {
        let segments = StreamManifest::split_ranges("u", 2500, 1000);
        let ranges: Vec<_> = segments.iter().map(|s| s.range).collect();
        assert_eq!(
            ranges,
            vec![Some((0, 999)), Some((1000, 1999)), Some((2000, 2499))]
        );
        let total: u64 = segments.iter().filter_map(Segment::len_hint).sum();
        assert_eq!(total, 2500);
        assert!(segments.iter().enumerate().all(|(i, s)| s.index == i));
    }

    #[test]
    fn split_ranges_exact_multiple_and_empty() {
        assert_eq!(StreamManifest::split_ranges("u", 2048, 1024).len(), 2);
        assert!(StreamManifest::split_ranges("u", 0, 1024).is_empty());
    }
}
