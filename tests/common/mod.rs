//! In-memory collaborators for driving the public `Acquirer` API

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tidal_dl::config::RetryConfig;
use tidal_dl::config::TranscodeTarget;
use tidal_dl::decrypt::ContainerFormat;
use tidal_dl::fetch::SegmentSource;
use tidal_dl::manifest::{ManifestResolver, Segment, StreamManifest};
use tidal_dl::transcode::Transcoder;
use tidal_dl::{Config, Error, ItemDescriptor, QualitySelection, Result};

/// Serves a fixed manifest per item id
#[derive(Default)]
pub struct FakeResolver {
    manifests: Mutex<HashMap<String, StreamManifest>>,
    pub calls: AtomicUsize,
}

impl FakeResolver {
    pub fn insert(&self, id: &str, manifest: StreamManifest) {
        self.manifests
            .lock()
            .unwrap()
            .insert(id.to_string(), manifest);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestResolver for FakeResolver {
    async fn resolve(
        &self,
        descriptor: &ItemDescriptor,
        quality: QualitySelection,
    ) -> Result<StreamManifest> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let manifest = self.manifests.lock().unwrap().get(&descriptor.id).cloned();
        manifest.ok_or_else(|| Error::NotAvailable {
            item: descriptor.to_string(),
            quality: quality.to_string(),
        })
    }
}

/// Serves byte ranges of in-memory blobs with scripted misbehaviour
#[derive(Default)]
pub struct FakeSource {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    /// Segment index -> number of leading attempts that hang past any timeout
    slow_attempts: Mutex<HashMap<usize, u32>>,
    /// Segment indices that always fail transiently
    broken: Mutex<HashSet<usize>>,
    /// Segment indices that never answer
    hanging: Mutex<HashSet<usize>>,
    delay: Mutex<Duration>,
    pub calls: AtomicUsize,
}

impl FakeSource {
    pub fn put(&self, url: &str, bytes: Vec<u8>) {
        self.blobs.lock().unwrap().insert(url.to_string(), bytes);
    }

    pub fn slow_once(&self, segment: usize) {
        self.slow_attempts.lock().unwrap().insert(segment, 1);
    }

    pub fn break_segment(&self, segment: usize) {
        self.broken.lock().unwrap().insert(segment);
    }

    pub fn hang_segment(&self, segment: usize) {
        self.hanging.lock().unwrap().insert(segment);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SegmentSource for FakeSource {
    async fn fetch_segment(&self, segment: &Segment) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        let slow = {
            let mut slow = self.slow_attempts.lock().unwrap();
            match slow.get_mut(&segment.index) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        if slow {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.hanging.lock().unwrap().contains(&segment.index) {
            std::future::pending::<()>().await;
        }
        if self.broken.lock().unwrap().contains(&segment.index) {
            return Err(Error::TransientService(format!(
                "segment {} reset by peer",
                segment.index
            )));
        }

        let blob = self
            .blobs
            .lock()
            .unwrap()
            .get(&segment.url)
            .cloned()
            .ok_or_else(|| Error::InvalidManifest(format!("no blob at {}", segment.url)))?;
        let bytes = match segment.range {
            Some((start, end)) => blob[start as usize..=end as usize].to_vec(),
            None => blob,
        };
        Ok(Bytes::from(bytes))
    }
}

/// Rewrites any input as a FLAC stream with the same payload
#[derive(Default)]
pub struct FakeTranscoder {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(
        &self,
        input: &Path,
        _source: ContainerFormat,
        _target: TranscodeTarget,
        output: &Path,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let payload = tokio::fs::read(input).await?;
        let mut flac = b"fLaC\x00\x00\x00\x22".to_vec();
        flac.extend_from_slice(&payload[8.min(payload.len())..]);
        tokio::fs::write(output, flac).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// A FLAC-looking stream of `len` bytes
pub fn flac_stream(len: usize) -> Vec<u8> {
    let mut bytes = b"fLaC\x00\x00\x00\x22".to_vec();
    bytes.extend((0..len.saturating_sub(8)).map(|i| (i % 251) as u8));
    bytes.truncate(len);
    bytes
}

/// An MP4-looking stream of `len` bytes
pub fn mp4_stream(len: usize) -> Vec<u8> {
    let mut bytes = b"\x00\x00\x00\x20ftypiso6".to_vec();
    bytes.extend((0..len.saturating_sub(12)).map(|i| (i % 13) as u8));
    bytes.truncate(len);
    bytes
}

/// AES-128-CTR with counter block `nonce | 0u64`
pub fn ctr_encrypt(key: &[u8; 16], nonce: &[u8; 8], plain: &[u8]) -> Vec<u8> {
    use cipher::{KeyIvInit, StreamCipher};
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(nonce);
    let mut cipher = ctr::Ctr128BE::<aes::Aes128>::new_from_slices(key, &iv).unwrap();
    let mut buffer = plain.to_vec();
    cipher.apply_keystream(&mut buffer);
    buffer
}

/// Single-URL manifest split into `part_size` ranges, as the HTTP resolver builds it
pub fn ranged_manifest(
    url: &str,
    total: u64,
    part_size: u64,
    container: ContainerFormat,
) -> StreamManifest {
    StreamManifest {
        segments: StreamManifest::split_ranges(url, total, part_size),
        cipher: None,
        container,
        codec: "flac".to_string(),
        total_size: Some(total),
    }
}

pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.download.download_dir = dir.join("downloads");
    config.fetch.request_timeout = Duration::from_millis(250);
    config.retry.resolve = fast_retry(2);
    config.retry.segment = fast_retry(3);
    config
}
