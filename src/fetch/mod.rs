//! Chunk fetching
//!
//! [`ChunkFetcher`] retrieves a manifest's segments with bounded concurrency
//! and yields them strictly in index order. Each segment retries on its own;
//! a segment that runs out of retries fails the item with
//! [`Error::FetchExhausted`].

mod http;

pub use http::HttpSegmentSource;

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::manifest::Segment;
use crate::retry::with_retry;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Where segment bytes come from
#[async_trait]
pub trait SegmentSource: Send + Sync {
    /// Fetch one segment's raw bytes; a single attempt, no retries
    async fn fetch_segment(&self, segment: &Segment) -> Result<Bytes>;
}

/// One fetched segment, ready for the decryptor
///
/// A chunk only exists for a segment that was fetched in full; a segment
/// that runs out of retries ends the stream with [`Error::FetchExhausted`]
/// instead. `retries` is the fetch status of a delivered chunk: zero for a
/// first-attempt fetch, otherwise the number of failed attempts before it.
#[derive(Clone, Debug)]
pub struct FetchedChunk {
    /// Segment index
    pub index: usize,
    /// Raw ciphertext
    pub bytes: Bytes,
    /// Failed attempts before the fetch succeeded
    pub retries: u32,
}

/// Fetches segments concurrently and reassembles them in order
#[derive(Clone)]
pub struct ChunkFetcher {
    source: Arc<dyn SegmentSource>,
    retry: RetryConfig,
    concurrency: usize,
    request_timeout: Duration,
}

impl ChunkFetcher {
    /// Create a fetcher running up to `concurrency` segment fetches at once
    pub fn new(
        source: Arc<dyn SegmentSource>,
        retry: RetryConfig,
        concurrency: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            source,
            retry,
            concurrency: concurrency.max(1),
            request_timeout,
        }
    }

    /// Stream the segments' bytes in index order
    ///
    /// Fetches run ahead of the consumer by at most `concurrency` segments.
    /// The stream ends after the first error; dropping it aborts in-flight
    /// fetches. `on_retry(segment, retry)` is called for every retry.
    pub fn fetch_ordered<'a, R>(
        &'a self,
        segments: &'a [Segment],
        cancel: &'a CancellationToken,
        on_retry: &'a R,
    ) -> impl Stream<Item = Result<FetchedChunk>> + Send + 'a
    where
        R: Fn(usize, u32) + Sync,
    {
        stream::iter(segments)
            .map(move |segment| self.fetch_one(segment, cancel, on_retry))
            .buffered(self.concurrency)
    }

    /// Fetch every segment and concatenate them
    pub async fn fetch_all(
        &self,
        segments: &[Segment],
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let chunks = self.fetch_ordered(segments, cancel, &|_: usize, _: u32| {});
        futures::pin_mut!(chunks);
        while let Some(chunk) = chunks.next().await {
            out.extend_from_slice(&chunk?.bytes);
        }
        Ok(out)
    }

    async fn fetch_one<R>(
        &self,
        segment: &Segment,
        cancel: &CancellationToken,
        on_retry: &R,
    ) -> Result<FetchedChunk>
    where
        R: Fn(usize, u32) + Sync,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let retries = AtomicU32::new(0);
        let attempt = with_retry(
            &self.retry,
            || async {
                match tokio::time::timeout(self.request_timeout, self.source.fetch_segment(segment))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::TransientService(format!(
                        "segment {} timed out after {:?}",
                        segment.index, self.request_timeout
                    ))),
                }
            },
            |retry, e| {
                retries.store(retry, Ordering::Relaxed);
                tracing::debug!(segment = segment.index, retry, error = %e, "retrying segment");
                on_retry(segment.index, retry);
            },
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = attempt => outcome,
        };

        match outcome {
            Ok(bytes) => Ok(FetchedChunk {
                index: segment.index,
                bytes,
                retries: retries.load(Ordering::Relaxed),
            }),
            Err(exhausted) => Err(Error::FetchExhausted {
                segment: segment.index,
                attempts: exhausted.attempts,
                reason: exhausted.error.to_string(),
            }),
        }
    }
}
