//! HTTP segment source

use super::SegmentSource;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::limiter::NetworkLimiter;
use crate::manifest::Segment;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::StatusCode;
use reqwest::header::RANGE;

/// Fetches segments from the CDN, honouring the shared [`NetworkLimiter`]
#[derive(Clone, Debug)]
pub struct HttpSegmentSource {
    client: reqwest::Client,
    limiter: NetworkLimiter,
}

impl HttpSegmentSource {
    /// Create a source whose requests count against `limiter`
    pub fn new(config: &Config, limiter: NetworkLimiter) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch.request_timeout)
            .user_agent(concat!("tidal-dl/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config {
                message: format!("failed to create HTTP client: {e}"),
                key: None,
            })?;
        Ok(Self { client, limiter })
    }
}

#[async_trait]
impl SegmentSource for HttpSegmentSource {
    async fn fetch_segment(&self, segment: &Segment) -> Result<Bytes> {
        let _permit = self.limiter.request_permit().await?;

        let mut request = self.client.get(&segment.url);
        if let Some((start, end)) = segment.range {
            request = request.header(RANGE, format!("bytes={start}-{end}"));
        }

        let mut response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                Error::TransientService(e.to_string())
            } else {
                Error::Network(e)
            }
        })?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::TransientService(format!(
                "segment {}: {status}",
                segment.index
            )));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            // Signed segment URLs answer 403 once they expire
            return Err(Error::Unauthorized(format!(
                "segment {}: {status}",
                segment.index
            )));
        }
        if !status.is_success() {
            return Err(Error::InvalidManifest(format!(
                "segment {}: {status}",
                segment.index
            )));
        }
        if segment.range.is_some() && status != StatusCode::PARTIAL_CONTENT {
            return Err(Error::InvalidManifest(format!(
                "segment {}: server ignored the range request",
                segment.index
            )));
        }

        let mut body = BytesMut::with_capacity(segment.len_hint().unwrap_or(0) as usize);
        while let Some(piece) = response
            .chunk()
            .await
            .map_err(|e| Error::TransientService(e.to_string()))?
        {
            self.limiter.throttle(piece.len() as u64).await;
            body.extend_from_slice(&piece);
        }

        if let Some(expected) = segment.len_hint() {
            if body.len() as u64 != expected {
                return Err(Error::TransientService(format!(
                    "segment {}: short read, {} of {expected} bytes",
                    segment.index,
                    body.len()
                )));
            }
        }
        Ok(body.freeze())
    }
}
