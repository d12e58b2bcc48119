//! HTTP manifest resolver against the service API

use super::playback::{PlaybackManifest, decode_playback_info, select_variant};
use super::{ManifestResolver, Segment, StreamManifest};
use crate::config::{ApiConfig, Config};
use crate::decrypt::ContainerFormat;
use crate::error::{Error, Result};
use crate::limiter::NetworkLimiter;
use crate::types::{ItemDescriptor, ItemKind, QualitySelection};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, RANGE};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

const PAGE_LIMIT: usize = 100;

// Sub-status codes the service uses for "not streamable at this quality"
const NOT_AVAILABLE_SUB_STATUS: [u32; 3] = [4005, 4032, 4035];

/// Resolves manifests through `playbackinfopostpaywall`
///
/// Every call goes to the network; nothing is cached because manifests carry
/// signed URLs that expire.
#[derive(Clone, Debug)]
pub struct HttpManifestResolver {
    client: reqwest::Client,
    api: ApiConfig,
    part_size: u64,
    limiter: NetworkLimiter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceError {
    #[serde(default)]
    sub_status: Option<u32>,
    #[serde(default)]
    user_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    #[serde(default)]
    total_number_of_items: usize,
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct CollectionEntry {
    item: IdOnly,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: serde_json::Value,
}

impl IdOnly {
    fn as_id(&self) -> Option<String> {
        match &self.id {
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }
}

impl HttpManifestResolver {
    /// Create a resolver sharing `limiter` with the segment fetchers
    pub fn new(config: &Config, limiter: NetworkLimiter) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch.request_timeout)
            .user_agent(concat!("tidal-dl/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config {
                message: format!("failed to create HTTP client: {e}"),
                key: None,
            })?;

        let mut api = config.api.clone();
        if !api.base_url.ends_with('/') {
            api.base_url.push('/');
        }

        Ok(Self {
            client,
            api,
            part_size: config.fetch.part_size,
            limiter,
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.query(&[("countryCode", self.api.country_code.as_str())]);
        match &self.api.access_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let _permit = self.limiter.request_permit().await?;
        request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                Error::TransientService(e.to_string())
            } else {
                Error::Network(e)
            }
        })
    }

    /// Map a non-success API response onto the error taxonomy
    async fn check(
        &self,
        response: reqwest::Response,
        descriptor: &ItemDescriptor,
        quality: Option<QualitySelection>,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let detail: Option<ServiceError> = serde_json::from_str(&body).ok();
        let sub_status = detail.as_ref().and_then(|d| d.sub_status);
        let message = detail
            .and_then(|d| d.user_message)
            .unwrap_or_else(|| status.to_string());

        let not_available = || Error::NotAvailable {
            item: descriptor.to_string(),
            quality: quality.map(|q| q.to_string()).unwrap_or_default(),
        };

        Err(match status {
            _ if sub_status.is_some_and(|s| NOT_AVAILABLE_SUB_STATUS.contains(&s)) => {
                not_available()
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Unauthorized(message),
            StatusCode::TOO_MANY_REQUESTS => Error::TransientService(message),
            s if s.is_server_error() => Error::TransientService(format!("{s}: {message}")),
            _ => not_available(),
        })
    }

    async fn playback_info(
        &self,
        descriptor: &ItemDescriptor,
        quality: QualitySelection,
    ) -> Result<PlaybackManifest> {
        let (path, quality_param) = match (descriptor.kind, quality) {
            (ItemKind::Track, QualitySelection::Audio(tier)) => (
                format!("tracks/{}/playbackinfopostpaywall", descriptor.id),
                ("audioquality", tier.api_name()),
            ),
            // Resolution is picked from the HLS master playlist
            (ItemKind::Video, QualitySelection::Video(_)) => (
                format!("videos/{}/playbackinfopostpaywall", descriptor.id),
                ("videoquality", "HIGH"),
            ),
            _ => {
                return Err(Error::InvalidManifest(format!(
                    "{quality} does not apply to {descriptor}"
                )));
            }
        };

        let request = self.authorize(self.client.get(self.api_url(&path))).query(&[
            quality_param,
            ("playbackmode", "STREAM"),
            ("assetpresentation", "FULL"),
        ]);
        let response = self.send(request).await?;
        let response = self.check(response, descriptor, Some(quality)).await?;
        let body = response.bytes().await.map_err(|e| Error::TransientService(e.to_string()))?;
        decode_playback_info(&body)
    }

    /// Total length of a URL via a one-byte range probe
    async fn probe_length(&self, url: &str) -> Result<Option<u64>> {
        let response = self
            .send(self.client.get(url).header(RANGE, "bytes=0-0"))
            .await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(Error::TransientService(format!("probe {url}: {status}")));
        }
        if status != StatusCode::PARTIAL_CONTENT {
            return Ok(None);
        }
        let total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.trim().parse::<u64>().ok());
        Ok(total)
    }

    async fn fetch_playlist(&self, url: &str) -> Result<m3u8_rs::Playlist> {
        let response = self.send(self.client.get(url)).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(if status.is_server_error() {
                Error::TransientService(format!("playlist {url}: {status}"))
            } else {
                Error::InvalidManifest(format!("playlist {url}: {status}"))
            });
        }
        let body = response.bytes().await.map_err(|e| Error::TransientService(e.to_string()))?;
        m3u8_rs::parse_playlist_res(&body)
            .map_err(|e| Error::InvalidManifest(format!("playlist {url}: {e}")))
    }

    async fn resolve_hls(&self, master_url: &str, max_height: u64) -> Result<StreamManifest> {
        let master_base = Url::parse(master_url)
            .map_err(|e| Error::InvalidManifest(format!("master playlist url: {e}")))?;

        let (media_url, codec) = match self.fetch_playlist(master_url).await? {
            m3u8_rs::Playlist::MasterPlaylist(master) => {
                let variant = select_variant(&master, max_height).ok_or_else(|| {
                    Error::InvalidManifest("master playlist has no variants".into())
                })?;
                let url = master_base
                    .join(&variant.uri)
                    .map_err(|e| Error::InvalidManifest(format!("variant url: {e}")))?;
                debug!(variant = %url, bandwidth = variant.bandwidth, "selected video variant");
                (url, variant.codecs.clone().unwrap_or_default())
            }
            m3u8_rs::Playlist::MediaPlaylist(_) => (master_base, String::new()),
        };

        let media = match self.fetch_playlist(media_url.as_str()).await? {
            m3u8_rs::Playlist::MediaPlaylist(media) => media,
            m3u8_rs::Playlist::MasterPlaylist(_) => {
                return Err(Error::InvalidManifest(
                    "variant url points at another master playlist".into(),
                ));
            }
        };

        let segments = media
            .segments
            .iter()
            .enumerate()
            .map(|(index, segment)| {
                media_url
                    .join(&segment.uri)
                    .map(|url| Segment::whole(index, url))
                    .map_err(|e| Error::InvalidManifest(format!("segment url: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        if segments.is_empty() {
            return Err(Error::InvalidManifest("media playlist has no segments".into()));
        }

        Ok(StreamManifest {
            segments,
            cipher: None,
            container: ContainerFormat::MpegTs,
            codec,
            total_size: None,
        })
    }

    async fn paged<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        descriptor: &ItemDescriptor,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        loop {
            let offset = items.len().to_string();
            let request = self
                .authorize(self.client.get(self.api_url(path)))
                .query(&[("limit", PAGE_LIMIT.to_string()), ("offset", offset)]);
            let response = self.send(request).await?;
            let response = self.check(response, descriptor, None).await?;
            let page: Page<T> = response
                .json()
                .await
                .map_err(|e| Error::InvalidManifest(format!("{path}: {e}")))?;

            let received = page.items.len();
            items.extend(page.items);
            if received == 0 || items.len() >= page.total_number_of_items {
                return Ok(items);
            }
        }
    }

    async fn collection_items(&self, descriptor: &ItemDescriptor) -> Result<Vec<ItemDescriptor>> {
        let path = format!("{}s/{}/items", descriptor.kind, descriptor.id);
        let entries: Vec<CollectionEntry> = self.paged(&path, descriptor).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let kind = match entry.kind.as_str() {
                    "track" => ItemKind::Track,
                    "video" => ItemKind::Video,
                    _ => return None,
                };
                entry.item.as_id().map(|id| ItemDescriptor::new(kind, id))
            })
            .collect())
    }
}

#[async_trait]
impl ManifestResolver for HttpManifestResolver {
    async fn resolve(
        &self,
        descriptor: &ItemDescriptor,
        quality: QualitySelection,
    ) -> Result<StreamManifest> {
        match self.playback_info(descriptor, quality).await? {
            PlaybackManifest::Hls { master_url } => {
                let height = match quality {
                    QualitySelection::Video(tier) => tier.height(),
                    QualitySelection::Audio(_) => u64::MAX,
                };
                self.resolve_hls(&master_url, height).await
            }
            PlaybackManifest::Direct {
                urls,
                container,
                codec,
                cipher,
            } => {
                let (segments, total_size) = match urls.as_slice() {
                    [url] => match self.probe_length(url).await? {
                        Some(total) if total > 0 => (
                            StreamManifest::split_ranges(url, total, self.part_size),
                            Some(total),
                        ),
                        _ => (vec![Segment::whole(0, url.clone())], None),
                    },
                    many => (
                        many.iter()
                            .enumerate()
                            .map(|(index, url)| Segment::whole(index, url.clone()))
                            .collect(),
                        None,
                    ),
                };
                debug!(
                    item = %descriptor,
                    segments = segments.len(),
                    total_size,
                    encrypted = cipher.is_some(),
                    "resolved manifest"
                );
                Ok(StreamManifest {
                    segments,
                    cipher,
                    container,
                    codec,
                    total_size,
                })
            }
        }
    }

    async fn expand(&self, descriptor: &ItemDescriptor) -> Result<Vec<ItemDescriptor>> {
        match descriptor.kind {
            ItemKind::Track | ItemKind::Video => Ok(vec![descriptor.clone()]),
            ItemKind::Album | ItemKind::Playlist => self.collection_items(descriptor).await,
            ItemKind::Artist => {
                let path = format!("artists/{}/albums", descriptor.id);
                let albums: Vec<IdOnly> = self.paged(&path, descriptor).await?;
                let mut items = Vec::new();
                for album in albums.iter().filter_map(IdOnly::as_id) {
                    let album = ItemDescriptor::new(ItemKind::Album, album);
                    items.extend(self.collection_items(&album).await?);
                }
                Ok(items)
            }
        }
    }
}
