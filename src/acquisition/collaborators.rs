//! Path planning and tagging seams
//!
//! Turning metadata into a file name and embedding tags are owned by the
//! embedding application. The defaults here place files under the download
//! directory by kind and id, and leave tags alone.

use crate::decrypt::ContainerFormat;
use crate::error::{Error, Result};
use crate::types::{ItemDescriptor, ItemKind, QualitySelection};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Maps an item and quality to its destination path
///
/// The path must be stable for a given input: the existing-file check and the
/// final rename both rely on it.
pub trait PathPlanner: Send + Sync {
    /// Destination for `descriptor` acquired at `quality`
    fn plan(&self, descriptor: &ItemDescriptor, quality: QualitySelection) -> Result<PathBuf>;
}

/// Embeds metadata into a finished file
#[async_trait]
pub trait Tagger: Send + Sync {
    /// Tag the file at `path`; only called for completed items
    async fn tag(&self, path: &Path, descriptor: &ItemDescriptor) -> Result<()>;
}

/// `<root>/<kind>s/<id><ext>`, with the extension chosen by quality
///
/// Lossless audio tiers end in `.flac`, lossy tiers in `.m4a` and videos in
/// `.ts`.
#[derive(Clone, Debug)]
pub struct FlatPathPlanner {
    root: PathBuf,
}

impl FlatPathPlanner {
    /// Plan paths below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PathPlanner for FlatPathPlanner {
    fn plan(&self, descriptor: &ItemDescriptor, quality: QualitySelection) -> Result<PathBuf> {
        let container = match (descriptor.kind, quality) {
            (ItemKind::Track, QualitySelection::Audio(tier)) if tier.is_lossless() => {
                ContainerFormat::Flac
            }
            (ItemKind::Track, QualitySelection::Audio(_)) => ContainerFormat::Mp4,
            (ItemKind::Video, QualitySelection::Video(_)) => ContainerFormat::MpegTs,
            _ => {
                return Err(Error::InvalidIdentifier(format!(
                    "no destination for {descriptor} at {quality}"
                )));
            }
        };
        let file_name = format!("{}{}", descriptor.id, container.extension());
        Ok(self
            .root
            .join(format!("{}s", descriptor.kind))
            .join(file_name))
    }
}

/// Tagger that does nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpTagger;

#[async_trait]
impl Tagger for NoOpTagger {
    async fn tag(&self, _path: &Path, _descriptor: &ItemDescriptor) -> Result<()> {
        Ok(())
    }
}
