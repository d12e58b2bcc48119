//! Identifier parsing
//!
//! Turns user-supplied strings into [`ItemDescriptor`]s. Accepted forms:
//!
//! - `https://tidal.com/browse/album/123`
//! - `https://listen.tidal.com/track/456`
//! - `album/123` or `albums/123`
//!
//! Bare numbers are rejected because the same id can name a track, an album
//! and a video at once.

use crate::error::{Error, Result};
use crate::types::{ItemDescriptor, ItemKind};
use url::Url;

/// Parse a single identifier
pub fn parse_identifier(input: &str) -> Result<ItemDescriptor> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::InvalidIdentifier("empty identifier".to_string()));
    }

    if input.contains("://") {
        return parse_url(input);
    }

    let mut parts = input.trim_matches('/').split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some(id), None) => descriptor_from(kind, id, input),
        (Some(id), None, None) if id.chars().all(|c| c.is_ascii_digit()) => {
            Err(Error::InvalidIdentifier(format!(
                "'{input}' is ambiguous; use kind/id such as track/{id}"
            )))
        }
        _ => Err(Error::InvalidIdentifier(format!(
            "'{input}' is neither a URL nor kind/id"
        ))),
    }
}

/// Parse a batch file: one identifier per line, `#` starts a comment
///
/// Fails on the first invalid line, reporting its line number.
pub fn parse_batch(text: &str) -> Result<Vec<ItemDescriptor>> {
    let mut descriptors = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = match line.split_once('#') {
            Some((before, _)) => before,
            None => line,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        let descriptor = parse_identifier(line).map_err(|e| match e {
            Error::InvalidIdentifier(msg) => {
                Error::InvalidIdentifier(format!("line {}: {msg}", number + 1))
            }
            other => other,
        })?;
        descriptors.push(descriptor);
    }
    Ok(descriptors)
}

fn parse_url(input: &str) -> Result<ItemDescriptor> {
    let url = Url::parse(input)
        .map_err(|e| Error::InvalidIdentifier(format!("'{input}': {e}")))?;

    let host = url.host_str().unwrap_or_default();
    if !(host == "tidal.com" || host.ends_with(".tidal.com")) {
        return Err(Error::InvalidIdentifier(format!(
            "'{input}' is not a tidal.com URL"
        )));
    }

    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    // Album track links look like /album/1/track/2; the innermost pair wins
    let pair = segments
        .windows(2)
        .rev()
        .find(|pair| pair[0].parse::<ItemKind>().is_ok());

    match pair {
        Some([kind, id]) => descriptor_from(kind, id, input),
        _ => Err(Error::InvalidIdentifier(format!(
            "'{input}' does not name a track, video, album, playlist or artist"
        ))),
    }
}

fn descriptor_from(kind: &str, id: &str, input: &str) -> Result<ItemDescriptor> {
    let kind: ItemKind = kind.parse()?;
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-');
    if !valid {
        return Err(Error::InvalidIdentifier(format!(
            "'{input}' has an invalid id '{id}'"
        )));
    }
    Ok(ItemDescriptor::new(kind, id))
}
