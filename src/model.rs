#![forbid(unsafe_code)]

//! Canonical records that flow through the mirroring pipeline.
//!
//! Everything upstream of the normalizer is loosely shaped JSON; everything
//! downstream only sees the types in this module.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Longest caption prefix used as a feed entry title.
pub const TITLE_MAX_CHARS: usize = 255;
/// Caption used when a post carries no text at all.
pub const UNTITLED: &str = "Untitled";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid creator handle {0:?}")]
pub struct InvalidHandle(pub String);

/// An upstream author. The handle doubles as a path component, so it is
/// validated once here and trusted everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Creator(String);

impl Creator {
    pub fn parse(raw: &str) -> Result<Self, InvalidHandle> {
        let handle = raw.trim().trim_start_matches('@');
        if is_path_component(handle) {
            Ok(Self(handle.to_owned()))
        } else {
            Err(InvalidHandle(raw.to_owned()))
        }
    }

    pub fn handle(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Creator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Creator {
    type Error = InvalidHandle;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Creator> for String {
    fn from(value: Creator) -> Self {
        value.0
    }
}

/// `[A-Za-z0-9._-]+`, not made of dots only. Such a value maps to exactly
/// one file name and needs no escaping in a URL path.
pub fn is_path_component(value: &str) -> bool {
    !value.is_empty()
        && !value.chars().all(|c| c == '.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// One normalized post. `id` always passes [`is_path_component`].
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    pub id: String,
    pub creator: Creator,
    pub caption: String,
    pub created_at: Option<DateTime<Utc>>,
    /// Held only until URL resolution and cover lookup are done.
    pub raw_metadata: Value,
}

impl MediaItem {
    /// Caption cut down to [`TITLE_MAX_CHARS`] characters for display.
    pub fn title(&self) -> String {
        truncate_title(&self.caption)
    }

    /// Moves the raw metadata out, leaving `Null` behind.
    pub fn take_metadata(&mut self) -> Value {
        self.raw_metadata.take()
    }
}

fn truncate_title(caption: &str) -> String {
    if caption.chars().count() <= TITLE_MAX_CHARS {
        return caption.to_owned();
    }
    let mut title: String = caption.chars().take(TITLE_MAX_CHARS - 3).collect();
    title.push_str("...");
    title
}

/// Which kind of binary a mirrored asset holds. Each kind has its own
/// directory tree and file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Video,
    Thumbnail,
}

impl AssetKind {
    pub fn extension(self) -> &'static str {
        match self {
            AssetKind::Video => "mp4",
            AssetKind::Thumbnail => "jpg",
        }
    }

    /// MIME type published for the stored file.
    pub fn mime_type(self) -> &'static str {
        match self {
            AssetKind::Video => "video/mp4",
            AssetKind::Thumbnail => "image/jpeg",
        }
    }

    /// Top-level MIME type a response must declare to be accepted.
    pub fn accepted_top_level(self) -> &'static str {
        match self {
            AssetKind::Video => "video",
            AssetKind::Thumbnail => "image",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetKind::Video => f.write_str("video"),
            AssetKind::Thumbnail => f.write_str("thumbnail"),
        }
    }
}

/// A binary mirrored to local storage. Existence of `local_path` is the only
/// persisted state; there is no index beside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub kind: AssetKind,
    pub creator: Creator,
    pub media_id: String,
    pub local_path: PathBuf,
    pub byte_size: u64,
    pub public_url: String,
}

/// Strategy that produced a resolved media URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    DirectField,
    RankedFallbackField,
    RecursiveSearch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedUrl {
    pub url: String,
    pub provenance: Provenance,
}

/// Builds the public-facing upstream URLs for creators and posts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformUrls {
    base: String,
}

impl PlatformUrls {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim().trim_end_matches('/').to_owned(),
        }
    }

    pub fn profile_url(&self, creator: &Creator) -> String {
        format!("{}/@{}", self.base, creator)
    }

    /// `media_id` is pushed as one percent-encoded path segment.
    pub fn permalink(&self, creator: &Creator, media_id: &str) -> String {
        let profile = self.profile_url(creator);
        let Ok(mut url) = Url::parse(&profile) else {
            return format!("{profile}/video/{media_id}");
        };
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("video").push(media_id);
        }
        url.into()
    }
}
