#![forbid(unsafe_code)]

//! On-disk layout of the mirror and its mapping to public URLs.
//!
//! ```text
//! <media_root>/videos/<creator>/<media_id>.mp4
//! <media_root>/thumbnails/<creator>/<media_id>.jpg
//! <media_root>/feeds/<creator>.xml
//! ```
//!
//! The same relative paths are appended to the public base URL, so whatever
//! serves `media_root` serves the feed's enclosures too.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use url::Url;
use walkdir::WalkDir;

use crate::model::{AssetKind, AssetRecord, Creator};

const VIDEOS_SUBDIR: &str = "videos";
const THUMBNAILS_SUBDIR: &str = "thumbnails";
const FEEDS_SUBDIR: &str = "feeds";
const FEED_EXTENSION: &str = "xml";

/// Suffix of in-flight downloads. Never a cache hit.
pub const PARTIAL_SUFFIX: &str = ".part";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    base: PathBuf,
    videos: PathBuf,
    thumbnails: PathBuf,
    feeds: PathBuf,
    public_base: Url,
}

impl StorageLayout {
    /// `public_base` must end in `/`; config guarantees it.
    pub fn with_root(media_root: &Path, public_base: Url) -> Self {
        let base = media_root.to_path_buf();
        Self {
            videos: base.join(VIDEOS_SUBDIR),
            thumbnails: base.join(THUMBNAILS_SUBDIR),
            feeds: base.join(FEEDS_SUBDIR),
            base,
            public_base,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Creates every top-level directory so later steps can assume they exist.
    pub fn prepare(&self) -> Result<()> {
        for dir in [&self.videos, &self.thumbnails, &self.feeds] {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }

    fn kind_dir(&self, kind: AssetKind) -> &Path {
        match kind {
            AssetKind::Video => &self.videos,
            AssetKind::Thumbnail => &self.thumbnails,
        }
    }

    fn kind_subdir(kind: AssetKind) -> &'static str {
        match kind {
            AssetKind::Video => VIDEOS_SUBDIR,
            AssetKind::Thumbnail => THUMBNAILS_SUBDIR,
        }
    }

    fn asset_file_name(kind: AssetKind, media_id: &str) -> String {
        format!("{}.{}", sanitize_component(media_id), kind.extension())
    }

    /// The single deterministic location for `(kind, creator, media_id)`.
    pub fn asset_path(&self, kind: AssetKind, creator: &Creator, media_id: &str) -> PathBuf {
        self.kind_dir(kind)
            .join(creator.handle())
            .join(Self::asset_file_name(kind, media_id))
    }

    pub fn asset_public_url(&self, kind: AssetKind, creator: &Creator, media_id: &str) -> String {
        self.public_url(&format!(
            "{}/{}/{}",
            Self::kind_subdir(kind),
            creator.handle(),
            Self::asset_file_name(kind, media_id)
        ))
    }

    pub fn asset_record(
        &self,
        kind: AssetKind,
        creator: &Creator,
        media_id: &str,
        byte_size: u64,
    ) -> AssetRecord {
        AssetRecord {
            kind,
            creator: creator.clone(),
            media_id: media_id.to_string(),
            local_path: self.asset_path(kind, creator, media_id),
            byte_size,
            public_url: self.asset_public_url(kind, creator, media_id),
        }
    }

    pub fn feed_path(&self, creator: &Creator) -> PathBuf {
        self.feeds
            .join(format!("{}.{FEED_EXTENSION}", creator.handle()))
    }

    pub fn feed_public_url(&self, creator: &Creator) -> String {
        self.public_url(&format!(
            "{FEEDS_SUBDIR}/{}.{FEED_EXTENSION}",
            creator.handle()
        ))
    }

    fn public_url(&self, relative: &str) -> String {
        format!("{}{}", self.public_base.as_str(), relative)
    }

    /// Deletes temp files left behind by interrupted downloads. Returns how
    /// many were removed.
    pub fn sweep_partial_downloads(&self) -> usize {
        let mut removed = 0;
        for root in [&self.videos, &self.thumbnails, &self.feeds] {
            if !root.exists() {
                continue;
            }
            for entry in WalkDir::new(root)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
            {
                if !entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                    continue;
                }
                match fs::remove_file(entry.path()) {
                    Ok(()) => {
                        debug!(path = %entry.path().display(), "removed stale partial download");
                        removed += 1;
                    }
                    Err(err) => {
                        warn!(path = %entry.path().display(), error = %err, "could not remove partial download");
                    }
                }
            }
        }
        removed
    }
}

/// Makes an upstream id safe to use as a single path component.
pub fn sanitize_component(value: &str) -> String {
    let sanitized: String = value
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "_".repeat(sanitized.len().max(1))
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn layout_at(root: &Path) -> StorageLayout {
        StorageLayout::with_root(root, Url::parse("https://cdn.example.com/reels/").unwrap())
    }

    #[test]
    fn prepare_creates_directories() -> Result<()> {
        let temp = tempdir()?;
        let layout = layout_at(temp.path());
        layout.prepare()?;
        for sub in [VIDEOS_SUBDIR, THUMBNAILS_SUBDIR, FEEDS_SUBDIR] {
            assert!(temp.path().join(sub).is_dir());
        }
        Ok(())
    }

    #[test]
    fn asset_paths_and_urls_share_relative_layout() {
        let layout = layout_at(Path::new("/srv/reels"));
        let creator = Creator::parse("alice").unwrap();
        assert_eq!(
            layout.asset_path(AssetKind::Video, &creator, "42"),
            PathBuf::from("/srv/reels/videos/alice/42.mp4")
        );
        assert_eq!(
            layout.asset_public_url(AssetKind::Thumbnail, &creator, "42"),
            "https://cdn.example.com/reels/thumbnails/alice/42.jpg"
        );
        assert_eq!(
            layout.feed_public_url(&creator),
            "https://cdn.example.com/reels/feeds/alice.xml"
        );
        assert_eq!(
            layout.feed_path(&creator),
            PathBuf::from("/srv/reels/feeds/alice.xml")
        );
    }

    #[test]
    fn sanitize_component_blocks_traversal() {
        assert_eq!(sanitize_component("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_component(".."), "__");
        assert_eq!(sanitize_component("abc def"), "abc_def");
        assert_eq!(sanitize_component(""), "_");
        assert_eq!(sanitize_component("7301234"), "7301234");
    }

    #[test]
    fn sweep_removes_only_partial_files() -> Result<()> {
        let temp = tempdir()?;
        let layout = layout_at(temp.path());
        layout.prepare()?;
        let creator_dir = temp.path().join(VIDEOS_SUBDIR).join("alice");
        fs::create_dir_all(&creator_dir)?;
        fs::write(creator_dir.join("42.mp4"), b"complete")?;
        fs::write(creator_dir.join(".tmpXYZ.part"), b"half")?;
        assert_eq!(layout.sweep_partial_downloads(), 1);
        assert!(creator_dir.join("42.mp4").exists());
        assert!(!creator_dir.join(".tmpXYZ.part").exists());
        Ok(())
    }
}
