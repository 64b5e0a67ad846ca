#![forbid(unsafe_code)]

//! Per-creator RSS 2.0 feed assembly.
//!
//! Entries keep upstream enumeration order. Every entry carries exactly one
//! enclosure: the mirrored video when there is one, otherwise the permalink
//! with length `0`. Published URLs are either mirror URLs or platform
//! permalinks, never raw CDN links from the metadata. Dates are optional in
//! RSS, so unknown timestamps are simply left out.

use std::fmt;
use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::layout::{PARTIAL_SUFFIX, StorageLayout};
use crate::model::{AssetKind, AssetRecord, Creator, MediaItem, PlatformUrls};

pub const GENERATOR: &str = "reelfeed-tools";
const ATOM_NAMESPACE: &str = "http://www.w3.org/2005/Atom";
const RSS_DOCS: &str = "https://www.rssboard.org/rss-specification";

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("placing feed: {0}")]
    Persist(#[from] tempfile::PathPersistError),
    #[error("existing feed is unreadable: {0}")]
    Parse(#[from] feed_rs::parser::ParseFeedError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enclosure {
    pub url: String,
    /// Byte size rendered as text, `"0"` when unknown.
    pub length: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEntry {
    /// Rendered as the item `<guid>`.
    pub id: String,
    pub title: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// HTML fragment.
    pub content: String,
    pub enclosure: Enclosure,
}

/// Channel-level identity of a creator's feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedMeta {
    pub title: String,
    /// Creator profile page.
    pub link: String,
    pub description: String,
    pub self_link: String,
}

impl FeedMeta {
    pub fn for_creator(creator: &Creator, platform: &PlatformUrls, layout: &StorageLayout) -> Self {
        Self {
            title: format!("@{creator}"),
            link: platform.profile_url(creator),
            description: format!("Latest videos from @{creator}"),
            self_link: layout.feed_public_url(creator),
        }
    }
}

pub struct FeedAssembler {
    meta: FeedMeta,
    platform: PlatformUrls,
    entries: Vec<FeedEntry>,
    logo: Option<String>,
}

impl FeedAssembler {
    pub fn new(meta: FeedMeta, platform: PlatformUrls) -> Self {
        Self {
            meta,
            platform,
            entries: Vec::new(),
            logo: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add_entry(
        &mut self,
        item: &MediaItem,
        video: Option<&AssetRecord>,
        thumbnail: Option<&AssetRecord>,
    ) {
        let permalink = self.platform.permalink(&item.creator, &item.id);
        let enclosure = match video {
            Some(asset) => Enclosure {
                url: asset.public_url.clone(),
                length: asset.byte_size.to_string(),
                mime_type: AssetKind::Video.mime_type().to_string(),
            },
            None => Enclosure {
                url: permalink.clone(),
                length: "0".to_string(),
                mime_type: AssetKind::Video.mime_type().to_string(),
            },
        };

        let title = item.title();
        let mut content = String::new();
        if let Some(thumbnail) = thumbnail {
            if self.logo.is_none() {
                self.logo = Some(thumbnail.public_url.clone());
            }
            content.push_str(&format!(
                r#"<img src="{}" alt="{}"/>"#,
                escape_xml(&thumbnail.public_url),
                escape_xml(&title)
            ));
        }
        content.push_str(&format!("<p>{}</p>", escape_xml(&item.caption)));

        self.entries.push(FeedEntry {
            id: permalink.clone(),
            title,
            link: permalink,
            published_at: item.created_at,
            updated_at: item.created_at,
            content,
            enclosure,
        });
    }

    pub fn finalize(self) -> FeedDocument {
        let FeedAssembler {
            meta,
            entries,
            logo,
            ..
        } = self;
        let entries: Vec<FeedEntry> = entries
            .into_iter()
            .filter(|entry| {
                let keep = !entry.id.trim().is_empty() && !entry.link.trim().is_empty();
                if !keep {
                    warn!(feed = %meta.link, "dropping feed entry without id or link");
                }
                keep
            })
            .collect();
        let updated = entries.iter().filter_map(|entry| entry.updated_at).max();
        FeedDocument {
            meta,
            logo,
            updated,
            entries,
        }
    }
}

/// A finalized feed. [`fmt::Display`] renders RSS 2.0 XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedDocument {
    pub meta: FeedMeta,
    pub logo: Option<String>,
    /// Latest entry timestamp; absent when no entry has one.
    pub updated: Option<DateTime<Utc>>,
    pub entries: Vec<FeedEntry>,
}

impl FeedDocument {
    pub fn to_xml(&self) -> String {
        self.to_string()
    }

    pub fn newest_entry_id(&self) -> Option<&str> {
        self.entries.first().map(|entry| entry.id.as_str())
    }
}

impl fmt::Display for FeedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = &self.meta;
        writeln!(f, r#"<?xml version="1.0" encoding="utf-8"?>"#)?;
        writeln!(f, r#"<rss version="2.0" xmlns:atom="{ATOM_NAMESPACE}">"#)?;
        writeln!(f, "  <channel>")?;
        writeln!(f, "    <title>{}</title>", escape_xml(&meta.title))?;
        writeln!(f, "    <link>{}</link>", escape_xml(&meta.link))?;
        writeln!(f, "    <description>{}</description>", escape_xml(&meta.description))?;
        writeln!(
            f,
            r#"    <atom:link href="{}" rel="self" type="application/rss+xml"/>"#,
            escape_xml(&meta.self_link)
        )?;
        if let Some(updated) = self.updated {
            writeln!(f, "    <lastBuildDate>{}</lastBuildDate>", timestamp(updated))?;
        }
        writeln!(f, "    <generator>{GENERATOR}</generator>")?;
        writeln!(f, "    <docs>{RSS_DOCS}</docs>")?;
        if let Some(logo) = &self.logo {
            writeln!(f, "    <image>")?;
            writeln!(f, "      <url>{}</url>", escape_xml(logo))?;
            writeln!(f, "      <title>{}</title>", escape_xml(&meta.title))?;
            writeln!(f, "      <link>{}</link>", escape_xml(&meta.link))?;
            writeln!(f, "    </image>")?;
        }
        for entry in &self.entries {
            write_item(f, entry)?;
        }
        writeln!(f, "  </channel>")?;
        writeln!(f, "</rss>")
    }
}

fn write_item(f: &mut fmt::Formatter<'_>, entry: &FeedEntry) -> fmt::Result {
    writeln!(f, "    <item>")?;
    writeln!(f, "      <title>{}</title>", escape_xml(&entry.title))?;
    writeln!(f, "      <link>{}</link>", escape_xml(&entry.link))?;
    writeln!(f, r#"      <guid isPermaLink="true">{}</guid>"#, escape_xml(&entry.id))?;
    if let Some(published) = entry.published_at {
        writeln!(f, "      <pubDate>{}</pubDate>", timestamp(published))?;
    }
    writeln!(f, "      <description>{}</description>", escape_xml(&entry.content))?;
    writeln!(
        f,
        r#"      <enclosure url="{}" length="{}" type="{}"/>"#,
        escape_xml(&entry.enclosure.url),
        escape_xml(&entry.enclosure.length),
        escape_xml(&entry.enclosure.mime_type)
    )?;
    writeln!(f, "    </item>")
}

/// RFC 822 date, as RSS 2.0 requires.
fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc2822()
}

pub fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            // Control characters other than tab and newlines are not valid XML 1.0.
            c if c.is_control() && !matches!(c, '\t' | '\n' | '\r') => {}
            c => escaped.push(c),
        }
    }
    escaped
}

/// Writes the feed next to its final path and renames it into place.
pub async fn write_feed(path: &Path, document: &FeedDocument) -> Result<u64, FeedError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;
    let xml = document.to_xml();
    let (file, temp_path) = tempfile::Builder::new()
        .prefix(".")
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(parent)?
        .into_parts();
    let mut file = tokio::fs::File::from_std(file);
    file.write_all(xml.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    temp_path.persist(path)?;
    Ok(xml.len() as u64)
}

/// Id of the first entry of a previously written feed, if there is one.
pub async fn newest_entry_id(path: &Path) -> Result<Option<String>, FeedError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let parsed = feed_rs::parser::parse(bytes.as_slice())?;
    Ok(parsed.entries.first().map(|entry| entry.id.clone()))
}
