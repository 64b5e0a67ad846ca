#![forbid(unsafe_code)]

//! One creator, end to end: session, enumeration, per-item mirroring, feed.
//!
//! ```text
//! Idle -> SessionEstablished -> Enumerating -> PerItemProcessing(i)* -> Finalizing -> Done
//!   \___________________ any step may end in Failed ____________________/
//! ```
//!
//! Only session, enumeration and the final feed write can fail a creator.
//! Item-level problems degrade that entry and the loop moves on.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{ConfigError, Settings};
use crate::feed::{self, FeedAssembler, FeedMeta};
use crate::layout::StorageLayout;
use crate::mirror::{AssetMirror, MirrorOptions, http_client};
use crate::model::{AssetKind, AssetRecord, Creator, MediaItem, PlatformUrls, ResolvedUrl};
use crate::normalize::normalize;
use crate::resolve::{resolve, resolve_cover};
use crate::thumbnail::ThumbnailRenderer;
use crate::upstream::{self, Session, SessionOptions, Upstream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    SessionEstablished,
    Enumerating,
    PerItemProcessing(usize),
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreatorOutcome {
    /// Feed rewritten. `degraded` entries lack a mirrored video or thumbnail;
    /// `dropped` posts never made it into the feed.
    Done {
        entries: usize,
        degraded: usize,
        dropped: usize,
    },
    /// Newest post already published; nothing touched.
    Unchanged,
    Failed { reason: String },
}

impl CreatorOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, CreatorOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatorReport {
    /// Handle as listed, which may not have been a valid [`Creator`].
    pub creator: String,
    pub outcome: CreatorOutcome,
}

/// Everything a pipeline needs, built once per run and shared by all
/// creators.
pub struct PipelineContext {
    pub upstream: Arc<dyn Upstream>,
    pub mirror: AssetMirror,
    pub renderer: ThumbnailRenderer,
    pub platform: PlatformUrls,
    pub session_options: SessionOptions,
    pub item_limit: usize,
    pub force_refresh: bool,
}

impl PipelineContext {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let client = http_client(settings.fetch_timeout, settings.proxy.as_deref())?;
        let layout = StorageLayout::with_root(&settings.media_root, settings.public_base_url.clone());
        Ok(Self {
            upstream: upstream::from_settings(settings),
            mirror: AssetMirror::new(client, layout, MirrorOptions::from_settings(settings)),
            renderer: ThumbnailRenderer::from_settings(settings),
            platform: PlatformUrls::new(&settings.platform_url),
            session_options: SessionOptions::from_settings(settings),
            item_limit: settings.item_limit,
            force_refresh: settings.force_refresh,
        })
    }

    pub fn layout(&self) -> &StorageLayout {
        self.mirror.layout()
    }
}

pub struct CreatorPipeline<'a> {
    context: &'a PipelineContext,
    creator: Creator,
    state: PipelineState,
}

impl<'a> CreatorPipeline<'a> {
    pub fn new(context: &'a PipelineContext, creator: Creator) -> Self {
        Self {
            context,
            creator,
            state: PipelineState::Idle,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, next: PipelineState) {
        debug!(creator = %self.creator, from = ?self.state, to = ?next, "pipeline transition");
        self.state = next;
    }

    fn fail(&mut self, stage: &'static str, err: &dyn fmt::Display) -> CreatorOutcome {
        warn!(creator = %self.creator, stage, error = %err, "creator failed");
        self.transition(PipelineState::Failed);
        CreatorOutcome::Failed {
            reason: format!("{stage}: {err}"),
        }
    }

    /// Runs to a terminal state. The session is released on every path
    /// once established.
    pub async fn run(&mut self) -> CreatorOutcome {
        let session = match self
            .context
            .upstream
            .establish_session(&self.context.session_options)
            .await
        {
            Ok(session) => session,
            Err(err) => return self.fail("session", &err),
        };
        self.transition(PipelineState::SessionEstablished);
        let outcome = self.run_with_session(session.as_ref()).await;
        session.release().await;
        outcome
    }

    async fn run_with_session(&mut self, session: &dyn Session) -> CreatorOutcome {
        let context = self.context;
        let creator = self.creator.clone();

        self.transition(PipelineState::Enumerating);
        let posts = match session.list_recent_posts(&creator, context.item_limit).await {
            Ok(posts) => posts,
            Err(err) => return self.fail("enumerate", &err),
        };

        let mut items = Vec::with_capacity(posts.len());
        let mut dropped = 0;
        for post in posts {
            match normalize(&creator, post) {
                Ok(item) => items.push(item),
                Err(reason) => {
                    dropped += 1;
                    warn!(creator = %creator, stage = "normalize", %reason, "dropping post");
                }
            }
        }

        let feed_path = context.layout().feed_path(&creator);
        if !context.force_refresh
            && let Some(newest) = items.first()
        {
            let permalink = context.platform.permalink(&creator, &newest.id);
            match feed::newest_entry_id(&feed_path).await {
                Ok(Some(seen)) if seen == permalink => {
                    info!(creator = %creator, media_id = %newest.id, "feed already current");
                    self.transition(PipelineState::Done);
                    return CreatorOutcome::Unchanged;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(creator = %creator, stage = "feed", error = %err, "existing feed unreadable, rebuilding");
                }
            }
        }

        let mut assembler = FeedAssembler::new(
            FeedMeta::for_creator(&creator, &context.platform, context.layout()),
            context.platform.clone(),
        );
        let mut degraded = 0;
        for (index, item) in items.into_iter().enumerate() {
            self.transition(PipelineState::PerItemProcessing(index));
            if !self.process_item(session, item, &mut assembler).await {
                degraded += 1;
            }
        }

        self.transition(PipelineState::Finalizing);
        let document = assembler.finalize();
        let entries = document.entries.len();
        match feed::write_feed(&feed_path, &document).await {
            Ok(size) => {
                info!(creator = %creator, entries, degraded, dropped, size, "feed written");
                self.transition(PipelineState::Done);
                CreatorOutcome::Done {
                    entries,
                    degraded,
                    dropped,
                }
            }
            Err(err) => self.fail("feed", &err),
        }
    }

    /// Mirrors one item's assets and appends its entry. Returns `false` when
    /// the entry had to be degraded.
    async fn process_item(
        &self,
        session: &dyn Session,
        mut item: MediaItem,
        assembler: &mut FeedAssembler,
    ) -> bool {
        let metadata = item.take_metadata();
        let resolved = resolve(&metadata);
        let cover = resolve_cover(&metadata);
        drop(metadata);

        let video = match resolved {
            Some(ResolvedUrl { url, provenance }) => {
                debug!(creator = %item.creator, media_id = %item.id, ?provenance, "resolved media url");
                match self
                    .context
                    .mirror
                    .mirror_with(AssetKind::Video, &item.creator, &item.id, &url, Some(session))
                    .await
                {
                    Ok(record) => Some(record),
                    Err(err) => {
                        warn!(creator = %item.creator, media_id = %item.id, stage = "mirror_video", error = %err, "video not mirrored");
                        None
                    }
                }
            }
            None => {
                info!(creator = %item.creator, media_id = %item.id, stage = "resolve", "no media url, linking permalink");
                None
            }
        };

        let thumbnail = match &cover {
            Some(cover_url) => self.mirror_thumbnail(&item, cover_url).await,
            None => None,
        };

        let complete = video.is_some() && (cover.is_none() || thumbnail.is_some());
        assembler.add_entry(&item, video.as_ref(), thumbnail.as_ref());
        complete
    }

    /// Direct image fetch first, browser capture second. Both land on the
    /// same path.
    async fn mirror_thumbnail(&self, item: &MediaItem, cover_url: &str) -> Option<AssetRecord> {
        let mirror = &self.context.mirror;
        match mirror
            .mirror(AssetKind::Thumbnail, &item.creator, &item.id, cover_url)
            .await
        {
            Ok(record) => return Some(record),
            Err(err) => {
                debug!(creator = %item.creator, media_id = %item.id, stage = "mirror_thumbnail", error = %err, "direct cover fetch failed, rendering");
            }
        }

        let destination = mirror
            .layout()
            .asset_path(AssetKind::Thumbnail, &item.creator, &item.id);
        match self
            .context
            .renderer
            .render_thumbnail(cover_url, &destination)
            .await
        {
            Ok(size) => Some(mirror.layout().asset_record(
                AssetKind::Thumbnail,
                &item.creator,
                &item.id,
                size,
            )),
            Err(err) => {
                warn!(creator = %item.creator, media_id = %item.id, stage = "render_thumbnail", error = %err, "thumbnail unavailable, text-only entry");
                None
            }
        }
    }
}

/// Runs one creator and reports how it ended.
pub async fn run_creator(context: &PipelineContext, creator: Creator) -> CreatorReport {
    let handle = creator.to_string();
    let outcome = CreatorPipeline::new(context, creator).run().await;
    CreatorReport {
        creator: handle,
        outcome,
    }
}
