#![forbid(unsafe_code)]

//! Command-line flags shared by the binaries. Every flag overrides the
//! matching `.env`/environment setting.

use std::path::PathBuf;

use clap::Args;
use clap::builder::RangedU64ValueParser;

use crate::config::SettingsOverrides;

/// Accepts whole numbers of at least one.
pub fn positive_count() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::<usize>::new().range(1..)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Args)]
pub struct CommonArgs {
    /// Settings file to read instead of `.env`
    #[arg(long, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Directory holding videos/, thumbnails/ and feeds/
    #[arg(long, value_name = "PATH")]
    pub media_root: Option<PathBuf>,

    /// Absolute URL the media root is served from
    #[arg(long, value_name = "URL")]
    pub public_base_url: Option<String>,

    /// Most recent posts to process per creator
    #[arg(long, value_name = "N", value_parser = positive_count())]
    pub limit: Option<usize>,

    /// Rebuild feeds even when the newest post is already published
    #[arg(long)]
    pub force: bool,
}

impl CommonArgs {
    pub fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            env_path: self.env_file.clone(),
            media_root: self.media_root.clone(),
            public_base_url: self.public_base_url.clone(),
            item_limit: self.limit,
            force_refresh: self.force.then_some(true),
            ..SettingsOverrides::default()
        }
    }
}
