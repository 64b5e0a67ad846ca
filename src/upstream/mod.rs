#![forbid(unsafe_code)]

//! Boundary with the upstream platform.
//!
//! Session handshakes and anti-bot plumbing live outside this crate. The
//! pipeline only talks to the [`Upstream`] and [`Session`] traits; the two
//! adapters in this module either replay JSON dumps or drive an external
//! helper program.

pub mod command;
pub mod dump;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::{Settings, UpstreamSource};
use crate::model::Creator;

pub use command::CommandUpstream;
pub use dump::DumpUpstream;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream blocked access: {0}")]
    Blocked(String),
    #[error("session could not be established: {0}")]
    Session(String),
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream call timed out after {0} seconds")]
    Timeout(u64),
    #[error("operation not supported by this upstream")]
    Unsupported,
    #[error("upstream returned malformed data: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Model objects handed out by some upstream client versions. They only
/// promise a map view of themselves.
pub trait PostModel: Send + Sync + fmt::Debug {
    fn to_map(&self) -> Map<String, Value>;
}

/// One post exactly as the upstream produced it.
#[derive(Debug)]
pub enum RawPost {
    /// Plain mapping; may use legacy camelCase or snake_case keys.
    Record(Value),
    Model(Box<dyn PostModel>),
}

impl From<Value> for RawPost {
    fn from(value: Value) -> Self {
        RawPost::Record(value)
    }
}

/// Options forwarded to session establishment.
#[derive(Clone)]
pub struct SessionOptions {
    pub credential: String,
    pub headless: bool,
    pub force_refresh: bool,
    pub proxy: Option<String>,
    pub timeout: Duration,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("credential", &"<redacted>")
            .field("headless", &self.headless)
            .field("force_refresh", &self.force_refresh)
            .field("proxy", &self.proxy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SessionOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            credential: settings.credential.clone(),
            headless: settings.render_headless,
            force_refresh: settings.force_refresh,
            proxy: settings.proxy.clone(),
            timeout: settings.fetch_timeout,
        }
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    async fn establish_session(
        &self,
        options: &SessionOptions,
    ) -> Result<Box<dyn Session>, UpstreamError>;
}

/// A live upstream session. Callers must finish with [`Session::release`];
/// implementations also free their resources on drop so a cancelled
/// pipeline never leaks a helper process or scratch directory.
#[async_trait]
pub trait Session: Send + Sync {
    /// Most recent posts first, at most `limit` of them. Fails with
    /// [`UpstreamError::Blocked`] when access is denied.
    async fn list_recent_posts(
        &self,
        creator: &Creator,
        limit: usize,
    ) -> Result<Vec<RawPost>, UpstreamError>;

    /// Platform-aware download of a post's video. Optional.
    async fn fetch_media_bytes(&self, _media_id: &str) -> Result<Vec<u8>, UpstreamError> {
        Err(UpstreamError::Unsupported)
    }

    async fn release(self: Box<Self>);
}

/// Picks the upstream adapter configured for this run.
pub fn from_settings(settings: &Settings) -> Arc<dyn Upstream> {
    match &settings.upstream {
        UpstreamSource::Command(program) => Arc::new(CommandUpstream::new(program.clone())),
        UpstreamSource::Dump(dir) => Arc::new(DumpUpstream::new(dir.clone())),
    }
}

/// Pulls the post list out of a listing payload: either a bare array or an
/// object wrapping one under a well-known key.
pub(crate) fn posts_from_listing(payload: Value) -> Result<Vec<RawPost>, UpstreamError> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => ["itemList", "items", "videos", "aweme_list"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| {
                UpstreamError::Transport("listing payload has no post array".to_string())
            })?,
        _ => {
            return Err(UpstreamError::Transport(
                "listing payload is not a list".to_string(),
            ));
        }
    };
    Ok(items.into_iter().map(RawPost::Record).collect())
}
