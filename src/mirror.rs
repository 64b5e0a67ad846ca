#![forbid(unsafe_code)]

//! Idempotent mirroring of videos and thumbnails into local storage.
//!
//! Every asset has exactly one path, derived from `(kind, creator, media_id)`.
//! If that path exists the asset is a cache hit and no network request is
//! made. Downloads stream into a `.part` temp file next to the final path and
//! are renamed into place only after the body arrived in full, so a crash
//! never leaves a half file that looks like a hit.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::layout::{PARTIAL_SUFFIX, StorageLayout, sanitize_component};
use crate::model::{AssetKind, AssetRecord, Creator};
use crate::upstream::{Session, UpstreamError};

const RETRY_BACKOFF_MS: u64 = 250;
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status code: {0}")]
    HttpStatus(u16),
    #[error("response is not {expected} media (content type {content_type})")]
    NotMedia {
        expected: AssetKind,
        content_type: String,
    },
    #[error("transfer truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },
    #[error("response body was empty")]
    Empty,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("placing download: {0}")]
    Persist(#[from] tempfile::PathPersistError),
}

impl FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Request(err) => err.is_timeout() || err.is_connect() || err.is_body(),
            FetchError::HttpStatus(code) => *code >= 500 || *code == 429,
            FetchError::Truncated { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MirrorOptions {
    /// Bounded attempts for the generic HTTP path.
    pub attempts: u32,
    /// Fast-path payloads below this size are treated as truncated.
    pub min_fast_path_bytes: u64,
    /// Deadline for one fast-path call.
    pub fast_path_timeout: Duration,
}

impl MirrorOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            attempts: settings.fetch_attempts,
            min_fast_path_bytes: settings.min_video_bytes,
            fast_path_timeout: settings.fetch_timeout,
        }
    }
}

/// Shared HTTP client: one total-request timeout and optional proxy.
pub fn http_client(timeout: Duration, proxy: Option<&str>) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(MAX_CONNECT_TIMEOUT))
        .user_agent(concat!("reelfeed-tools/", env!("CARGO_PKG_VERSION")));
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    builder.build()
}

/// Keyed on the stored file name, so ids that map to one path share a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AssetKey {
    kind: AssetKind,
    creator: Creator,
    file_stem: String,
}

/// Per-key async locks so two concurrent mirrors of one asset fetch once.
#[derive(Default)]
struct KeyLocks {
    slots: Mutex<HashMap<AssetKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, key: AssetKey) -> KeyGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = slot.lock_owned().await;
        KeyGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }
}

struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: AssetKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.locks.slots.lock();
        if slots
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.key);
        }
    }
}

pub struct AssetMirror {
    client: reqwest::Client,
    layout: StorageLayout,
    options: MirrorOptions,
    locks: KeyLocks,
}

impl AssetMirror {
    pub fn new(client: reqwest::Client, layout: StorageLayout, options: MirrorOptions) -> Self {
        Self {
            client,
            layout,
            options,
            locks: KeyLocks::default(),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Mirrors `source_url` over plain HTTP.
    pub async fn mirror(
        &self,
        kind: AssetKind,
        creator: &Creator,
        media_id: &str,
        source_url: &str,
    ) -> Result<AssetRecord, FetchError> {
        self.mirror_with(kind, creator, media_id, source_url, None)
            .await
    }

    /// Like [`AssetMirror::mirror`], but videos first try the session's
    /// platform-aware download.
    pub async fn mirror_with(
        &self,
        kind: AssetKind,
        creator: &Creator,
        media_id: &str,
        source_url: &str,
        fast_path: Option<&dyn Session>,
    ) -> Result<AssetRecord, FetchError> {
        let _guard = self
            .locks
            .acquire(AssetKey {
                kind,
                creator: creator.clone(),
                file_stem: sanitize_component(media_id),
            })
            .await;

        let path = self.layout.asset_path(kind, creator, media_id);
        if let Some(size) = existing_size(&path).await? {
            debug!(creator = %creator, media_id, %kind, size, "cache hit");
            return Ok(self.layout.asset_record(kind, creator, media_id, size));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if kind == AssetKind::Video
            && let Some(session) = fast_path
            && let Some(size) = self.fetch_via_session(session, creator, media_id, &path).await?
        {
            info!(creator = %creator, media_id, %kind, size, "mirrored via upstream session");
            return Ok(self.layout.asset_record(kind, creator, media_id, size));
        }

        let size = self.fetch_http(kind, source_url, &path).await?;
        info!(creator = %creator, media_id, %kind, size, "mirrored over http");
        Ok(self.layout.asset_record(kind, creator, media_id, size))
    }

    /// `Ok(None)` is a soft failure: the caller moves on to plain HTTP.
    async fn fetch_via_session(
        &self,
        session: &dyn Session,
        creator: &Creator,
        media_id: &str,
        path: &Path,
    ) -> Result<Option<u64>, FetchError> {
        let call = session.fetch_media_bytes(media_id);
        let bytes = match tokio::time::timeout(self.options.fast_path_timeout, call).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(UpstreamError::Unsupported)) => return Ok(None),
            Ok(Err(err)) => {
                warn!(creator = %creator, media_id, stage = "mirror_video", error = %err, "upstream download failed, falling back to http");
                return Ok(None);
            }
            Err(_) => {
                warn!(creator = %creator, media_id, stage = "mirror_video", "upstream download timed out, falling back to http");
                return Ok(None);
            }
        };

        let size = bytes.len() as u64;
        if size < self.options.min_fast_path_bytes {
            warn!(
                creator = %creator,
                media_id,
                stage = "mirror_video",
                size,
                minimum = self.options.min_fast_path_bytes,
                "upstream download suspiciously small, falling back to http"
            );
            return Ok(None);
        }

        let (file, temp_path) = partial_file(path)?.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        temp_path.persist(path)?;
        Ok(Some(size))
    }

    async fn fetch_http(&self, kind: AssetKind, url: &str, path: &Path) -> Result<u64, FetchError> {
        let mut attempt = 1;
        loop {
            match self.fetch_once(kind, url, path).await {
                Ok(size) => return Ok(size),
                Err(err) if err.is_retryable() && attempt < self.options.attempts => {
                    debug!(url, attempt, error = %err, "retrying download");
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64))
                        .await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn fetch_once(&self, kind: AssetKind, url: &str, path: &Path) -> Result<u64, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);
        check_media_type(kind, content_type.as_deref(), url)?;
        let expected = response.content_length();

        // Dropping `temp_path` on any early return deletes the partial file.
        let (file, temp_path) = partial_file(path)?.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut received = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if received == 0 {
            return Err(FetchError::Empty);
        }
        if let Some(expected) = expected
            && expected != received
        {
            return Err(FetchError::Truncated { expected, received });
        }
        temp_path.persist(path)?;
        Ok(received)
    }
}

async fn existing_size(path: &Path) -> std::io::Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn partial_file(path: &Path) -> std::io::Result<NamedTempFile> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tempfile::Builder::new()
        .prefix(".")
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(dir)
}

/// Accepts a declared media type of the right family. Generic binary or
/// missing types fall back to guessing from the URL's path.
fn check_media_type(kind: AssetKind, declared: Option<&str>, url: &str) -> Result<(), FetchError> {
    let family = kind.accepted_top_level();
    let essence = declared.map(|value| {
        value
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    });
    let rejected = |content_type: Option<String>| FetchError::NotMedia {
        expected: kind,
        content_type: content_type.unwrap_or_else(|| "none".to_string()),
    };

    match essence.as_deref() {
        Some(essence) if essence.split('/').next() == Some(family) => Ok(()),
        None | Some("") | Some("application/octet-stream") | Some("binary/octet-stream") => {
            let guessed = url::Url::parse(url)
                .ok()
                .and_then(|parsed| mime_guess::from_path(parsed.path()).first());
            if guessed.is_some_and(|mime| mime.type_().as_str() == family) {
                Ok(())
            } else {
                Err(rejected(essence))
            }
        }
        Some(_) => Err(rejected(essence)),
    }
}
