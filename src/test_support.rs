#![forbid(unsafe_code)]

//! Fixtures shared by the in-crate tests: a local media server, an in-memory
//! upstream and a stand-in browser.

use std::collections::HashMap;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::layout::StorageLayout;
use crate::model::Creator;
use crate::upstream::{RawPost, Session, SessionOptions, Upstream, UpstreamError};

pub const VIDEO_BYTES: &[u8] = b"\x00\x00\x00\x18ftypmp42\x00\x00\x00\x00mp42isom fake video payload";
pub const COVER_BYTES: &[u8] = b"\xff\xd8\xff\xe0 fake jpeg cover";
pub const PUBLIC_BASE: &str = "https://cdn.example.com/reels/";

pub fn layout_in(root: &Path) -> StorageLayout {
    StorageLayout::with_root(root, Url::parse(PUBLIC_BASE).unwrap())
}

#[derive(Clone, Default)]
struct Hits(Arc<Mutex<HashMap<String, usize>>>);

impl Hits {
    fn record(&self, uri: &Uri) -> usize {
        let mut hits = self.0.lock();
        let count = hits.entry(uri.path().to_string()).or_default();
        *count += 1;
        *count
    }
}

/// Local HTTP server on an ephemeral port that counts requests per path.
pub struct MediaServer {
    base: String,
    hits: Hits,
    handle: tokio::task::JoinHandle<()>,
}

impl MediaServer {
    pub async fn spawn() -> Self {
        let hits = Hits::default();
        let app = Router::new()
            .route("/video.mp4", get(video))
            .route("/slow.mp4", get(slow_video))
            .route("/stream.mp4", get(streamed_video))
            .route("/flaky.mp4", get(flaky_video))
            .route("/always-500.mp4", get(server_error))
            .route("/missing.mp4", get(not_found))
            .route("/page", get(html_page))
            .route("/cover.jpg", get(cover))
            .route("/cover-page", get(html_page))
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("http://{addr}"),
            hits,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.0.lock().get(path).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.0.lock().values().sum()
    }
}

impl Drop for MediaServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn video(State(hits): State<Hits>, uri: Uri) -> Response {
    hits.record(&uri);
    ([(header::CONTENT_TYPE, "video/mp4")], VIDEO_BYTES).into_response()
}

async fn slow_video(State(hits): State<Hits>, uri: Uri) -> Response {
    hits.record(&uri);
    tokio::time::sleep(Duration::from_millis(150)).await;
    ([(header::CONTENT_TYPE, "video/mp4")], VIDEO_BYTES).into_response()
}

async fn streamed_video(State(hits): State<Hits>, uri: Uri) -> Response {
    hits.record(&uri);
    let body = Body::from_stream(ReaderStream::with_capacity(
        std::io::Cursor::new(VIDEO_BYTES),
        8,
    ));
    ([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response()
}

async fn flaky_video(State(hits): State<Hits>, uri: Uri) -> Response {
    if hits.record(&uri) == 1 {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([(header::CONTENT_TYPE, "video/mp4")], VIDEO_BYTES).into_response()
}

async fn server_error(State(hits): State<Hits>, uri: Uri) -> StatusCode {
    hits.record(&uri);
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn not_found(State(hits): State<Hits>, uri: Uri) -> StatusCode {
    hits.record(&uri);
    StatusCode::NOT_FOUND
}

async fn html_page(State(hits): State<Hits>, uri: Uri) -> Response {
    hits.record(&uri);
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        "<html><body>login required</body></html>",
    )
        .into_response()
}

async fn cover(State(hits): State<Hits>, uri: Uri) -> Response {
    hits.record(&uri);
    ([(header::CONTENT_TYPE, "image/jpeg")], COVER_BYTES).into_response()
}

/// In-memory upstream. Creators without a listing are blocked, as are
/// empty listings.
#[derive(Clone, Default)]
pub struct FakeUpstream {
    listings: HashMap<String, Vec<Value>>,
    refused_sessions: usize,
    sessions: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

impl FakeUpstream {
    pub fn with_listing(mut self, creator: &str, posts: Vec<Value>) -> Self {
        self.listings.insert(creator.to_string(), posts);
        self
    }

    /// The first `count` session attempts fail as blocked.
    pub fn refusing_first_sessions(mut self, count: usize) -> Self {
        self.refused_sessions = count;
        self
    }

    /// Session attempts, refused ones included.
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn establish_session(
        &self,
        _options: &SessionOptions,
    ) -> Result<Box<dyn Session>, UpstreamError> {
        let attempt = self.sessions.fetch_add(1, Ordering::SeqCst);
        if attempt < self.refused_sessions {
            return Err(UpstreamError::Blocked("captcha wall".into()));
        }
        Ok(Box::new(FakeSession {
            listings: self.listings.clone(),
            media: None,
            releases: self.releases.clone(),
        }))
    }
}

pub struct FakeSession {
    listings: HashMap<String, Vec<Value>>,
    media: Option<Vec<u8>>,
    releases: Arc<AtomicUsize>,
}

impl FakeSession {
    /// Session whose fast path returns `bytes` for every media id.
    pub fn with_media(bytes: Vec<u8>) -> Self {
        Self {
            listings: HashMap::new(),
            media: Some(bytes),
            releases: Arc::default(),
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn list_recent_posts(
        &self,
        creator: &Creator,
        limit: usize,
    ) -> Result<Vec<RawPost>, UpstreamError> {
        let posts = self
            .listings
            .get(creator.handle())
            .ok_or_else(|| UpstreamError::Blocked(format!("no access to @{creator}")))?;
        if posts.is_empty() {
            return Err(UpstreamError::Blocked(format!("empty listing for @{creator}")));
        }
        Ok(posts.iter().take(limit).cloned().map(RawPost::Record).collect())
    }

    async fn fetch_media_bytes(&self, _media_id: &str) -> Result<Vec<u8>, UpstreamError> {
        self.media.clone().ok_or(UpstreamError::Unsupported)
    }

    async fn release(self: Box<Self>) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Writes a fake browser that copies `screenshot` to whatever path it is
/// handed via `--screenshot=` and logs its arguments next to itself.
pub fn install_browser_stub(dir: &Path, screenshot: &Path) -> PathBuf {
    let script_path = dir.join("fake-browser");
    let script = format!(
        r#"#!/usr/bin/env bash
set -eu
out=""
for arg in "$@"; do
  case "$arg" in
    --screenshot=*) out="${{arg#--screenshot=}}" ;;
  esac
done
echo "$@" >> "{log}"
[ -n "$out" ] || exit 2
cp "{screenshot}" "$out"
"#,
        log = dir.join("browser-args.log").display(),
        screenshot = screenshot.display(),
    );
    fs::write(&script_path, script).unwrap();
    #[cfg(unix)]
    fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755)).unwrap();
    script_path
}

/// Small PNG to serve as the stub browser's screenshot.
pub fn write_test_png(path: &Path) {
    image::RgbImage::from_pixel(16, 24, image::Rgb([200, 40, 90]))
        .save(path)
        .unwrap();
}

/// `(url, length)` of each item's enclosure, in feed order.
pub fn feed_enclosures(xml: &[u8]) -> Vec<Option<(String, Option<u64>)>> {
    let parsed = feed_rs::parser::parse(xml).unwrap();
    parsed
        .entries
        .iter()
        .map(|entry| {
            entry
                .media
                .iter()
                .flat_map(|media| &media.content)
                .find_map(|content| {
                    content
                        .url
                        .as_ref()
                        .map(|url| (url.to_string(), content.size))
                })
        })
        .collect()
}
