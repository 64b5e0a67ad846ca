#![forbid(unsafe_code)]

//! Renders a cover page through a headless browser and stores the capture as
//! a compressed JPEG.
//!
//! The browser is an external program driven over its command line, the same
//! way the downloader shells out to `yt-dlp`: `--screenshot=<file>` plus the
//! URL to capture.

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use image::{DynamicImage, ImageOutputFormat};
use tokio::process::Command;
use tracing::debug;

use crate::config::Settings;
use crate::layout::PARTIAL_SUFFIX;

/// Portrait viewport matching short-form video covers.
pub const DEFAULT_VIEWPORT: (u32, u32) = (720, 1280);
const JPEG_QUALITY: u8 = 80;
const SCREENSHOT_FILE: &str = "shot.png";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to launch browser {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("browser timed out after {0} seconds")]
    Timeout(u64),
    #[error("browser exited with {status}: {stderr}")]
    Browser { status: String, stderr: String },
    #[error("browser finished without writing a screenshot")]
    NoScreenshot,
    #[error("image conversion failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("render task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone)]
pub struct ThumbnailRenderer {
    program: PathBuf,
    headless: bool,
    proxy: Option<String>,
    timeout: Duration,
    viewport: (u32, u32),
}

impl ThumbnailRenderer {
    pub fn new(program: impl Into<PathBuf>, headless: bool, proxy: Option<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            headless,
            proxy,
            timeout,
            viewport: DEFAULT_VIEWPORT,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.browser,
            settings.render_headless,
            settings.proxy.clone(),
            settings.fetch_timeout,
        )
    }

    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.viewport = (width, height);
        self
    }

    /// Captures `cover_url` into `destination`, returning the stored size.
    /// An existing destination is kept as is.
    pub async fn render_thumbnail(&self, cover_url: &str, destination: &Path) -> Result<u64, RenderError> {
        if let Ok(meta) = tokio::fs::metadata(destination).await
            && meta.is_file()
        {
            debug!(path = %destination.display(), "thumbnail already present");
            return Ok(meta.len());
        }

        let workdir = tempfile::Builder::new()
            .prefix("reelfeed-render-")
            .tempdir()?;
        let screenshot = workdir.path().join(SCREENSHOT_FILE);
        self.capture(cover_url, &screenshot).await?;
        if !screenshot.is_file() {
            return Err(RenderError::NoScreenshot);
        }

        let destination = destination.to_path_buf();
        let size = tokio::task::spawn_blocking(move || store_as_jpeg(&screenshot, &destination))
            .await
            .map_err(|err| RenderError::Join(err.to_string()))??;
        drop(workdir);
        Ok(size)
    }

    async fn capture(&self, url: &str, screenshot: &Path) -> Result<(), RenderError> {
        let mut command = Command::new(&self.program);
        if self.headless {
            command.arg("--headless=new");
        }
        command
            .arg("--disable-gpu")
            .arg("--hide-scrollbars")
            .arg("--no-first-run")
            .arg(format!("--window-size={},{}", self.viewport.0, self.viewport.1));
        if let Some(proxy) = &self.proxy {
            command.arg(format!("--proxy-server={proxy}"));
        }
        command
            .arg(format!("--screenshot={}", screenshot.display()))
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program.display(), url, "rendering thumbnail");
        let child = command.spawn().map_err(|source| RenderError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| RenderError::Timeout(self.timeout.as_secs().max(1)))??;
        if !output.status.success() {
            return Err(RenderError::Browser {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn store_as_jpeg(screenshot: &Path, destination: &Path) -> Result<u64, RenderError> {
    let capture = image::open(screenshot)?;
    let mut encoded = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(capture.to_rgb8())
        .write_to(&mut encoded, ImageOutputFormat::Jpeg(JPEG_QUALITY))?;
    let bytes = encoded.into_inner();

    let parent = destination.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut temp = tempfile::Builder::new()
        .prefix(".")
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(parent)?;
    temp.write_all(&bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(destination).map_err(|err| err.error)?;
    Ok(bytes.len() as u64)
}
