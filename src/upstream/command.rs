#![forbid(unsafe_code)]

//! Upstream adapter that shells out to a helper program.
//!
//! The helper owns the platform handshake (tokens, browser fingerprinting)
//! and speaks a tiny CLI protocol:
//!
//! - `<program> session <dir>`: prepare a session, keeping any cookies in `dir`
//! - `<program> list <creator> <limit>`: print the listing as JSON on stdout
//! - `<program> media <media_id>`: print the raw video bytes on stdout
//!
//! Exit status 3 means the platform blocked the request. Options travel as
//! environment variables so secrets never show up in process listings.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{RawPost, Session, SessionOptions, Upstream, UpstreamError, posts_from_listing};
use crate::model::Creator;

/// Exit status the helper uses to report a block.
pub const BLOCKED_EXIT_CODE: i32 = 3;

#[derive(Debug, Clone)]
pub struct CommandUpstream {
    program: PathBuf,
}

impl CommandUpstream {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

#[async_trait]
impl Upstream for CommandUpstream {
    async fn establish_session(
        &self,
        options: &SessionOptions,
    ) -> Result<Box<dyn Session>, UpstreamError> {
        let scratch = tempfile::Builder::new()
            .prefix("reelfeed-session-")
            .tempdir()?;
        let session = CommandSession {
            program: self.program.clone(),
            options: options.clone(),
            scratch,
        };
        let dir = session.scratch.path().to_string_lossy().into_owned();
        match session.run(&["session", &dir]).await {
            Ok(_) => Ok(Box::new(session)),
            Err(err @ UpstreamError::Blocked(_)) => Err(err),
            Err(err) => Err(UpstreamError::Session(err.to_string())),
        }
    }
}

struct CommandSession {
    program: PathBuf,
    options: SessionOptions,
    /// Removed on release, or on drop if the pipeline is cancelled.
    scratch: TempDir,
}

impl CommandSession {
    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, UpstreamError> {
        run_helper(&self.program, args, &self.options, self.scratch.path()).await
    }
}

#[async_trait]
impl Session for CommandSession {
    async fn list_recent_posts(
        &self,
        creator: &Creator,
        limit: usize,
    ) -> Result<Vec<RawPost>, UpstreamError> {
        let stdout = self
            .run(&["list", creator.handle(), &limit.to_string()])
            .await?;
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(UpstreamError::Blocked(format!(
                "empty listing for @{creator}"
            )));
        }
        let payload: Value = serde_json::from_slice(&stdout)?;
        let mut posts = posts_from_listing(payload)?;
        if posts.is_empty() {
            return Err(UpstreamError::Blocked(format!(
                "empty listing for @{creator}"
            )));
        }
        posts.truncate(limit);
        Ok(posts)
    }

    async fn fetch_media_bytes(&self, media_id: &str) -> Result<Vec<u8>, UpstreamError> {
        self.run(&["media", media_id]).await
    }

    async fn release(self: Box<Self>) {
        let CommandSession { scratch, .. } = *self;
        let path = scratch.path().to_path_buf();
        if let Err(err) = scratch.close() {
            warn!(path = %path.display(), error = %err, "could not remove session scratch dir");
        }
    }
}

async fn run_helper(
    program: &Path,
    args: &[&str],
    options: &SessionOptions,
    scratch: &Path,
) -> Result<Vec<u8>, UpstreamError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .env("SESSION_CREDENTIAL", &options.credential)
        .env("RENDER_HEADLESS", flag(options.headless))
        .env("FORCE_REFRESH", flag(options.force_refresh))
        .env("REELFEED_SESSION_DIR", scratch)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(proxy) = &options.proxy {
        command.env("PROXY", proxy);
    }

    debug!(program = %program.display(), ?args, "running upstream helper");
    let child = command.spawn()?;
    let output = match tokio::time::timeout(options.timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => return Err(UpstreamError::Timeout(timeout_secs(options.timeout))),
    };

    if output.status.success() {
        return Ok(output.stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if output.status.code() == Some(BLOCKED_EXIT_CODE) {
        return Err(UpstreamError::Blocked(stderr));
    }
    Err(UpstreamError::Transport(format!(
        "{} {} exited with {}: {}",
        program.display(),
        args.first().copied().unwrap_or_default(),
        output.status,
        stderr
    )))
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

fn timeout_secs(timeout: Duration) -> u64 {
    timeout.as_secs().max(1)
}
