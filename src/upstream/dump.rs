#![forbid(unsafe_code)]

//! Replays post listings captured earlier by an upstream dump script.
//!
//! Layout: `<dir>/<creator>.json` holds the listing and, optionally,
//! `<dir>/media/<media_id>.mp4` holds bytes for the fast download path.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{RawPost, Session, SessionOptions, Upstream, UpstreamError, posts_from_listing};
use crate::model::Creator;

const MEDIA_SUBDIR: &str = "media";

#[derive(Debug, Clone)]
pub struct DumpUpstream {
    dir: PathBuf,
}

impl DumpUpstream {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl Upstream for DumpUpstream {
    async fn establish_session(
        &self,
        _options: &SessionOptions,
    ) -> Result<Box<dyn Session>, UpstreamError> {
        match tokio::fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(Box::new(DumpSession {
                dir: self.dir.clone(),
            })),
            Ok(_) => Err(UpstreamError::Session(format!(
                "{} is not a directory",
                self.dir.display()
            ))),
            Err(err) => Err(UpstreamError::Session(format!(
                "{}: {err}",
                self.dir.display()
            ))),
        }
    }
}

struct DumpSession {
    dir: PathBuf,
}

#[async_trait]
impl Session for DumpSession {
    async fn list_recent_posts(
        &self,
        creator: &Creator,
        limit: usize,
    ) -> Result<Vec<RawPost>, UpstreamError> {
        let path = self.dir.join(format!("{}.json", creator.handle()));
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(UpstreamError::Blocked(format!(
                    "no dump for @{creator} at {}",
                    path.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };
        let payload: Value = serde_json::from_slice(&raw)?;
        let mut posts = posts_from_listing(payload)?;
        if posts.is_empty() {
            return Err(UpstreamError::Blocked(format!(
                "empty listing for @{creator}"
            )));
        }
        posts.truncate(limit);
        debug!(creator = %creator, count = posts.len(), "loaded dumped listing");
        Ok(posts)
    }

    async fn fetch_media_bytes(&self, media_id: &str) -> Result<Vec<u8>, UpstreamError> {
        let safe_id = crate::layout::sanitize_component(media_id);
        let path = self.dir.join(MEDIA_SUBDIR).join(format!("{safe_id}.mp4"));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(UpstreamError::Unsupported),
            Err(err) => Err(err.into()),
        }
    }

    async fn release(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn options() -> SessionOptions {
        SessionOptions {
            credential: "tok".into(),
            headless: true,
            force_refresh: false,
            proxy: None,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn lists_posts_up_to_limit() -> anyhow::Result<()> {
        let dir = tempdir()?;
        fs::write(
            dir.path().join("alice.json"),
            r#"[{"id":"1"},{"id":"2"},{"id":"3"}]"#,
        )?;
        let upstream = DumpUpstream::new(dir.path().to_path_buf());
        let session = upstream.establish_session(&options()).await?;
        let posts = session
            .list_recent_posts(&Creator::parse("alice")?, 2)
            .await?;
        assert_eq!(posts.len(), 2);
        session.release().await;
        Ok(())
    }

    #[tokio::test]
    async fn missing_dump_is_reported_as_blocked() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let upstream = DumpUpstream::new(dir.path().to_path_buf());
        let session = upstream.establish_session(&options()).await?;
        let err = session
            .list_recent_posts(&Creator::parse("ghost")?, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Blocked(_)));
        Ok(())
    }

    #[tokio::test]
    async fn empty_dump_is_reported_as_blocked() -> anyhow::Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("quiet.json"), "[]")?;
        let upstream = DumpUpstream::new(dir.path().to_path_buf());
        let session = upstream.establish_session(&options()).await?;
        let err = session
            .list_recent_posts(&Creator::parse("quiet")?, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Blocked(ref msg) if msg == "empty listing for @quiet"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_dump_dir_fails_session() {
        let upstream = DumpUpstream::new(PathBuf::from("/nonexistent/reelfeed-dumps"));
        let err = upstream.establish_session(&options()).await.err().unwrap();
        assert!(matches!(err, UpstreamError::Session(_)));
    }

    #[tokio::test]
    async fn fast_path_reads_media_bytes_when_present() -> anyhow::Result<()> {
        let dir = tempdir()?;
        fs::create_dir_all(dir.path().join(MEDIA_SUBDIR))?;
        fs::write(dir.path().join(MEDIA_SUBDIR).join("42.mp4"), b"bytes")?;
        let upstream = DumpUpstream::new(dir.path().to_path_buf());
        let session = upstream.establish_session(&options()).await?;
        assert_eq!(session.fetch_media_bytes("42").await?, b"bytes");
        assert!(matches!(
            session.fetch_media_bytes("43").await.unwrap_err(),
            UpstreamError::Unsupported
        ));
        Ok(())
    }
}
