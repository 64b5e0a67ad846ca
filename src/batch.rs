#![forbid(unsafe_code)]

//! Runs one pipeline per subscribed creator and tallies the results.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::model::Creator;
use crate::pipeline::{CreatorOutcome, CreatorReport, PipelineContext, run_creator};

/// Reads the subscriber list: one handle per line, `#` comments and blank
/// lines ignored, duplicates dropped keeping the first occurrence.
pub fn load_subscribers(path: &Path) -> Result<Vec<String>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut seen = HashSet::new();
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| seen.insert(line.trim_start_matches('@').to_ascii_lowercase()))
        .map(str::to_string)
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// One report per listed creator, in list order.
    pub reports: Vec<CreatorReport>,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.reports
            .iter()
            .filter(|report| report.outcome.is_success())
            .count()
    }

    pub fn unchanged(&self) -> usize {
        self.reports
            .iter()
            .filter(|report| report.outcome == CreatorOutcome::Unchanged)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.reports.len() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.reports.iter().filter_map(|report| match &report.outcome {
            CreatorOutcome::Failed { reason } => Some((report.creator.as_str(), reason.as_str())),
            _ => None,
        })
    }
}

pub struct BatchRunner {
    context: Arc<PipelineContext>,
    concurrency: usize,
}

impl BatchRunner {
    pub fn new(context: Arc<PipelineContext>, concurrency: usize) -> Self {
        Self {
            context,
            concurrency: concurrency.max(1),
        }
    }

    /// Every creator reaches a terminal state; none can stop the others.
    /// Dropping the returned future cancels in-flight pipelines, which kills
    /// their helper processes.
    pub async fn run(&self, handles: &[String]) -> BatchSummary {
        info!(creators = handles.len(), concurrency = self.concurrency, "starting batch");
        let reports: Vec<CreatorReport> = stream::iter(handles)
            .map(|handle| self.run_one(handle))
            .buffered(self.concurrency)
            .collect()
            .await;
        BatchSummary { reports }
    }

    async fn run_one(&self, handle: &str) -> CreatorReport {
        match Creator::parse(handle) {
            Ok(creator) => run_creator(&self.context, creator).await,
            Err(err) => {
                warn!(creator = handle, error = %err, "skipping invalid handle");
                CreatorReport {
                    creator: handle.to_string(),
                    outcome: CreatorOutcome::Failed {
                        reason: err.to_string(),
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::{AssetMirror, MirrorOptions, http_client};
    use crate::model::PlatformUrls;
    use crate::test_support::{FakeUpstream, MediaServer, layout_in};
    use crate::thumbnail::ThumbnailRenderer;
    use crate::upstream::SessionOptions;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn subscriber_list_skips_comments_and_duplicates() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let path = temp.path().join("subscribers.txt");
        fs::write(&path, "# creators\nalice\n\n  @bob \nAlice\n@alice\ncarol\n")?;
        assert_eq!(load_subscribers(&path)?, ["alice", "@bob", "carol"]);
        Ok(())
    }

    #[test]
    fn missing_subscriber_list_is_a_config_error() {
        let err = load_subscribers(Path::new("/nonexistent/subscribers.txt")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    fn post(server: &MediaServer, id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "desc": format!("post {id}"),
            "createTime": 1_700_000_000,
            "video": {"playAddr": server.url("/video.mp4")}
        })
    }

    fn context_for(upstream: FakeUpstream, root: &Path) -> anyhow::Result<Arc<PipelineContext>> {
        let timeout = Duration::from_secs(5);
        Ok(Arc::new(PipelineContext {
            upstream: Arc::new(upstream),
            mirror: AssetMirror::new(
                http_client(timeout, None)?,
                layout_in(root),
                MirrorOptions {
                    attempts: 1,
                    min_fast_path_bytes: 1024,
                    fast_path_timeout: timeout,
                },
            ),
            renderer: ThumbnailRenderer::new("/nonexistent/browser", true, None, timeout),
            platform: PlatformUrls::new("https://www.tiktok.com"),
            session_options: SessionOptions {
                credential: "token".into(),
                headless: true,
                force_refresh: false,
                proxy: None,
                timeout,
            },
            item_limit: 10,
            force_refresh: false,
        }))
    }

    fn handles(list: &[&str]) -> Vec<String> {
        list.iter().map(|handle| handle.to_string()).collect()
    }

    fn feed_entries(context: &PipelineContext, handle: &str) -> anyhow::Result<usize> {
        let path = context.layout().feed_path(&Creator::parse(handle)?);
        Ok(feed_rs::parser::parse(fs::read(path)?.as_slice())?.entries.len())
    }

    #[tokio::test]
    async fn one_blocked_creator_does_not_stop_the_rest() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let server = MediaServer::spawn().await;
        let upstream = FakeUpstream::default()
            .with_listing("alice", vec![post(&server, "1")])
            .with_listing("carol", vec![post(&server, "2"), post(&server, "3")]);
        let context = context_for(upstream.clone(), temp.path())?;
        let runner = BatchRunner::new(context.clone(), 2);

        let summary = runner
            .run(&handles(&["blocked", "alice", "not/valid", "carol"]))
            .await;

        assert_eq!(summary.reports.len(), 4);
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.failed(), 2);
        let failed: Vec<&str> = summary.failures().map(|(creator, _)| creator).collect();
        assert_eq!(failed, ["blocked", "not/valid"]);
        assert_eq!(upstream.sessions(), 3);
        assert_eq!(upstream.releases(), 3);
        assert_eq!(feed_entries(&context, "alice")?, 1);
        assert_eq!(feed_entries(&context, "carol")?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn refused_session_does_not_stop_later_creators() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let server = MediaServer::spawn().await;
        let upstream = FakeUpstream::default()
            .with_listing("dave", vec![post(&server, "9")])
            .with_listing("alice", vec![post(&server, "1")])
            .with_listing("carol", vec![post(&server, "2"), post(&server, "3")])
            .refusing_first_sessions(1);
        let context = context_for(upstream.clone(), temp.path())?;
        // One at a time so the refused session is dave's.
        let runner = BatchRunner::new(context.clone(), 1);

        let summary = runner.run(&handles(&["dave", "alice", "carol"])).await;

        assert_eq!(
            summary.failures().collect::<Vec<_>>(),
            [("dave", "session: upstream blocked access: captcha wall")]
        );
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(upstream.sessions(), 3);
        assert_eq!(upstream.releases(), 2);
        assert!(!context.layout().feed_path(&Creator::parse("dave")?).exists());
        assert_eq!(feed_entries(&context, "alice")?, 1);
        assert_eq!(feed_entries(&context, "carol")?, 2);
        Ok(())
    }

    #[test]
    fn summary_counts_unchanged_as_success() {
        let summary = BatchSummary {
            reports: vec![
                CreatorReport {
                    creator: "a".into(),
                    outcome: CreatorOutcome::Unchanged,
                },
                CreatorReport {
                    creator: "b".into(),
                    outcome: CreatorOutcome::Done {
                        entries: 3,
                        degraded: 0,
                        dropped: 0,
                    },
                },
                CreatorReport {
                    creator: "c".into(),
                    outcome: CreatorOutcome::Failed {
                        reason: "enumerate: blocked".into(),
                    },
                },
            ],
        };
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.unchanged(), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.failures().collect::<Vec<_>>(), [("c", "enumerate: blocked")]);
    }
}
