#![forbid(unsafe_code)]

//! Nightly job: refreshes the mirror and feed of every creator in the
//! subscriber list. Exits non-zero only when the configuration is unusable;
//! creator failures are reported in the summary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use reelfeed_tools::{
    batch::{BatchRunner, load_subscribers},
    cli::{CommonArgs, positive_count},
    config::{SettingsOverrides, resolve_settings},
    init_logging,
    pipeline::{CreatorOutcome, PipelineContext},
};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(version, about = "Refresh the mirror and feed of every subscribed creator")]
struct RoutineArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Subscriber list, one creator handle per line
    #[arg(long, value_name = "PATH")]
    subscribers: Option<PathBuf>,

    /// Creators processed at the same time
    #[arg(long, value_name = "N", value_parser = positive_count())]
    concurrency: Option<usize>,
}

impl RoutineArgs {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            subscribers_file: self.subscribers.clone(),
            concurrency: self.concurrency,
            ..self.common.overrides()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args = RoutineArgs::parse();
    let settings = resolve_settings(args.overrides()).context("loading configuration")?;
    let subscribers = load_subscribers(&settings.subscribers_file)
        .context("loading subscriber list")?;
    let context = PipelineContext::from_settings(&settings).context("preparing pipeline")?;
    context
        .layout()
        .prepare()
        .context("preparing media directories")?;
    let swept = context.layout().sweep_partial_downloads();

    println!("===================================");
    println!("Creator Feed Refresh");
    println!("===================================");
    println!("Media root: {}", settings.media_root.display());
    println!("Public base: {}", settings.public_base_url);
    println!("Subscribers: {}", settings.subscribers_file.display());
    if swept > 0 {
        println!("Removed {swept} stale partial download(s)");
    }
    println!();

    if subscribers.is_empty() {
        println!(
            "No creators listed in {}.",
            settings.subscribers_file.display()
        );
        return Ok(());
    }
    println!("Found {} creator(s) to refresh.", subscribers.len());
    println!();

    let runner = BatchRunner::new(Arc::new(context), settings.concurrency);
    let summary = tokio::select! {
        summary = runner.run(&subscribers) => summary,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling in-flight creators");
            println!("Interrupted.");
            return Ok(());
        }
    };

    for report in &summary.reports {
        match &report.outcome {
            CreatorOutcome::Done {
                entries,
                degraded,
                dropped,
            } => println!(
                "  @{}: {entries} entries, {degraded} degraded, {dropped} dropped",
                report.creator
            ),
            CreatorOutcome::Unchanged => println!("  @{}: up to date", report.creator),
            CreatorOutcome::Failed { reason } => {
                println!("  @{}: FAILED ({reason})", report.creator)
            }
        }
    }

    println!();
    println!("===================================");
    println!("Refresh complete!");
    println!("===================================");
    println!(
        "Succeeded: {} ({} unchanged)",
        summary.succeeded(),
        summary.unchanged()
    );
    println!("Failed: {}", summary.failed());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<RoutineArgs, clap::Error> {
        RoutineArgs::try_parse_from(std::iter::once("routine_update").chain(args.iter().copied()))
    }

    #[test]
    fn parses_split_and_inline_values() {
        let overrides = parse(&[
            "--media-root",
            "/srv/reels",
            "--public-base-url=https://cdn.example.com/reels",
            "--subscribers=/etc/reelfeed/subscribers.txt",
            "--concurrency",
            "3",
            "--limit=5",
            "--force",
        ])
        .unwrap()
        .overrides();
        assert_eq!(overrides.media_root, Some(PathBuf::from("/srv/reels")));
        assert_eq!(
            overrides.public_base_url.as_deref(),
            Some("https://cdn.example.com/reels")
        );
        assert_eq!(
            overrides.subscribers_file,
            Some(PathBuf::from("/etc/reelfeed/subscribers.txt"))
        );
        assert_eq!(overrides.concurrency, Some(3));
        assert_eq!(overrides.item_limit, Some(5));
        assert_eq!(overrides.force_refresh, Some(true));
    }

    #[test]
    fn no_arguments_leave_everything_to_configuration() {
        assert_eq!(parse(&[]).unwrap().overrides(), SettingsOverrides::default());
    }

    #[test]
    fn rejects_unknown_and_incomplete_arguments() {
        assert!(parse(&["--bogus"]).is_err());
        assert!(parse(&["alice"]).is_err());
        assert!(parse(&["--media-root"]).is_err());
        assert!(parse(&["--force=yes"]).is_err());
    }

    #[test]
    fn counts_must_be_positive() {
        assert!(parse(&["--concurrency=0"]).is_err());
        assert!(parse(&["--limit", "many"]).is_err());
    }

    #[test]
    fn command_definition_is_consistent() {
        use clap::CommandFactory;
        RoutineArgs::command().debug_assert();
    }
}
