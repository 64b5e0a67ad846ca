#![forbid(unsafe_code)]

//! Mirrors a single creator and rewrites their feed. Handy for re-running
//! one creator after a failure shows up in the nightly summary.

use anyhow::{Context, Result};
use clap::Parser;
use reelfeed_tools::{
    cli::CommonArgs,
    config::resolve_settings,
    init_logging,
    model::Creator,
    pipeline::{CreatorOutcome, PipelineContext, run_creator},
};

#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(version, about = "Mirror one creator and rewrite their feed")]
struct MirrorArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Creator handle, with or without the leading `@`
    #[arg(value_parser = Creator::parse)]
    creator: Creator,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let MirrorArgs { common, creator } = MirrorArgs::parse();
    let settings = resolve_settings(common.overrides()).context("loading configuration")?;
    let context = PipelineContext::from_settings(&settings).context("preparing pipeline")?;
    context
        .layout()
        .prepare()
        .context("preparing media directories")?;
    context.layout().sweep_partial_downloads();

    println!("===================================");
    println!("Creator Mirror");
    println!("===================================");
    println!("Creator: @{creator}");
    println!("Media root: {}", settings.media_root.display());
    println!("Feed: {}", context.layout().feed_public_url(&creator));
    println!();

    let feed_path = context.layout().feed_path(&creator);
    let report = run_creator(&context, creator).await;

    println!();
    println!("===================================");
    match &report.outcome {
        CreatorOutcome::Done {
            entries,
            degraded,
            dropped,
        } => {
            println!("Mirror complete!");
            println!("===================================");
            println!("Entries: {entries} ({degraded} degraded, {dropped} dropped)");
            println!("Feed file: {}", feed_path.display());
        }
        CreatorOutcome::Unchanged => {
            println!("Feed already up to date");
            println!("===================================");
            println!("Use --force to rebuild it anyway.");
        }
        CreatorOutcome::Failed { reason } => {
            println!("Mirror failed");
            println!("===================================");
            println!("Reason: {reason}");
        }
    }

    Ok(())
}
