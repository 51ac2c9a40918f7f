use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use freeze_core::config::FreezeOptions;
use freeze_core::graph::GraphTracker;
use freeze_core::rewrite;

/// Resolve and rewrite Mach-O dependency references within an already
/// assembled application bundle.
///
/// This is a thin harness over `freeze_core`: it does not decide which
/// files belong in the bundle (that is the out-of-scope package/finder
/// driver) — it walks whatever is already on disk under `bundle_dir`,
/// builds the dependency graph, finalizes unresolved `@rpath` references,
/// and rewrites install names to `@loader_path`-relative tokens.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Opt {
    /// Root directory of the already-copied bundle to rewrite in place.
    bundle_dir: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print a JSON summary of the resolved graph to stdout instead of
    /// rewriting anything.
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    options: FreezeOptions,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    init_tracing(opt.verbose);

    let mut graph = GraphTracker::new();
    for entry in walkdir::WalkDir::new(&opt.bundle_dir) {
        let entry = entry.with_context(|| {
            format!("failed to walk bundle directory {}", opt.bundle_dir.display())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        graph
            .record_copy(path, path, None, &opt.options)
            .with_context(|| format!("failed to register {}", path.display()))?;
    }

    tracing::info!(file_count = graph.len(), "registered bundle files");

    graph
        .finalize()
        .context("failed to finalize dependency graph")?;

    if opt.verbose > 0 {
        tracing::debug!("{}", graph.dump_tree());
    }

    if opt.json {
        let summary = graph.summarize();
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    rewrite::rewrite_all(&mut graph).context("failed to rewrite install names")?;

    Ok(())
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
