mod console;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tagsync_adapters::{
    load_snapshot_bundle, DirectorySource, MemoryPatchSink, PatchSink, RecordSource, Snapshot,
    StorePatchSink,
};
use tagsync_storage::TargetStore;
use tagsync_sync::{
    DeferAll, MatchResolver, PatchReviewer, ReconcileStatus, Scorer, SkipAmbiguous, SyncConfig,
    SyncPipeline, SyncRules, TakeBest,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::console::{ConsoleResolver, ConsoleReviewer};

#[derive(Debug, Parser)]
#[command(name = "tagsync")]
#[command(about = "Link and reconcile tagged records against an authoritative dataset")]
struct Cli {
    /// Data directory holding `authoritative/` bundles and the `target/` store.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// YAML rules file with scoring, linkage and merge sections.
    #[arg(long, global = true)]
    rules: Option<PathBuf>,
    /// Print the run summary as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Ambiguous {
    Prompt,
    Skip,
    Best,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Link current authoritative records to target records.
    Link {
        #[arg(long, value_enum, default_value_t = Ambiguous::Prompt)]
        ambiguous: Ambiguous,
        /// Report only; leave the target store untouched.
        #[arg(long)]
        dry_run: bool,
    },
    /// Fold changes between the previous and current snapshot into linked targets.
    Reconcile {
        /// Defer every update instead of prompting.
        #[arg(long)]
        batch: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the score breakdown for one authoritative/target pair.
    Score {
        #[arg(long)]
        source: String,
        #[arg(long)]
        target: String,
    },
    /// Seed the target store from a snapshot bundle.
    Import {
        #[arg(long)]
        bundle: PathBuf,
        /// Replace a non-empty store.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if cli.rules.is_some() {
        config.rules_path = cli.rules;
    }
    let rules = SyncRules::load(config.rules_path.as_deref())?;
    let source = DirectorySource::new(&config.data_dir);

    match cli.command {
        Commands::Link { ambiguous, dry_run } => {
            let (store_sink, sink) = open_sink(&source, dry_run).await?;
            let pipeline = SyncPipeline::new(rules, Arc::new(source), sink).with_tag_links(config.tag_links);
            let mut resolver: Box<dyn MatchResolver> = match ambiguous {
                Ambiguous::Prompt => Box::new(ConsoleResolver),
                Ambiguous::Skip => Box::new(SkipAmbiguous),
                Ambiguous::Best => Box::new(TakeBest),
            };
            let summary = pipeline.run_link(resolver.as_mut()).await?;
            if summary.tagged > 0 {
                persist(store_sink.as_deref()).await?;
            }
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", summary.summary_line());
            }
        }
        Commands::Reconcile { batch, dry_run } => {
            let (store_sink, sink) = open_sink(&source, dry_run).await?;
            let pipeline = SyncPipeline::new(rules, Arc::new(source), sink);
            let mut reviewer: Box<dyn PatchReviewer> = if batch || config.batch {
                Box::new(DeferAll)
            } else {
                Box::new(ConsoleReviewer)
            };
            let summary = pipeline.run_reconcile(reviewer.as_mut()).await?;
            if summary.count(ReconcileStatus::Applied) > 0 {
                persist(store_sink.as_deref()).await?;
            }
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for entry in &summary.entries {
                    for conflict in &entry.conflicts {
                        println!("{}: {conflict}", entry.key);
                    }
                }
                println!("{}", summary.summary_line());
            }
        }
        Commands::Score {
            source: source_id,
            target: target_id,
        } => {
            let scorer = Scorer::new(rules.scoring);
            let id_key = scorer.weights().id_key.clone();
            let records = source.authoritative(Snapshot::Current).await?;
            let record = records
                .iter()
                .find(|e| e.tag(&id_key) == Some(source_id.as_str()) || e.id.as_deref() == Some(source_id.as_str()))
                .with_context(|| format!("no authoritative record `{source_id}`"))?;
            let targets = source.targets().await?;
            let target = targets
                .iter()
                .find(|e| e.id.as_deref() == Some(target_id.as_str()))
                .with_context(|| format!("no target record `{target_id}`"))?;
            let breakdown = scorer.score_breakdown(record, target);
            println!("{}", serde_json::to_string_pretty(&breakdown)?);
            println!("total {}", breakdown.total());
        }
        Commands::Import { bundle, force } => {
            let root = source.target_store_root();
            let existing = TargetStore::open(&root).await?;
            if !existing.is_empty() && !force {
                bail!(
                    "target store at {} already holds {} entities; pass --force to replace it",
                    root.display(),
                    existing.len()
                );
            }
            let bundle = load_snapshot_bundle(&bundle)?;
            let entities = bundle.to_entities()?;
            let saved = TargetStore::from_entities(&root, entities)
                .save(bundle.captured_at)
                .await?;
            println!(
                "imported {} entities from {} into {}",
                bundle.entities.len(),
                bundle.dataset,
                saved.absolute_path.display()
            );
        }
    }

    Ok(())
}

/// The store-backed sink, or a recording sink for dry runs.
async fn open_sink(
    source: &DirectorySource,
    dry_run: bool,
) -> Result<(Option<Arc<StorePatchSink>>, Arc<dyn PatchSink>)> {
    if dry_run {
        let sink: Arc<dyn PatchSink> = Arc::new(MemoryPatchSink::new());
        return Ok((None, sink));
    }
    let store = TargetStore::open(source.target_store_root()).await?;
    let store_sink = Arc::new(StorePatchSink::new(store));
    let sink: Arc<dyn PatchSink> = store_sink.clone();
    Ok((Some(store_sink), sink))
}

async fn persist(sink: Option<&StorePatchSink>) -> Result<()> {
    let Some(sink) = sink else {
        return Ok(());
    };
    let store = sink.lock().await;
    let saved = store.save(Utc::now()).await?;
    info!(
        path = %saved.relative_path.display(),
        modified = store.modified().len(),
        deduplicated = saved.deduplicated,
        "target store saved"
    );
    Ok(())
}
