use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{error, info, warn};

use nick_aggregator::config::AggregatorConfig;
use nick_aggregator::dedupe::DedupeMode;
use nick_aggregator::error::AggregatorError;
use nick_aggregator::export::{ExportFormat, Partition};
use nick_aggregator::layout::CacheLayout;
use nick_aggregator::menu::{self, StdinPrompt};
use nick_aggregator::orchestrator::Orchestrator;
use nick_aggregator::{logging, metrics};

#[derive(Parser)]
#[command(name = "nick_aggregator")]
#[command(about = "Aggregates and deduplicates nickname corpora")]
#[command(version)]
struct Cli {
    /// Path to the TOML source configuration
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Refresh cached downloads and artifacts
    #[arg(long, global = true)]
    force: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every configured source into the raw cache
    Download,
    /// Normalize raw sources into per-source nick tables
    Normalize,
    /// Split the normalized text into bounded chunk files
    Split {
        #[arg(long)]
        max_lines: Option<usize>,
    },
    /// Deduplicate normalized values
    Dedupe {
        #[arg(long, value_enum, default_value_t = ModeArg::Chunks)]
        mode: ModeArg,
    },
    /// Export the deduplicated set
    Export {
        #[arg(long, value_enum, default_value_t = FormatArg::All)]
        format: FormatArg,
        /// Values per line (streaming) or per read batch
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Run the full automated pipeline
    Run {
        #[arg(long, value_enum)]
        only: Option<PartitionArg>,
    },
    /// Remove stale caches, or everything outside the allow-list with --strict
    Clean {
        #[arg(long)]
        strict: bool,
        /// Skip the confirmation of a strict cleanup
        #[arg(long)]
        yes: bool,
        #[arg(long, default_value = ".")]
        root: PathBuf,
    },
    /// Interactive menu
    Menu,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Full,
    HighVolume,
    Chunks,
}

impl From<ModeArg> for DedupeMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => DedupeMode::Full,
            ModeArg::HighVolume => DedupeMode::HighVolume,
            ModeArg::Chunks => DedupeMode::Chunks,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Streaming,
    Original,
    Emails,
    Final,
    Nicknames,
    Passwords,
    All,
}

impl From<FormatArg> for ExportFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Streaming => ExportFormat::Streaming,
            FormatArg::Original => ExportFormat::Original,
            FormatArg::Emails => ExportFormat::Emails,
            FormatArg::Final => ExportFormat::Final,
            FormatArg::Nicknames => ExportFormat::Nicknames,
            FormatArg::Passwords => ExportFormat::Passwords,
            FormatArg::All => ExportFormat::All,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PartitionArg {
    Nicknames,
    Emails,
    Passwords,
}

impl From<PartitionArg> for Partition {
    fn from(partition: PartitionArg) -> Self {
        match partition {
            PartitionArg::Nicknames => Partition::Nicknames,
            PartitionArg::Emails => Partition::Emails,
            PartitionArg::Passwords => Partition::Passwords,
        }
    }
}

async fn run(cli: Cli, config: AggregatorConfig) -> anyhow::Result<()> {
    let mut orchestrator = Orchestrator::new(config, cli.force)?;

    match cli.command {
        Commands::Download => {
            println!("📥 Downloading sources...");
            let report = orchestrator.download().await?;
            println!("✅ {} sources ready", report.succeeded.len());
            if !report.failed.is_empty() {
                println!("\n⚠️  Failed sources:");
                for failed in &report.failed {
                    println!("   - {} ({}): {}", failed.slug, failed.locator, failed.message);
                }
            }
        }
        Commands::Normalize => {
            println!("🧾 Normalizing sources...");
            let report = orchestrator.normalize().await?;
            for artifact in &report.artifacts {
                println!("   {} -> {} values", artifact.slug, artifact.values);
            }
            for failure in &report.failures {
                println!("   ❌ {}: {}", failure.slug, failure.message);
            }
        }
        Commands::Split { max_lines } => {
            let report = orchestrator.split_normalized(max_lines).await?;
            println!("✂️  {} lines into {} chunks", report.lines, report.chunks.len());
        }
        Commands::Dedupe { mode } => {
            let report = orchestrator.deduplicate(mode.into()).await?;
            println!("🧹 {} unique entries -> {}", report.unique, report.path.display());
            if report.reused {
                println!("   (reused existing output, pass --force to rebuild)");
            }
            for failed in &report.read_failures {
                println!("   ⚠️  unreadable: {}", failed);
            }
        }
        Commands::Export { format, chunk_size } => {
            let summary = orchestrator.export(format.into(), chunk_size).await?;
            println!("📤 {} entries exported", summary.entries);
            for file in &summary.files {
                println!("   {}", file.display());
            }
        }
        Commands::Run { only } => {
            println!("🚀 Running full pipeline...");
            let stats = orchestrator.run_automated(only.map(Into::into)).await?;
            println!("{}", stats);
        }
        Commands::Clean { strict, yes, root } => {
            if !strict {
                let removed = orchestrator.clean_cache()?;
                println!("🗑️  Removed {} stale cache directories", removed.len());
            } else {
                let confirmed = yes || {
                    use menu::Prompt;
                    StdinPrompt
                        .ask(&format!("Delete everything in {} outside the allow-list? [y/N]: ", root.display()))
                        .map_or(false, |a| matches!(a.to_ascii_lowercase().as_str(), "y" | "yes"))
                };
                if !confirmed {
                    println!("Cleanup cancelled.");
                    return Ok(());
                }
                let report = orchestrator.clean_strict(&root)?;
                println!("🧽 {} removed, {} failed", report.removed.len(), report.failed.len());
                for failed in &report.failed {
                    warn!("Could not remove {}", failed.display());
                }
            }
        }
        Commands::Menu => {
            let root = std::env::current_dir().context("Failed to resolve working directory")?;
            menu::run_menu(&mut orchestrator, &mut StdinPrompt, &root).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = AggregatorConfig::load(&cli.config)
        .with_context(|| format!("Invalid configuration in {}", cli.config.display()))?;
    let layout = CacheLayout::new(&config.defaults.cache_dir);
    logging::init_logging(&layout.logs);
    metrics::init_metrics();
    info!("Loaded {} sources from {}", config.sources.len(), cli.config.display());

    match run(cli, config).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Some(AggregatorError::Interrupted) = e.downcast_ref::<AggregatorError>() {
                println!("\n⏹️  Interrupted; completed artifacts are kept and reused on the next run.");
                return Ok(());
            }
            error!("Command failed: {:#}", e);
            println!("❌ {:#}", e);
            Err(e)
        }
    }
}
