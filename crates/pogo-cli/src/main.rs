use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Utc};
use clap::{Args, Parser, Subcommand};
use pogo_core::DateWindow;
use pogo_digest::{CompileOptions, DigestCompiler, DigestOutputs};
use pogo_storage::read_library_summary;
use pogo_sync::{build_scheduler, BuilderConfig, LibraryBuilder};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pogo-cli")]
#[command(about = "Pokémon GO event library builder and digest compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// `--month` or an explicit `--start`/`--end`; defaults to the current month.
#[derive(Debug, Clone, Default, Args)]
struct WindowArgs {
    #[arg(long, conflicts_with_all = ["start", "end"])]
    month: Option<String>,
    #[arg(long, requires = "end")]
    start: Option<String>,
    #[arg(long, requires = "start")]
    end: Option<String>,
}

impl WindowArgs {
    fn resolve(&self) -> Result<Option<DateWindow>> {
        match (&self.month, &self.start, &self.end) {
            (Some(month), _, _) => Ok(Some(DateWindow::month(month)?)),
            (None, Some(start), Some(end)) => Ok(Some(DateWindow::from_bounds(start, end)?)),
            (None, None, None) => Ok(None),
            _ => bail!("--start and --end must be given together"),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Discover and fetch event pages into the library.
    Build {
        #[command(flatten)]
        window: WindowArgs,
        /// Library directory (overrides POGO_LIBRARY_DIR).
        #[arg(long)]
        out: Option<PathBuf>,
        /// Per-source candidate cap.
        #[arg(long)]
        max: Option<usize>,
        /// Replay `routes.json` from this directory instead of fetching live.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Compile the library into a workbook, calendar, and Parquet snapshots.
    Compile {
        #[arg(long = "lib")]
        library: Option<PathBuf>,
        #[arg(long, default_value = "pogo_digest.xlsx")]
        out: PathBuf,
        #[arg(long)]
        ics: Option<PathBuf>,
        #[arg(long)]
        parquet_dir: Option<PathBuf>,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Print the library's top-level manifest.
    Status {
        #[arg(long = "lib")]
        library: Option<PathBuf>,
    },
    /// Build then compile the current month on the configured cron until Ctrl-C.
    Schedule {
        #[arg(long, default_value = "pogo_digest.xlsx")]
        out: PathBuf,
        #[arg(long)]
        ics: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("POGO_LOG_JSON").is_ok_and(|v| v == "1") {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn current_month() -> Result<DateWindow> {
    let today = Utc::now().date_naive();
    Ok(DateWindow::month(&format!("{:04}-{:02}", today.year(), today.month()))?)
}

async fn build_once(config: BuilderConfig, window: &DateWindow) -> Result<()> {
    let summary = LibraryBuilder::from_config(config)?.run(window).await?;
    println!(
        "build complete: run_id={} window={} created={} updated={} unchanged={} failed={}",
        summary.run_id,
        summary.window,
        summary.created,
        summary.updated,
        summary.unchanged,
        summary.failures.len()
    );
    for failure in &summary.failures {
        println!(
            "  failed: {} {} ({})",
            failure.source_id,
            failure.url.as_deref().unwrap_or("<discovery>"),
            failure.reason
        );
    }
    Ok(())
}

async fn compile_once(
    config: &BuilderConfig,
    library: PathBuf,
    window: Option<DateWindow>,
    outputs: DigestOutputs,
) -> Result<()> {
    let options = CompileOptions {
        window,
        ..CompileOptions::from_workspace_root(&config.workspace_root)?
    };
    let (_, report) = DigestCompiler::new(options)
        .run(&library, &outputs, Utc::now())
        .await?;
    println!(
        "compile complete: pages={} records={} events={} review={} failed={} outputs={}",
        report.pages_read,
        report.records_normalized,
        report.events,
        report.review_items,
        report.failures.len(),
        report.outputs.join(", ")
    );
    for failure in &report.failures {
        println!(
            "  failed: {}/{} {:?}: {}",
            failure.source_id, failure.slug, failure.stage, failure.reason
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = BuilderConfig::from_env();

    match cli.command {
        Commands::Build {
            window,
            out,
            max,
            fixtures,
        } => {
            let window = match window.resolve()? {
                Some(window) => window,
                None => current_month()?,
            };
            let config = BuilderConfig {
                library_dir: out.unwrap_or(config.library_dir),
                max_pages_per_source: max.unwrap_or(config.max_pages_per_source),
                fixtures_dir: fixtures.or(config.fixtures_dir),
                ..config
            };
            build_once(config, &window).await?;
        }
        Commands::Compile {
            library,
            out,
            ics,
            parquet_dir,
            window,
        } => {
            let library = library.unwrap_or_else(|| config.library_dir.clone());
            let outputs = DigestOutputs {
                xlsx: Some(out),
                ics,
                parquet_dir,
            };
            compile_once(&config, library, window.resolve()?, outputs).await?;
        }
        Commands::Status { library } => {
            let library = library.unwrap_or_else(|| config.library_dir.clone());
            let summary = read_library_summary(&library)
                .await
                .with_context(|| format!("reading library status at {}", library.display()))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing library status")?
            );
        }
        Commands::Schedule { out, ics } => {
            let cron = config.sync_cron.clone();
            let job_config = config.clone();
            let mut sched = build_scheduler(&cron, move || {
                let config = job_config.clone();
                let outputs = DigestOutputs {
                    xlsx: Some(out.clone()),
                    ics: ics.clone(),
                    parquet_dir: None,
                };
                async move {
                    let result = async {
                        let window = current_month()?;
                        build_once(config.clone(), &window).await?;
                        let library = config.library_dir.clone();
                        compile_once(&config, library, Some(window), outputs).await
                    }
                    .await;
                    if let Err(err) = result {
                        error!(error = %format!("{err:#}"), "scheduled run failed");
                    }
                }
            })
            .await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
