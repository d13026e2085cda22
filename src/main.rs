use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use patent_harvester::config::Settings;
use patent_harvester::db::{self, Ledger};
use patent_harvester::download::HttpDownloader;
use patent_harvester::ground_truth;
use patent_harvester::groups;
use patent_harvester::harvest::{HarvestOptions, Harvester, RunSummary};
use patent_harvester::page::PatentPage;
use patent_harvester::record::Level;
use patent_harvester::session::WebDriverSession;
use patent_harvester::store::WorkUnitStore;

#[derive(Parser)]
#[command(name = "patent_harvester", about = "Patent and citation harvester")]
struct Cli {
    /// Settings file (default: ./harvest.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Overrides {
    /// Class group to skip, with or without extension (repeatable)
    #[arg(short = 'x', long)]
    exclude: Vec<String>,
    /// Related identifiers to harvest per source
    #[arg(short, long)]
    quota: Option<usize>,
    /// Sampling seed
    #[arg(short, long)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest class groups and expand new sources into their citations
    Run {
        #[command(flatten)]
        overrides: Overrides,
        /// Max source identifiers to attempt (default: all)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Also expand sources harvested by earlier runs
        #[arg(long)]
        expand_existing: bool,
    },
    /// Only harvest the citations of already persisted sources
    Expand {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Rebuild per-group ground truth from persisted document records
    GroundTruth {
        /// Class group to skip (repeatable)
        #[arg(short = 'x', long)]
        exclude: Vec<String>,
    },
    /// Outcome counts of the latest run
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Run {
            overrides,
            limit,
            expand_existing,
        } => {
            apply(&mut settings, overrides);
            settings.expand_existing |= expand_existing;
            run(&settings, limit).await
        }
        Commands::Expand { overrides } => {
            apply(&mut settings, overrides);
            expand(&settings).await
        }
        Commands::GroundTruth { exclude } => {
            settings.exclude_groups.extend(exclude);
            let store = work_unit_store(&settings);
            let built = ground_truth::build_all(
                &store,
                &settings.paths.ground_truth_dir,
                &settings.exclude_groups,
            )?;
            if built.is_empty() {
                println!("No document records found under {}.", store.json_dir().display());
            }
            for g in &built {
                println!(
                    "{:<12} {:>5} sources {:>6} documents -> {}",
                    g.group,
                    g.sources,
                    g.related,
                    g.path.display()
                );
            }
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&settings.paths.ledger)?;
            db::init_schema(&conn)?;
            match db::get_stats(&conn)? {
                None => println!("No runs recorded yet."),
                Some(s) => {
                    println!(
                        "Run #{} ({}) started {}, {}",
                        s.run_id,
                        s.command,
                        s.started_at,
                        s.finished_at
                            .map(|t| format!("finished {t}"))
                            .unwrap_or_else(|| "not finished".into())
                    );
                    println!(
                        "{:<12} | {:<8} | {:>9} | {:>7} | {:>10} | {:>6}",
                        "Group", "Level", "Persisted", "Skipped", "Incomplete", "Failed"
                    );
                    println!("{}", "-".repeat(67));
                    for g in &s.groups {
                        println!(
                            "{:<12} | {:<8} | {:>9} | {:>7} | {:>10} | {:>6}",
                            g.group, g.level, g.persisted, g.skipped, g.incomplete, g.failed
                        );
                    }
                    if !s.incomplete_reasons.is_empty() {
                        println!("\n--- Most common incomplete reasons ---");
                        for (reason, n) in &s.incomplete_reasons {
                            println!("  {n:>5}  {reason}");
                        }
                    }
                }
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn apply(settings: &mut Settings, overrides: Overrides) {
    settings.exclude_groups.extend(overrides.exclude);
    if let Some(quota) = overrides.quota {
        settings.sampling.quota = quota;
    }
    if let Some(seed) = overrides.seed {
        settings.sampling.seed = seed;
    }
}

fn work_unit_store(settings: &Settings) -> WorkUnitStore {
    WorkUnitStore::new(
        &settings.paths.json_dir,
        &settings.paths.image_dir,
        settings.claim_ttl(),
    )
}

fn harvester(settings: &Settings, limit: Option<usize>) -> Harvester {
    Harvester::new(
        work_unit_store(settings),
        HarvestOptions {
            base_url: settings.page.base_url.clone(),
            sampler: settings.sampler(),
            policy: settings.field_policy(),
            expand_existing: settings.expand_existing,
            limit,
        },
    )
}

async fn open_page(settings: &Settings) -> anyhow::Result<PatentPage<WebDriverSession, HttpDownloader>> {
    let session = WebDriverSession::start(
        &settings.webdriver.url,
        settings.webdriver.browser,
        settings.webdriver.headless,
    )
    .await
    .context("cannot obtain a browser session")?;
    let downloader = HttpDownloader::new(Duration::from_millis(settings.page.download_timeout_ms))?;
    Ok(PatentPage::new(session, downloader, settings.waits()))
}

async fn close_page(page: PatentPage<WebDriverSession, HttpDownloader>) {
    if let Err(e) = page.into_session().quit().await {
        warn!(error = %e, "Browser session did not close cleanly");
    }
}

async fn run(settings: &Settings, limit: Option<usize>) -> anyhow::Result<()> {
    let files = groups::class_group_files(&settings.paths.class_dir, &settings.exclude_groups)?;
    if files.is_empty() {
        println!(
            "No class groups to harvest in {}.",
            settings.paths.class_dir.display()
        );
        return Ok(());
    }

    let mut ledger = Ledger::open(&settings.paths.ledger, "run")?;
    let mut page = open_page(settings).await?;
    println!("Harvesting {} class groups...", files.len());

    let summary = harvester(settings, limit)
        .run(&mut page, &files, &mut ledger)
        .await;

    close_page(page).await;
    ledger.finish(&summary)?;
    print_summary(&summary);
    Ok(())
}

async fn expand(settings: &Settings) -> anyhow::Result<()> {
    let harvester = harvester(settings, None);
    let groups: Vec<String> = harvester
        .store()
        .groups(Level::Query)?
        .into_iter()
        .filter(|g| !groups::is_excluded(g, &settings.exclude_groups))
        .collect();
    if groups.is_empty() {
        println!("No persisted query records to expand. Run 'run' first.");
        return Ok(());
    }

    let mut ledger = Ledger::open(&settings.paths.ledger, "expand")?;
    let mut page = open_page(settings).await?;
    println!("Expanding {} class groups...", groups.len());

    let summary = harvester.expand(&mut page, &groups, &mut ledger).await;

    close_page(page).await;
    ledger.finish(&summary)?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    for g in &summary.groups {
        println!("{:<12} queries: {}", g.group, g.queries);
        println!("{:<12} documents: {}", "", g.documents);
    }
    println!("Queries:   {}", summary.queries());
    println!("Documents: {}", summary.documents());
    if summary.limited {
        println!("Stopped at the attempt limit; run again to continue.");
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
