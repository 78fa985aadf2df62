mod credentials;
mod db;
mod extract;
mod pipeline;
mod settings;
mod transform;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use credentials::Credentials;
use pipeline::{Pipeline, RunOutcome, RunState};
use settings::Settings;

#[derive(Parser)]
#[command(name = "apod_etl", about = "NASA APOD daily extract-transform-load")]
struct Cli {
    /// Settings file (default: ./apod.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// One full pipeline run: schema + extract, transform, load
    Run,
    /// Create the apod_data table if missing
    Init,
    /// Extract and transform only; print the record, write nothing
    Fetch,
    /// Show the most recent stored records
    List {
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
    /// Show the stored record for one date (YYYY-MM-DD)
    Show { date: String },
    /// Show storage statistics
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
    let settings = Settings::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Run => {
            let report = build_pipeline(&settings)?.run().await;
            let took = report.finished_at - report.started_at;
            match report.outcome {
                RunOutcome::Succeeded { date, outcome } => {
                    println!(
                        "{}: {:?} for {} ({:?}, {}ms)",
                        report.run_id,
                        report.states.last().copied().unwrap_or(RunState::NotStarted),
                        date,
                        outcome,
                        took.num_milliseconds()
                    );
                    Ok(())
                }
                RunOutcome::Failed(e) => {
                    let stage = e.stage();
                    Err(anyhow::Error::new(e)
                        .context(format!("{}: failed at {} stage", report.run_id, stage)))
                }
            }
        }
        Commands::Init => {
            let store = open_store(&settings)?;
            store.ensure_schema()?;
            println!("Table apod_data ready.");
            Ok(())
        }
        Commands::Fetch => {
            let raw = build_pipeline(&settings)?.client().extract().await?;
            let record = transform::transform(raw);
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Commands::List { limit } => {
            let store = open_store(&settings)?;
            store.ensure_schema()?;
            let rows = store.fetch_recent(limit)?;
            if rows.is_empty() {
                println!("No records stored. Run 'run' first.");
                return Ok(());
            }

            println!(
                "{:>5} | {:<10} | {:<7} | {:<40} | {}",
                "id", "date", "media", "title", "url"
            );
            println!("{}", "-".repeat(100));
            for r in &rows {
                println!(
                    "{:>5} | {:<10} | {:<7} | {:<40} | {}",
                    r.id,
                    r.date,
                    truncate(&r.media_type, 7),
                    truncate(&r.title, 40),
                    r.media_url
                );
            }
            Ok(())
        }
        Commands::Show { date } => {
            let store = open_store(&settings)?;
            store.ensure_schema()?;
            match store.fetch_by_date(&date)? {
                Some(r) => {
                    println!("#{} {} [{}]", r.id, r.date, r.media_type);
                    println!("{}", r.title);
                    println!("{}\n", r.media_url);
                    println!("{}", r.explanation);
                }
                None => println!("No record for {}.", date),
            }
            Ok(())
        }
        Commands::Stats => {
            let store = open_store(&settings)?;
            store.ensure_schema()?;
            let s = store.get_stats()?;
            println!("Rows:  {}", s.rows);
            println!("First: {}", s.first_date.as_deref().unwrap_or("-"));
            println!("Last:  {}", s.last_date.as_deref().unwrap_or("-"));
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {:.1}s", elapsed.as_secs_f64());
    }

    result
}

fn build_pipeline(settings: &Settings) -> anyhow::Result<Pipeline> {
    Pipeline::from_settings(settings, settings).context("Failed to set up pipeline")
}

fn open_store(settings: &Settings) -> anyhow::Result<db::Store> {
    let dsn = settings.storage_dsn(&settings.storage.conn_id)?;
    db::Store::open(&dsn, Duration::from_millis(settings.storage.busy_timeout_ms))
        .with_context(|| format!("Failed to open {}", dsn))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}
