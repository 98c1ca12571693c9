use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facewatch_core::{EnrollReport, FsCodec, OnnxExtractor, Recognition, Reconciler};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod inspect;

use config::Config;
use engine::EngineHandle;
use inspect::Inspector;

#[derive(Parser)]
#[command(name = "facewatch", version, about = "Folder-driven face enrollment and recognition")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the index with the source folders once
    Enroll,
    /// Reconcile now and then periodically until interrupted
    Watch {
        /// Seconds between passes (default: FACEWATCH_WATCH_INTERVAL_SECS)
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Recognise the face in an image
    Identify {
        /// Image file to identify
        image: PathBuf,
        /// Maximum cosine distance accepted as a match (default: FACEWATCH_THRESHOLD)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// List enrolled identifiers (no models needed)
    List,
    /// Show one profile as JSON (no models needed)
    Show {
        identifier: String,
    },
    /// Show store status as JSON (no models needed)
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Enroll => {
            let engine = start_engine(&config)?;
            let report = engine.enroll().await?;
            print_report(&report);
        }
        Commands::Watch { interval } => {
            let period = interval
                .map(|secs| std::time::Duration::from_secs(secs.max(1)))
                .unwrap_or_else(|| config.watch_interval());
            let engine = start_engine(&config)?;
            watch(&engine, period).await?;
        }
        Commands::Identify { image, threshold } => {
            let threshold = threshold.unwrap_or(config.threshold);
            let engine = start_engine(&config)?;
            match engine.identify(image.clone(), threshold).await? {
                None => println!("{}: no face detected", image.display()),
                Some(found) => match found.recognition {
                    Recognition::NoEnrolledFaces => println!("no enrolled faces"),
                    Recognition::Match {
                        identifier,
                        distance,
                    } => println!("match: {identifier} (distance {distance:.4})"),
                    Recognition::Unknown { nearest, distance } => println!(
                        "unknown (nearest {nearest}, distance {distance:.4}, threshold {threshold})"
                    ),
                },
            }
        }
        Commands::List => {
            let identifiers = open_inspector(&config)?.list()?;
            if identifiers.is_empty() {
                println!("No faces enrolled");
            }
            for identifier in identifiers {
                println!("{identifier}");
            }
        }
        Commands::Show { identifier } => match open_inspector(&config)?.profile(&identifier)? {
            Some(profile) => println!("{}", serde_json::to_string_pretty(&profile)?),
            None => anyhow::bail!("no profile for {identifier}"),
        },
        Commands::Status => {
            let status = open_inspector(&config)?.status()?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

/// Load the models and open every store, then hand them to the engine thread.
fn start_engine(config: &Config) -> Result<EngineHandle> {
    let extractor = OnnxExtractor::load(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    tracing::info!(path = %config.model_dir.display(), "face models loaded");

    let reconciler = Reconciler::open(config.source_dir.clone(), config.layout(), extractor, FsCodec)
        .with_context(|| format!("opening stores in {}", config.data_dir.display()))?;

    Ok(engine::spawn_engine(reconciler)?)
}

fn open_inspector(config: &Config) -> Result<Inspector> {
    Inspector::open(config.source_dir.clone(), config.layout())
        .with_context(|| format!("opening stores in {}", config.data_dir.display()))
}

async fn watch(engine: &EngineHandle, period: std::time::Duration) -> Result<()> {
    tracing::info!(interval_secs = period.as_secs(), "watching source folders");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // One listener for the whole loop, polled first so it is installed before
    // the first pass. An interrupt that lands while a pass is running is
    // picked up once that pass has finished.
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            biased;
            signal = &mut interrupt => {
                signal?;
                tracing::info!("interrupted; stopping watch");
                return Ok(());
            }
            _ = ticker.tick() => match engine.enroll().await {
                Ok(report) if report.changed() => print_report(&report),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "reconciliation failed"),
            },
        }
    }
}

fn print_report(report: &EnrollReport) {
    for identifier in &report.removed {
        println!("removed {identifier}");
    }
    for identifier in &report.new_identifiers {
        println!("enrolled {identifier}");
    }
    for skipped in &report.skipped {
        println!("skipped {} ({:?})", skipped.path.display(), skipped.reason);
    }
    println!(
        "{} embedding(s) added, {} removed, {} skipped",
        report.embeddings_added,
        report.embeddings_removed,
        report.skipped.len()
    );
}
