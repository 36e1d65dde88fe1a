//! Batch driver for condensed dataset generation.
//!
//! # Responsibility
//! - Wire config, catalog, object store and lock into a condensation engine.
//! - Run the batch over every catalog package and print one line per event.
//! - Turn SIGINT/SIGTERM into cancellation of the running batch.

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use dcserve_core::lock::FileResourceLock;
use dcserve_core::repo::{InMemoryCatalog, LocalObjectStore};
use dcserve_core::service::BatchError;
use dcserve_core::{
    init_from_config, run_condense_batch, BatchEvent, CancelToken, CondensationEngine,
    ServeConfig,
};
use log::info;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "dcserve")]
#[command(about = "Condensed dataset generation for RT-DC resources")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "DCSERVE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute condensed datasets for all resources, including drafts
    RunJobsDcView {
        /// JSON catalog of packages and their resources
        #[arg(long)]
        catalog: PathBuf,

        /// Only visit packages modified within this many days
        #[arg(long)]
        modified_days: Option<u32>,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => ServeConfig::load(path)?,
        None => ServeConfig::default(),
    };
    init_from_config(&config.logging)?;

    match args.command {
        Command::RunJobsDcView {
            catalog,
            modified_days,
        } => run_jobs_dc_view(config, catalog, modified_days),
    }
}

fn run_jobs_dc_view(
    config: ServeConfig,
    catalog_path: PathBuf,
    modified_days: Option<u32>,
) -> Result<(), Box<dyn Error>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&interrupted))?;
    }

    let catalog = Arc::new(InMemoryCatalog::from_json_file(&catalog_path)?);
    let store = Arc::new(LocalObjectStore::new(
        config.object_store.root.clone(),
        config.object_store.endpoint_url.clone(),
        config.object_store.presign_secret.clone(),
    ));
    let lock = Arc::new(FileResourceLock::new(config.lock_dir()));
    let engine = CondensationEngine::new(config, catalog.clone(), store, lock)
        .with_cancel_token(CancelToken::from_flag(interrupted));

    let modified_since =
        modified_days.map(|days| Utc::now() - Duration::days(i64::from(days)));
    info!(
        "event=cli_batch module=cli status=start catalog={} modified_days={:?}",
        catalog_path.display(),
        modified_days
    );

    let mut current_package: Option<String> = None;
    let result = run_condense_batch(catalog.as_ref(), &engine, modified_since, |event| {
        match event {
            BatchEvent::Checking { package, .. } => {
                if current_package.as_deref() != Some(package.id.as_str()) {
                    println!("Checking dataset {}", package.id);
                    current_package = Some(package.id.clone());
                }
            }
            BatchEvent::Created { resource, .. } => {
                println!("Created condensed resource for {}", resource.name);
            }
            BatchEvent::Failed {
                resource,
                kind,
                message,
                ..
            } => {
                println!("{kind}: {message} for {}", resource.name);
            }
        }
    });

    match result {
        Ok(summary) => {
            println!("Done!");
            info!(
                "event=cli_batch module=cli status=ok checked={} created={} failed={}",
                summary.checked, summary.created, summary.failed
            );
            Ok(())
        }
        Err(BatchError::Cancelled) => {
            println!("Interrupted.");
            Err(Box::new(BatchError::Cancelled))
        }
        Err(err) => Err(Box::new(err)),
    }
}
