// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use velo_wear::config::Config;
use velo_wear::database::Database;
use velo_wear::ingest::ActivityIngestor;
use velo_wear::logging;
use velo_wear::remote::{RemoteActivitySummary, RemoteGear, RemoteImporter};
use velo_wear::storage::ActivityFileStore;
use velo_wear::telemetry::JsonTelemetryDecoder;

#[derive(Parser, Debug)]
#[command(author, version, about = "Bicycle component wear tracking", long_about = None)]
struct Args {
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database schema and seed types and rule templates
    InitDb,
    /// Import local telemetry files, one activity each
    Import {
        /// Telemetry files to import
        files: Vec<PathBuf>,
    },
    /// Re-run sensor and bike analysis over every stored activity
    AnalyzeAll,
    /// Delete an activity and reverse its accumulated usage
    Delete {
        /// Activity id
        id: Uuid,
    },
    /// List components whose maintenance rules are due
    Due,
    /// Import remote activities from a JSON export
    ImportRemote {
        /// File holding an array of remote activity summaries
        file: PathBuf,
    },
    /// Reconcile the bike roster against a remote gear export
    SyncGear {
        /// File holding an array of remote gear entries
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_from_env()?;

    let args = Args::parse();
    let config = Config::load(args.config)?;

    let db = Database::new(&config.database_url).await?;

    match args.command {
        Command::InitDb => {
            db.load_taxonomy().await?;
            db.seed_rule_templates().await?;
            info!("Database initialized at {}", config.database_url);
        }
        Command::Import { files } => {
            let ingestor = build_ingestor(&db, &config).await?;
            for file in files {
                match ingestor.import_local_activity(&file).await {
                    Ok(record) => println!(
                        "Imported '{}' ({:.1} km, {} min)",
                        record.name,
                        record.distance_m / 1000.0,
                        record.duration_s / 60
                    ),
                    Err(e) => eprintln!("{}: {e}", file.display()),
                }
            }
        }
        Command::AnalyzeAll => {
            let ingestor = build_ingestor(&db, &config).await?;
            let (analyzed, failed) = ingestor.analyze_all_activities().await?;
            println!("Analyzed {analyzed} activities, {failed} failed");
        }
        Command::Delete { id } => {
            let ingestor = build_ingestor(&db, &config).await?;
            ingestor.delete_activity(id).await?;
            println!("Deleted activity {id}");
        }
        Command::Due => {
            report_due(&db).await?;
        }
        Command::ImportRemote { file } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let summaries: Vec<RemoteActivitySummary> =
                serde_json::from_str(&content).context("parsing remote activities")?;

            let importer = RemoteImporter::new(db);
            let mut imported = 0;
            for summary in summaries {
                match importer.import_remote_activity(summary).await {
                    Ok(_) => imported += 1,
                    Err(velo_wear::errors::WearError::AlreadyImported(_)) => {}
                    Err(e) => eprintln!("{e}"),
                }
            }
            println!("Imported {imported} remote activities");
        }
        Command::SyncGear { file } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let gear: Vec<RemoteGear> =
                serde_json::from_str(&content).context("parsing gear export")?;

            let importer = RemoteImporter::new(db);
            let (created, updated) = importer.sync_gear(&gear).await?;
            println!("Gear sync: {created} created, {updated} updated");
        }
    }

    Ok(())
}

async fn build_ingestor(db: &Database, config: &Config) -> Result<ActivityIngestor> {
    let store = ActivityFileStore::new(&config.activities_dir).await?;
    Ok(ActivityIngestor::new(
        db.clone(),
        Arc::new(JsonTelemetryDecoder),
        store,
    ))
}

async fn report_due(db: &Database) -> Result<()> {
    let now = chrono::Utc::now();
    let mut due_count = 0;

    for bike in db.list_bikes().await? {
        for (component, rule) in velo_wear::rules::due_rules(db, bike.id, now).await? {
            due_count += 1;
            println!(
                "{} on '{}': {} (threshold {}{}, {:.0} km / {} h ridden)",
                component.name.as_deref().unwrap_or("component"),
                bike.name,
                rule.notification_message.as_deref().unwrap_or(&rule.name),
                rule.rule_value,
                rule.kind.symbol(),
                component.distance_m / 1000.0,
                component.duration_s / 3600
            );
        }
    }

    if due_count == 0 {
        println!("Nothing due");
    }
    Ok(())
}
