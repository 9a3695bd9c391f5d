//! backlog CLI: operator and session-driver interface to the feature backlog.

use std::path::PathBuf;

use backlog_rs::config::Config;
use backlog_rs::config::secrets::ExposeSecret;
use backlog_rs::db::Db;
use backlog_rs::db::legacy::{ImportOutcome, import_legacy};
use backlog_rs::engine::Engine;
use backlog_rs::model::{FeatureId, NewFeature, PassesUpdate, Stats};
use backlog_rs::store::ListQuery;
use backlog_rs::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "backlog", about = "Feature backlog for multi-session automated builds")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show progress: passing, total, percentage
    Stats,
    /// Show the next pending feature
    Next {
        /// Also flag it as in progress
        #[arg(long)]
        claim: bool,
    },
    /// List features (at most 5 per page)
    List {
        /// Filter by pass flag
        #[arg(long)]
        passes: Option<bool>,
        /// Filter by category
        #[arg(long)]
        category: Option<String>,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Random sample instead of queue order
        #[arg(long)]
        random: bool,
    },
    /// Show a feature
    Show { id: FeatureId },
    /// Create a single feature
    Create {
        #[arg(long)]
        category: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Verification step (repeatable, at least one)
        #[arg(long = "step", required = true)]
        steps: Vec<String>,
    },
    /// Bulk-create features from a JSON array of {category, name, description, steps}
    Import { file: PathBuf },
    /// Mark a feature as passing
    Pass { id: FeatureId },
    /// Set the pass flag through the generic update path
    SetPasses {
        id: FeatureId,
        #[arg(action = clap::ArgAction::Set)]
        passes: bool,
    },
    /// Move a feature to the end of the queue pending review
    Skip { id: FeatureId, reason: String },
    /// Re-admit a skipped feature
    Approve { id: FeatureId },
    /// Confirm a skip permanently
    Reject { id: FeatureId },
    /// Record a failed attempt
    Fail { id: FeatureId, message: String },
    /// Random sample of passing features to re-verify
    Regression {
        #[arg(long, default_value_t = 3)]
        limit: usize,
    },
    /// List skipped features awaiting review
    Review,
    /// Delete a feature (administrative)
    Delete { id: FeatureId },
    /// Import the legacy feature_list.json, if present
    MigrateLegacy,
    /// Check the backlog is reachable
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "backlog".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    tokio::fs::create_dir_all(&config.project_dir).await?;
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let engine = Engine::new(db).with_max_failures(config.max_feature_failures);

    match cli.command {
        Command::Stats => cmd_stats(&engine).await,
        Command::Next { claim } => {
            let next = if claim {
                engine.claim_next().await?
            } else {
                engine.get_next().await?
            };
            match next {
                Some(feature) => print_json(&feature),
                None => {
                    let review = engine.list_pending_review().await?.len();
                    if review > 0 {
                        println!("No pending features; {review} skipped feature(s) await review.");
                    } else {
                        println!("All features are passing. No more work to do.");
                    }
                    Ok(())
                }
            }
        }
        Command::List {
            passes,
            category,
            limit,
            offset,
            random,
        } => {
            let features = engine
                .list(ListQuery {
                    passes,
                    category,
                    limit,
                    offset,
                    random,
                    ..ListQuery::default()
                })
                .await?;
            print_json(&features)
        }
        Command::Show { id } => print_json(&engine.get(id).await?),
        Command::Create {
            category,
            name,
            description,
            steps,
        } => {
            let feature = engine
                .create(
                    NewFeature::new(category, name)
                        .description(description)
                        .steps(steps),
                )
                .await?;
            print_json(&feature)
        }
        Command::Import { file } => {
            let raw = tokio::fs::read_to_string(&file).await?;
            let features: Vec<NewFeature> = serde_json::from_str(&raw)?;
            let ids = engine.bulk_create(features).await?;
            println!("Created {} feature(s).", ids.len());
            Ok(())
        }
        Command::Pass { id } => print_json(&engine.mark_passing(id).await?),
        Command::SetPasses { id, passes } => {
            print_json(&engine.update(id, PassesUpdate { passes }).await?)
        }
        Command::Skip { id, reason } => {
            let report = engine.skip(id, &reason).await?;
            println!(
                "Feature '{}' moved to end of queue ({} -> {}), awaiting review.",
                report.feature.name, report.old_priority, report.new_priority
            );
            Ok(())
        }
        Command::Approve { id } => print_json(&engine.approve(id).await?),
        Command::Reject { id } => print_json(&engine.reject_skip(id).await?),
        Command::Fail { id, message } => {
            let report = engine.record_failure(id, &message).await?;
            println!(
                "Recorded failure #{} for feature '{}' (threshold {}).",
                report.failure_count, report.feature.name, report.max_failures
            );
            if report.threshold_exceeded {
                println!("Feature has hit the failure threshold; consider skipping it.");
            }
            Ok(())
        }
        Command::Regression { limit } => print_json(&engine.get_for_regression(limit).await?),
        Command::Review => print_json(&engine.list_pending_review().await?),
        Command::Delete { id } => {
            engine.delete(id).await?;
            println!("Deleted feature {id}.");
            Ok(())
        }
        Command::MigrateLegacy => {
            match import_legacy(engine.store(), &config.project_dir).await? {
                ImportOutcome::Imported { count, archived_to } => println!(
                    "Imported {count} feature(s); legacy file archived to {}.",
                    archived_to.display()
                ),
                ImportOutcome::SkippedNonEmpty => {
                    println!("Backlog already populated; legacy file left untouched.")
                }
                ImportOutcome::NoLegacyFile => println!("No legacy feature list found."),
            }
            Ok(())
        }
        Command::Health => print_json(&engine.health().await?),
    }
}

async fn cmd_stats(engine: &Engine<Db>) -> anyhow::Result<()> {
    let Stats {
        passing,
        total,
        percentage,
    } = engine.stats().await?;
    println!("Passing:    {passing}/{total}");
    println!("Progress:   {percentage:.1}%");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
